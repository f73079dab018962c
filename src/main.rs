// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Vitalsync API Server
//!
//! Coordinates cross-device health-data synchronization: web and mobile
//! clients share one per-user record store, with Fitbit data imported via
//! OAuth2 delegated authorization.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vitalsync::{
    config::Config,
    db::Db,
    services::{
        FitbitClient, FitbitService, GoogleIdentityVerifier, IdentityBridge, KmsService,
        NotifyService, SyncService,
    },
    AppState,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize structured JSON logging for GCP
    init_logging();

    // Load configuration from environment
    let config = Config::from_env().expect("Failed to load configuration");
    tracing::info!(port = config.port, "Starting Vitalsync API");

    // Initialize Firestore database
    let db = Db::connect(&config.gcp_project_id)
        .await
        .expect("Failed to connect to Firestore");

    // Delegated identity verifier for mobile sign-in
    let google_verifier = Arc::new(
        GoogleIdentityVerifier::new(&config).expect("Failed to initialize identity verifier"),
    );

    // Initialize KMS service for sealing provider tokens
    let kms = KmsService::new(&config.gcp_project_id, &config.gcp_region, "token-encryption")
        .await
        .expect("Failed to initialize KMS service");
    tracing::info!("KMS service initialized");

    // Shared token cache and refresh locks, shared across all
    // FitbitService clones within this instance
    let token_cache = Arc::new(dashmap::DashMap::new());
    let refresh_locks = Arc::new(dashmap::DashMap::new());
    tracing::info!("Token cache initialized");

    let fitbit = FitbitService::new(
        FitbitClient::new(
            config.fitbit_client_id.clone(),
            config.fitbit_client_secret.clone(),
        ),
        db.clone(),
        kms,
        token_cache,
        refresh_locks,
    );

    let notify = NotifyService::new(&config);
    let sync = SyncService::new(db.clone(), notify.clone());
    let identity = IdentityBridge::new(&config, google_verifier, db.clone());

    // Build shared state
    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        identity,
        fitbit,
        sync,
        notify,
    });

    // Build router
    let app = vitalsync::routes::create_router(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Initialize structured JSON logging (GCP-compliant).
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("vitalsync=debug".parse().unwrap())
                .add_directive("info".parse().unwrap()),
        )
        .with(format)
        .init();
}
