// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use jsonwebtoken::{encode, Algorithm, DecodingKey, EncodingKey, Header};
use serde::Serialize;
use std::sync::Arc;
use vitalsync::config::Config;
use vitalsync::db::Db;
use vitalsync::services::{
    FitbitClient, FitbitService, GoogleIdentityVerifier, IdentityBridge, KmsService,
    NotifyService, SyncService,
};
use vitalsync::AppState;

/// Key id used by the static-key identity verifier in tests.
pub const TEST_KID: &str = "test-key-1";

pub const TEST_RSA_PRIVATE_PEM: &str = include_str!("../fixtures/test_rsa_private.pem");
pub const TEST_RSA_PUBLIC_PEM: &str = include_str!("../fixtures/test_rsa_public.pem");

/// Create a test app backed by the in-memory store and offline mocks.
/// Returns the router and the shared state.
#[allow(dead_code)]
pub fn create_test_app() -> (axum::Router, Arc<AppState>) {
    create_test_app_with_fitbit_base("http://127.0.0.1:9".to_string())
}

/// Same as `create_test_app`, with the Fitbit API pointed at a stub server.
#[allow(dead_code)]
pub fn create_test_app_with_fitbit_base(fitbit_api_base: String) -> (axum::Router, Arc<AppState>) {
    let config = Config::test_default();
    let db = Db::new_memory();

    let decoding_key = DecodingKey::from_rsa_pem(TEST_RSA_PUBLIC_PEM.as_bytes())
        .expect("Failed to parse test RSA public key");
    let google_verifier = Arc::new(
        GoogleIdentityVerifier::new_with_static_key(&config, TEST_KID, decoding_key)
            .expect("Failed to build static-key verifier"),
    );

    let kms = KmsService::new_mock();
    let token_cache = Arc::new(dashmap::DashMap::new());
    let refresh_locks = Arc::new(dashmap::DashMap::new());

    let fitbit = FitbitService::new(
        FitbitClient::with_base_urls(
            config.fitbit_client_id.clone(),
            config.fitbit_client_secret.clone(),
            fitbit_api_base.clone(),
            fitbit_api_base,
        ),
        db.clone(),
        kms,
        token_cache,
        refresh_locks,
    );

    let notify = NotifyService::disabled();
    let sync = SyncService::new(db.clone(), notify.clone());
    let identity = IdentityBridge::new(&config, google_verifier, db.clone());

    let state = Arc::new(AppState {
        config,
        db,
        identity,
        fitbit,
        sync,
        notify,
    });

    (vitalsync::routes::create_router(state.clone()), state)
}

/// Create a session JWT the way the web frontend's session issuer does.
#[allow(dead_code)]
pub fn create_test_session(user_id: &str, signing_key: &[u8]) -> String {
    vitalsync::middleware::auth::create_session_jwt(user_id, signing_key)
        .expect("Failed to create session JWT")
}

#[derive(Serialize)]
struct IdTokenClaims {
    iss: String,
    aud: String,
    sub: String,
    exp: usize,
    iat: usize,
    email: String,
    email_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

/// Mint a Google-style RS256 ID token signed with the test key.
#[allow(dead_code)]
pub fn mint_google_id_token(email: &str, name: Option<&str>, audience: &str) -> String {
    mint_google_id_token_with(email, name, audience, true, TEST_KID)
}

/// Full-control variant for negative tests.
#[allow(dead_code)]
pub fn mint_google_id_token_with(
    email: &str,
    name: Option<&str>,
    audience: &str,
    email_verified: bool,
    kid: &str,
) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as usize;

    let claims = IdTokenClaims {
        iss: "https://accounts.google.com".to_string(),
        aud: audience.to_string(),
        sub: format!("sub-{}", email),
        exp: now + 3600,
        iat: now,
        email: email.to_string(),
        email_verified,
        name: name.map(str::to_string),
    };

    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());

    let key = EncodingKey::from_rsa_pem(TEST_RSA_PRIVATE_PEM.as_bytes())
        .expect("Failed to parse test RSA private key");

    encode(&header, &claims, &key).expect("Failed to mint ID token")
}
