// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Fitbit token exchange and refresh tests against a local stub endpoint.
//!
//! The stub speaks just enough of the provider's token protocol to
//! exercise the real HTTP path: basic-auth form POSTs in, JSON grants or
//! `{errors: [...]}` payloads out.

use axum::http::{header, StatusCode};
use axum::routing::{get, post};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tower::ServiceExt;
use vitalsync::error::AppError;
use vitalsync::models::{ProviderTokens, User};
use vitalsync::services::kms::{self, KmsService};
use vitalsync::AppState;

mod common;

/// Serve a stub router on an ephemeral local port; returns its base URL.
async fn spawn_stub(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub listener");
    let addr = listener.local_addr().expect("stub local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve stub");
    });
    format!("http://{}", addr)
}

fn token_stub(status: StatusCode, body: &'static str) -> axum::Router {
    axum::Router::new().route(
        "/oauth2/token",
        post(move || async move {
            (status, [(header::CONTENT_TYPE, "application/json")], body)
        }),
    )
}

/// Seed a sealed token row directly, as a prior successful exchange would.
async fn seed_tokens(
    state: &Arc<AppState>,
    user_id: &str,
    access: &str,
    refresh: &str,
    expires_at: chrono::DateTime<Utc>,
) {
    let kms = KmsService::new_mock();
    let (sealed_access, sealed_refresh) = kms::seal_tokens(&kms, access, refresh, user_id)
        .await
        .expect("seal test tokens");

    let tokens = ProviderTokens {
        access_token_sealed: sealed_access,
        refresh_token_sealed: sealed_refresh,
        expires_at: expires_at.to_rfc3339(),
        scopes: vec!["activity".to_string(), "heartrate".to_string()],
    };
    state
        .db
        .set_provider_tokens(user_id, &tokens)
        .await
        .expect("seed token row");
}

async fn unseal_access(user_id: &str, tokens: &ProviderTokens) -> String {
    let kms = KmsService::new_mock();
    kms.decrypt(&tokens.access_token_sealed, Some(user_id.as_bytes()))
        .await
        .expect("unseal access token")
}

#[tokio::test]
async fn exchange_error_payload_persists_nothing() {
    let base = spawn_stub(token_stub(
        StatusCode::BAD_REQUEST,
        r#"{"errors":[{"errorType":"invalid_grant","message":"Authorization code invalid"}],"success":false}"#,
    ))
    .await;
    let (_app, state) = common::create_test_app_with_fitbit_base(base);

    let err = state
        .fitbit
        .handle_oauth_callback("u1", "bad-code", "http://localhost:8080/auth/fitbit/callback")
        .await
        .unwrap_err();

    match err {
        AppError::ProviderApi(msg) => assert!(msg.contains("invalid_grant")),
        other => panic!("expected ProviderApi error, got {:?}", other),
    }

    assert!(state.db.get_provider_tokens("u1").await.unwrap().is_none());
}

#[tokio::test]
async fn successful_exchange_upserts_sealed_tokens() {
    let base = spawn_stub(token_stub(
        StatusCode::OK,
        r#"{"access_token":"at-1","refresh_token":"rt-1","expires_in":28800,"scope":"activity heartrate","token_type":"Bearer","user_id":"ABCDEF"}"#,
    ))
    .await;
    let (_app, state) = common::create_test_app_with_fitbit_base(base);

    state
        .fitbit
        .handle_oauth_callback("u1", "good-code", "http://localhost:8080/auth/fitbit/callback")
        .await
        .unwrap();

    let tokens = state
        .db
        .get_provider_tokens("u1")
        .await
        .unwrap()
        .expect("token row stored");

    assert_eq!(unseal_access("u1", &tokens).await, "at-1");
    assert_eq!(tokens.scopes, vec!["activity", "heartrate"]);

    let expires_at = chrono::DateTime::parse_from_rfc3339(&tokens.expires_at).unwrap();
    assert!(expires_at > Utc::now());
}

#[tokio::test]
async fn missing_access_token_fails_exchange() {
    let base = spawn_stub(token_stub(StatusCode::OK, r#"{"token_type":"Bearer"}"#)).await;
    let (_app, state) = common::create_test_app_with_fitbit_base(base);

    let err = state
        .fitbit
        .handle_oauth_callback("u1", "odd-code", "http://localhost:8080/auth/fitbit/callback")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ProviderApi(_)));

    assert!(state.db.get_provider_tokens("u1").await.unwrap().is_none());
}

#[tokio::test]
async fn expired_token_refreshes_and_rotates_the_row() {
    let base = spawn_stub(token_stub(
        StatusCode::OK,
        r#"{"access_token":"at-new","refresh_token":"rt-new","expires_in":28800,"token_type":"Bearer"}"#,
    ))
    .await;
    let (_app, state) = common::create_test_app_with_fitbit_base(base);

    seed_tokens(&state, "u1", "at-old", "rt-old", Utc::now() - Duration::hours(1)).await;

    let access = state.fitbit.get_valid_access_token("u1").await.unwrap();
    assert_eq!(access, "at-new");

    let tokens = state.db.get_provider_tokens("u1").await.unwrap().unwrap();
    assert_eq!(unseal_access("u1", &tokens).await, "at-new");

    let expires_at = chrono::DateTime::parse_from_rfc3339(&tokens.expires_at).unwrap();
    assert!(expires_at > Utc::now());
}

#[tokio::test]
async fn rejected_refresh_surfaces_reauth_and_preserves_the_row() {
    let base = spawn_stub(token_stub(
        StatusCode::UNAUTHORIZED,
        r#"{"errors":[{"errorType":"invalid_grant","message":"Refresh token invalid"}],"success":false}"#,
    ))
    .await;
    let (_app, state) = common::create_test_app_with_fitbit_base(base);

    seed_tokens(&state, "u1", "at-old", "rt-old", Utc::now() - Duration::hours(1)).await;

    let err = state.fitbit.get_valid_access_token("u1").await.unwrap_err();
    assert!(matches!(err, AppError::ProviderReauth));

    // The row from the last successful exchange is untouched.
    let tokens = state.db.get_provider_tokens("u1").await.unwrap().unwrap();
    assert_eq!(unseal_access("u1", &tokens).await, "at-old");
}

#[tokio::test]
async fn valid_token_is_served_without_touching_the_provider() {
    // Default app points at an unroutable stub; any provider call fails.
    let (_app, state) = common::create_test_app();

    seed_tokens(&state, "u1", "at-live", "rt-live", Utc::now() + Duration::hours(2)).await;

    let access = state.fitbit.get_valid_access_token("u1").await.unwrap();
    assert_eq!(access, "at-live");
}

#[tokio::test]
async fn missing_row_needs_reauth() {
    let (_app, state) = common::create_test_app();

    let err = state
        .fitbit
        .get_valid_access_token("never-connected")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ProviderReauth));
}

#[tokio::test]
async fn import_route_ingests_provider_samples_with_snapshot() {
    let stub = axum::Router::new()
        .route(
            "/oauth2/token",
            post(|| async {
                (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/json")],
                    r#"{"access_token":"at-x","refresh_token":"rt-x","expires_in":28800,"token_type":"Bearer"}"#,
                )
            }),
        )
        .route(
            "/1/user/-/activities/date/{file}",
            get(|| async {
                (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/json")],
                    r#"{"activities":[],"summary":{"steps":4321,"restingHeartRate":58}}"#,
                )
            }),
        );
    let base = spawn_stub(stub).await;
    let (app, state) = common::create_test_app_with_fitbit_base(base);

    let email = "importer@example.com";
    let user_id = User::id_for_email(email);
    let session = common::create_test_session(&user_id, &state.config.jwt_signing_key);

    seed_tokens(&state, &user_id, "at-x", "rt-x", Utc::now() + Duration::hours(2)).await;

    let response = app
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/sync/import")
                .header(header::AUTHORIZATION, format!("Bearer {}", session))
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "success");
    assert_eq!(body["count"], 2);

    // Normalized rows landed...
    assert_eq!(state.db.count_records(&user_id).await.unwrap(), 2);

    // ...and the raw provider payload rides along on the sync state.
    let sync_state = state.db.get_sync_state(&user_id).await.unwrap().unwrap();
    assert!(!sync_state.pending);
    assert!(sync_state
        .raw_snapshot
        .as_deref()
        .unwrap()
        .contains("restingHeartRate"));
}

#[tokio::test]
async fn import_without_connection_returns_reauth_code() {
    let (app, state) = common::create_test_app();

    let user_id = User::id_for_email("unconnected@example.com");
    let session = common::create_test_session(&user_id, &state.config.jwt_signing_key);

    let response = app
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/sync/import")
                .header(header::AUTHORIZATION, format!("Bearer {}", session))
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"], "provider_reauth_required");
}
