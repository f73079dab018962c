// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Connect-flow tests: authorization redirect and signed-state callback.
//!
//! Callback failures must land on distinguishable error codes so the UI
//! can offer the right retry affordance, and only a verified state binds
//! exchanged tokens to a user.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::routing::post;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tower::ServiceExt;
use vitalsync::models::User;

mod common;

type HmacSha256 = Hmac<Sha256>;

/// Build a signed state parameter the way /auth/fitbit does.
fn signed_state(user_id: &str, frontend_url: &str, secret: &[u8]) -> String {
    let payload = format!("{}|{}|{:x}", user_id, frontend_url, 1234567890u128);
    let mut mac = HmacSha256::new_from_slice(secret).unwrap();
    mac.update(payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    URL_SAFE_NO_PAD.encode(format!("{}|{}", payload, signature).as_bytes())
}

fn location(response: &axum::response::Response) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .expect("redirect location")
        .to_str()
        .unwrap()
        .to_string()
}

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

#[tokio::test]
async fn connect_start_redirects_to_provider_authorization() {
    let (app, state) = common::create_test_app();

    let session = common::create_test_session("user-1", &state.config.jwt_signing_key);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/auth/fitbit")
                .header(header::AUTHORIZATION, format!("Bearer {}", session))
                .header(header::HOST, "localhost:8080")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);

    let target = location(&response);
    assert!(target.contains("/oauth2/authorize?"));
    assert!(target.contains("response_type=code"));
    assert!(target.contains("client_id=test_client_id"));
    assert!(target.contains("redirect_uri="));
    assert!(target.contains("expires_in="));
    assert!(target.contains("state="));
}

#[tokio::test]
async fn callback_with_tampered_state_redirects_to_invalid_state() {
    let (app, _state) = common::create_test_app();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/auth/fitbit/callback?code=abc&state=bm90LXJlYWw")
                .header(header::HOST, "localhost:8080")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        location(&response),
        "http://localhost:5173?error=invalid_state"
    );
}

#[tokio::test]
async fn callback_forwards_provider_denial_code() {
    let (app, state) = common::create_test_app();

    let oauth_state = signed_state("user-1", "https://app.example.com", &state.config.oauth_state_key);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(&format!(
                    "/auth/fitbit/callback?error=access_denied&state={}",
                    oauth_state
                ))
                .header(header::HOST, "localhost:8080")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        location(&response),
        "https://app.example.com?error=access_denied"
    );
}

#[tokio::test]
async fn callback_without_code_is_distinct_from_exchange_failure() {
    let (app, state) = common::create_test_app();

    let oauth_state = signed_state("user-1", "https://app.example.com", &state.config.oauth_state_key);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(&format!("/auth/fitbit/callback?state={}", oauth_state))
                .header(header::HOST, "localhost:8080")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        location(&response),
        "https://app.example.com?error=missing_code"
    );
}

#[tokio::test]
async fn callback_with_rejected_exchange_redirects_with_error() {
    let stub = axum::Router::new().route(
        "/oauth2/token",
        post(|| async {
            (
                StatusCode::BAD_REQUEST,
                [(header::CONTENT_TYPE, "application/json")],
                r#"{"errors":[{"errorType":"invalid_grant","message":"Authorization code invalid"}],"success":false}"#,
            )
        }),
    );
    let base = spawn_stub(stub).await;
    let (app, state) = common::create_test_app_with_fitbit_base(base);

    let user_id = User::id_for_email("connectee@example.com");
    let oauth_state = signed_state(&user_id, "https://app.example.com", &state.config.oauth_state_key);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(&format!(
                    "/auth/fitbit/callback?code=expired-code&state={}",
                    oauth_state
                ))
                .header(header::HOST, "localhost:8080")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        location(&response),
        "https://app.example.com?error=exchange_failed"
    );

    // The rejected exchange persisted nothing.
    assert!(state
        .db
        .get_provider_tokens(&user_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn callback_roundtrip_stores_tokens_for_the_state_user() {
    let stub = axum::Router::new().route(
        "/oauth2/token",
        post(|| async {
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                r#"{"access_token":"at-cb","refresh_token":"rt-cb","expires_in":28800,"scope":"activity heartrate","token_type":"Bearer"}"#,
            )
        }),
    );
    let base = spawn_stub(stub).await;
    let (app, state) = common::create_test_app_with_fitbit_base(base);

    let user_id = User::id_for_email("connectee@example.com");
    let oauth_state = signed_state(&user_id, "https://app.example.com", &state.config.oauth_state_key);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(&format!(
                    "/auth/fitbit/callback?code=fresh-code&state={}",
                    oauth_state
                ))
                .header(header::HOST, "localhost:8080")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(
        location(&response),
        "https://app.example.com?connected=fitbit"
    );

    let tokens = state
        .db
        .get_provider_tokens(&user_id)
        .await
        .unwrap()
        .expect("token row bound to the state's user");
    assert_eq!(tokens.scopes, vec!["activity", "heartrate"]);
}
