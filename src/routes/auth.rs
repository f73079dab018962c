// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Fitbit OAuth connect routes.
//!
//! The connect flow starts from an authenticated web session; the signed
//! state parameter carries the acting user id across the provider
//! round-trip so the public callback can bind the exchanged tokens to the
//! right principal without trusting anything the provider echoes back.

use axum::{
    extract::{Query, State},
    response::Redirect,
    routing::get,
    Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{AppError, Result};
use crate::services::identity::Principal;
use crate::AppState;
use axum::Extension;

// Type alias for HMAC-SHA256
type HmacSha256 = Hmac<Sha256>;

/// Session-protected connect entry point.
pub fn connect_routes() -> Router<Arc<AppState>> {
    Router::new().route("/auth/fitbit", get(auth_start))
}

/// Public callback (authenticated by the signed state parameter).
pub fn callback_routes() -> Router<Arc<AppState>> {
    Router::new().route("/auth/fitbit/callback", get(auth_callback))
}

/// Query parameters for starting the connect flow.
#[derive(Deserialize)]
pub struct AuthStartParams {
    /// Frontend URL to redirect back to after OAuth completes.
    /// If not provided, uses FRONTEND_URL config.
    #[serde(default)]
    redirect_uri: Option<String>,
}

/// Start the connect flow - redirect to Fitbit authorization.
async fn auth_start(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Query(params): Query<AuthStartParams>,
    headers: axum::http::HeaderMap,
) -> Result<Redirect> {
    let frontend_url = params
        .redirect_uri
        .unwrap_or_else(|| state.config.frontend_url.clone());

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("System time error: {}", e)))?
        .as_millis();

    // Data payload: "user_id|frontend_url|timestamp_hex"
    let state_payload = format!("{}|{}|{:x}", principal.user_id, frontend_url, timestamp);

    let mut mac = HmacSha256::new_from_slice(&state.config.oauth_state_key)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("HMAC init failed: {}", e)))?;
    mac.update(state_payload.as_bytes());
    let signature = mac.finalize().into_bytes();

    // Combine payload + signature: "payload|signature_hex", base64 for the URL
    let signed_state = format!("{}|{}", state_payload, hex::encode(signature));
    let oauth_state = URL_SAFE_NO_PAD.encode(signed_state.as_bytes());

    let callback_url = callback_url_from_headers(&headers);
    let auth_url = state.fitbit.authorize_url(&callback_url, &oauth_state);

    tracing::info!(
        user_id = %principal.user_id,
        frontend_url = %frontend_url,
        "Starting connect flow, redirecting to Fitbit"
    );

    Ok(Redirect::temporary(&auth_url))
}

#[derive(Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    code: Option<String>,
    state: String,
    #[serde(default)]
    error: Option<String>,
}

/// OAuth callback - exchange code for tokens, bound to the state's user.
///
/// Every failure redirects back to the frontend with a distinct error
/// code so the UI can render the right retry affordance; a failed
/// exchange never touches previously stored tokens.
async fn auth_callback(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Result<Redirect> {
    let callback_url = callback_url_from_headers(&headers);

    let Some((user_id, frontend_url)) =
        verify_and_decode_state(&params.state, &state.config.oauth_state_key)
    else {
        tracing::warn!("Invalid or tampered state parameter on Fitbit callback");
        let redirect = format!("{}?error=invalid_state", state.config.frontend_url);
        return Ok(Redirect::temporary(&redirect));
    };

    // Provider-reported denial (user clicked "deny", etc).
    if let Some(error) = params.error {
        tracing::warn!(error = %error, "OAuth error from Fitbit");
        let redirect = format!("{}?error={}", frontend_url, error);
        return Ok(Redirect::temporary(&redirect));
    }

    // Missing code is distinct from a rejected exchange.
    let Some(code) = params.code else {
        tracing::warn!(user_id = %user_id, "Fitbit callback without authorization code");
        let redirect = format!("{}?error=missing_code", frontend_url);
        return Ok(Redirect::temporary(&redirect));
    };

    tracing::info!(user_id = %user_id, "Exchanging authorization code for tokens");

    if let Err(e) = state
        .fitbit
        .handle_oauth_callback(&user_id, &code, &callback_url)
        .await
    {
        tracing::error!(error = %e, user_id = %user_id, "Fitbit token exchange failed");
        let redirect = format!("{}?error=exchange_failed", frontend_url);
        return Ok(Redirect::temporary(&redirect));
    }

    let redirect = format!("{}?connected=fitbit", frontend_url);
    Ok(Redirect::temporary(&redirect))
}

/// Reconstruct this service's callback URL from the request Host header.
fn callback_url_from_headers(headers: &axum::http::HeaderMap) -> String {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost:8080");

    let scheme = if host.contains("localhost") || host.contains("127.0.0.1") {
        "http"
    } else {
        "https"
    };

    format!("{}://{}/auth/fitbit/callback", scheme, host)
}

/// Verify the HMAC signature and decode (user_id, frontend_url) from the
/// OAuth state parameter.
fn verify_and_decode_state(state: &str, secret: &[u8]) -> Option<(String, String)> {
    let bytes = URL_SAFE_NO_PAD.decode(state).ok()?;
    let state_str = String::from_utf8(bytes).ok()?;

    // Format is "user_id|frontend_url|timestamp_hex|signature_hex"
    let parts: Vec<&str> = state_str.splitn(4, '|').collect();
    if parts.len() != 4 {
        return None;
    }

    let user_id = parts[0];
    let frontend_url = parts[1];
    let timestamp_hex = parts[2];
    let signature_hex = parts[3];

    // Reconstruct payload and verify signature
    let payload = format!("{}|{}|{}", user_id, frontend_url, timestamp_hex);

    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(payload.as_bytes());

    let expected_signature = hex::encode(mac.finalize().into_bytes());

    if signature_hex != expected_signature {
        tracing::error!("OAuth state signature mismatch! Potential tampering.");
        return None;
    }

    Some((user_id.to_string(), frontend_url.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_state(user_id: &str, frontend_url: &str, secret: &[u8]) -> String {
        let payload = format!("{}|{}|{:x}", user_id, frontend_url, 1234567890u128);
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        let state_data = format!("{}|{}", payload, signature);
        URL_SAFE_NO_PAD.encode(state_data.as_bytes())
    }

    #[test]
    fn test_verify_and_decode_state_success() {
        let secret = b"secret_key";
        let encoded = encode_state("user123", "https://example.com", secret);

        let result = verify_and_decode_state(&encoded, secret);
        assert_eq!(
            result,
            Some(("user123".to_string(), "https://example.com".to_string()))
        );
    }

    #[test]
    fn test_verify_and_decode_state_invalid_signature() {
        let secret = b"secret_key";
        let payload = format!("user123|https://example.com|{:x}", 1234567890u128);
        let state_data = format!("{}|{}", payload, "invalid_signature");
        let encoded = URL_SAFE_NO_PAD.encode(state_data.as_bytes());

        assert_eq!(verify_and_decode_state(&encoded, secret), None);
    }

    #[test]
    fn test_verify_and_decode_state_wrong_secret() {
        let secret = b"secret_key";
        let encoded = encode_state("user123", "https://example.com", secret);

        assert_eq!(verify_and_decode_state(&encoded, b"wrong_key"), None);
    }

    #[test]
    fn test_verify_and_decode_state_malformed() {
        let secret = b"secret_key";
        let encoded = URL_SAFE_NO_PAD.encode("invalid|format");
        assert_eq!(verify_and_decode_state(&encoded, secret), None);
    }
}
