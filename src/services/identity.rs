// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Identity bridge: resolves either credential type to one principal.
//!
//! Two capability-equivalent verifiers feed the same seam: the first-party
//! session JWT (web) and the Google ID token (mobile). The delegated path
//! creates the canonical user record on first contact; the session path
//! never creates anything. Every failure collapses to a uniform 401 so the
//! boundary does not leak which verification step rejected the credential.

use crate::config::Config;
use crate::db::Db;
use crate::error::AppError;
use crate::middleware::auth::SessionClaims;
use crate::models::User;
use crate::services::google_identity::{GoogleIdentityVerifier, IdTokenError};
use crate::time_utils::format_utc_rfc3339;
use axum::http::HeaderValue;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use std::sync::Arc;

/// The authenticated actor making a request, after identity resolution.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
}

/// A credential presented by an inbound request.
pub enum Credential<'a> {
    /// First-party session JWT (from cookie or Authorization header)
    Session(&'a str),
    /// Google ID bearer token (raw Authorization header)
    Delegated(Option<&'a HeaderValue>),
}

/// Resolves credentials to principals.
#[derive(Clone)]
pub struct IdentityBridge {
    jwt_signing_key: Vec<u8>,
    google: Arc<GoogleIdentityVerifier>,
    db: Db,
}

impl IdentityBridge {
    pub fn new(config: &Config, google: Arc<GoogleIdentityVerifier>, db: Db) -> Self {
        Self {
            jwt_signing_key: config.jwt_signing_key.clone(),
            google,
            db,
        }
    }

    /// Resolve a credential to a principal.
    pub async fn resolve(&self, credential: Credential<'_>) -> Result<Principal, AppError> {
        match credential {
            Credential::Session(token) => self.resolve_session(token),
            Credential::Delegated(header) => self.resolve_delegated(header).await,
        }
    }

    /// Web path: verify the session JWT. A session can only exist for an
    /// already-registered user, so no creation happens here.
    fn resolve_session(&self, token: &str) -> Result<Principal, AppError> {
        let key = DecodingKey::from_secret(&self.jwt_signing_key);
        let validation = Validation::new(Algorithm::HS256);

        let token_data = decode::<SessionClaims>(token, &key, &validation)
            .map_err(|_| AppError::Unauthorized)?;

        Ok(Principal {
            user_id: token_data.claims.sub,
        })
    }

    /// Mobile path: verify the Google ID token, then upsert the user.
    ///
    /// The user id derives from the verified email, so repeated calls with
    /// the same email always resolve to the same row and concurrent first
    /// contacts collapse in the store's create-only insert.
    async fn resolve_delegated(
        &self,
        header: Option<&HeaderValue>,
    ) -> Result<Principal, AppError> {
        let identity = self.google.verify_id_token(header).await.map_err(|e| {
            match e {
                IdTokenError::Rejected(msg) => {
                    tracing::debug!(reason = %msg, "Delegated token rejected");
                }
                IdTokenError::Transient(msg) => {
                    tracing::warn!(reason = %msg, "Delegated token verification unavailable");
                }
            }
            AppError::Unauthorized
        })?;

        let now = format_utc_rfc3339(chrono::Utc::now());
        let display_name = identity
            .display_name
            .unwrap_or_else(|| identity.email.split('@').next().unwrap_or_default().to_string());

        let user = User::from_identity(&identity.email, &display_name, &now);
        let stored = self.db.create_user_if_absent(&user).await?;

        Ok(Principal {
            user_id: stored.user_id,
        })
    }
}
