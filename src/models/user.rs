// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! User identity and provider credential models.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of the derived user id (hex characters).
const USER_ID_LEN: usize = 32;

/// Canonical user identity stored in Firestore.
///
/// Created on first contact from the delegated-identity path; referenced by
/// id from every other collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Derived user id (also used as document ID)
    pub user_id: String,
    /// Email address (unique; the id is derived from it)
    pub email: String,
    /// Display name supplied by the identity provider
    pub display_name: String,
    /// First-party email verification flag
    pub verified: bool,
    /// When the user was first seen
    pub created_at: String,
    /// Last activity timestamp
    pub last_active: String,
}

impl User {
    /// Derive the canonical user id from an email address.
    ///
    /// The id is a truncated SHA-256 of the lowercased email, so two
    /// concurrent first-contact requests for the same address compute the
    /// same document id and the store's create-only insert collapses them.
    pub fn id_for_email(email: &str) -> String {
        let digest = Sha256::digest(email.trim().to_lowercase().as_bytes());
        hex::encode(digest)[..USER_ID_LEN].to_string()
    }

    /// Build a new unverified user record from identity-provider claims.
    pub fn from_identity(email: &str, display_name: &str, now: &str) -> Self {
        Self {
            user_id: Self::id_for_email(email),
            email: email.trim().to_lowercase(),
            display_name: display_name.to_string(),
            verified: false,
            created_at: now.to_string(),
            last_active: now.to_string(),
        }
    }
}

/// A user's Fitbit OAuth tokens (sealed before storage).
///
/// One row per user; replaced wholesale on every exchange or refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderTokens {
    /// Sealed access token (base64)
    pub access_token_sealed: String,
    /// Sealed refresh token (base64)
    pub refresh_token_sealed: String,
    /// When the access token expires (ISO 8601)
    pub expires_at: String,
    /// Granted OAuth scopes
    pub scopes: Vec<String>,
}
