// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Cloud KMS service for sealing Fitbit OAuth tokens at rest.
//!
//! Uses direct KMS encryption (not envelope encryption) for simplicity,
//! with the owning user id as additional authenticated data so a sealed
//! token cannot be replayed under another user's row.

use crate::error::AppError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// KMS encryption service.
#[derive(Clone)]
pub struct KmsService {
    /// Full resource path to the KMS key
    /// Format: projects/{project}/locations/{location}/keyRings/{ring}/cryptoKeys/{key}
    key_path: String,

    /// GCP KMS client
    client: Option<std::sync::Arc<google_cloud_kms::client::Client>>,
}

impl KmsService {
    /// KMS Key Ring Name
    const KEY_RING_NAME: &str = "vitalsync";

    /// Create a new KMS service.
    /// Connects to GCP KMS.
    pub async fn new(project_id: &str, location: &str, key_name: &str) -> Result<Self, AppError> {
        let key_path = format!(
            "projects/{}/locations/{}/keyRings/{}/cryptoKeys/{}",
            project_id,
            location,
            Self::KEY_RING_NAME,
            key_name
        );

        let config = google_cloud_kms::client::ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| {
                AppError::Internal(anyhow::anyhow!("Failed to create KMS auth config: {}", e))
            })?;

        let client = google_cloud_kms::client::Client::new(config)
            .await
            .map_err(|e| {
                AppError::Internal(anyhow::anyhow!("Failed to create KMS client: {}", e))
            })?;

        Ok(Self {
            key_path,
            client: Some(std::sync::Arc::new(client)),
        })
    }

    /// Create a mock KMS service for testing (offline mode).
    /// Only available in debug/test builds.
    #[cfg(debug_assertions)]
    pub fn new_mock() -> Self {
        Self {
            key_path: "projects/mock/locations/mock/keyRings/mock/cryptoKeys/mock".to_string(),
            client: None,
        }
    }

    /// Encrypt plaintext data using KMS with optional AAD.
    /// Returns base64-encoded ciphertext.
    pub async fn encrypt(&self, plaintext: &str, aad: Option<&[u8]>) -> Result<String, AppError> {
        use google_cloud_googleapis::cloud::kms::v1::EncryptRequest;

        // Mock mode (Debug builds only): AAD is bound into the mock
        // ciphertext so mismatches fail like the real thing.
        #[cfg(debug_assertions)]
        {
            if self.client.is_none() {
                let bound = format!(
                    "{}|{}",
                    hex::encode(aad.unwrap_or_default()),
                    plaintext
                );
                return Ok(BASE64.encode(bound));
            }
        }

        // Production/Real mode. In release builds, this check ensures we
        // return an error if the client is missing rather than sealing
        // with a passthrough.
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("KMS client not connected")))?;

        let req = EncryptRequest {
            name: self.key_path.clone(),
            plaintext: plaintext.as_bytes().to_vec(),
            additional_authenticated_data: aad.map(|a| a.to_vec()).unwrap_or_default(),
            ..Default::default()
        };

        let response = client
            .encrypt(req, None)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("KMS encrypt failed: {}", e)))?;

        Ok(BASE64.encode(response.ciphertext))
    }

    /// Decrypt ciphertext using KMS with optional AAD.
    /// Expects base64-encoded ciphertext.
    pub async fn decrypt(
        &self,
        ciphertext_b64: &str,
        aad: Option<&[u8]>,
    ) -> Result<String, AppError> {
        use google_cloud_googleapis::cloud::kms::v1::DecryptRequest;

        // Mock mode (Debug builds only)
        #[cfg(debug_assertions)]
        {
            if self.client.is_none() {
                let bytes = BASE64.decode(ciphertext_b64).map_err(|e| {
                    AppError::Internal(anyhow::anyhow!("Base64 decode failed (mock): {}", e))
                })?;
                let bound = String::from_utf8(bytes).map_err(|e| {
                    AppError::Internal(anyhow::anyhow!("UTF-8 decode failed (mock): {}", e))
                })?;
                let (bound_aad, plaintext) = bound.split_once('|').ok_or_else(|| {
                    AppError::Internal(anyhow::anyhow!("Malformed mock ciphertext"))
                })?;
                if bound_aad != hex::encode(aad.unwrap_or_default()) {
                    return Err(AppError::Internal(anyhow::anyhow!(
                        "AAD mismatch (mock)"
                    )));
                }
                return Ok(plaintext.to_string());
            }
        }

        // Production/Real mode
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("KMS client not connected")))?;

        let ciphertext = BASE64
            .decode(ciphertext_b64)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Base64 decode failed: {}", e)))?;

        let req = DecryptRequest {
            name: self.key_path.clone(),
            ciphertext,
            additional_authenticated_data: aad.map(|a| a.to_vec()).unwrap_or_default(),
            ..Default::default()
        };

        let response = client
            .decrypt(req, None)
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("KMS decrypt failed: {}", e)))?;

        String::from_utf8(response.plaintext)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("UTF-8 decode failed: {}", e)))
    }
}

/// Seal an access/refresh token pair for a user before storing.
pub async fn seal_tokens(
    kms: &KmsService,
    access_token: &str,
    refresh_token: &str,
    user_id: &str,
) -> Result<(String, String), AppError> {
    let aad = user_id.as_bytes();
    let sealed_access = kms.encrypt(access_token, Some(aad)).await?;
    let sealed_refresh = kms.encrypt(refresh_token, Some(aad)).await?;
    Ok((sealed_access, sealed_refresh))
}

/// Open a sealed access/refresh token pair after retrieval.
pub async fn open_tokens(
    kms: &KmsService,
    sealed_access: &str,
    sealed_refresh: &str,
    user_id: &str,
) -> Result<(String, String), AppError> {
    let aad = user_id.as_bytes();
    let access_token = kms.decrypt(sealed_access, Some(aad)).await?;
    let refresh_token = kms.decrypt(sealed_refresh, Some(aad)).await?;
    Ok((access_token, refresh_token))
}
