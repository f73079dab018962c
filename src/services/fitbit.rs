// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Fitbit API client and OAuth token lifecycle.
//!
//! Handles:
//! - Authorization URL construction for the connect flow
//! - Authorization-code exchange (basic-auth client credentials)
//! - Token refresh when expired, with per-user serialization
//! - Daily activity fetch for the provider import path

use crate::db::Db;
use crate::error::AppError;
use crate::models::{ProviderTokens, RawSample};
use crate::services::kms::{self, KmsService};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Margin before token expiration when we proactively refresh (5 minutes).
const TOKEN_REFRESH_MARGIN_SECS: i64 = 5 * 60;

/// Scopes requested during the connect flow.
const OAUTH_SCOPES: &str = "activity heartrate";

/// Relative-expiry hint passed on the authorization URL (one week).
const TOKEN_EXPIRY_HINT_SECS: u32 = 604_800;

/// Timeout for all Fitbit HTTP calls.
const HTTP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Fitbit API client.
#[derive(Clone)]
pub struct FitbitClient {
    http: reqwest::Client,
    api_base: String,
    auth_base: String,
    client_id: String,
    client_secret: String,
}

impl FitbitClient {
    /// Create a new Fitbit client with OAuth credentials.
    pub fn new(client_id: String, client_secret: String) -> Self {
        Self::with_base_urls(
            client_id,
            client_secret,
            "https://api.fitbit.com".to_string(),
            "https://www.fitbit.com".to_string(),
        )
    }

    /// Create a client against alternate base URLs (integration tests).
    pub fn with_base_urls(
        client_id: String,
        client_secret: String,
        api_base: String,
        auth_base: String,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            api_base,
            auth_base,
            client_id,
            client_secret,
        }
    }

    /// Build the provider authorization URL for the connect redirect.
    pub fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}/oauth2/authorize?\
             response_type=code&\
             client_id={}&\
             redirect_uri={}&\
             scope={}&\
             expires_in={}&\
             state={}",
            self.auth_base,
            self.client_id,
            urlencoding::encode(redirect_uri),
            urlencoding::encode(OAUTH_SCOPES),
            TOKEN_EXPIRY_HINT_SECS,
            state
        )
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant, AppError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.client_id.as_str()),
        ])
        .await
    }

    /// Refresh an expired access token.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenGrant, AppError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    /// POST to the token endpoint with basic-auth client credentials.
    ///
    /// An `{errors: [...]}` payload or a missing access token fails the
    /// grant regardless of HTTP status; nothing is persisted here.
    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenGrant, AppError> {
        let url = format!("{}/oauth2/token", self.api_base);

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(form)
            .send()
            .await
            .map_err(|e| AppError::ProviderApi(format!("Token request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::ProviderApi(format!("Token response read failed: {}", e)))?;

        let parsed: FitbitTokenResponse = serde_json::from_str(&body).map_err(|e| {
            AppError::ProviderApi(format!("Failed to parse token response: {}", e))
        })?;

        if let Some(errors) = parsed.errors {
            let kinds: Vec<String> = errors.into_iter().map(|e| e.error_type).collect();
            tracing::warn!(status = %status, errors = ?kinds, "Fitbit token grant rejected");
            return Err(AppError::ProviderApi(format!(
                "Token grant rejected: {}",
                kinds.join(", ")
            )));
        }

        if !status.is_success() {
            return Err(AppError::ProviderApi(format!(
                "Token endpoint returned status {}",
                status
            )));
        }

        match (parsed.access_token, parsed.refresh_token, parsed.expires_in) {
            (Some(access), Some(refresh), Some(expires_in)) if !access.is_empty() => {
                Ok(TokenGrant {
                    access_token: access,
                    refresh_token: refresh,
                    expires_in,
                    scope: parsed.scope,
                })
            }
            _ => Err(AppError::ProviderApi(
                "Token response missing access token".to_string(),
            )),
        }
    }

    /// Fetch the daily activity summary for a date (YYYY-MM-DD).
    ///
    /// Returns the parsed summary and the raw body (stored as the import
    /// snapshot).
    pub async fn get_daily_activity(
        &self,
        access_token: &str,
        date: &str,
    ) -> Result<(DailySummary, String), AppError> {
        let url = format!("{}/1/user/-/activities/date/{}.json", self.api_base, date);

        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AppError::ProviderApi(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::ProviderApi(e.to_string()))?;

        if !status.is_success() {
            return Err(AppError::ProviderApi(format!("HTTP {}: {}", status, body)));
        }

        let parsed: DailyActivityResponse = serde_json::from_str(&body)
            .map_err(|e| AppError::ProviderApi(format!("JSON parse error: {}", e)))?;

        Ok((parsed.summary.unwrap_or_default(), body))
    }
}

/// A successful token grant from Fitbit.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub scope: Option<String>,
}

/// Raw token endpoint response; success and error shapes share it.
#[derive(Debug, Deserialize)]
struct FitbitTokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
    errors: Option<Vec<FitbitApiError>>,
}

#[derive(Debug, Deserialize)]
struct FitbitApiError {
    #[serde(rename = "errorType")]
    error_type: String,
    #[allow(dead_code)]
    message: Option<String>,
}

/// Daily activity summary fields we ingest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DailySummary {
    pub steps: Option<i64>,
    #[serde(rename = "restingHeartRate")]
    pub resting_heart_rate: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DailyActivityResponse {
    summary: Option<DailySummary>,
}

// ─────────────────────────────────────────────────────────────────────────────
// FitbitService - High-level service with token management
// ─────────────────────────────────────────────────────────────────────────────

/// Cached access token with expiry information.
#[derive(Clone)]
pub struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

/// Shared token cache type for use in AppState.
pub type TokenCache = Arc<DashMap<String, CachedToken>>;

/// Shared refresh locks type for use in AppState.
pub type RefreshLocks = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// High-level Fitbit service that manages token lifecycle and API calls.
///
/// This service encapsulates:
/// - Token retrieval and unsealing from the store
/// - Proactive refresh when expiring (with 5-minute margin)
/// - Re-sealing and storage of refreshed tokens
/// - In-memory token caching to reduce KMS calls
/// - Per-user locking to prevent duplicate refresh calls
#[derive(Clone)]
pub struct FitbitService {
    client: FitbitClient,
    db: Db,
    kms: KmsService,
    /// In-memory cache of unsealed access tokens (shared across requests).
    token_cache: TokenCache,
    /// Per-user mutex to serialize token refresh operations.
    refresh_locks: RefreshLocks,
}

impl FitbitService {
    /// Create a new Fitbit service with shared token cache.
    pub fn new(
        client: FitbitClient,
        db: Db,
        kms: KmsService,
        token_cache: TokenCache,
        refresh_locks: RefreshLocks,
    ) -> Self {
        Self {
            client,
            db,
            kms,
            token_cache,
            refresh_locks,
        }
    }

    /// Build the provider authorization URL for the connect redirect.
    pub fn authorize_url(&self, redirect_uri: &str, state: &str) -> String {
        self.client.authorize_url(redirect_uri, state)
    }

    // ─── OAuth Callback Handling ─────────────────────────────────────────────

    /// Handle the OAuth callback: exchange the code and store sealed tokens.
    ///
    /// A rejected exchange persists nothing; the row from the last
    /// successful exchange (if any) is untouched.
    pub async fn handle_oauth_callback(
        &self,
        user_id: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<(), AppError> {
        let grant = self.client.exchange_code(code, redirect_uri).await?;

        let now = Utc::now();
        let expires_at = now + Duration::seconds(grant.expires_in);

        let (sealed_access, sealed_refresh) =
            kms::seal_tokens(&self.kms, &grant.access_token, &grant.refresh_token, user_id)
                .await?;

        let scopes = grant
            .scope
            .as_deref()
            .unwrap_or(OAUTH_SCOPES)
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let tokens = ProviderTokens {
            access_token_sealed: sealed_access,
            refresh_token_sealed: sealed_refresh,
            expires_at: expires_at.to_rfc3339(),
            scopes,
        };

        self.db.set_provider_tokens(user_id, &tokens).await?;

        self.token_cache.insert(
            user_id.to_string(),
            CachedToken {
                access_token: grant.access_token,
                expires_at,
            },
        );

        tracing::info!(user_id, "OAuth code exchanged, provider tokens stored");
        Ok(())
    }

    // ─── Token Management ────────────────────────────────────────────────────

    /// Get a valid (non-expired) access token for the given user.
    ///
    /// 1. Check in-memory cache (fast path - no I/O)
    /// 2. Acquire per-user lock to prevent duplicate refresh calls
    /// 3. Re-check cache after lock (another task may have refreshed)
    /// 4. Fetch from the store and unseal
    /// 5. If token is valid, cache and return
    /// 6. If expired, refresh with Fitbit, re-seal and store
    ///
    /// No stored row, or a rejected refresh, surfaces `ProviderReauth` so
    /// the client re-runs the connect flow; a failed refresh never
    /// overwrites the stored row.
    pub async fn get_valid_access_token(&self, user_id: &str) -> Result<String, AppError> {
        let now = Utc::now();
        let margin = Duration::seconds(TOKEN_REFRESH_MARGIN_SECS);

        if let Some(cached) = self.token_cache.get(user_id) {
            if now + margin < cached.expires_at {
                return Ok(cached.access_token.clone());
            }
        }

        let lock = self
            .refresh_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let _guard = lock.lock().await;

        // Another task may have refreshed while we were waiting.
        if let Some(cached) = self.token_cache.get(user_id) {
            if now + margin < cached.expires_at {
                return Ok(cached.access_token.clone());
            }
        }

        let tokens = self
            .db
            .get_provider_tokens(user_id)
            .await?
            .ok_or(AppError::ProviderReauth)?;

        let access_token = self
            .kms
            .decrypt(&tokens.access_token_sealed, Some(user_id.as_bytes()))
            .await?;

        let expires_at = DateTime::parse_from_rfc3339(&tokens.expires_at)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to parse expiry: {}", e)))?
            .with_timezone(&Utc);

        if now + margin < expires_at {
            self.token_cache.insert(
                user_id.to_string(),
                CachedToken {
                    access_token: access_token.clone(),
                    expires_at,
                },
            );
            return Ok(access_token);
        }

        tracing::info!(user_id, "Access token expired, refreshing");

        let refresh_token = self
            .kms
            .decrypt(&tokens.refresh_token_sealed, Some(user_id.as_bytes()))
            .await?;

        let grant = match self.client.refresh_token(&refresh_token).await {
            Ok(g) => g,
            Err(AppError::ProviderApi(msg)) => {
                tracing::warn!(user_id, reason = %msg, "Token refresh rejected");
                return Err(AppError::ProviderReauth);
            }
            Err(e) => return Err(e),
        };

        let new_expires_at = now + Duration::seconds(grant.expires_in);

        let (sealed_access, sealed_refresh) =
            kms::seal_tokens(&self.kms, &grant.access_token, &grant.refresh_token, user_id)
                .await?;

        let updated = ProviderTokens {
            access_token_sealed: sealed_access,
            refresh_token_sealed: sealed_refresh,
            expires_at: new_expires_at.to_rfc3339(),
            scopes: tokens.scopes.clone(),
        };

        self.db.set_provider_tokens(user_id, &updated).await?;

        self.token_cache.insert(
            user_id.to_string(),
            CachedToken {
                access_token: grant.access_token.clone(),
                expires_at: new_expires_at,
            },
        );

        tracing::info!(user_id, "Token refreshed and cached");
        Ok(grant.access_token)
    }

    // ─── Provider Import ─────────────────────────────────────────────────────

    /// Pull today's summary from Fitbit and map it to raw samples.
    ///
    /// Returns the samples plus the raw provider payload, which the import
    /// path stores as the sync snapshot.
    pub async fn fetch_today_samples(
        &self,
        user_id: &str,
    ) -> Result<(Vec<RawSample>, String), AppError> {
        let access_token = self.get_valid_access_token(user_id).await?;

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let (summary, raw) = self.client.get_daily_activity(&access_token, &today).await?;

        // Daily aggregates are keyed to midnight UTC so re-imports of the
        // same day land on the same record identity.
        let date = format!("{}T00:00:00Z", today);
        let mut samples = Vec::new();

        if let Some(steps) = summary.steps {
            samples.push(RawSample {
                kind: "step-count".to_string(),
                date: date.clone(),
                count: Some(serde_json::json!(steps)),
                bpm: None,
                value: None,
                duration: None,
                systolic: None,
                diastolic: None,
            });
        }

        if let Some(resting) = summary.resting_heart_rate {
            samples.push(RawSample {
                kind: "heart-rate".to_string(),
                date: date.clone(),
                count: None,
                bpm: Some(serde_json::json!(resting)),
                value: None,
                duration: None,
                systolic: None,
                diastolic: None,
            });
        }

        tracing::info!(user_id, sample_count = samples.len(), "Fetched Fitbit daily summary");
        Ok((samples, raw))
    }
}
