// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Best-effort sync notifications.
//!
//! When a sync is requested or fulfilled, the other device can be nudged
//! through an optional outbound webhook (push relay, chat hook, whatever
//! the deployment wires up). Delivery is fire-and-forget: failures are
//! logged and never propagate into the primary operation.

use crate::config::Config;
use crate::time_utils::format_utc_rfc3339;
use serde::Serialize;
use std::time::Duration;

/// Timeout for webhook delivery; a slow receiver must not hold anything up.
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(3);

/// Payload posted to the notification webhook.
#[derive(Debug, Clone, Serialize)]
pub struct SyncEventPayload {
    pub event: String,
    pub user_id: String,
    pub at: String,
}

/// Best-effort notification sender.
#[derive(Clone)]
pub struct NotifyService {
    http: reqwest::Client,
    webhook_url: Option<String>,
}

impl NotifyService {
    pub fn new(config: &Config) -> Self {
        let http = reqwest::Client::builder()
            .timeout(NOTIFY_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            webhook_url: config.notify_webhook_url.clone(),
        }
    }

    /// Disabled notifier (tests).
    pub fn disabled() -> Self {
        Self {
            http: reqwest::Client::new(),
            webhook_url: None,
        }
    }

    /// Fire a sync event notification without blocking the caller.
    pub fn notify(&self, user_id: &str, event: &str) {
        let Some(url) = self.webhook_url.clone() else {
            return;
        };

        let payload = SyncEventPayload {
            event: event.to_string(),
            user_id: user_id.to_string(),
            at: format_utc_rfc3339(chrono::Utc::now()),
        };

        let http = self.http.clone();
        tokio::spawn(async move {
            match http.post(&url).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    tracing::warn!(
                        status = %response.status(),
                        event = %payload.event,
                        "Sync notification rejected, continuing anyway"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        event = %payload.event,
                        "Sync notification failed, continuing anyway"
                    );
                }
            }
        });
    }
}
