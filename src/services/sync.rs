// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Sync state machine and record ingestion pipeline.
//!
//! The pending flag is a coarse cross-device signal: "the web app wants
//! fresh data; mobile, please upload". It is not a lock. Two requests
//! collapse into one pending state, and a fulfill racing a fresh request
//! can legitimately leave the flag set again right after clearing it —
//! that just means a new request arrived after the old one was satisfied.
//! All coordination happens through the durable rows, so the subsystem is
//! safe across stateless server processes.

use crate::db::Db;
use crate::error::AppError;
use crate::models::{HealthRecord, RawSample, SyncState};
use crate::services::notify::NotifyService;
use crate::time_utils::format_utc_rfc3339;
use chrono::Utc;

/// Sync coordination and ingestion.
#[derive(Clone)]
pub struct SyncService {
    db: Db,
    notify: NotifyService,
}

impl SyncService {
    pub fn new(db: Db, notify: NotifyService) -> Self {
        Self { db, notify }
    }

    /// Register a sync request for a user (web principal).
    ///
    /// Idle → PendingSync, or a no-op if already pending. The row is
    /// created lazily on first request; `last_synced_at` is preserved.
    pub async fn request_sync(&self, user_id: &str) -> Result<(), AppError> {
        let now = format_utc_rfc3339(Utc::now());

        let mut state = self
            .db
            .get_sync_state(user_id)
            .await?
            .unwrap_or_else(|| SyncState::initial(&now));

        state.pending = true;
        state.updated_at = now;

        self.db.set_sync_state(user_id, &state).await?;

        tracing::info!(user_id, "Sync requested");
        self.notify.notify(user_id, "sync_requested");
        Ok(())
    }

    /// Check whether a sync is pending (mobile principal).
    ///
    /// Pure read; a user with no sync row has never requested a sync.
    pub async fn check_pending(&self, user_id: &str) -> Result<bool, AppError> {
        Ok(self
            .db
            .get_sync_state(user_id)
            .await?
            .map(|s| s.pending)
            .unwrap_or(false))
    }

    /// Validate and persist a sample batch, then fulfill the pending flag.
    ///
    /// All-or-nothing: one unknown type or unparseable date rejects the
    /// whole batch before anything is written. The batch insert and the
    /// fulfill write commit as one unit, so a failed insert leaves the
    /// pending flag set. An empty batch is a valid "no new data"
    /// confirmation and still fulfills.
    ///
    /// The provider import path passes the raw payload as `snapshot`; the
    /// mobile upload path passes none and the previous snapshot survives.
    pub async fn ingest(
        &self,
        user_id: &str,
        samples: &[RawSample],
        snapshot: Option<String>,
    ) -> Result<usize, AppError> {
        let now = format_utc_rfc3339(Utc::now());

        let mut records: Vec<HealthRecord> = Vec::with_capacity(samples.len());
        for sample in samples {
            let record = sample
                .normalize(user_id, &now)
                .map_err(|e| AppError::Validation(e.to_string()))?;
            records.push(record);
        }

        let prior = self.db.get_sync_state(user_id).await?;
        let new_state = SyncState {
            pending: false,
            last_synced_at: Some(now.clone()),
            raw_snapshot: snapshot.or_else(|| prior.and_then(|s| s.raw_snapshot)),
            updated_at: now,
        };

        self.db.ingest_atomic(user_id, &records, &new_state).await?;

        tracing::info!(
            user_id,
            accepted = records.len(),
            "Ingestion complete, sync fulfilled"
        );
        self.notify.notify(user_id, "sync_fulfilled");

        Ok(records.len())
    }

    /// Most recent records for a user, newest first.
    pub async fn recent_records(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<HealthRecord>, AppError> {
        self.db.get_recent_records(user_id, limit).await
    }
}
