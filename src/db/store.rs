// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore client wrapper with typed operations.
//!
//! Provides high-level operations for:
//! - Users (identity records, create-if-absent)
//! - Provider tokens (sealed Fitbit OAuth tokens)
//! - Sync states (per-user pending flag + last-synced timestamp)
//! - Health records (append-only sample rows, batch-inserted)
//!
//! Two backends sit behind the same API: real Firestore (emulator-aware)
//! for production, and an in-memory map store so integration tests can
//! drive the full sync flows offline.

use crate::db::collections;
use crate::error::AppError;
use crate::models::{HealthRecord, ProviderTokens, SyncState, User};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Database client.
#[derive(Clone)]
pub struct Db {
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Firestore(firestore::FirestoreDb),
    Memory(Arc<MemStore>),
}

/// In-memory backend. Typed maps keyed by document id, with per-user
/// write locks standing in for Firestore transactions.
#[derive(Default)]
struct MemStore {
    users: DashMap<String, User>,
    tokens: DashMap<String, ProviderTokens>,
    sync_states: DashMap<String, SyncState>,
    records: DashMap<String, HealthRecord>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MemStore {
    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Db {
    /// Create a new Firestore-backed client.
    ///
    /// For local development with emulator, set FIRESTORE_EMULATOR_HOST.
    pub async fn connect(project_id: &str) -> Result<Self, AppError> {
        // If the emulator environment variable is set, use unauthenticated
        // connection to avoid local credential warnings and leakage.
        if std::env::var("FIRESTORE_EMULATOR_HOST").is_ok() {
            return Self::create_emulator_client(project_id).await;
        }

        let client = firestore::FirestoreDb::new(project_id)
            .await
            .map_err(|e| AppError::Database(format!("Failed to connect to Firestore: {}", e)))?;

        tracing::info!(project = project_id, "Connected to Firestore");

        Ok(Self {
            backend: Backend::Firestore(client),
        })
    }

    /// Create a Firestore client for the emulator with unauthenticated access.
    async fn create_emulator_client(project_id: &str) -> Result<Self, AppError> {
        tracing::info!("Using unauthenticated connection for Firestore Emulator");

        let token_source = gcloud_sdk::ExternalJwtFunctionSource::new(|| async {
            Ok(gcloud_sdk::Token {
                token_type: "Bearer".to_string(),
                token: gcloud_sdk::SecretValue::new(
                    "eyJhbGciOiJub25lIn0.eyJ1aWQiOiJ0ZXN0In0."
                        .to_string()
                        .into(),
                ),
                expiry: chrono::Utc::now() + chrono::Duration::hours(1),
            })
        });

        let options = firestore::FirestoreDbOptions::new(project_id.to_string());

        let client = firestore::FirestoreDb::with_options_token_source(
            options,
            gcloud_sdk::GCP_DEFAULT_SCOPES.clone(),
            gcloud_sdk::TokenSourceType::ExternalSource(Box::new(token_source)),
        )
        .await
        .map_err(|e| {
            AppError::Database(format!("Failed to connect to Firestore Emulator: {}", e))
        })?;

        tracing::info!(
            project = project_id,
            "Connected to Firestore (Emulator/Unauthenticated)"
        );

        Ok(Self {
            backend: Backend::Firestore(client),
        })
    }

    /// Create an in-memory store.
    ///
    /// Fully functional but non-durable; used by integration tests to
    /// exercise the sync state machine and ingestion pipeline offline.
    pub fn new_memory() -> Self {
        Self {
            backend: Backend::Memory(Arc::new(MemStore::default())),
        }
    }

    // ─── User Operations ─────────────────────────────────────────

    /// Get a user by id.
    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>, AppError> {
        match &self.backend {
            Backend::Firestore(client) => client
                .fluent()
                .select()
                .by_id_in(collections::USERS)
                .obj()
                .one(user_id)
                .await
                .map_err(|e| AppError::Database(e.to_string())),
            Backend::Memory(mem) => Ok(mem.users.get(user_id).map(|u| u.clone())),
        }
    }

    /// Create a user if no row with that id exists; return the stored row.
    ///
    /// Uses a create-only insert so concurrent first-contact requests for
    /// the same email cannot produce duplicates: the loser of the race gets
    /// a conflict and reads the winner's row. The caller derives the id
    /// deterministically from the email.
    pub async fn create_user_if_absent(&self, user: &User) -> Result<User, AppError> {
        match &self.backend {
            Backend::Firestore(client) => {
                if let Some(existing) = self.get_user(&user.user_id).await? {
                    return Ok(existing);
                }

                let inserted: Result<(), firestore::errors::FirestoreError> = client
                    .fluent()
                    .insert()
                    .into(collections::USERS)
                    .document_id(&user.user_id)
                    .object(user)
                    .execute()
                    .await;

                match inserted {
                    Ok(()) => Ok(user.clone()),
                    Err(firestore::errors::FirestoreError::DataConflictError(_)) => {
                        // Lost the creation race; fetch the winner's row.
                        self.get_user(&user.user_id).await?.ok_or_else(|| {
                            AppError::Database(format!(
                                "User {} vanished after insert conflict",
                                user.user_id
                            ))
                        })
                    }
                    Err(e) => Err(AppError::Database(e.to_string())),
                }
            }
            Backend::Memory(mem) => {
                let entry = mem
                    .users
                    .entry(user.user_id.clone())
                    .or_insert_with(|| user.clone());
                Ok(entry.clone())
            }
        }
    }

    // ─── Provider Token Operations ───────────────────────────────

    /// Get sealed provider tokens for a user.
    pub async fn get_provider_tokens(
        &self,
        user_id: &str,
    ) -> Result<Option<ProviderTokens>, AppError> {
        match &self.backend {
            Backend::Firestore(client) => client
                .fluent()
                .select()
                .by_id_in(collections::PROVIDER_TOKENS)
                .obj()
                .one(user_id)
                .await
                .map_err(|e| AppError::Database(e.to_string())),
            Backend::Memory(mem) => Ok(mem.tokens.get(user_id).map(|t| t.clone())),
        }
    }

    /// Store sealed provider tokens for a user (upsert keyed by user id).
    pub async fn set_provider_tokens(
        &self,
        user_id: &str,
        tokens: &ProviderTokens,
    ) -> Result<(), AppError> {
        match &self.backend {
            Backend::Firestore(client) => {
                let _: () = client
                    .fluent()
                    .update()
                    .in_col(collections::PROVIDER_TOKENS)
                    .document_id(user_id)
                    .object(tokens)
                    .execute()
                    .await
                    .map_err(|e| AppError::Database(e.to_string()))?;
                Ok(())
            }
            Backend::Memory(mem) => {
                mem.tokens.insert(user_id.to_string(), tokens.clone());
                Ok(())
            }
        }
    }

    // ─── Sync State Operations ───────────────────────────────────

    /// Get a user's sync state. Absence means no sync was ever requested.
    pub async fn get_sync_state(&self, user_id: &str) -> Result<Option<SyncState>, AppError> {
        match &self.backend {
            Backend::Firestore(client) => client
                .fluent()
                .select()
                .by_id_in(collections::SYNC_STATES)
                .obj()
                .one(user_id)
                .await
                .map_err(|e| AppError::Database(e.to_string())),
            Backend::Memory(mem) => Ok(mem.sync_states.get(user_id).map(|s| s.clone())),
        }
    }

    /// Store a user's sync state (whole-row upsert keyed by user id;
    /// last writer wins, which the pending-flag protocol tolerates).
    pub async fn set_sync_state(&self, user_id: &str, state: &SyncState) -> Result<(), AppError> {
        match &self.backend {
            Backend::Firestore(client) => {
                let _: () = client
                    .fluent()
                    .update()
                    .in_col(collections::SYNC_STATES)
                    .document_id(user_id)
                    .object(state)
                    .execute()
                    .await
                    .map_err(|e| AppError::Database(e.to_string()))?;
                Ok(())
            }
            Backend::Memory(mem) => {
                mem.sync_states.insert(user_id.to_string(), state.clone());
                Ok(())
            }
        }
    }

    // ─── Health Record Operations ────────────────────────────────

    /// Get the most recent records for a user, newest first.
    pub async fn get_recent_records(
        &self,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<HealthRecord>, AppError> {
        match &self.backend {
            Backend::Firestore(client) => {
                let user_id = user_id.to_string();
                client
                    .fluent()
                    .select()
                    .from(collections::HEALTH_RECORDS)
                    .filter(move |q| q.for_all([q.field("user_id").eq(user_id.clone())]))
                    .order_by([(
                        "recorded_at",
                        firestore::FirestoreQueryDirection::Descending,
                    )])
                    .limit(limit)
                    .obj()
                    .query()
                    .await
                    .map_err(|e| AppError::Database(e.to_string()))
            }
            Backend::Memory(mem) => {
                let mut records: Vec<HealthRecord> = mem
                    .records
                    .iter()
                    .filter(|r| r.user_id == user_id)
                    .map(|r| r.clone())
                    .collect();
                records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
                records.truncate(limit as usize);
                Ok(records)
            }
        }
    }

    /// Count all records for a user (tests and diagnostics).
    pub async fn count_records(&self, user_id: &str) -> Result<usize, AppError> {
        match &self.backend {
            Backend::Firestore(client) => {
                let user_id = user_id.to_string();
                let records: Vec<HealthRecord> = client
                    .fluent()
                    .select()
                    .from(collections::HEALTH_RECORDS)
                    .filter(move |q| q.for_all([q.field("user_id").eq(user_id.clone())]))
                    .obj()
                    .query()
                    .await
                    .map_err(|e| AppError::Database(e.to_string()))?;
                Ok(records.len())
            }
            Backend::Memory(mem) => {
                Ok(mem.records.iter().filter(|r| r.user_id == user_id).count())
            }
        }
    }

    // ─── Atomic Ingestion ────────────────────────────────────────

    /// Atomically write a record batch and the fulfilled sync state.
    ///
    /// All record writes and the sync-state write commit together; if the
    /// batch fails, the pending flag stays set so a future sync attempt is
    /// not skipped. Record document ids are deterministic in
    /// (user, kind, recorded_at), so retried batches overwrite rather than
    /// duplicate.
    pub async fn ingest_atomic(
        &self,
        user_id: &str,
        records: &[HealthRecord],
        new_state: &SyncState,
    ) -> Result<(), AppError> {
        match &self.backend {
            Backend::Firestore(client) => {
                let mut transaction = client.begin_transaction().await.map_err(|e| {
                    AppError::Database(format!("Failed to begin transaction: {}", e))
                })?;

                for record in records {
                    client
                        .fluent()
                        .update()
                        .in_col(collections::HEALTH_RECORDS)
                        .document_id(record.doc_id())
                        .object(record)
                        .add_to_transaction(&mut transaction)
                        .map_err(|e| {
                            AppError::Database(format!(
                                "Failed to add record to transaction: {}",
                                e
                            ))
                        })?;
                }

                client
                    .fluent()
                    .update()
                    .in_col(collections::SYNC_STATES)
                    .document_id(user_id)
                    .object(new_state)
                    .add_to_transaction(&mut transaction)
                    .map_err(|e| {
                        AppError::Database(format!(
                            "Failed to add sync state to transaction: {}",
                            e
                        ))
                    })?;

                transaction
                    .commit()
                    .await
                    .map_err(|e| AppError::Database(format!("Transaction commit failed: {}", e)))?;

                tracing::info!(
                    user_id,
                    record_count = records.len(),
                    "Ingestion batch committed"
                );

                Ok(())
            }
            Backend::Memory(mem) => {
                let lock = mem.user_lock(user_id);
                let _guard = lock.lock().await;

                for record in records {
                    mem.records.insert(record.doc_id(), record.clone());
                }
                mem.sync_states.insert(user_id.to_string(), new_state.clone());
                Ok(())
            }
        }
    }
}
