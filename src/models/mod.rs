// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Data models for the application.

pub mod health;
pub mod user;

pub use health::{HealthRecord, RawSample, RecordKind, SampleError, SyncState};
pub use user::{ProviderTokens, User};
