// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - business logic layer.

pub mod fitbit;
pub mod google_identity;
pub mod identity;
pub mod kms;
pub mod notify;
pub mod sync;

pub use fitbit::{FitbitClient, FitbitService};
pub use google_identity::{GoogleIdentityVerifier, IdTokenError, VerifiedIdentity};
pub use identity::{Credential, IdentityBridge, Principal};
pub use kms::KmsService;
pub use notify::NotifyService;
pub use sync::SyncService;
