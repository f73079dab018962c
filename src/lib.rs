// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Vitalsync: cross-device health-data synchronization backend.
//!
//! This crate provides the API that lets the web and mobile clients share
//! one per-user health-record store, coordinate sync timing through a
//! durable pending flag, and import health data from Fitbit via OAuth2.

pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod time_utils;

use config::Config;
use db::Db;
use services::{FitbitService, IdentityBridge, NotifyService, SyncService};

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub db: Db,
    pub identity: IdentityBridge,
    pub fitbit: FitbitService,
    pub sync: SyncService,
    pub notify: NotifyService,
}
