//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use crate::config::Config;
use std::sync::Arc;
use wa_bridge_core::RelayService;

//=========================================================================================
// AppState (Shared Across All Connections)
//=========================================================================================

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<RelayService>,
    pub config: Arc<Config>,
}

/// The caller identity resolved by `require_user`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserId(pub i64);
