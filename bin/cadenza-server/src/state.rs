//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use cadenza_core::TaskRegistry;

use crate::config::Config;

#[derive(Clone, Debug)]
pub struct AppState {
    /// Server configuration (env-derived).
    pub config: Arc<Config>,
    /// Owner of every task record.
    pub registry: Arc<TaskRegistry>,
}
