use std::sync::Arc;

use mirage_db::JobStore;
use mirage_engine::Dispatcher;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Job record store (read path).
    pub store: Arc<dyn JobStore>,
    /// Workflow dispatcher (write path).
    pub dispatcher: Arc<Dispatcher>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}
