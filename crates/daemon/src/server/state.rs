//! Shared application state.

use std::sync::Arc;

use crate::config::Config;
use crate::query::QueryRunner;
use crate::session::SessionRegistryImpl;

/// State shared by every handler.
pub struct AppState {
    /// Registry of persistent shell sessions.
    pub registry: Arc<SessionRegistryImpl>,
    /// Spawns one-shot query subprocesses.
    pub runner: QueryRunner,
    /// Effective configuration.
    pub config: Config,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(SessionRegistryImpl::new(config.session.clone()));
        let runner = QueryRunner::new(&config.query, config.session.workspace_root.clone());
        Self {
            registry,
            runner,
            config,
        }
    }
}
