//! HTTP, WebSocket and SSE surface over the session broker.
//!
//! | route                       | handler |
//! |-----------------------------|---------|
//! | `GET /api/health`           | [`api::health`] |
//! | `GET/POST /api/sessions`    | list / create |
//! | `GET/PATCH/DELETE /api/sessions/:id` | get / rename / terminate |
//! | `GET /ws/:id`               | [`ws::ws_handler`] |
//! | `POST /api/chat`            | [`chat::chat_handler`] |

pub mod api;
pub mod chat;
mod error;
mod state;
pub mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use error::{ApiError, ServerError};
pub use state::AppState;

use crate::config::Config;
use crate::session::Reaper;

/// Create the router with all routes configured.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(api::health))
        .route(
            "/api/sessions",
            get(api::list_sessions).post(api::create_session),
        )
        .route(
            "/api/sessions/:id",
            get(api::get_session)
                .patch(api::rename_session)
                .delete(api::delete_session),
        )
        .route("/ws/:id", get(ws::ws_handler))
        .route("/api/chat", post(chat::chat_handler))
        .with_state(state)
}

/// The webterm server.
pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            state: Arc::new(AppState::new(config)),
        }
    }

    /// Get the shared application state
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Binds the configured address and serves until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let addr = self.state.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.clone(),
                source: e,
            })?;

        tracing::info!("webterm server listening on {}", addr);
        self.serve(listener, shutdown).await
    }

    /// Serves on an already bound listener. Starts the reaper, and on
    /// shutdown terminates every remaining session.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        let reaper_config = &self.state.config.reaper;
        let reaper = Reaper::spawn(
            Arc::clone(&self.state.registry),
            reaper_config.interval(),
            reaper_config.idle_timeout(),
            shutdown.child_token(),
        );

        let router = create_router(Arc::clone(&self.state));
        let signal = shutdown.clone();
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await
            .map_err(|e| ServerError::Internal(e.to_string()));

        shutdown.cancel();
        if let Err(e) = reaper.await {
            tracing::warn!(error = %e, "Reaper task failed");
        }

        let terminated = self.state.registry.terminate_all().await;
        tracing::info!(sessions = terminated, "Server stopped");
        result
    }
}
