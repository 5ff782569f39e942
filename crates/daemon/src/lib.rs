//! # webterm Daemon Library
//!
//! This crate provides the session broker behind webterm: persistent shell
//! sessions that any number of browser or terminal clients can attach to,
//! plus one-shot query sessions streamed back over server-sent events.
//!
//! ## Overview
//!
//! - **PTY Sessions**: spawn shells in pseudo-terminals and keep them alive
//!   across client disconnects
//! - **Fan-out Relay**: replay scrollback on attach, broadcast live output,
//!   merge input from every attached client
//! - **Idle Reaper**: reclaim sessions whose process died or went idle
//! - **Query Runner**: one subprocess per request, parsed stream-json deltas
//! - **HTTP Surface**: REST, WebSocket and SSE routes over the above
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         HTTP Server (axum)                       │
//! │   /api/sessions        /ws/:id                 /api/chat (SSE)   │
//! ├───────────┬──────────────┬──────────────────────────┬────────────┤
//! │           │              │                          │            │
//! │  ┌────────▼────────┐  ┌──▼───────────────┐   ┌──────▼────────┐   │
//! │  │ Session Registry│──│  Session Relay   │   │ Query Runner  │   │
//! │  │   (DashMap)     │  │ scrollback+fanout│   │ (subprocess)  │   │
//! │  └────────┬────────┘  └──▲───────────────┘   └───────────────┘   │
//! │           │              │ output                                │
//! │  ┌────────▼────────┐  ┌──┴───────────────┐                       │
//! │  │   Idle Reaper   │  │   PTY Process    │                       │
//! │  └─────────────────┘  └──────────────────┘                       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, Server};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!     config.validate()?;
//!
//!     let shutdown = CancellationToken::new();
//!     Server::new(config).run(shutdown).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY sessions, relay, registry and reaper
//! - [`query`]: One-shot query subprocesses
//! - [`server`]: HTTP, WebSocket and SSE routes

pub mod config;
pub mod query;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use query::{QueryError, QueryOutcome, QueryRunner};
pub use server::{create_router, ApiError, AppState, Server, ServerError};
pub use session::{
    Reaper, Session, SessionError, SessionId, SessionRegistry, SessionRegistryImpl, SessionRelay,
    SweepReport,
};
