//! # webterm Protocol Library
//!
//! Wire shapes shared by the webterm daemon and its clients.
//!
//! ## Overview
//!
//! - **Terminal channel**: JSON text frames exchanged over the WebSocket
//!   attached to a persistent session ([`ClientMessage`], [`ServerMessage`]),
//!   decoded through the tagged [`Frame`] result so raw passthrough is an
//!   explicit case rather than an error path.
//! - **Query stream**: events of a one-shot query response delivered as
//!   `text/event-stream` ([`QueryEvent`], [`EventStreamDecoder`]).
//! - **Registry shapes**: [`SessionSummary`] and the request bodies of the
//!   session API.
//!
//! ## Channels
//!
//! ```text
//! client ──{type:"input"|"resize"}──▶ daemon ──▶ PTY
//! client ◀──{type:"output"|"exit"}─── daemon ◀── PTY
//!
//! client ──POST {message, sessionId}──▶ daemon ──▶ query subprocess
//! client ◀──data: {type:"text"|"error"|"done"}── daemon
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientMessage, Frame};
//!
//! match Frame::<ClientMessage>::decode(r#"{"type":"resize","cols":80,"rows":24}"#) {
//!     Frame::Structured(ClientMessage::Resize { cols, rows }) => assert_eq!((cols, rows), (80, 24)),
//!     other => panic!("unexpected frame: {other:?}"),
//! }
//! ```

pub mod error;
pub mod messages;
pub mod query;
pub mod session;

pub use error::{ProtocolError, Result};
pub use messages::{ClientMessage, Frame, ServerMessage};
pub use query::{EventStreamDecoder, QueryEvent, QueryRequest};
pub use session::{CreateSessionRequest, RenameSessionRequest, SessionSummary};
