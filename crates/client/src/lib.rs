//! Reconnecting terminal client for webterm sessions.
//!
//! [`ReconnectController`] holds the backoff and attempt rules without doing
//! any I/O. [`ReconnectingClient`] drives it over a WebSocket to
//! `/ws/<session-id>`, and the `webterm-attach` binary wires that to the
//! local terminal.

pub mod driver;
pub mod error;
pub mod reconnect;
pub mod terminal;

pub use driver::{session_ws_url, ClientInput, ReconnectingClient, RunOutcome};
pub use error::{ClientError, Result};
pub use reconnect::{
    Action, CloseOutcome, ConnectionState, ReconnectController, ReconnectPolicy,
    ABANDONED_MESSAGE, SESSION_ENDED_MESSAGE,
};
