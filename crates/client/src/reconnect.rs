//! Reconnect state machine for a persistent session connection.
//!
//! The controller performs no I/O. A driver reports transport events to it
//! and acts on what it returns, which keeps the backoff and attempt rules
//! testable without sockets or timers.
//!
//! ```text
//! Disconnected ──begin_connect──▶ Connecting ──on_open──▶ Connected
//!      ▲                              │                       │
//!      └───────── on_close: Retry ◀───┴───────────────────────┘
//!                      │
//!                      └── attempts exhausted ──▶ Abandoned
//! ```

use std::time::Duration;

use protocol::{ClientMessage, Frame, ServerMessage};

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);
/// Default growth factor between consecutive retries.
pub const DEFAULT_GROWTH_FACTOR: f64 = 1.5;
/// Default upper bound on a single retry delay.
pub const DEFAULT_CAP_DELAY: Duration = Duration::from_secs(10);
/// Default number of retries before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Shown once when the controller gives up.
pub const ABANDONED_MESSAGE: &str =
    "\r\n\x1b[31mConnection lost. Restart the client to retry.\x1b[0m\r\n";
/// Shown when the server reports that the session's process exited.
pub const SESSION_ENDED_MESSAGE: &str = "\r\n\x1b[33mSession ended.\x1b[0m\r\n";

/// Backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub growth_factor: f64,
    pub cap_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            cap_delay: DEFAULT_CAP_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero-based):
    /// `min(base * factor^attempt, cap)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.growth_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.cap_delay.as_secs_f64() {
            self.cap_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal. Only a new controller leaves this state.
    Abandoned,
}

/// Something the driver must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a message over the open channel.
    Send(ClientMessage),
}

/// Result of reporting a transport close.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    /// Wait this long, then connect again.
    Retry(Duration),
    /// Retries are exhausted; show `message` and stop.
    Abandoned { message: String },
    /// The controller had already given up.
    Ignored,
}

/// Reconnect state machine.
#[derive(Debug, Clone)]
pub struct ReconnectController {
    policy: ReconnectPolicy,
    state: ConnectionState,
    attempts: u32,
    viewport: (u16, u16),
}

impl ReconnectController {
    pub fn new(policy: ReconnectPolicy, cols: u16, rows: u16) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            attempts: 0,
            viewport: (cols, rows),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Retries scheduled since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn viewport(&self) -> (u16, u16) {
        self.viewport
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Marks a connection attempt as started. Returns `false` once abandoned.
    pub fn begin_connect(&mut self) -> bool {
        if self.state == ConnectionState::Abandoned {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    /// The channel opened: reset the attempt counter and announce geometry.
    pub fn on_open(&mut self) -> Vec<Action> {
        if self.state == ConnectionState::Abandoned {
            return Vec::new();
        }
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        vec![Action::Send(self.resize_message())]
    }

    /// The channel closed, or a connection attempt failed.
    pub fn on_close(&mut self) -> CloseOutcome {
        if self.state == ConnectionState::Abandoned {
            return CloseOutcome::Ignored;
        }
        if self.attempts >= self.policy.max_attempts {
            self.state = ConnectionState::Abandoned;
            return CloseOutcome::Abandoned {
                message: ABANDONED_MESSAGE.to_string(),
            };
        }

        let delay = self.policy.delay_for(self.attempts);
        self.attempts += 1;
        self.state = ConnectionState::Disconnected;
        CloseOutcome::Retry(delay)
    }

    /// Turns an inbound text frame into bytes for the display.
    pub fn on_message(&self, text: &str) -> Option<String> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        match Frame::<ServerMessage>::decode(text) {
            Frame::Structured(ServerMessage::Output { data }) => Some(data),
            Frame::Structured(ServerMessage::Exit) => Some(SESSION_ENDED_MESSAGE.to_string()),
            Frame::Raw(raw) => Some(raw),
            Frame::Unrecognized => None,
        }
    }

    /// Keystrokes to send, or `None` while not connected (dropped, not queued).
    pub fn outbound_input(&self, data: impl Into<String>) -> Option<ClientMessage> {
        (self.state == ConnectionState::Connected).then(|| ClientMessage::input(data))
    }

    /// Records new geometry; returns a resize to send only while connected.
    pub fn set_viewport(&mut self, cols: u16, rows: u16) -> Option<ClientMessage> {
        self.viewport = (cols, rows);
        (self.state == ConnectionState::Connected).then(|| self.resize_message())
    }

    fn resize_message(&self) -> ClientMessage {
        ClientMessage::Resize {
            cols: self.viewport.0,
            rows: self.viewport.1,
        }
    }
}
