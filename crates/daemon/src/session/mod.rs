//! Session management module.
//!
//! This module provides PTY spawning, output fan-out with scrollback replay,
//! the session registry and the idle reaper. Sessions can be created,
//! attached to, detached from, resized, renamed and terminated.

pub mod manager;
pub mod multiplexer;
pub mod pty;
pub mod reaper;
pub mod scrollback;

pub use manager::{resolve_working_dir, Session, SessionRegistry, SessionRegistryImpl};
pub use multiplexer::{ClientHandle, ClientId, ClientStats, SessionRelay};
pub use pty::{ProcessEvent, PtyProcess, SessionError, SessionId, SpawnOptions};
pub use reaper::{Reaper, SweepReport};
pub use scrollback::ScrollbackBuffer;
