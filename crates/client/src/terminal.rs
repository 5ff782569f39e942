//! Local terminal handling for the attach client.

use crossterm::terminal;
use std::io::{self, Write};

/// Byte that detaches the client (Ctrl-]).
pub const DETACH_KEY: u8 = 0x1d;

/// RAII guard for raw terminal mode. Restores the previous mode on drop.
pub struct RawTerminal {
    was_raw: bool,
}

impl RawTerminal {
    pub fn new() -> io::Result<Self> {
        let was_raw = terminal::is_raw_mode_enabled()?;
        if !was_raw {
            terminal::enable_raw_mode()?;
        }
        Ok(Self { was_raw })
    }

    /// Write display bytes straight to stdout.
    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut stdout = io::stdout();
        stdout.write_all(data)?;
        stdout.flush()
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        if !self.was_raw {
            let _ = terminal::disable_raw_mode();
        }
    }
}

/// Current terminal size as (cols, rows), falling back to 80x24.
pub fn viewport() -> (u16, u16) {
    match terminal::size() {
        Ok((cols, rows)) if cols > 0 && rows > 0 => (cols, rows),
        _ => (80, 24),
    }
}

/// Splits a chunk of keyboard input at the detach key.
///
/// Returns the bytes to forward and whether the user asked to detach.
pub fn split_detach(chunk: &[u8]) -> (&[u8], bool) {
    match chunk.iter().position(|&b| b == DETACH_KEY) {
        Some(pos) => (&chunk[..pos], true),
        None => (chunk, false),
    }
}

/// Decodes keyboard bytes as UTF-8, carrying an incomplete trailing sequence
/// over to the next chunk.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let rest = self.pending.split_off(valid);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        text
    }
}
