//! PTY process adapter.
//!
//! Wraps a shell running inside a pseudo-terminal behind a channel-based
//! interface: input is queued to a writer thread, output and the final exit
//! code arrive as [`ProcessEvent`]s on a single receiver, in order.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session's process has already exited.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),

    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// The requested working directory is not usable.
    #[error("invalid working directory: {0}")]
    InvalidWorkingDir(String),

    /// The configured session limit has been reached.
    #[error("session limit reached ({0})")]
    LimitReached(usize),

    /// Failed to queue input for the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to kill the session.
    #[error("failed to kill session: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something the PTY produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A chunk of decoded terminal output.
    Data(String),
    /// The process exited. Sent once, after all output.
    Exit(i32),
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// How long the exit event waits for the reader to drain after the child is
/// reaped. A background job that inherited the terminal keeps the reader
/// blocked; the exit is reported anyway once this passes.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Shared sending half of a process's event channel.
///
/// The reader and the waiter both send through it. Once the exit event has
/// gone out the sender is dropped, so late output from a lingering
/// background job is discarded instead of following the exit.
#[derive(Clone)]
struct EventSink {
    tx: Arc<std::sync::Mutex<Option<mpsc::UnboundedSender<ProcessEvent>>>>,
}

impl EventSink {
    fn new(tx: mpsc::UnboundedSender<ProcessEvent>) -> Self {
        Self {
            tx: Arc::new(std::sync::Mutex::new(Some(tx))),
        }
    }

    fn data(&self, text: String) {
        if let Ok(guard) = self.tx.lock() {
            if let Some(tx) = guard.as_ref() {
                if tx.send(ProcessEvent::Data(text)).is_err() {
                    tracing::trace!("PTY event receiver dropped");
                }
            }
        }
    }

    fn exit(&self, code: i32) {
        if let Ok(mut guard) = self.tx.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(ProcessEvent::Exit(code));
            }
        }
    }
}

/// Parameters for spawning a PTY process.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl SpawnOptions {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            cols: 80,
            rows: 24,
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// A shell process running inside a pseudo-terminal.
pub struct PtyProcess {
    /// The PTY master handle, used for resizing.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// Queue feeding the writer thread.
    input_tx: mpsc::UnboundedSender<Vec<u8>>,

    /// Handle used to terminate the child.
    killer: std::sync::Mutex<Box<dyn ChildKiller + Send + Sync>>,

    /// Cleared once the exit event has been produced.
    running: Arc<AtomicBool>,

    /// Current terminal size.
    size: std::sync::Mutex<(u16, u16)>,

    /// Process ID.
    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawns a process inside a new PTY.
    ///
    /// Returns the process handle and the receiver for its output and exit
    /// events. The reader and writer run on dedicated threads and stop on
    /// their own when the process goes away.
    pub fn spawn(
        opts: SpawnOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ProcessEvent>), SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: opts.rows,
                cols: opts.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&opts.shell);
        if let Some(ref dir) = opts.cwd {
            cmd.cwd(dir);
        }
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        // The master only sees EOF once every slave handle is closed.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(true));
        let sink = EventSink::new(event_tx);
        let (drained_tx, drained_rx) = std::sync::mpsc::channel::<()>();

        let reader_sink = sink.clone();
        std::thread::Builder::new()
            .name(format!("pty-reader-{}", pid.unwrap_or(0)))
            .spawn(move || {
                read_loop(reader, &reader_sink);
                let _ = drained_tx.send(());
            })?;

        // Reaping does not depend on reader EOF: a detached job holding the
        // slave open must not keep the shell a zombie.
        let waiter_running = Arc::clone(&running);
        std::thread::Builder::new()
            .name(format!("pty-waiter-{}", pid.unwrap_or(0)))
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => status.exit_code() as i32,
                    Err(e) => {
                        tracing::warn!(pid = ?pid, error = %e, "Failed to reap PTY child");
                        -1
                    }
                };
                waiter_running.store(false, Ordering::SeqCst);
                if drained_rx.recv_timeout(OUTPUT_DRAIN_GRACE).is_err() {
                    tracing::debug!(pid = ?pid, "PTY still held open after exit");
                }
                tracing::debug!(pid = ?pid, code = code, "PTY process exited");
                sink.exit(code);
            })?;

        std::thread::Builder::new()
            .name(format!("pty-writer-{}", pid.unwrap_or(0)))
            .spawn(move || write_loop(writer, input_rx))?;

        let process = PtyProcess {
            master: Mutex::new(pair.master),
            input_tx,
            killer: std::sync::Mutex::new(killer),
            running,
            size: std::sync::Mutex::new((opts.cols, opts.rows)),
            pid,
        };

        tracing::debug!(pid = ?pid, shell = %opts.shell, "Spawned PTY process");
        Ok((process, event_rx))
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> (u16, u16) {
        self.size.lock().map(|s| *s).unwrap_or((0, 0))
    }

    /// Returns false once the shell has been reaped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Checks the OS for the process with signal 0.
    ///
    /// This does not disturb the process. The child is reaped as soon as it
    /// exits, so an exited shell reports false even while a background job
    /// still holds its terminal.
    pub fn is_alive(&self) -> bool {
        if !self.is_running() {
            return false;
        }
        match self.pid {
            Some(pid) => probe_pid(pid),
            None => true,
        }
    }

    /// Queues input for the process. Never blocks.
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if data.is_empty() {
            return Ok(());
        }
        self.input_tx
            .send(data.to_vec())
            .map_err(|_| SessionError::WriteFailed("PTY writer has stopped".to_string()))
    }

    /// Resizes the PTY to the given dimensions.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        if let Ok(mut size) = self.size.lock() {
            *size = (cols, rows);
        }

        tracing::debug!(pid = ?self.pid, cols = cols, rows = rows, "Resized PTY");
        Ok(())
    }

    /// Terminates the process. Calling this on an exited process is a no-op.
    pub fn kill(&self) -> Result<(), SessionError> {
        if !self.is_running() {
            return Ok(());
        }

        let mut killer = self
            .killer
            .lock()
            .map_err(|_| SessionError::KillFailed("killer lock poisoned".to_string()))?;

        match killer.kill() {
            Ok(()) => Ok(()),
            // The child may have exited between the check and the kill.
            Err(_) if !self.is_running() => Ok(()),
            Err(e) => Err(SessionError::KillFailed(e.to_string())),
        }
    }
}

#[cfg(unix)]
fn probe_pid(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    kill(Pid::from_raw(raw), None).is_ok()
}

#[cfg(not(unix))]
fn probe_pid(_pid: u32) -> bool {
    true
}

/// Reads the PTY until EOF or error, forwarding decoded chunks.
fn read_loop(mut reader: Box<dyn Read + Send>, sink: &EventSink) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    let mut decoder = Utf8Decoder::default();

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buffer[..n]);
                if !text.is_empty() {
                    sink.data(text);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // Linux reports EIO on the master once the slave side is gone.
            Err(e) => {
                tracing::trace!(error = %e, "PTY read ended");
                break;
            }
        }
    }

    let tail = decoder.finish();
    if !tail.is_empty() {
        sink.data(tail);
    }
}

/// Drains queued input into the PTY until every sender is gone.
fn write_loop(mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = input_rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            tracing::debug!(error = %e, "PTY write failed, stopping writer");
            break;
        }
    }
}

/// Incremental UTF-8 decoder.
///
/// An incomplete multi-byte sequence at the end of a chunk is held back and
/// completed by the next chunk. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, input: &[u8]) -> String {
        self.pending.extend_from_slice(input);

        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        let mut carry = Vec::new();

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        self.pending = carry;
        out
    }

    /// Flushes whatever is still held back.
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }
}
