//! One-shot query subprocess runner.
//!
//! Each query spawns the configured command in print mode with stream-json
//! output, forwards text deltas as they arrive and finishes with exactly one
//! `done` event carrying the latest resume token. Dropping the event receiver
//! kills the subprocess.

use std::path::PathBuf;
use std::process::Stdio;

use protocol::QueryEvent;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::stream::{parse_line, LineBuffer};
use crate::config::QueryConfig;

/// Upper bound on captured stderr.
pub const MAX_STDERR_BYTES: usize = 64 * 1024;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const READ_CHUNK: usize = 8192;

/// Errors that can occur while running a query.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The query command could not be started.
    #[error("failed to start query command '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error while talking to the subprocess.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a query run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    /// The subprocess exited and `done` was delivered.
    Completed { exit_code: Option<i32> },
    /// The subprocess could not be started; `error` and `done` were delivered.
    SpawnFailed,
    /// The receiver went away; the subprocess was killed.
    Disconnected,
}

/// Spawns query subprocesses.
#[derive(Debug, Clone)]
pub struct QueryRunner {
    command: String,
    args: Vec<String>,
    cwd: PathBuf,
}

impl QueryRunner {
    /// Creates a runner whose subprocesses start in `cwd`.
    pub fn new(config: &QueryConfig, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            cwd: cwd.into(),
        }
    }

    /// Builds the subprocess command for one query.
    pub fn build_command(&self, prompt: &str, resume: Option<&str>) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--include-partial-messages");

        if let Some(token) = resume {
            cmd.arg("--resume").arg(token);
        }

        cmd.current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Runs a query and returns its event stream.
    pub fn run(&self, prompt: String, resume: Option<String>) -> mpsc::Receiver<QueryEvent> {
        self.start(prompt, resume).0
    }

    /// Like [`run`](Self::run), also returning the driving task.
    pub fn start(
        &self,
        prompt: String,
        resume: Option<String>,
    ) -> (mpsc::Receiver<QueryEvent>, JoinHandle<QueryOutcome>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let query_id = Uuid::new_v4().to_string();
        let cmd = self.build_command(&prompt, resume.as_deref());

        tracing::info!(
            query_id = %query_id,
            command = %self.command,
            resume = resume.is_some(),
            "Starting query"
        );

        let handle = tokio::spawn(drive(cmd, self.command.clone(), resume, tx, query_id));
        (rx, handle)
    }
}

async fn drive(
    mut cmd: Command,
    command: String,
    resume: Option<String>,
    tx: mpsc::Sender<QueryEvent>,
    query_id: String,
) -> QueryOutcome {
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(source) => {
            let err = QueryError::SpawnFailed { command, source };
            tracing::warn!(query_id = %query_id, error = %err, "Query spawn failed");
            let _ = tx.send(QueryEvent::error(err.to_string())).await;
            let _ = tx.send(QueryEvent::done(resume)).await;
            return QueryOutcome::SpawnFailed;
        }
    };

    let stderr_task = tokio::spawn(collect_stderr(child.stderr.take()));
    let mut token = resume;

    if let Some(mut stdout) = child.stdout.take() {
        let mut lines = LineBuffer::new();
        let mut buf = vec![0u8; READ_CHUNK];

        loop {
            let read = tokio::select! {
                _ = tx.closed() => {
                    return disconnect(&mut child, stderr_task, &query_id).await;
                }
                read = stdout.read(&mut buf) => read,
            };

            match read {
                Ok(0) => break,
                Ok(n) => {
                    for line in lines.push(&buf[..n]) {
                        if !forward_line(&tx, &line, &mut token).await {
                            return disconnect(&mut child, stderr_task, &query_id).await;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(query_id = %query_id, error = %e, "Failed reading query output");
                    break;
                }
            }
        }

        if let Some(line) = lines.finish() {
            if !forward_line(&tx, &line, &mut token).await {
                return disconnect(&mut child, stderr_task, &query_id).await;
            }
        }
    }

    let status = tokio::select! {
        _ = tx.closed() => {
            return disconnect(&mut child, stderr_task, &query_id).await;
        }
        status = child.wait() => status,
    };
    let stderr = stderr_task.await.unwrap_or_default();

    let exit_code = match &status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(query_id = %query_id, error = %e, "Failed waiting for query process");
            None
        }
    };
    let failed = !matches!(&status, Ok(s) if s.success());

    if failed && !stderr.is_empty() {
        let _ = tx.send(QueryEvent::error(stderr)).await;
    }
    let _ = tx.send(QueryEvent::done(token)).await;

    tracing::info!(query_id = %query_id, exit_code = ?exit_code, "Query finished");
    QueryOutcome::Completed { exit_code }
}

/// Parses one line and forwards its text. Returns `false` once the receiver
/// is gone.
async fn forward_line(
    tx: &mpsc::Sender<QueryEvent>,
    line: &str,
    token: &mut Option<String>,
) -> bool {
    let Some(parsed) = parse_line(line) else {
        return true;
    };
    if let Some(session_id) = parsed.session_id {
        *token = Some(session_id);
    }
    match parsed.text {
        Some(text) => tx.send(QueryEvent::text(text)).await.is_ok(),
        None => true,
    }
}

async fn disconnect(
    child: &mut Child,
    stderr_task: JoinHandle<String>,
    query_id: &str,
) -> QueryOutcome {
    if let Err(e) = child.kill().await {
        tracing::debug!(query_id = %query_id, error = %e, "Query process already gone");
    }
    stderr_task.abort();
    tracing::info!(query_id = %query_id, "Query cancelled by client disconnect");
    QueryOutcome::Disconnected
}

/// Drains stderr to EOF, keeping at most [`MAX_STDERR_BYTES`].
async fn collect_stderr(stderr: Option<ChildStderr>) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };

    let mut captured = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_STDERR_BYTES.saturating_sub(captured.len());
                captured.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&captured).trim().to_string()
}
