//! Session registry for managing multiple PTY sessions.
//!
//! This module provides a thread-safe registry that can create, look up,
//! rename, attach to and terminate persistent shell sessions concurrently.
//! Each session gets a pump task that drains its process events into the
//! relay and unregisters the session when the process exits.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use protocol::{ServerMessage, SessionSummary};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::multiplexer::{ClientId, SessionRelay};
use super::pty::{ProcessEvent, PtyProcess, SessionError, SessionId, SpawnOptions};
use crate::config::SessionConfig;

/// Trait for session registry operations.
///
/// Implementations must be thread-safe and suitable for concurrent access.
#[allow(async_fn_in_trait)]
pub trait SessionRegistry: Send + Sync {
    /// Creates a new session.
    ///
    /// # Arguments
    /// * `cwd` - Working directory, absolute or relative to the workspace root.
    ///   Defaults to the workspace root.
    /// * `title` - Display title. Defaults to `Session N`.
    async fn create(
        &self,
        cwd: Option<PathBuf>,
        title: Option<String>,
    ) -> Result<SessionSummary, SessionError>;

    /// Looks up a session.
    fn get(&self, session_id: &SessionId) -> Result<Arc<Session>, SessionError>;

    /// Changes a session's title.
    fn rename(&self, session_id: &SessionId, title: String)
        -> Result<SessionSummary, SessionError>;

    /// Kills a session's process, notifies its clients and removes it.
    ///
    /// A second call for the same id returns `NotFound`.
    async fn terminate(&self, session_id: &SessionId) -> Result<(), SessionError>;

    /// Lists all sessions, most recently active first.
    fn list(&self) -> Vec<SessionSummary>;

    /// Attaches a client. The first message on the receiver is the replay.
    async fn attach(
        &self,
        session_id: &SessionId,
        client_id: ClientId,
    ) -> Result<mpsc::Receiver<ServerMessage>, SessionError>;

    /// Detaches a client. The session keeps running.
    async fn detach(&self, session_id: &SessionId, client_id: &ClientId)
        -> Result<(), SessionError>;

    /// Forwards client input to a session's process.
    async fn write(&self, session_id: &SessionId, data: &[u8]) -> Result<(), SessionError>;

    /// Resizes a session's terminal.
    async fn resize(&self, session_id: &SessionId, cols: u16, rows: u16)
        -> Result<(), SessionError>;

    /// Checks if a session is registered.
    fn exists(&self, session_id: &SessionId) -> bool;

    /// Returns the number of registered sessions.
    fn count(&self) -> usize;
}

/// A persistent shell session.
pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    title: RwLock<String>,
    cwd: PathBuf,
    process: PtyProcess,
    relay: SessionRelay,
}

impl Session {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn title(&self) -> String {
        self.title.read().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn process(&self) -> &PtyProcess {
        &self.process
    }

    pub fn relay(&self) -> &SessionRelay {
        &self.relay
    }

    /// Last activity as a timestamp.
    pub fn last_activity(&self) -> DateTime<Utc> {
        i64::try_from(self.relay.last_activity())
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or(self.created_at)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            title: self.title(),
            cwd: self.cwd.display().to_string(),
            last_activity: self.last_activity(),
        }
    }

    fn set_title(&self, title: String) {
        if let Ok(mut current) = self.title.write() {
            *current = title;
        }
    }
}

/// Thread-safe session registry implementation using DashMap.
pub struct SessionRegistryImpl {
    /// Map of session ID to session.
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    /// Serializes the limit check, default title and insert of `create`.
    create_lock: Mutex<()>,
    config: SessionConfig,
}

impl SessionRegistryImpl {
    /// Creates a new registry that spawns sessions per `config`.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            create_lock: Mutex::new(()),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Unregisters a session without touching its process or clients.
    pub fn remove(&self, session_id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.remove(session_id).map(|(_, s)| s)
    }

    /// Terminates every session. Used on shutdown.
    pub async fn terminate_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut terminated = 0;
        for id in ids {
            match self.terminate(&id).await {
                Ok(()) => terminated += 1,
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Failed to terminate session"),
            }
        }
        terminated
    }

    fn lookup(&self, session_id: &SessionId) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))
    }

    /// Spawns the shell and inserts the session while holding `create_lock`,
    /// so concurrent creates cannot overshoot `max_sessions` or share a
    /// default title.
    fn register(
        &self,
        cwd: Option<PathBuf>,
        title: Option<String>,
    ) -> Result<(Arc<Session>, mpsc::UnboundedReceiver<ProcessEvent>), SessionError> {
        let _guard = self
            .create_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let count = self.sessions.len();
        if count >= self.config.max_sessions {
            return Err(SessionError::LimitReached(self.config.max_sessions));
        }

        let cwd = resolve_working_dir(&self.config.workspace_root, cwd.as_deref())?;
        let (process, events) = PtyProcess::spawn(self.spawn_options(&cwd))?;

        let session = Arc::new(Session {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            title: RwLock::new(title.unwrap_or_else(|| format!("Session {}", count + 1))),
            cwd,
            process,
            relay: SessionRelay::new(self.config.scrollback_bytes),
        });
        self.sessions.insert(session.id.clone(), Arc::clone(&session));
        Ok((session, events))
    }

    fn spawn_options(&self, cwd: &Path) -> SpawnOptions {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        SpawnOptions::new(self.config.shell.clone())
            .size(self.config.cols, self.config.rows)
            .env("TERM", self.config.term.clone())
            .env("COLORTERM", "truecolor")
            .env("HOME", home)
            .cwd(cwd)
    }
}

impl SessionRegistry for SessionRegistryImpl {
    async fn create(
        &self,
        cwd: Option<PathBuf>,
        title: Option<String>,
    ) -> Result<SessionSummary, SessionError> {
        let (session, events) = self.register(cwd, title)?;
        let session_id = session.id.clone();

        tokio::spawn(pump_events(
            Arc::clone(&self.sessions),
            Arc::clone(&session),
            events,
        ));

        if let Some(command) = self.config.startup_command() {
            let session = Arc::clone(&session);
            let delay = self.config.startup_delay();
            let line = format!("{command}\r");
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if session.process.is_running() {
                    if let Err(e) = session.process.write(line.as_bytes()) {
                        tracing::debug!(session_id = %session.id, error = %e, "Startup command not sent");
                    }
                }
            });
        }

        tracing::info!(
            session_id = %session_id,
            pid = ?session.process.pid(),
            cwd = %session.cwd.display(),
            "Created new session"
        );

        Ok(session.summary())
    }

    fn get(&self, session_id: &SessionId) -> Result<Arc<Session>, SessionError> {
        self.lookup(session_id)
    }

    fn rename(
        &self,
        session_id: &SessionId,
        title: String,
    ) -> Result<SessionSummary, SessionError> {
        let session = self.lookup(session_id)?;
        session.set_title(title);
        tracing::debug!(session_id = %session_id, title = %session.title(), "Renamed session");
        Ok(session.summary())
    }

    async fn terminate(&self, session_id: &SessionId) -> Result<(), SessionError> {
        // Removing first makes the claim atomic: concurrent callers see NotFound.
        let (_, session) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        let notified = session.relay.close(None).await;
        session.process.kill()?;

        tracing::info!(
            session_id = %session_id,
            clients = notified,
            "Session terminated and removed"
        );
        Ok(())
    }

    fn list(&self) -> Vec<SessionSummary> {
        let mut sessions = self.sessions();
        sessions.sort_by(|a, b| {
            b.relay
                .last_activity()
                .cmp(&a.relay.last_activity())
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        sessions.iter().map(|s| s.summary()).collect()
    }

    async fn attach(
        &self,
        session_id: &SessionId,
        client_id: ClientId,
    ) -> Result<mpsc::Receiver<ServerMessage>, SessionError> {
        let session = self.lookup(session_id)?;
        Ok(session.relay.attach(client_id).await)
    }

    async fn detach(
        &self,
        session_id: &SessionId,
        client_id: &ClientId,
    ) -> Result<(), SessionError> {
        let session = self.lookup(session_id)?;
        session.relay.detach(client_id).await;
        Ok(())
    }

    async fn write(&self, session_id: &SessionId, data: &[u8]) -> Result<(), SessionError> {
        let session = self.lookup(session_id)?;
        if !session.process.is_running() {
            return Err(SessionError::AlreadyTerminated(session_id.clone()));
        }
        session.relay.touch();
        session.process.write(data)
    }

    async fn resize(
        &self,
        session_id: &SessionId,
        cols: u16,
        rows: u16,
    ) -> Result<(), SessionError> {
        let session = self.lookup(session_id)?;
        session.process.resize(cols, rows).await
    }

    fn exists(&self, session_id: &SessionId) -> bool {
        self.sessions.contains_key(session_id)
    }

    fn count(&self) -> usize {
        self.sessions.len()
    }
}

/// Drains one session's process events until the process exits, then
/// notifies its clients and unregisters it.
async fn pump_events(
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
    session: Arc<Session>,
    mut events: mpsc::UnboundedReceiver<ProcessEvent>,
) {
    let mut exit_code = None;
    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Data(chunk) => {
                let delivered = session.relay.publish(&chunk).await;
                tracing::trace!(
                    session_id = %session.id,
                    bytes = chunk.len(),
                    clients = delivered,
                    "Relayed output"
                );
            }
            ProcessEvent::Exit(code) => {
                exit_code = Some(code);
                break;
            }
        }
    }

    let notified = session.relay.close(None).await;
    if sessions.remove(&session.id).is_some() {
        tracing::info!(
            session_id = %session.id,
            exit_code = ?exit_code,
            clients = notified,
            "Session process exited"
        );
    }
}

/// Resolves a requested working directory against the workspace root.
///
/// Relative paths are joined onto the root. The result must stay inside the
/// root both lexically and after symlinks are resolved. Missing directories
/// are created.
pub fn resolve_working_dir(root: &Path, requested: Option<&Path>) -> Result<PathBuf, SessionError> {
    std::fs::create_dir_all(root).map_err(|e| {
        SessionError::InvalidWorkingDir(format!("{}: {}", root.display(), e))
    })?;
    let root = root.canonicalize()?;

    let candidate = match requested {
        None => return Ok(root),
        Some(path) if path.is_absolute() => normalize(path),
        Some(path) => normalize(&root.join(path)),
    };

    if !candidate.starts_with(&root) {
        return Err(SessionError::InvalidWorkingDir(format!(
            "{} is outside the workspace",
            candidate.display()
        )));
    }

    std::fs::create_dir_all(&candidate).map_err(|e| {
        SessionError::InvalidWorkingDir(format!("{}: {}", candidate.display(), e))
    })?;

    let resolved = candidate.canonicalize()?;
    if !resolved.starts_with(&root) {
        return Err(SessionError::InvalidWorkingDir(format!(
            "{} resolves outside the workspace",
            candidate.display()
        )));
    }
    Ok(resolved)
}

/// Lexically removes `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn test_registry(root: &Path) -> SessionRegistryImpl {
        SessionRegistryImpl::new(SessionConfig {
            shell: "/bin/sh".to_string(),
            workspace_root: root.to_path_buf(),
            startup_command: String::new(),
            ..SessionConfig::default()
        })
    }

    /// Reads output messages until `needle` is seen.
    async fn wait_for_output(rx: &mut mpsc::Receiver<ServerMessage>, needle: &str) -> bool {
        let mut seen = String::new();
        for _ in 0..50 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(ServerMessage::Output { data })) => {
                    seen.push_str(&data);
                    if seen.contains(needle) {
                        return true;
                    }
                }
                Ok(Some(ServerMessage::Exit)) | Ok(None) => return false,
                Err(_) => {}
            }
        }
        false
    }

    #[test]
    fn test_normalize_collapses_dots() {
        assert_eq!(
            normalize(Path::new("/work/a/./b/../c")),
            PathBuf::from("/work/a/c")
        );
        assert_eq!(normalize(Path::new("/work/../../etc")), PathBuf::from("/etc"));
    }

    #[test]
    fn test_resolve_defaults_to_root() {
        let temp = TempDir::new().unwrap();
        let resolved = resolve_working_dir(temp.path(), None).unwrap();
        assert_eq!(resolved, temp.path().canonicalize().unwrap());
    }

    #[test]
    fn test_resolve_creates_relative_dir() {
        let temp = TempDir::new().unwrap();
        let resolved = resolve_working_dir(temp.path(), Some(Path::new("proj/sub"))).unwrap();
        assert!(resolved.is_dir());
        assert!(resolved.ends_with("proj/sub"));
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let temp = TempDir::new().unwrap();
        let result = resolve_working_dir(temp.path(), Some(Path::new("../outside")));
        assert!(matches!(result, Err(SessionError::InvalidWorkingDir(_))));

        let result = resolve_working_dir(temp.path(), Some(Path::new("/etc")));
        assert!(matches!(result, Err(SessionError::InvalidWorkingDir(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let temp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).unwrap();

        let result = resolve_working_dir(temp.path(), Some(Path::new("link")));
        assert!(matches!(result, Err(SessionError::InvalidWorkingDir(_))));
    }

    #[tokio::test]
    async fn test_registry_create_session() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());

        let summary = registry.create(None, None).await.unwrap();
        assert!(!summary.id.is_empty());
        assert_eq!(summary.title, "Session 1");
        assert_eq!(
            PathBuf::from(&summary.cwd),
            temp.path().canonicalize().unwrap()
        );
        assert!(registry.exists(&summary.id));
        assert_eq!(registry.count(), 1);

        registry.terminate(&summary.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_create_with_title_and_cwd() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());

        let summary = registry
            .create(Some(PathBuf::from("repo")), Some("build box".to_string()))
            .await
            .unwrap();
        assert_eq!(summary.title, "build box");
        assert!(summary.cwd.ends_with("repo"));
        assert!(temp.path().join("repo").is_dir());

        registry.terminate(&summary.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_create_outside_root_fails() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());

        let result = registry.create(Some(PathBuf::from("../../x")), None).await;
        assert!(matches!(result, Err(SessionError::InvalidWorkingDir(_))));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_registry_spawn_failure_not_registered() {
        let temp = TempDir::new().unwrap();
        let registry = SessionRegistryImpl::new(SessionConfig {
            shell: "/nonexistent/shell-xyz".to_string(),
            workspace_root: temp.path().to_path_buf(),
            startup_command: String::new(),
            ..SessionConfig::default()
        });

        let result = registry.create(None, None).await;
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_registry_session_limit() {
        let temp = TempDir::new().unwrap();
        let registry = SessionRegistryImpl::new(SessionConfig {
            shell: "/bin/sh".to_string(),
            workspace_root: temp.path().to_path_buf(),
            startup_command: String::new(),
            max_sessions: 1,
            ..SessionConfig::default()
        });

        let first = registry.create(None, None).await.unwrap();
        let second = registry.create(None, None).await;
        assert!(matches!(second, Err(SessionError::LimitReached(1))));

        registry.terminate(&first.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_get_nonexistent() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());
        assert!(matches!(
            registry.get(&"nonexistent".to_string()),
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_rename_then_list() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());
        let summary = registry.create(None, None).await.unwrap();

        let renamed = registry.rename(&summary.id, "deploy".to_string()).unwrap();
        assert_eq!(renamed.title, "deploy");

        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "deploy");

        assert!(matches!(
            registry.rename(&"missing".to_string(), "x".to_string()),
            Err(SessionError::NotFound(_))
        ));

        registry.terminate(&summary.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_terminate_twice_is_not_found() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());
        let summary = registry.create(None, None).await.unwrap();

        registry.terminate(&summary.id).await.unwrap();
        assert!(matches!(
            registry.get(&summary.id),
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            registry.terminate(&summary.id).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_terminate_notifies_clients() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());
        let summary = registry.create(None, None).await.unwrap();

        let mut rx = registry.attach(&summary.id, "c1".to_string()).await.unwrap();
        registry.terminate(&summary.id).await.unwrap();

        let mut saw_exit = false;
        while let Ok(Some(message)) = timeout(Duration::from_secs(1), rx.recv()).await {
            if message.is_exit() {
                saw_exit = true;
            }
        }
        assert!(saw_exit);
    }

    #[tokio::test]
    async fn test_registry_output_roundtrip() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());
        let summary = registry.create(None, None).await.unwrap();

        let mut rx = registry.attach(&summary.id, "c1".to_string()).await.unwrap();
        registry
            .write(&summary.id, b"echo roundtrip_$((6*7))\n")
            .await
            .unwrap();

        assert!(wait_for_output(&mut rx, "roundtrip_42").await);

        registry.terminate(&summary.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_startup_command_injected() {
        let temp = TempDir::new().unwrap();
        let registry = SessionRegistryImpl::new(SessionConfig {
            shell: "/bin/sh".to_string(),
            workspace_root: temp.path().to_path_buf(),
            startup_command: "echo startup_$((1+1))_done".to_string(),
            startup_delay_ms: 20,
            ..SessionConfig::default()
        });
        let summary = registry.create(None, None).await.unwrap();

        let mut rx = registry.attach(&summary.id, "c1".to_string()).await.unwrap();
        assert!(wait_for_output(&mut rx, "startup_2_done").await);

        registry.terminate(&summary.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_process_exit_unregisters_and_notifies() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());
        let summary = registry.create(None, None).await.unwrap();

        let mut rx = registry.attach(&summary.id, "c1".to_string()).await.unwrap();
        registry.write(&summary.id, b"exit 3\n").await.unwrap();

        let mut saw_exit = false;
        while let Ok(Some(message)) = timeout(Duration::from_secs(5), rx.recv()).await {
            if message.is_exit() {
                saw_exit = true;
            }
        }
        assert!(saw_exit);
        assert!(!registry.exists(&summary.id));
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_registry_detach_keeps_session() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());
        let summary = registry.create(None, None).await.unwrap();

        let _rx1 = registry.attach(&summary.id, "c1".to_string()).await.unwrap();
        let mut rx2 = registry.attach(&summary.id, "c2".to_string()).await.unwrap();
        registry.detach(&summary.id, &"c1".to_string()).await.unwrap();

        let session = registry.get(&summary.id).unwrap();
        assert!(session.process().is_alive());
        assert_eq!(session.relay().client_count().await, 1);

        registry.write(&summary.id, b"echo after_detach\n").await.unwrap();
        assert!(wait_for_output(&mut rx2, "after_detach").await);

        registry.terminate(&summary.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_list_orders_by_activity() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());
        let first = registry.create(None, None).await.unwrap();
        let second = registry.create(None, None).await.unwrap();
        assert_eq!(second.title, "Session 2");

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.get(&first.id).unwrap().relay().touch();

        let listed = registry.list();
        assert_eq!(listed[0].id, first.id);
        assert!(listed[0].last_activity >= listed[1].last_activity);

        registry.terminate_all().await;
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_registry_write_resize_nonexistent() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());
        let id = "nonexistent".to_string();

        assert!(matches!(
            registry.write(&id, b"x").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            registry.resize(&id, 80, 24).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(
            registry.attach(&id, "c".to_string()).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_resize() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());
        let summary = registry.create(None, None).await.unwrap();

        // Let the prompt settle so no output lands during the resize.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let before = registry.get(&summary.id).unwrap().relay().last_activity();
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.resize(&summary.id, 100, 30).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let session = registry.get(&summary.id).unwrap();
        assert_eq!(session.process().size(), (100, 30));
        // Geometry changes are not activity.
        assert_eq!(session.relay().last_activity(), before);

        registry.terminate(&summary.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_registry_exit_with_background_holder_unregisters() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());
        let summary = registry.create(None, None).await.unwrap();

        let mut rx = registry.attach(&summary.id, "c1".to_string()).await.unwrap();
        registry
            .write(&summary.id, b"(trap '' HUP; exec sleep 20) & exit 0\n")
            .await
            .unwrap();

        let mut saw_exit = false;
        while let Ok(Some(message)) = timeout(Duration::from_secs(5), rx.recv()).await {
            if message.is_exit() {
                saw_exit = true;
                break;
            }
        }
        assert!(saw_exit, "no exit while a background job held the terminal");

        for _ in 0..50 {
            if !registry.exists(&summary.id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!registry.exists(&summary.id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_registry_concurrent_creates_respect_limit() {
        let temp = TempDir::new().unwrap();
        let registry = Arc::new(SessionRegistryImpl::new(SessionConfig {
            shell: "/bin/sh".to_string(),
            workspace_root: temp.path().to_path_buf(),
            startup_command: String::new(),
            max_sessions: 2,
            ..SessionConfig::default()
        }));

        let barrier = Arc::new(tokio::sync::Barrier::new(4));
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                registry.create(None, None).await
            }));
        }

        let mut titles = Vec::new();
        let mut refused = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(summary) => titles.push(summary.title),
                Err(SessionError::LimitReached(2)) => refused += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        titles.sort();
        assert_eq!(titles, vec!["Session 1", "Session 2"]);
        assert_eq!(refused, 2);
        assert_eq!(registry.count(), 2);

        registry.terminate_all().await;
    }
}
