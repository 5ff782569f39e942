//! Periodic sweep that reclaims dead and idle sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::manager::{Session, SessionRegistryImpl};
use super::pty::SessionId;

/// Sessions removed by one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Sessions whose process was no longer alive.
    pub dead: Vec<SessionId>,
    /// Sessions terminated for inactivity.
    pub idle: Vec<SessionId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.dead.is_empty() && self.idle.is_empty()
    }
}

/// Idle reaper over a session registry.
pub struct Reaper {
    registry: Arc<SessionRegistryImpl>,
    idle_timeout: Option<Duration>,
}

impl Reaper {
    /// `idle_timeout` of `None` disables idle termination.
    pub fn new(registry: Arc<SessionRegistryImpl>, idle_timeout: Option<Duration>) -> Self {
        Self {
            registry,
            idle_timeout,
        }
    }

    /// Starts a background task that sweeps every `interval` until `cancel`
    /// fires. Sweeps run inline in the timer loop and never overlap.
    pub fn spawn(
        registry: Arc<SessionRegistryImpl>,
        interval: Duration,
        idle_timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let reaper = Self::new(registry, idle_timeout);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            tracing::debug!(?interval, ?idle_timeout, "Reaper started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = reaper.sweep().await;
                        if !report.is_empty() {
                            tracing::info!(
                                dead = report.dead.len(),
                                idle = report.idle.len(),
                                "Reaper sweep removed sessions"
                            );
                        }
                    }
                }
            }
            tracing::debug!("Reaper stopped");
        })
    }

    /// Runs one sweep over every registered session.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for session in self.registry.sessions() {
            if !session.process().is_alive() {
                if self.reap_dead(&session).await {
                    report.dead.push(session.id().clone());
                }
                continue;
            }

            let Some(limit) = self.idle_timeout else {
                continue;
            };
            let idle = session.relay().idle_for();
            if idle > limit && self.reap_idle(&session, idle).await {
                report.idle.push(session.id().clone());
            }
        }

        report
    }

    async fn reap_dead(&self, session: &Arc<Session>) -> bool {
        if self.registry.remove(session.id()).is_none() {
            return false;
        }
        session.relay().close(None).await;
        tracing::info!(session_id = %session.id(), "Reaped session with dead process");
        true
    }

    async fn reap_idle(&self, session: &Arc<Session>, idle: Duration) -> bool {
        if self.registry.remove(session.id()).is_none() {
            return false;
        }

        let notice = idle_notice(idle);
        let notified = session.relay().close(Some(&notice)).await;
        if let Err(e) = session.process().kill() {
            tracing::warn!(session_id = %session.id(), error = %e, "Failed to kill idle session");
        }

        tracing::info!(
            session_id = %session.id(),
            idle_secs = idle.as_secs(),
            clients = notified,
            "Terminated idle session"
        );
        true
    }
}

fn idle_notice(idle: Duration) -> String {
    format!(
        "\r\n[webterm] session closed after {}s of inactivity\r\n",
        idle.as_secs()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::manager::SessionRegistry;
    use protocol::ServerMessage;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn test_registry(root: &std::path::Path) -> Arc<SessionRegistryImpl> {
        Arc::new(SessionRegistryImpl::new(SessionConfig {
            shell: "/bin/sh".to_string(),
            workspace_root: root.to_path_buf(),
            startup_command: String::new(),
            ..SessionConfig::default()
        }))
    }

    #[test]
    fn test_idle_notice_format() {
        assert_eq!(
            idle_notice(Duration::from_secs(90)),
            "\r\n[webterm] session closed after 90s of inactivity\r\n"
        );
    }

    #[tokio::test]
    async fn test_sweep_empty_registry() {
        let temp = TempDir::new().unwrap();
        let reaper = Reaper::new(test_registry(temp.path()), Some(Duration::from_secs(1)));
        assert!(reaper.sweep().await.is_empty());
    }

    #[tokio::test]
    async fn test_zero_idle_timeout_disables_idle_reaping() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());
        let summary = registry.create(None, None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let reaper = Reaper::new(Arc::clone(&registry), None);
        let report = reaper.sweep().await;

        assert!(report.is_empty());
        assert!(registry.exists(&summary.id));

        registry.terminate(&summary.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_session_notified_then_terminated() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());
        let summary = registry.create(None, None).await.unwrap();
        let mut rx = registry.attach(&summary.id, "c1".to_string()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let reaper = Reaper::new(Arc::clone(&registry), Some(Duration::from_millis(50)));
        let report = reaper.sweep().await;

        assert_eq!(report.idle, vec![summary.id.clone()]);
        assert!(!registry.exists(&summary.id));

        let mut messages = Vec::new();
        while let Ok(Some(message)) = timeout(Duration::from_secs(1), rx.recv()).await {
            messages.push(message);
        }
        let notice_pos = messages
            .iter()
            .position(|m| matches!(m, ServerMessage::Output { data } if data.contains("of inactivity")))
            .expect("inactivity notice");
        let exit_pos = messages.iter().position(|m| m.is_exit()).expect("exit");
        assert!(notice_pos < exit_pos);
    }

    #[tokio::test]
    async fn test_active_session_survives_sweep() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());
        let summary = registry.create(None, None).await.unwrap();

        let reaper = Reaper::new(Arc::clone(&registry), Some(Duration::from_secs(3600)));
        assert!(reaper.sweep().await.is_empty());
        assert!(registry.exists(&summary.id));

        registry.terminate(&summary.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_process_is_removed() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());
        let summary = registry.create(None, None).await.unwrap();

        let session = registry.get(&summary.id).unwrap();
        session.process().kill().unwrap();
        for _ in 0..50 {
            if !session.process().is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!session.process().is_alive());

        // Either the exit pump or this sweep unregisters it.
        let report = Reaper::new(Arc::clone(&registry), None).sweep().await;
        assert!(report.idle.is_empty());
        assert!(!registry.exists(&summary.id));
    }

    #[tokio::test]
    async fn test_exited_shell_with_background_holder_is_removed() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());
        let summary = registry.create(None, None).await.unwrap();

        registry
            .write(&summary.id, b"(trap '' HUP; exec sleep 20) & exit 0\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let session = registry.get(&summary.id).ok();
        if let Some(session) = session {
            assert!(!session.process().is_alive());
        }
        Reaper::new(Arc::clone(&registry), None).sweep().await;
        assert!(!registry.exists(&summary.id));
    }

    #[tokio::test]
    async fn test_spawned_reaper_stops_on_cancel() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());
        let cancel = CancellationToken::new();

        let handle = Reaper::spawn(
            registry,
            Duration::from_millis(10),
            None,
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_spawned_reaper_reaps_idle_sessions() {
        let temp = TempDir::new().unwrap();
        let registry = test_registry(temp.path());
        let summary = registry.create(None, None).await.unwrap();
        let cancel = CancellationToken::new();

        let _handle = Reaper::spawn(
            Arc::clone(&registry),
            Duration::from_millis(50),
            Some(Duration::from_millis(100)),
            cancel.clone(),
        );

        let mut gone = false;
        for _ in 0..100 {
            if !registry.exists(&summary.id) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        assert!(gone);
    }
}
