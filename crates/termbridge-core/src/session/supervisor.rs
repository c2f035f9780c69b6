//! Termination escalation and host-shutdown cleanup.
//!
//! Per-session state machine: Running -> GracefullyTerminating ->
//! (Exited | ForceKilled), terminal in either case. Running -> Exited is
//! also reachable directly when the child exits on its own.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::session::Session;
use crate::session::registry::{SessionKey, SessionRegistry};

impl<K: SessionKey> SessionRegistry<K> {
    /// Terminates the session for `key`: graceful signal first, forceful
    /// kill once the grace period elapses without an exit.
    ///
    /// Returns true if a live session was terminated. A second call, or a
    /// call for an unknown or already-dead key, returns false.
    pub async fn kill(&self, key: &K) -> bool {
        let Some(session) = self.get(key) else {
            return false;
        };
        self.remove(key);
        if !session.mark_terminated() {
            return false;
        }

        debug!(?key, "terminating session");
        terminate_with_grace(&session, self.config().grace_period()).await;
        true
    }

    /// Terminates every registered session and clears the registry.
    ///
    /// All sessions get the graceful signal up front and share one grace
    /// period before stragglers are force-killed.
    pub async fn shutdown_all(&self) {
        let sessions = self.drain();
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "terminating all sessions");

        for (key, session) in &sessions {
            debug!(?key, "requesting graceful termination");
            session.mark_terminated();
            session.handle().signal_term();
        }

        let deadline = Instant::now() + self.config().grace_period();
        for (key, session) in &sessions {
            if !wait_until_exit(session, deadline).await {
                warn!(?key, "grace period elapsed; force killing");
                session.handle().force_kill();
            }
        }
    }

    /// Synchronous best-effort sweep for the shutdown hook: mark every
    /// session terminated, send the graceful signal, clear the registry.
    ///
    /// No escalation here; the host process is exiting and the signal
    /// handler thread has no runtime to wait on.
    pub fn shutdown_sync(&self) {
        for (key, session) in self.drain() {
            debug!(?key, "shutdown sweep: signaling session");
            session.mark_terminated();
            session.handle().signal_term();
        }
    }
}

/// Registers a host-shutdown hook (SIGINT, and SIGTERM/SIGHUP via the
/// `ctrlc` termination feature) that sweeps the registry synchronously
/// on the handler thread, so an immediate host exit cannot skip it.
/// Nothing in the sweep panics or propagates errors past the handler.
///
/// Call once from the application's composition root. Fails if a handler
/// is already installed for this process.
pub fn install_shutdown_hook<K: SessionKey>(
    registry: &SessionRegistry<K>,
) -> Result<(), ctrlc::Error> {
    let registry = registry.clone();
    ctrlc::set_handler(move || {
        registry.shutdown_sync();
    })
}

/// Graceful signal, bounded wait, then forceful kill.
async fn terminate_with_grace(session: &Session, grace: std::time::Duration) {
    session.handle().signal_term();

    if wait_until_exit(session, Instant::now() + grace).await {
        debug!("session exited within the grace period");
        return;
    }

    warn!("grace period elapsed; force killing session");
    session.handle().force_kill();
    // SIGKILL cannot be ignored; the second wait is bounded anyway for
    // platforms where the forceful path goes through the reaper.
    let _ = wait_until_exit(session, Instant::now() + grace).await;
}

/// Waits for the exit notification up to `deadline`. Returns true if the
/// process is known to have exited.
async fn wait_until_exit(session: &Session, deadline: Instant) -> bool {
    let mut exit = session.handle().exit_watch();
    loop {
        if exit.borrow_and_update().is_some() {
            return true;
        }
        match tokio::time::timeout_at(deadline, exit.changed()).await {
            Ok(Ok(())) => {}
            // The reaper only drops the sender after publishing the exit.
            Ok(Err(_)) => return true,
            Err(_) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::Config;
    use crate::session::registry::SessionRegistry;

    fn registry(program: &str, args: &[&str], grace_ms: u64) -> SessionRegistry<u32> {
        SessionRegistry::new(Config {
            program: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            grace_period_ms: grace_ms,
            ..Config::default()
        })
    }

    #[tokio::test]
    async fn test_kill_live_session() {
        let reg = registry("sleep", &["30"], 500);
        reg.start(1, None).await.unwrap();

        assert!(reg.kill(&1).await);
        assert!(!reg.is_alive(&1));
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let reg = registry("sleep", &["30"], 500);
        reg.start(1, None).await.unwrap();

        assert!(reg.kill(&1).await);
        assert!(!reg.kill(&1).await);
        assert!(!reg.kill(&404).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_escalates_when_term_is_ignored() {
        let reg = registry("sh", &["-c", "trap '' TERM; sleep 30"], 200);
        reg.start(1, None).await.unwrap();
        let session = reg.get(&1).unwrap();

        let started = std::time::Instant::now();
        assert!(reg.kill(&1).await);

        // The graceful signal was ignored, so the grace period must have
        // elapsed before the forceful kill landed.
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(
            session.handle().exit_status().and_then(|e| e.signal),
            Some(libc::SIGKILL)
        );
    }

    #[tokio::test]
    async fn test_shutdown_all_clears_every_session() {
        let reg = registry("sleep", &["30"], 500);
        for key in 1..=3 {
            reg.start(key, None).await.unwrap();
        }
        assert_eq!(reg.list_active().len(), 3);

        reg.shutdown_all().await;

        for key in 1..=3 {
            assert!(!reg.is_alive(&key));
        }
        assert!(reg.list_active().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_sync_signals_and_clears() {
        let reg = registry("sleep", &["30"], 500);
        reg.start(1, None).await.unwrap();
        let session = reg.get(&1).unwrap();

        reg.shutdown_sync();

        assert!(!reg.is_alive(&1));
        assert!(reg.list_active().is_empty());
        // The graceful signal actually lands.
        assert!(wait_until_exit(&session, Instant::now() + Duration::from_secs(2)).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_hook_sweeps_on_sigterm() {
        let reg = registry("sleep", &["30"], 500);
        reg.start(1, None).await.unwrap();
        let session = reg.get(&1).unwrap();
        install_shutdown_hook(&reg).unwrap();

        // SAFETY: signaling our own process; the handler thread catches it.
        unsafe {
            libc::kill(libc::getpid(), libc::SIGTERM);
        }

        // The sweep runs on the handler's own thread.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(reg.list_active().is_empty());
        assert!(wait_until_exit(&session, Instant::now() + Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_shutdown_all_on_empty_registry_is_a_noop() {
        let reg = registry("sleep", &["30"], 500);
        reg.shutdown_all().await;
        assert!(reg.list_active().is_empty());
    }
}
