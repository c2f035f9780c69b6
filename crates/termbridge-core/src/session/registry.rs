//! Process-wide mapping from owner keys to live sessions.
//!
//! Purge-on-access plus purge-on-exit gives eventual consistency without a
//! periodic sweep: every access path re-validates liveness, so correctness
//! never depends on sweep timing.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::SessionError;
use crate::session::process::{OutputChunk, ProcessHandle};
use crate::session::{Session, SessionInfo};

/// Bounds for session keys: any hashable opaque value chosen by the caller
/// (an OS pid, a composite chat identity, a string). Keys are never reused
/// while their session is live.
pub trait SessionKey: Eq + Hash + Clone + Debug + Send + Sync + 'static {}

impl<K: Eq + Hash + Clone + Debug + Send + Sync + 'static> SessionKey for K {}

/// Result of a successful `start`.
#[derive(Debug)]
pub struct StartedSession<K> {
    pub key: K,
    /// Output the child produced during the startup window (often empty).
    pub initial_output: String,
}

/// Registry of live sessions.
///
/// A cheap cloneable handle over shared state, owned by the application's
/// composition root. Independent registries can coexist; nothing here is
/// global.
#[derive(Clone)]
pub struct SessionRegistry<K: SessionKey> {
    inner: Arc<Inner<K>>,
}

pub(crate) struct Inner<K> {
    config: Config,
    sessions: Mutex<HashMap<K, Arc<Session>>>,
}

impl<K: SessionKey> SessionRegistry<K> {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Starts a session for `key` using the configured program.
    ///
    /// `workdir` defaults to the host's current directory and is resolved
    /// to an absolute path. Returns the key together with whatever output
    /// the child produced during the startup window.
    pub async fn start(
        &self,
        key: K,
        workdir: Option<PathBuf>,
    ) -> Result<StartedSession<K>, SessionError> {
        let config = &self.inner.config;
        self.start_program(key, &config.program, &config.args, workdir)
            .await
    }

    /// Starts a session for `key` with an explicit program and arguments.
    ///
    /// Fails with `AlreadyActive` when a live session occupies the key;
    /// the existing session is left untouched. A spawn failure registers
    /// nothing.
    pub async fn start_program(
        &self,
        key: K,
        program: &str,
        args: &[String],
        workdir: Option<PathBuf>,
    ) -> Result<StartedSession<K>, SessionError> {
        let workdir = resolve_workdir(workdir);

        let chunks = {
            let mut sessions = self.inner.lock_sessions();
            if let Some(existing) = sessions.get(&key) {
                if existing.is_alive() {
                    return Err(SessionError::AlreadyActive);
                }
                // The previous holder died silently; evict it so the key
                // can be reused.
                sessions.remove(&key);
            }

            let handle =
                ProcessHandle::spawn(program, args, &workdir).map_err(SessionError::Spawn)?;
            let chunks = handle.subscribe();
            let session = Arc::new(Session::new(handle, workdir));

            self.spawn_exit_watcher(key.clone(), &session);
            sessions.insert(key.clone(), session);
            chunks
        };

        let initial_output =
            collect_startup_output(chunks, self.inner.config.startup_window()).await;

        Ok(StartedSession {
            key,
            initial_output,
        })
    }

    /// Fetches the live session for `key`.
    ///
    /// A dead entry is purged here as a side effect and never returned;
    /// callers must tolerate a lookup mutating the registry.
    pub fn get(&self, key: &K) -> Option<Arc<Session>> {
        let mut sessions = self.inner.lock_sessions();
        let session = sessions.get(key)?;
        if session.is_alive() {
            Some(Arc::clone(session))
        } else {
            debug!(?key, "purging stale session on access");
            sessions.remove(key);
            None
        }
    }

    /// Liveness check. Unknown keys (including previously purged ones)
    /// report dead with no error.
    pub fn is_alive(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Removes `key` if present. Idempotent; a no-op for absent keys.
    pub fn remove(&self, key: &K) -> Option<Arc<Session>> {
        self.inner.lock_sessions().remove(key)
    }

    /// Snapshot of all live sessions for diagnostics, purging dead entries
    /// on the way.
    pub fn list_active(&self) -> Vec<SessionInfo<K>> {
        let mut sessions = self.inner.lock_sessions();
        sessions.retain(|_, session| session.is_alive());
        sessions
            .iter()
            .map(|(key, session)| SessionInfo {
                key: key.clone(),
                uptime: session.uptime(),
                workdir: session.workdir().to_path_buf(),
                created_at: session.created_at(),
            })
            .collect()
    }

    /// Takes every session out of the registry (shutdown sweep).
    pub(crate) fn drain(&self) -> Vec<(K, Arc<Session>)> {
        self.inner.lock_sessions().drain().collect()
    }

    /// Watches for process exit and purges the entry, so the registry
    /// converges even when nobody touches the key again.
    ///
    /// The entry is removed only while it still holds this watcher's own
    /// session: keys are reusable after a death, and a late-firing watcher
    /// for the old holder must not delete the new one.
    fn spawn_exit_watcher(&self, key: K, session: &Arc<Session>) {
        let mut exit = session.handle().exit_watch();
        let weak: Weak<Inner<K>> = Arc::downgrade(&self.inner);
        let owner: Weak<Session> = Arc::downgrade(session);
        tokio::spawn(async move {
            loop {
                if let Some(status) = *exit.borrow_and_update() {
                    if let Some(inner) = weak.upgrade() {
                        let mut sessions = inner.lock_sessions();
                        let still_ours = sessions.get(&key).is_some_and(|current| {
                            owner.upgrade().is_some_and(|own| Arc::ptr_eq(current, &own))
                        });
                        if still_ours {
                            sessions.remove(&key);
                            debug!(?key, exit = %status, "session process exited; purged");
                        }
                    }
                    return;
                }
                if exit.changed().await.is_err() {
                    warn!(?key, "exit watch closed without a status");
                    return;
                }
            }
        });
    }
}

impl<K> Inner<K> {
    /// The map lock is only ever held for short, non-awaiting sections,
    /// including on the signal handler thread.
    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<K, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn resolve_workdir(workdir: Option<PathBuf>) -> PathBuf {
    let dir = workdir
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."));
    std::path::absolute(&dir).unwrap_or(dir)
}

/// Drains whatever arrived during the startup window into a string.
async fn collect_startup_output(
    mut chunks: broadcast::Receiver<OutputChunk>,
    window: std::time::Duration,
) -> String {
    if !window.is_zero() {
        tokio::time::sleep(window).await;
    }
    let mut collected = Vec::new();
    loop {
        match chunks.try_recv() {
            Ok(chunk) => collected.extend_from_slice(&chunk.bytes),
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(
                broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed,
            ) => break,
        }
    }
    String::from_utf8_lossy(&collected).trim().to_string()
}
