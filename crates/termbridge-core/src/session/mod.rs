//! Session module: registry, process wrapper, correlation, supervision.
//!
//! This module contains:
//! - `process`: child process spawn and stdio plumbing
//! - `registry`: key-to-session mapping with lazy liveness purging
//! - `correlate`: request/response correlation over the raw byte stream
//! - `supervisor`: termination escalation and host-shutdown cleanup

pub mod correlate;
pub mod process;
pub mod registry;
pub mod supervisor;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::session::process::ProcessHandle;

/// One running external process bound to a logical owner key.
///
/// Invariant: a session present in the registry is never terminated; the
/// false-to-true transition of the termination flag is immediately followed
/// by removal from the registry.
pub struct Session {
    handle: ProcessHandle,
    workdir: PathBuf,
    created_at: DateTime<Utc>,
    started: Instant,
    terminated: AtomicBool,
    /// Serializes correlator calls: at most one request in flight per
    /// session, so output cannot be routed to the wrong caller.
    request_gate: Mutex<()>,
}

impl Session {
    pub(crate) fn new(handle: ProcessHandle, workdir: PathBuf) -> Self {
        Self {
            handle,
            workdir,
            created_at: Utc::now(),
            started: Instant::now(),
            terminated: AtomicBool::new(false),
            request_gate: Mutex::new(()),
        }
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Resolved absolute working directory, immutable after creation.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Creation timestamp, for diagnostics only.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether the process is still expected to accept input and produce
    /// output. The cached flag alone is never trusted: the observed exit
    /// status is combined in, since the child may have died asynchronously.
    pub fn is_alive(&self) -> bool {
        !self.terminated.load(Ordering::SeqCst) && self.handle.exit_status().is_none()
    }

    /// Marks the session terminated (monotonic). Returns false if it
    /// already was, which makes termination idempotent for callers.
    pub(crate) fn mark_terminated(&self) -> bool {
        !self.terminated.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn request_gate(&self) -> &Mutex<()> {
        &self.request_gate
    }
}

/// Diagnostic snapshot of a live session, as returned by `list_active`.
#[derive(Debug, Clone)]
pub struct SessionInfo<K> {
    pub key: K,
    pub uptime: Duration,
    pub workdir: PathBuf,
    pub created_at: DateTime<Utc>,
}
