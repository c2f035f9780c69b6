//! Typed errors for session operations.
//!
//! Every failure is returned to the immediate caller; nothing is silently
//! swallowed. A failed `send` should be converted into a user-facing
//! message by the integration layer, never crash the host.

use std::fmt;
use std::io;
use std::time::Duration;

/// Errors surfaced by the session registry and correlator.
#[derive(Debug)]
pub enum SessionError {
    /// The key is not registered, or its process was found dead and purged.
    /// The caller should `start` a fresh session.
    NotFound,
    /// A live session already occupies this key. The existing session is
    /// untouched; reuse it or `kill` it first.
    AlreadyActive,
    /// Another request is already in flight on this session. Requests are
    /// serialized per session so replies cannot be attributed to the wrong
    /// caller.
    RequestInFlight,
    /// The child's stdin pipe is no longer available.
    StdinUnavailable,
    /// Writing to stdin failed (typically a broken pipe). The session is
    /// treated as dead and purged from the registry.
    Write(io::Error),
    /// The executable could not be spawned. No session was created.
    Spawn(io::Error),
    /// No terminal event arrived within the deadline. The session remains
    /// registered and usable for a later request.
    Timeout(Duration),
}

impl SessionError {
    /// Whether the caller can recover by retrying, restarting the session,
    /// or reusing the existing one.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::NotFound
                | SessionError::AlreadyActive
                | SessionError::RequestInFlight
                | SessionError::Timeout(_)
        )
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotFound => write!(f, "session not found"),
            SessionError::AlreadyActive => write!(f, "session already active for this key"),
            SessionError::RequestInFlight => {
                write!(f, "another request is in flight on this session")
            }
            SessionError::StdinUnavailable => write!(f, "session stdin unavailable"),
            SessionError::Write(err) => write!(f, "failed to write to session stdin: {err}"),
            SessionError::Spawn(err) => write!(f, "failed to spawn session process: {err}"),
            SessionError::Timeout(deadline) => {
                write!(f, "no reply within {} ms", deadline.as_millis())
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Write(err) | SessionError::Spawn(err) => Some(err),
            _ => None,
        }
    }
}
