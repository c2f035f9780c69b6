//! Session management for long-lived interactive CLI processes.
//!
//! A coding-assistant CLI spawned once per logical owner is driven over
//! its raw stdin/stdout/stderr pipes by independent callers (chat
//! integrations, tooling). The child offers no message framing, so this
//! crate provides the pieces that make that workable:
//!
//! - [`SessionRegistry`]: caller-chosen keys mapped to live sessions,
//!   with lazy purging of dead entries on every access path
//! - request/response correlation over the unframed byte stream
//!   ([`SessionRegistry::send`], [`SessionRegistry::send_settled`])
//! - termination escalation (graceful signal, then kill) and host
//!   shutdown sweeps ([`install_shutdown_hook`])
//!
//! The registry is an explicit value owned by the application's
//! composition root; independent registries can coexist in one process.

pub mod config;
pub mod error;
pub mod session;

pub use config::Config;
pub use error::SessionError;
pub use session::registry::{SessionKey, SessionRegistry, StartedSession};
pub use session::supervisor::install_shutdown_hook;
pub use session::{Session, SessionInfo};
