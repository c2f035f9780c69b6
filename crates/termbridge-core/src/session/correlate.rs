//! Request/response correlation over the shared byte stream.
//!
//! The child gives us no message framing, so "the reply" to an input line
//! is whatever output accumulates between the write and a terminal event.
//! Two strategies are supported:
//!
//! - [`SessionRegistry::send`] races to the first terminal event: process
//!   exit resolves with everything accumulated, a deadline rejects with
//!   `Timeout` while leaving the process running.
//! - [`SessionRegistry::send_settled`] waits a fixed quiet window and
//!   resolves with whatever stdout accumulated, never observing exit.
//!
//! Both strategies hold the session's request gate for their whole
//! duration, so a second call on the same session fails with
//! `RequestInFlight` instead of racing for the same output bytes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::session::Session;
use crate::session::process::{OutputChunk, StreamKind};
use crate::session::registry::{SessionKey, SessionRegistry};

impl<K: SessionKey> SessionRegistry<K> {
    /// Delivers one line to the session's stdin and resolves on the first
    /// terminal event:
    ///
    /// - the process exits: resolves with all stdout and stderr
    ///   accumulated since the write, trimmed;
    /// - the deadline elapses (default from config, 30 s): fails with
    ///   `Timeout`. Only the wait is cancelled; the process keeps running
    ///   and the session stays registered and usable.
    ///
    /// All output subscriptions attached for this call are dropped on every
    /// exit path, so they never leak into a later request.
    pub async fn send(
        &self,
        key: &K,
        text: &str,
        timeout: Option<Duration>,
    ) -> Result<String, SessionError> {
        let session = self.get(key).ok_or(SessionError::NotFound)?;
        let timeout = timeout.unwrap_or_else(|| self.config().reply_timeout());

        let Ok(_gate) = session.request_gate().try_lock() else {
            return Err(SessionError::RequestInFlight);
        };

        let mut chunks = session.handle().subscribe();
        let mut exit = session.handle().exit_watch();

        self.write_or_purge(key, &session, text).await?;

        let mut collected: Vec<u8> = Vec::new();

        // The child may have exited between the liveness check and the
        // write landing in the pipe buffer.
        if exit.borrow_and_update().is_some() {
            drain_into(&mut chunks, &mut collected, None);
            return Ok(finish(&collected));
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut chunks_open = true;

        loop {
            tokio::select! {
                chunk = chunks.recv(), if chunks_open => match chunk {
                    Ok(chunk) => collected.extend_from_slice(&chunk.bytes),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(?key, skipped, "reply accumulator lagged; output lost");
                    }
                    Err(RecvError::Closed) => chunks_open = false,
                },
                changed = exit.changed() => {
                    // A closed watch means the reaper finished, which only
                    // happens after the exit status is published.
                    if changed.is_err() || exit.borrow_and_update().is_some() {
                        drain_into(&mut chunks, &mut collected, None);
                        return Ok(finish(&collected));
                    }
                }
                () = &mut deadline => {
                    debug!(?key, timeout_ms = timeout.as_millis() as u64, "reply deadline elapsed");
                    return Err(SessionError::Timeout(timeout));
                }
            }
        }
    }

    /// Delivers one line and resolves after a fixed quiet window (default
    /// from config, 500 ms) with whatever stdout accumulated, trimmed, or
    /// the configured placeholder when nothing arrived.
    ///
    /// This strategy never observes exit or error for the current request.
    /// If the child is still computing when the window elapses, the rest
    /// of its output surfaces in a later call's accumulation; the request
    /// gate only prevents two concurrent calls from racing.
    pub async fn send_settled(
        &self,
        key: &K,
        text: &str,
        window: Option<Duration>,
    ) -> Result<String, SessionError> {
        let session = self.get(key).ok_or(SessionError::NotFound)?;
        let window = window.unwrap_or_else(|| self.config().settle_window());

        let Ok(_gate) = session.request_gate().try_lock() else {
            return Err(SessionError::RequestInFlight);
        };

        let mut chunks = session.handle().subscribe();
        self.write_or_purge(key, &session, text).await?;

        tokio::time::sleep(window).await;

        let mut collected: Vec<u8> = Vec::new();
        drain_into(&mut chunks, &mut collected, Some(StreamKind::Stdout));

        let reply = finish(&collected);
        if reply.is_empty() {
            Ok(self.config().empty_reply.clone())
        } else {
            Ok(reply)
        }
    }

    /// Writes the input line; a broken pipe means the process is dead for
    /// our purposes, so the session is purged before the error propagates.
    async fn write_or_purge(
        &self,
        key: &K,
        session: &Arc<Session>,
        text: &str,
    ) -> Result<(), SessionError> {
        match session.handle().write_line(text).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if matches!(err, SessionError::Write(_)) {
                    warn!(?key, "stdin write failed; purging session");
                    self.remove(key);
                }
                Err(err)
            }
        }
    }
}

/// Moves everything already buffered into `collected`, optionally keeping
/// only one stream. Exit is published after both pumps drain, so at that
/// point this sees every chunk the child ever wrote.
fn drain_into(chunks: &mut Receiver<OutputChunk>, collected: &mut Vec<u8>, only: Option<StreamKind>) {
    loop {
        match chunks.try_recv() {
            Ok(chunk) => {
                if only.is_none() || only == Some(chunk.stream) {
                    collected.extend_from_slice(&chunk.bytes);
                }
            }
            Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
}

fn finish(collected: &[u8]) -> String {
    String::from_utf8_lossy(collected).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn registry(program: &str, args: &[&str]) -> SessionRegistry<u32> {
        SessionRegistry::new(Config {
            program: program.to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            ..Config::default()
        })
    }

    #[tokio::test]
    async fn test_send_on_unknown_key_fails_before_io() {
        let reg = registry("sh", &["-c", "read line"]);
        let err = reg.send(&404, "ping", None).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound));
        assert!(reg.list_active().is_empty());
    }

    #[tokio::test]
    async fn test_send_resolves_on_exit_with_echoed_output() {
        let reg = registry("sh", &["-c", "read line; echo X"]);
        reg.start(1, None).await.unwrap();

        let reply = reg.send(&1, "ping", None).await.unwrap();
        assert_eq!(reply, "X");
    }

    #[tokio::test]
    async fn test_send_accumulates_both_streams() {
        let reg = registry("sh", &["-c", "read line; echo out; echo err >&2"]);
        reg.start(1, None).await.unwrap();

        let reply = reg.send(&1, "go", None).await.unwrap();
        assert!(reply.contains("out"));
        assert!(reply.contains("err"));
    }

    #[tokio::test]
    async fn test_send_times_out_and_session_survives() {
        let reg = registry("sleep", &["30"]);
        reg.start(1, None).await.unwrap();

        let started = std::time::Instant::now();
        let err = reg
            .send(&1, "ping", Some(Duration::from_millis(100)))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(reg.is_alive(&1));
    }

    #[tokio::test]
    async fn test_send_settled_echoes_through_cat() {
        let reg = registry("cat", &[]);
        reg.start(1, None).await.unwrap();

        let reply = reg
            .send_settled(&1, "hello", Some(Duration::from_millis(300)))
            .await
            .unwrap();
        assert_eq!(reply, "hello");
        // The settle strategy never tears the session down.
        assert!(reg.is_alive(&1));
    }

    #[tokio::test]
    async fn test_send_settled_placeholder_when_silent() {
        let reg = registry("sleep", &["30"]);
        reg.start(1, None).await.unwrap();

        let reply = reg
            .send_settled(&1, "anyone there", Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(reply, "(no output)");
    }

    #[tokio::test]
    async fn test_send_settled_ignores_stderr() {
        let reg = registry("sh", &["-c", "read line; echo noise >&2; read line"]);
        reg.start(1, None).await.unwrap();

        let reply = reg
            .send_settled(&1, "x", Some(Duration::from_millis(200)))
            .await
            .unwrap();
        assert_eq!(reply, "(no output)");
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_rejected() {
        let reg = registry("cat", &[]);
        reg.start(1, None).await.unwrap();

        let reg2 = reg.clone();
        let first = tokio::spawn(async move {
            reg2.send_settled(&1, "slow", Some(Duration::from_millis(400)))
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = reg.send(&1, "eager", None).await.unwrap_err();
        assert!(matches!(err, SessionError::RequestInFlight));

        // The first request is unaffected by the rejected one.
        assert_eq!(first.await.unwrap().unwrap(), "slow");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_send_purges_session_when_stdin_is_closed() {
        // The child closes its stdin end but keeps running, so the next
        // write hits a broken pipe while the process still looks alive.
        let reg = registry("sh", &["-c", "exec 0<&-; sleep 30"]);
        reg.start(1, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let err = reg.send(&1, "ping", None).await.unwrap_err();
        assert!(matches!(err, SessionError::Write(_)));
        // An unwritable session is useless; the failed write purged it.
        assert!(!reg.is_alive(&1));
        assert!(reg.list_active().is_empty());
    }

    #[tokio::test]
    async fn test_send_after_exit_reports_not_found() {
        let reg = registry("sh", &["-c", "exit 0"]);
        reg.start(1, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let err = reg.send(&1, "ping", None).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound));
    }
}
