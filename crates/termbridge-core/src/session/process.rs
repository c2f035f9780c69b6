//! Child process wrapper: piped stdio, output fan-out, exit notification.
//!
//! The child provides no message framing, so this layer stays byte-level:
//! output is forwarded as opaque chunks in OS delivery order per stream,
//! and the exit status is published exactly once.

use std::fmt;
use std::io;
use std::path::Path;
use std::process::Stdio;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::SessionError;

/// Buffered output chunks before a lagging subscriber starts losing the
/// oldest ones. Only affects diagnostics of extremely chatty children.
const CHUNK_CHANNEL_CAPACITY: usize = 1024;

/// Read buffer size for the stdout/stderr pumps.
const READ_BUF_SIZE: usize = 8 * 1024;

/// Which pipe a chunk arrived on.
///
/// Stdout and stderr are independent streams; chunks are ordered within a
/// stream but not across the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// One chunk of child output.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub bytes: Bytes,
}

/// Terminal state of a child process: a numeric exit code, or the signal
/// that killed it. Both are surfaced to callers for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    fn from_status(status: Option<std::process::ExitStatus>) -> Self {
        match status {
            Some(status) => {
                #[cfg(unix)]
                let signal = std::os::unix::process::ExitStatusExt::signal(&status);
                #[cfg(not(unix))]
                let signal = None;
                Self {
                    code: status.code(),
                    signal,
                }
            }
            // wait() itself failed; all we know is that the child is gone.
            None => Self {
                code: None,
                signal: None,
            },
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code={code}"),
            (None, Some(signal)) => write!(f, "signal={}", signal_name(signal)),
            (None, None) => write!(f, "unknown"),
        }
    }
}

/// Maps common termination signal numbers to their conventional names.
pub fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        9 => "SIGKILL".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("signal {other}"),
    }
}

/// A spawned child process with stdin, stdout, and stderr all piped.
///
/// Output chunks fan out through a broadcast channel; a subscriber only
/// observes chunks produced after it subscribed. The exit status is
/// published on a watch channel once, after both output pumps have
/// drained, so by the time the exit is visible every chunk the child ever
/// wrote is already in the broadcast buffer.
pub struct ProcessHandle {
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    chunks: broadcast::Sender<OutputChunk>,
    exit: watch::Receiver<Option<ProcessExit>>,
    kill: mpsc::UnboundedSender<()>,
}

impl ProcessHandle {
    /// Spawns `program` with `args` in `workdir`.
    ///
    /// Spawning allocates an OS process and three pipes; the caller must
    /// eventually observe exit or request termination to release them.
    pub fn spawn(program: &str, args: &[String], workdir: &Path) -> io::Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("child stderr was not piped"))?;

        let (chunk_tx, _) = broadcast::channel(CHUNK_CHANNEL_CAPACITY);
        let stdout_pump = tokio::spawn(pump(StreamKind::Stdout, stdout, chunk_tx.clone()));
        let stderr_pump = tokio::spawn(pump(StreamKind::Stderr, stderr, chunk_tx.clone()));

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        tokio::spawn(reap(child, kill_rx, stdout_pump, stderr_pump, exit_tx));

        debug!(pid, program, workdir = %workdir.display(), "spawned child process");

        Ok(Self {
            pid,
            stdin: Mutex::new(stdin),
            chunks: chunk_tx,
            exit: exit_rx,
            kill: kill_tx,
        })
    }

    /// OS process id assigned at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Writes one line of UTF-8 text to the child's stdin and flushes.
    ///
    /// The line terminator is the only framing the child gets.
    pub async fn write_line(&self, text: &str) -> Result<(), SessionError> {
        let mut stdin = self.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(SessionError::StdinUnavailable);
        };

        let result = async {
            stdin.write_all(text.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;

        result.map_err(SessionError::Write)
    }

    /// Subscribes to output chunks produced after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<OutputChunk> {
        self.chunks.subscribe()
    }

    /// Watch handle for the exit notification. The value transitions from
    /// `None` to `Some` at most once.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit.clone()
    }

    /// Returns the exit status if the process has already terminated.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Sends the graceful termination signal (SIGTERM on unix).
    ///
    /// Callable from any thread, including a signal handler's: this only
    /// issues a `kill(2)` or an unbounded channel send.
    pub fn signal_term(&self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                // SAFETY: kill(2) with a pid we spawned; no memory access.
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
                return;
            }
        }
        // No pid, or no signal support on this platform: the forceful
        // path is the only termination available.
        let _ = self.kill.send(());
    }

    /// Forcefully kills the child (SIGKILL semantics).
    pub fn force_kill(&self) {
        let _ = self.kill.send(());
    }
}

/// Copies one output pipe into the broadcast channel until EOF.
async fn pump<R>(stream: StreamKind, mut reader: R, tx: broadcast::Sender<OutputChunk>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                // A send error only means nobody is subscribed right now.
                let _ = tx.send(OutputChunk {
                    stream,
                    bytes: Bytes::copy_from_slice(&buf[..n]),
                });
            }
        }
    }
}

/// Owns the child: waits for exit, handles force-kill requests, and
/// publishes the exit status after both pumps have drained.
async fn reap(
    mut child: Child,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
    stdout_pump: JoinHandle<()>,
    stderr_pump: JoinHandle<()>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status.ok(),
            // When the handle is dropped the channel closes and this
            // branch is disabled; only wait() remains.
            Some(()) = kill_rx.recv() => {
                let _ = child.start_kill();
            }
        }
    };

    // The pumps end at EOF on their pipes. Joining them before publishing
    // the exit guarantees subscribers see every chunk before the exit event.
    let _ = stdout_pump.await;
    let _ = stderr_pump.await;

    let exit = ProcessExit::from_status(status);
    debug!(%exit, "child process exited");
    let _ = exit_tx.send(Some(exit));
}
