//! Process supervisor
//!
//! Runs one child process under hard resource caps: dedicated uid/gid, its
//! own process group, rlimits, a wall-clock watchdog, capped stdout/stderr
//! capture, stdin injection, and on-demand signal delivery. Everything a
//! phase needs, nothing it can escape.
//!
//! The supervisor never fails in the Result sense once invoked: a child that
//! cannot even be spawned is reported as a [`PhaseResult`] with `message`
//! set, because to the client a missing interpreter is the same class of
//! outcome as a crashing program.

use std::collections::HashMap;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

pub use crate::supervisor::signals::{ALLOWED_SIGNALS, parse_signal, signal_name};
use crate::types::{PhaseResult, StreamKind};

mod rlimits;
mod signals;

/// Time allowed for the pipe readers to hit EOF after the group is killed.
/// Only matters when a descendant escaped the process group while holding a
/// pipe end open.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Read buffer size for the stdout/stderr pumps
const READ_BUF: usize = 4096;

/// What to execute and as whom
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Absolute path of the program
    pub program: PathBuf,

    /// Full argv; argv[0] is the logical program name
    pub argv: Vec<String>,

    /// Working directory, inside the sandbox slot
    pub cwd: PathBuf,

    /// Complete child environment (the parent's is never inherited)
    pub env: HashMap<String, String>,

    /// Uid to drop to; None runs as the engine's own uid
    pub uid: Option<u32>,

    /// Gid to drop to
    pub gid: Option<u32>,
}

/// Hard caps enforced on the child
#[derive(Debug, Clone)]
pub struct ProcessLimits {
    /// Wall clock budget in milliseconds; the whole group is SIGKILLed at
    /// expiry
    pub wall_ms: u64,

    /// Memory cap in bytes (RLIMIT_AS + RLIMIT_DATA); None is unlimited
    pub memory_bytes: Option<u64>,

    /// Per-stream capture cap; bytes past it are discarded, the child keeps
    /// running
    pub max_output_bytes: u64,

    /// RLIMIT_NPROC (only with a dedicated uid)
    pub max_processes: u32,

    /// RLIMIT_NOFILE
    pub max_open_files: u32,

    /// RLIMIT_FSIZE
    pub max_file_size_bytes: u64,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            wall_ms: 3_000,
            memory_bytes: None,
            max_output_bytes: 1024 * 1024,
            max_processes: 64,
            max_open_files: 2048,
            max_file_size_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Where the child's stdin comes from
pub enum StdinSource {
    /// Write the whole buffer, then close (batch mode)
    Buffer(Vec<u8>),

    /// Forward chunks as they arrive; close on channel EOF (interactive mode)
    Channel(mpsc::Receiver<Vec<u8>>),
}

impl std::fmt::Debug for StdinSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StdinSource::Buffer(data) => f.debug_tuple("Buffer").field(&data.len()).finish(),
            StdinSource::Channel(_) => f.debug_tuple("Channel").finish(),
        }
    }
}

/// A chunk of child output, in kernel read order
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub data: Vec<u8>,
}

/// Live wiring for one supervised phase
#[derive(Debug, Default)]
pub struct PhaseIo<'a> {
    /// Sink for output chunks as they are read; None captures silently
    pub events: Option<mpsc::UnboundedSender<OutputChunk>>,

    /// Client signal requests, delivered to the child's process group
    pub signals: Option<&'a mut mpsc::Receiver<Signal>>,

    /// Cooperative cancellation; flips to true when the job is being torn
    /// down
    pub cancel: Option<watch::Receiver<bool>>,
}

/// Run one child to completion under the given limits.
#[instrument(skip_all, fields(program = %spec.program.display()))]
pub async fn supervise(
    spec: ProcessSpec,
    limits: ProcessLimits,
    stdin: StdinSource,
    io: PhaseIo<'_>,
) -> PhaseResult {
    let started = Instant::now();

    let mut cmd = Command::new(&spec.program);
    if let Some((name, rest)) = spec.argv.split_first() {
        cmd.as_std_mut().arg0(name);
        cmd.args(rest);
    }
    cmd.env_clear()
        .envs(&spec.env)
        .current_dir(&spec.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);
    if let Some(uid) = spec.uid {
        cmd.uid(uid);
    }
    if let Some(gid) = spec.gid {
        cmd.gid(gid);
    }

    let child_limits = limits.clone();
    let dedicated_uid = spec.uid.is_some();
    // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || rlimits::apply(&child_limits, dedicated_uid));
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            debug!(error = %e, "spawn failed");
            return PhaseResult::launch_failure(format!(
                "failed to launch {}: {e}",
                spec.program.display()
            ));
        }
    };
    // The child is its own process group leader, so its pid doubles as the
    // pgid for signal delivery.
    let pid = child.id().map(|p| p as i32).unwrap_or(0);

    let (chunk_tx, mut chunk_rx) = mpsc::channel::<OutputChunk>(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, StreamKind::Stdout, chunk_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, StreamKind::Stderr, chunk_tx.clone()));
    }
    drop(chunk_tx);

    let stdin_task = tokio::spawn(feed_stdin(child.stdin.take(), stdin));

    let mut buffers = OutputBuffers::new(limits.max_output_bytes as usize);
    let deadline = tokio::time::sleep(Duration::from_millis(limits.wall_ms));
    tokio::pin!(deadline);

    let mut signals = io.signals;
    let mut cancel = io.cancel;
    let mut timed_out = false;
    let mut canceled = false;
    let mut wait_error = None;

    let status = loop {
        tokio::select! {
            biased;

            Some(chunk) = chunk_rx.recv() => {
                emit(&mut buffers, &io.events, chunk);
            }

            sig = next_signal(&mut signals) => match sig {
                Some(sig) => {
                    debug!(signal = sig.as_str(), "delivering client signal");
                    deliver(pid, sig);
                }
                // Channel closed; stop polling it.
                None => signals = None,
            },

            _ = canceled_flag(&mut cancel), if !canceled => {
                debug!("phase canceled, killing process group");
                canceled = true;
                kill_group(pid);
            }

            _ = &mut deadline, if !timed_out => {
                debug!(wall_ms = limits.wall_ms, "wall clock expired, killing process group");
                timed_out = true;
                kill_group(pid);
            }

            status = child.wait() => {
                match status {
                    Ok(status) => break Some(status),
                    Err(e) => {
                        wait_error = Some(e);
                        break None;
                    }
                }
            }
        }
    };

    stdin_task.abort();
    // Descendants of the group die with it, whatever the exit path was.
    kill_group(pid);

    // Pick up whatever the readers still hold. Bounded: a process that
    // escaped the group could keep a pipe open forever.
    let drained = tokio::time::timeout(DRAIN_GRACE, async {
        while let Some(chunk) = chunk_rx.recv().await {
            emit(&mut buffers, &io.events, chunk);
        }
    })
    .await;
    if drained.is_err() {
        warn!("output drain timed out; something outside the process group holds a pipe");
    }

    let wall_ms = started.elapsed().as_millis() as u64;
    let mut result = PhaseResult {
        stdout: String::from_utf8_lossy(&buffers.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&buffers.stderr).into_owned(),
        output: String::from_utf8_lossy(&buffers.combined).into_owned(),
        wall_ms,
        ..Default::default()
    };

    match status {
        Some(status) => {
            if let Some(code) = status.code() {
                result.exit_code = Some(code);
            } else if let Some(raw) = status.signal() {
                result.signal = Some(signal_name(raw));
            }
        }
        None => {
            result.message = Some(match wait_error {
                Some(e) => format!("failed to reap child: {e}"),
                None => "failed to reap child".to_owned(),
            });
        }
    }

    if timed_out {
        result.exit_code = None;
        result.signal = Some("SIGKILL".to_owned());
        result.message = Some("timeout".to_owned());
    }

    debug!(
        exit_code = ?result.exit_code,
        signal = ?result.signal,
        wall_ms = result.wall_ms,
        "phase complete"
    );
    result
}

/// Append a chunk to the capped buffers and forward the kept prefix
fn emit(
    buffers: &mut OutputBuffers,
    events: &Option<mpsc::UnboundedSender<OutputChunk>>,
    chunk: OutputChunk,
) {
    let taken = buffers.append(chunk.stream, &chunk.data);
    if taken > 0
        && let Some(events) = events
    {
        let _ = events.send(OutputChunk {
            stream: chunk.stream,
            data: chunk.data[..taken].to_vec(),
        });
    }
}

struct OutputBuffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    combined: Vec<u8>,
    cap: usize,
}

impl OutputBuffers {
    fn new(cap: usize) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            combined: Vec::new(),
            cap,
        }
    }

    /// Append up to the per-stream cap; returns how many bytes were kept.
    /// Bytes past the cap are dropped but reading continues so the child
    /// never blocks on a full pipe.
    fn append(&mut self, stream: StreamKind, data: &[u8]) -> usize {
        let buf = match stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        };
        let take = self.cap.saturating_sub(buf.len()).min(data.len());
        if take > 0 {
            buf.extend_from_slice(&data[..take]);
            self.combined.extend_from_slice(&data[..take]);
        }
        take
    }
}

/// Read one child stream to EOF, forwarding chunks in read order
async fn pump(
    mut stream: impl tokio::io::AsyncRead + Unpin,
    kind: StreamKind,
    tx: mpsc::Sender<OutputChunk>,
) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = OutputChunk {
                    stream: kind,
                    data: buf[..n].to_vec(),
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Feed the child's stdin from a buffer or a live channel, then close it
async fn feed_stdin(pipe: Option<ChildStdin>, source: StdinSource) {
    let Some(mut pipe) = pipe else {
        return;
    };
    match source {
        StdinSource::Buffer(data) => {
            let _ = pipe.write_all(&data).await;
        }
        StdinSource::Channel(mut rx) => {
            while let Some(chunk) = rx.recv().await {
                if pipe.write_all(&chunk).await.is_err() {
                    break;
                }
                if pipe.flush().await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = pipe.shutdown().await;
}

async fn next_signal(rx: &mut Option<&mut mpsc::Receiver<Signal>>) -> Option<Signal> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn canceled_flag(rx: &mut Option<watch::Receiver<bool>>) {
    match rx {
        Some(rx) => loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without firing; cancellation can never happen.
                std::future::pending::<()>().await;
            }
        },
        None => std::future::pending().await,
    }
}

/// SIGKILL the whole process group; ESRCH is fine, the group is already gone
fn kill_group(pid: i32) {
    if pid > 0 {
        let _ = signal::killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

/// Deliver a client-requested signal to the process group
fn deliver(pid: i32, sig: Signal) {
    if pid > 0
        && let Err(e) = signal::killpg(Pid::from_raw(pid), sig)
    {
        debug!(signal = sig.as_str(), error = %e, "signal delivery failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_buffers_respect_cap() {
        let mut buffers = OutputBuffers::new(10);

        assert_eq!(buffers.append(StreamKind::Stdout, b"hello"), 5);
        assert_eq!(buffers.append(StreamKind::Stdout, b"world!!"), 5);
        // Stream is full; further bytes are dropped.
        assert_eq!(buffers.append(StreamKind::Stdout, b"more"), 0);

        assert_eq!(buffers.stdout, b"helloworld");
        assert_eq!(buffers.combined, b"helloworld");
    }

    #[test]
    fn output_buffers_cap_is_per_stream() {
        let mut buffers = OutputBuffers::new(4);

        assert_eq!(buffers.append(StreamKind::Stdout, b"aaaa"), 4);
        assert_eq!(buffers.append(StreamKind::Stderr, b"bbbb"), 4);
        assert_eq!(buffers.append(StreamKind::Stdout, b"x"), 0);
        assert_eq!(buffers.append(StreamKind::Stderr, b"x"), 0);

        assert_eq!(buffers.stdout, b"aaaa");
        assert_eq!(buffers.stderr, b"bbbb");
    }

    #[test]
    fn output_buffers_preserve_interleaving() {
        let mut buffers = OutputBuffers::new(100);

        buffers.append(StreamKind::Stdout, b"out1 ");
        buffers.append(StreamKind::Stderr, b"err1 ");
        buffers.append(StreamKind::Stdout, b"out2");

        assert_eq!(buffers.combined, b"out1 err1 out2");
        assert_eq!(buffers.stdout, b"out1 out2");
        assert_eq!(buffers.stderr, b"err1 ");
    }

    #[test]
    fn process_limits_default() {
        let limits = ProcessLimits::default();
        assert_eq!(limits.wall_ms, 3_000);
        assert!(limits.memory_bytes.is_none());
        assert!(limits.max_output_bytes > 0);
    }
}
