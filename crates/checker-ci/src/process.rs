//! Subprocess execution with a wall-clock limit and cancellation.
//!
//! Every child runs in its own process group. Once the child exits, times out
//! or is cancelled the whole group is killed, so grandchildren spawned by
//! student code never outlive the stage. Captured output is bounded: only the
//! last [`MAX_OUTPUT_BYTES`] are kept.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::plugin::{PluginError, PluginResult};

/// Grace period for pipe readers once the child has exited or been killed.
const IO_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Default cap on captured stdout+stderr.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// A shell string run with `sh -c`, or an argv list run directly.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Script {
    Shell(String),
    Argv(Vec<String>),
}

impl Script {
    fn argv(&self) -> Vec<String> {
        match self {
            Script::Shell(line) => vec!["sh".into(), "-c".into(), line.clone()],
            Script::Argv(argv) => argv.clone(),
        }
    }
}

impl std::fmt::Display for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Script::Shell(line) => write!(f, "{line}"),
            Script::Argv(argv) => write!(f, "{}", argv.join(" ")),
        }
    }
}

/// What the child reads on stdin.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Input {
    #[default]
    Null,
    File(PathBuf),
    Bytes(Vec<u8>),
}

/// Environment handed to the child.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvPolicy {
    /// When set, the child sees only these variables (plus `additional`).
    pub whitelist: Option<Vec<String>>,
    pub additional: BTreeMap<String, String>,
}

/// One process to run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub script: Script,
    pub cwd: Option<PathBuf>,
    pub env: EnvPolicy,
    pub input: Input,
    pub timeout: Option<Duration>,
    /// Bytes of output kept; older output is dropped.
    pub output_limit: usize,
}

impl ProcessSpec {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            cwd: None,
            env: EnvPolicy::default(),
            input: Input::Null,
            timeout: None,
            output_limit: MAX_OUTPUT_BYTES,
        }
    }

    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, env: EnvPolicy) -> Self {
        self.env = env;
        self
    }

    pub fn with_input(mut self, input: Input) -> Self {
        self.input = input;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit;
        self
    }
}

/// Tail of the child's output, at most `limit` bytes.
#[derive(Debug)]
struct Capture {
    tail: VecDeque<u8>,
    limit: usize,
    dropped: usize,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            tail: VecDeque::new(),
            limit,
            dropped: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.tail.extend(chunk);
        let excess = self.tail.len().saturating_sub(self.limit);
        if excess > 0 {
            self.tail.drain(..excess);
            self.dropped += excess;
        }
    }

    fn render(&self) -> String {
        let (front, back) = self.tail.as_slices();
        let mut bytes = Vec::with_capacity(front.len() + back.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        let text = String::from_utf8_lossy(&bytes);
        if self.dropped == 0 {
            text.into_owned()
        } else {
            format!("[output truncated: first {} bytes dropped]\n{text}", self.dropped)
        }
    }
}

/// Finished process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// stdout and stderr, interleaved in arrival order.
    pub output: String,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run `spec` to completion.
///
/// Returns [`PluginError::Timeout`] or [`PluginError::Cancelled`] after
/// killing the process group; a non-zero exit is not an error here.
pub async fn run_process(
    spec: &ProcessSpec,
    cancel: &CancellationToken,
) -> PluginResult<ProcessOutput> {
    let argv = spec.script.argv();
    let Some((program, args)) = argv.split_first() else {
        return Err(PluginError::failed("empty command", ""));
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    if let Some(whitelist) = &spec.env.whitelist {
        command.env_clear();
        for name in whitelist {
            command.env(name, std::env::var(name).unwrap_or_default());
        }
    }
    command.envs(&spec.env.additional);

    let mut stdin_bytes = None;
    match &spec.input {
        Input::Null => {
            command.stdin(Stdio::null());
        }
        Input::File(path) => {
            let file = std::fs::File::open(path).map_err(|e| {
                PluginError::failed(format!("cannot open input {}: {e}", path.display()), "")
            })?;
            command.stdin(Stdio::from(file));
        }
        Input::Bytes(bytes) => {
            command.stdin(Stdio::piped());
            stdin_bytes = Some(bytes.clone());
        }
    }

    let started = Instant::now();
    debug!(command = %spec.script, "spawning process");
    let mut child = command
        .spawn()
        .map_err(|e| PluginError::failed(format!("failed to start `{program}`: {e}"), ""))?;
    // read before waiting: the id is gone once the child is reaped
    let pgid = child.id();

    if let (Some(bytes), Some(mut stdin)) = (stdin_bytes, child.stdin.take()) {
        tokio::spawn(async move {
            // the child may exit without reading; a broken pipe is fine
            let _ = stdin.write_all(&bytes).await;
        });
    }

    let buffer = Arc::new(Mutex::new(Capture::new(spec.output_limit)));
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(collect(stdout, Arc::clone(&buffer))));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(collect(stderr, Arc::clone(&buffer))));
    }

    enum Outcome {
        Exited(Option<i32>),
        TimedOut(Duration),
        Cancelled,
    }

    let outcome = tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| PluginError::failed(format!("wait failed: {e}"), ""))?;
            Outcome::Exited(status.code())
        }
        _ = sleep_or_forever(spec.timeout) => Outcome::TimedOut(spec.timeout.unwrap_or_default()),
        _ = cancel.cancelled() => Outcome::Cancelled,
    };

    // background jobs left by a normally exiting shell die here too
    if let Err(e) = kill_process_group(pgid) {
        warn!(error = %e, "failed to kill process group");
    }
    if !matches!(outcome, Outcome::Exited(_)) {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }

    let deadline = tokio::time::Instant::now() + IO_DRAIN_TIMEOUT;
    for reader in &mut readers {
        if tokio::time::timeout_at(deadline, &mut *reader).await.is_err() {
            warn!(command = %spec.script, "output pipe still open after exit, dropping reader");
        }
        reader.abort();
    }
    let output = buffer.lock().map(|c| c.render()).unwrap_or_default();

    match outcome {
        Outcome::Exited(exit_code) => Ok(ProcessOutput {
            exit_code,
            output,
            elapsed: started.elapsed(),
        }),
        Outcome::TimedOut(limit) => Err(PluginError::Timeout {
            limit_secs: limit.as_secs_f64(),
            output,
        }),
        Outcome::Cancelled => Err(PluginError::Cancelled),
    }
}

/// Drain `pipe` to EOF; past the limit older bytes are discarded.
async fn collect(mut pipe: impl AsyncRead + Unpin, buffer: Arc<Mutex<Capture>>) {
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buffer) = buffer.lock() {
                    buffer.push(&chunk[..n]);
                }
            }
        }
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: Option<u32>) -> std::io::Result<()> {
    use std::io::ErrorKind;

    let Some(pid) = pgid else {
        return Ok(());
    };
    // the child leads its own group, so its pid is the pgid
    let result = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.kind() != ErrorKind::NotFound && err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_process_group(_: Option<u32>) -> std::io::Result<()> {
    Ok(())
}
