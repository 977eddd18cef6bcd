//! Drives one duplicity subprocess at a time.
//!
//! A [`DuplicityRunner`] is cheap to clone; clones share the same run state,
//! so one task can await an operation while another calls [`DuplicityRunner::cancel`].
//! Starting a second operation while one is active fails with [`RunError::Busy`].
//!
//! Children are spawned in their own process group. Cancellation sends `SIGINT`
//! to the whole group so helpers duplicity started (gpg, ssh) see it too.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};
use uuid::Uuid;

use super::command::{CommandBuilder, Invocation};
use super::error::{Outcome, RunError};
use super::models::{BackupMode, FileEntry, JobDescriptor, OutputChunk, StatusReport, Stream};
use super::parser::{DuplicityParser, OutputParser};
use crate::logging::RelayLog;

/// Default cap on combined stdout+stderr of one operation.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1000;

pub const DEFAULT_VERBOSITY: &str = "notice";

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Bytes of stderr kept on a failed exit.
const STDERR_TAIL: usize = 4 * 1024;

/// Receiver side of the output relay.
pub type OutputSink = mpsc::UnboundedSender<OutputChunk>;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Program spawned for every invocation.
    pub program: String,
    pub verbosity: String,
    pub max_output_bytes: usize,
    /// Exported to the child as `TMPDIR`.
    pub temp_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: "duplicity".to_string(),
            verbosity: DEFAULT_VERBOSITY.to_string(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            temp_dir: std::env::temp_dir(),
        }
    }
}

struct ActiveProcess {
    id: Uuid,
    op: &'static str,
    pid: Option<u32>,
}

#[derive(Default)]
struct RunState {
    active: Option<ActiveProcess>,
    cancelled: bool,
}

/// Releases the run slot when an operation ends, however it ends.
struct ActiveGuard {
    state: Arc<Mutex<RunState>>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.active = None;
        state.cancelled = false;
    }
}

struct Execution {
    status: std::process::ExitStatus,
    stdout: String,
    stderr: String,
    overflowed: bool,
}

#[derive(Clone)]
pub struct DuplicityRunner {
    commands: CommandBuilder,
    max_output_bytes: usize,
    parser: Arc<dyn OutputParser>,
    state: Arc<Mutex<RunState>>,
    sink: Arc<Mutex<Option<OutputSink>>>,
    relay_log: Arc<RelayLog>,
}

impl Default for DuplicityRunner {
    fn default() -> Self {
        Self::new(RunnerConfig::default())
    }
}

impl DuplicityRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            commands: CommandBuilder::new(config.program, config.verbosity, config.temp_dir),
            max_output_bytes: config.max_output_bytes,
            parser: Arc::new(DuplicityParser),
            state: Arc::new(Mutex::new(RunState::default())),
            sink: Arc::new(Mutex::new(None)),
            relay_log: Arc::new(RelayLog::new(Duration::from_secs(1))),
        }
    }

    /// Swap the output scraper, e.g. for a duplicity release with a different text format.
    pub fn with_parser(mut self, parser: impl OutputParser + 'static) -> Self {
        self.parser = Arc::new(parser);
        self
    }

    pub fn commands(&self) -> &CommandBuilder {
        &self.commands
    }

    /// True while an operation holds the run slot.
    pub fn is_processing(&self) -> bool {
        lock(&self.state).active.is_some()
    }

    /// Register the sink for raw output. Replaces any previous sink.
    pub fn on_output(&self, sink: OutputSink) {
        *lock(&self.sink) = Some(sink);
    }

    /// Drop the registered sink so its receiver sees end-of-stream.
    pub fn clear_output(&self) {
        lock(&self.sink).take();
    }

    /// Interrupt the active operation. Returns `false` (and does nothing) when idle.
    pub fn cancel(&self) -> bool {
        self.stop(Signal::SIGINT)
    }

    /// Like [`cancel`](Self::cancel) but with `SIGKILL`, for a child that ignores interrupts.
    pub fn kill(&self) -> bool {
        self.stop(Signal::SIGKILL)
    }

    fn stop(&self, signal: Signal) -> bool {
        let mut state = lock(&self.state);
        let Some(pid) = state.active.as_ref().map(|active| active.pid) else {
            debug!(?signal, "Stop requested with no active process");
            return false;
        };
        state.cancelled = true;

        match pid {
            Some(pid) => {
                info!(pid, ?signal, "Stopping duplicity");
                signal_group(pid, signal);
            }
            // `execute` interrupts the child as soon as it exists.
            None => debug!("Stop requested before spawn"),
        }
        true
    }

    /// `duplicity [full] <path> <url>`
    pub async fn backup(&self, job: &JobDescriptor, mode: BackupMode) -> Result<(), RunError> {
        let invocation = self.commands.backup(job, mode)?;
        self.run("backup", &[invocation]).await.into_result().map(drop)
    }

    /// Restore a single file or directory from the archive to `dest_path`.
    pub async fn restore_file(
        &self,
        job: &JobDescriptor,
        source_path: &str,
        dest_path: &str,
    ) -> Result<(), RunError> {
        let invocation = self.commands.restore_file(job, source_path, dest_path)?;
        self.run("restore_file", &[invocation]).await.into_result().map(drop)
    }

    pub async fn restore_tree(&self, job: &JobDescriptor, dest_path: &str) -> Result<(), RunError> {
        let invocation = self.commands.restore_tree(job, dest_path)?;
        self.run("restore_tree", &[invocation]).await.into_result().map(drop)
    }

    /// Files in the latest backup set, excluding `.` and `..`.
    ///
    /// Lines printed before a failure are still parsed into `data`.
    pub async fn get_files(&self, job: &JobDescriptor) -> Outcome<Vec<FileEntry>> {
        let invocation = match self.commands.list_current_files(job) {
            Ok(invocation) => invocation,
            Err(e) => return Outcome::failed(Vec::new(), e),
        };
        let entries = self
            .run("get_files", &[invocation])
            .await
            .map(|stdout| self.parser.parse_file_list(&stdout));
        debug!(count = entries.data.len(), failed = entries.is_failed(), "Parsed file listing");
        entries
    }

    /// Collection status plus source statistics from a dry-run incremental.
    ///
    /// If the dry run fails, the chain fields from `collection-status` are kept.
    pub async fn get_status(&self, job: &JobDescriptor) -> Outcome<StatusReport> {
        let invocations = match self.commands.status(job) {
            Ok(invocations) => invocations,
            Err(e) => return Outcome::failed(StatusReport::default(), e),
        };
        self.run("get_status", &invocations)
            .await
            .map(|stdout| self.parser.parse_status(&stdout))
    }

    /// Run invocations in order, stopping at the first failure.
    /// `data` is the stdout of every invocation that ran, failed ones included.
    async fn run(&self, op: &'static str, invocations: &[Invocation]) -> Outcome<String> {
        let (guard, id) = match self.begin(op) {
            Ok(reserved) => reserved,
            Err(e) => return Outcome::failed(String::new(), e),
        };
        let span = info_span!("duplicity", op, id = %id);

        // One output cap for the whole operation, across invocations.
        let budget = AtomicUsize::new(0);
        let mut stdout = String::new();

        let result = async {
            for invocation in invocations {
                if self.is_cancelled() {
                    return Err(RunError::Cancelled);
                }

                let execution = self.execute(invocation, &budget).await?;
                stdout.push_str(&execution.stdout);
                self.check(execution)?;
            }
            Ok::<_, RunError>(())
        }
        .instrument(span.clone())
        .await;

        span.in_scope(|| match &result {
            Ok(()) => info!("Operation finished"),
            Err(e) if e.is_cancelled() => info!("Operation cancelled"),
            Err(e) => warn!(error = %e, "Operation failed"),
        });
        drop(guard);

        match result {
            Ok(()) => Outcome::ok(stdout),
            Err(e) => Outcome::failed(stdout, e),
        }
    }

    fn begin(&self, op: &'static str) -> Result<(ActiveGuard, Uuid), RunError> {
        let mut state = lock(&self.state);
        if let Some(active) = &state.active {
            warn!(requested = op, active = active.op, active_id = %active.id, "Runner busy");
            return Err(RunError::Busy);
        }

        let id = Uuid::now_v7();
        state.active = Some(ActiveProcess { id, op, pid: None });
        state.cancelled = false;

        let guard = ActiveGuard {
            state: Arc::clone(&self.state),
        };
        Ok((guard, id))
    }

    fn is_cancelled(&self) -> bool {
        lock(&self.state).cancelled
    }

    /// Record the live pid. Returns whether a cancel arrived before it was known.
    fn attach_pid(&self, pid: Option<u32>) -> bool {
        let mut state = lock(&self.state);
        if let Some(active) = state.active.as_mut() {
            active.pid = pid;
        }
        state.cancelled
    }

    fn emit(&self, chunk: OutputChunk) {
        if let Some(tally) = self.relay_log.record(chunk.stream, chunk.text.len()) {
            trace!(
                stream = ?chunk.stream,
                chunks = tally.chunks,
                bytes = tally.bytes,
                "Relayed output"
            );
        }

        let sink = lock(&self.sink);
        if let Some(tx) = sink.as_ref() {
            if tx.send(chunk).is_err() {
                debug!("Output sink closed, dropping chunk");
            }
        }
    }

    async fn execute(
        &self,
        invocation: &Invocation,
        budget: &AtomicUsize,
    ) -> Result<Execution, RunError> {
        let mut child = invocation
            .to_command()
            .spawn()
            .map_err(|source| RunError::Spawn {
                program: invocation.program().to_string(),
                source,
            })?;

        let pid = child.id();
        info!(pid, command = %invocation, "Spawned duplicity");

        if self.attach_pid(pid) {
            if let Some(pid) = pid {
                signal_group(pid, Signal::SIGINT);
            }
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("stderr was not piped"))?;

        let overflow = CancellationToken::new();

        let relay = async {
            tokio::join!(
                self.pump(stdout, Stream::Stdout, budget, &overflow),
                self.pump(stderr, Stream::Stderr, budget, &overflow),
            )
        };

        let wait = async {
            tokio::select! {
                status = child.wait() => status,
                _ = overflow.cancelled() => {
                    warn!(limit = self.max_output_bytes, "Output limit exceeded, killing duplicity");
                    match pid {
                        Some(pid) => signal_group(pid, Signal::SIGKILL),
                        None => child.start_kill()?,
                    }
                    child.wait().await
                }
            }
        };

        let ((stdout, stderr), status) = tokio::join!(relay, wait);
        self.attach_pid(None);

        let status = status?;
        debug!(%status, "duplicity exited");

        Ok(Execution {
            status,
            stdout: stdout?,
            stderr: stderr?,
            overflowed: overflow.is_cancelled(),
        })
    }

    /// Map an exit to the operation outcome. Cancellation wins over every other cause.
    fn check(&self, execution: Execution) -> Result<(), RunError> {
        if self.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        if execution.overflowed {
            return Err(RunError::OutputOverflow {
                limit: self.max_output_bytes,
            });
        }
        if !execution.status.success() {
            return Err(RunError::ProcessExit {
                code: execution.status.code(),
                stderr: tail(&execution.stderr, STDERR_TAIL).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Read one stream to EOF, relaying each chunk and charging it to the shared budget.
    async fn pump<R>(
        &self,
        mut reader: R,
        stream: Stream,
        budget: &AtomicUsize,
        overflow: &CancellationToken,
    ) -> Result<String, RunError>
    where
        R: AsyncRead + Unpin,
    {
        let mut captured = String::new();
        let mut pending = Vec::new();
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }

            let total = budget.fetch_add(n, Ordering::Relaxed) + n;
            if total > self.max_output_bytes {
                overflow.cancel();
                break;
            }

            pending.extend_from_slice(&buf[..n]);
            let text = take_utf8(&mut pending);
            if text.is_empty() {
                continue;
            }
            captured.push_str(&text);
            self.emit(OutputChunk { stream, text });
        }

        if !pending.is_empty() {
            let text = String::from_utf8_lossy(&pending).into_owned();
            captured.push_str(&text);
            self.emit(OutputChunk { stream, text });
        }

        Ok(captured)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "Pid out of range, cannot signal");
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), signal) {
        warn!(pid, ?signal, error = %e, "Failed to signal duplicity");
    }
}

/// Decode `pending`, replacing invalid bytes with U+FFFD.
/// Only a trailing incomplete code point is left behind for the next read.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    let mut rest: &[u8] = pending;

    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                rest = &[];
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                text.push_str(&String::from_utf8_lossy(valid));
                match e.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                    }
                    None => {
                        rest = after;
                        break;
                    }
                }
            }
        }
    }

    let consumed = pending.len() - rest.len();
    pending.drain(..consumed);
    text
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
