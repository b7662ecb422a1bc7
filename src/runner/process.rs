use super::protocol::{parse_framed_output, tail};
use super::{ExecutionRequest, ExecutionResult, RunnerError};
use crate::config::ExecutionMode;
use crate::registry::GroupRecord;
use crate::shared::logging::append_text;
use crate::shared::time::now_rfc3339;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const FORCE_KILL_WAIT: Duration = Duration::from_secs(5);
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const READ_CHUNK_BYTES: usize = 8192;

/// Handle to a running worker, shared between the runner that waits on it
/// and the queue coordinator that may stop it during shutdown.
pub trait WorkerProcess: Send + Sync {
    fn label(&self) -> String;
    /// Requests a graceful stop. Must not block on the worker exiting.
    fn signal_stop(&self) -> Result<(), RunnerError>;
    fn force_kill(&self) -> Result<(), RunnerError>;
    fn try_wait(&self) -> Result<Option<ExitStatus>, RunnerError>;
}

pub struct SpawnedWorker {
    pub process: Arc<dyn WorkerProcess>,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// A way of starting workers. Both execution modes speak the same stdin and
/// stdout protocol, so everything after `spawn` is shared.
pub trait WorkerBackend: Send + Sync {
    fn mode(&self) -> ExecutionMode;
    fn check_available(&self) -> Result<(), RunnerError>;
    /// Per-stream capture cap. `None` captures everything.
    fn output_limit(&self) -> Option<usize>;
    fn spawn(
        &self,
        group: &GroupRecord,
        request: &ExecutionRequest,
    ) -> Result<SpawnedWorker, RunnerError>;
}

#[derive(Debug, Clone)]
pub struct RunContext {
    pub timeout: Duration,
    pub stop_grace: Duration,
    pub run_log: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WorkerRun {
    pub result: ExecutionResult,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout_truncated: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl WorkerRun {
    /// Everything the worker printed, for post-run inspection.
    pub fn combined_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Child process wrapper shared by both backends.
pub(crate) struct ChildHandle {
    child: Mutex<Child>,
    pid: u32,
}

impl ChildHandle {
    pub(crate) fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child: Mutex::new(child),
            pid,
        }
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn try_wait(&self, label: &str) -> Result<Option<ExitStatus>, RunnerError> {
        let mut child = self
            .child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        child.try_wait().map_err(|source| RunnerError::Io {
            path: label.to_string(),
            source,
        })
    }

    pub(crate) fn kill(&self) {
        let mut child = self
            .child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = child.kill();
    }
}

/// Takes the three stdio pipes off a freshly spawned child.
pub(crate) fn take_pipes(
    child: &mut Child,
    label: &str,
) -> Result<(ChildStdin, ChildStdout, ChildStderr), RunnerError> {
    let missing = |pipe: &str| RunnerError::Io {
        path: label.to_string(),
        source: std::io::Error::other(format!("missing {pipe} pipe")),
    };
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
    Ok((stdin, stdout, stderr))
}

/// Sends `signal` to `target` via `kill(1)`. A negative target addresses a
/// whole process group.
pub(crate) fn send_signal(signal: &str, target: &str) -> Result<(), RunnerError> {
    let output = Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(target)
        .output()
        .map_err(|err| RunnerError::Signal {
            target: target.to_string(),
            reason: err.to_string(),
        })?;
    if output.status.success() {
        return Ok(());
    }
    Err(RunnerError::Signal {
        target: target.to_string(),
        reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[derive(Debug, Default)]
struct CapturedOutput {
    bytes: Vec<u8>,
    truncated: bool,
}

impl CapturedOutput {
    fn push(&mut self, chunk: &[u8], limit: Option<usize>) {
        match limit {
            Some(limit) if self.bytes.len() + chunk.len() > limit => {
                let room = limit.saturating_sub(self.bytes.len());
                self.bytes.extend_from_slice(&chunk[..room]);
                self.truncated = true;
            }
            _ => self.bytes.extend_from_slice(chunk),
        }
    }
}

fn spawn_stdout_capture<R: Read + Send + 'static>(
    mut stream: R,
    limit: Option<usize>,
    sink: Arc<Mutex<CapturedOutput>>,
    done: mpsc::Sender<()>,
) {
    thread::spawn(move || {
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => sink
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(&chunk[..n], limit),
            }
        }
        let _ = done.send(());
    });
}

/// Streams stderr into the run log line by line while also capturing it.
fn spawn_stderr_capture<R: Read + Send + 'static>(
    stream: R,
    limit: Option<usize>,
    sink: Arc<Mutex<CapturedOutput>>,
    run_log: PathBuf,
    done: mpsc::Sender<()>,
) {
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    append_text(&run_log, &format!("[stderr] {}\n", text.trim_end()));
                    sink.lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(&line, limit);
                }
            }
        }
        let _ = done.send(());
    });
}

fn wait_until(
    process: &dyn WorkerProcess,
    deadline: Instant,
) -> Result<Option<ExitStatus>, RunnerError> {
    loop {
        if let Some(status) = process.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Graceful stop, then a forced kill once `grace` has elapsed.
pub(crate) fn stop_with_escalation(
    process: &dyn WorkerProcess,
    grace: Duration,
    log: &dyn Fn(&str),
) -> Result<Option<ExitStatus>, RunnerError> {
    if let Some(status) = process.try_wait()? {
        return Ok(Some(status));
    }
    if let Err(err) = process.signal_stop() {
        log(&format!("graceful stop of {} failed: {err}", process.label()));
    }
    if let Some(status) = wait_until(process, Instant::now() + grace)? {
        return Ok(Some(status));
    }
    log(&format!(
        "{} still running after {}s grace; forcing kill",
        process.label(),
        grace.as_secs()
    ));
    if let Err(err) = process.force_kill() {
        log(&format!("force kill of {} failed: {err}", process.label()));
    }
    wait_until(process, Instant::now() + FORCE_KILL_WAIT)
}

/// Runs one worker to completion: writes the request to stdin, captures
/// output, enforces the timeout and parses the framed result.
pub fn run_worker(
    backend: &dyn WorkerBackend,
    group: &GroupRecord,
    request: &ExecutionRequest,
    ctx: &RunContext,
    on_spawn: &dyn Fn(Arc<dyn WorkerProcess>),
) -> Result<WorkerRun, RunnerError> {
    let payload = serde_json::to_vec(request).map_err(|err| RunnerError::Io {
        path: ctx.run_log.display().to_string(),
        source: std::io::Error::other(err),
    })?;

    let started = Instant::now();
    let SpawnedWorker {
        process,
        mut stdin,
        stdout,
        stderr,
    } = backend.spawn(group, request)?;
    on_spawn(Arc::clone(&process));

    append_text(
        &ctx.run_log,
        &format!(
            "=== {} run {} group={} mode={} started={} ===\n",
            if request.is_scheduled_task { "task" } else { "message" },
            request.run_id,
            request.group_folder,
            backend.mode(),
            now_rfc3339()
        ),
    );

    let stdin_log = ctx.run_log.clone();
    thread::spawn(move || {
        if let Err(err) = stdin.write_all(&payload) {
            append_text(&stdin_log, &format!("[runner] stdin write failed: {err}\n"));
        }
    });

    let limit = backend.output_limit();
    let stdout_buf = Arc::new(Mutex::new(CapturedOutput::default()));
    let stderr_buf = Arc::new(Mutex::new(CapturedOutput::default()));
    let (done_tx, done_rx) = mpsc::channel();
    spawn_stdout_capture(stdout, limit, Arc::clone(&stdout_buf), done_tx.clone());
    spawn_stderr_capture(
        stderr,
        limit,
        Arc::clone(&stderr_buf),
        ctx.run_log.clone(),
        done_tx,
    );

    let run_log = ctx.run_log.clone();
    let log = move |line: &str| append_text(&run_log, &format!("[runner] {line}\n"));

    let mut timed_out = false;
    let status = match wait_until(process.as_ref(), started + ctx.timeout)? {
        Some(status) => Some(status),
        None => {
            timed_out = true;
            log(&format!(
                "worker exceeded timeout of {}s",
                ctx.timeout.as_secs()
            ));
            stop_with_escalation(process.as_ref(), ctx.stop_grace, &log)?
        }
    };

    // Grandchildren can keep a pipe open after the worker exits.
    let drain_deadline = Instant::now() + READER_DRAIN_TIMEOUT;
    for _ in 0..2 {
        let remaining = drain_deadline.saturating_duration_since(Instant::now());
        if done_rx.recv_timeout(remaining).is_err() {
            log("output pipes still open after exit; using captured output");
            break;
        }
    }

    let (stdout_text, stdout_truncated) = {
        let captured = stdout_buf
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (
            String::from_utf8_lossy(&captured.bytes).into_owned(),
            captured.truncated,
        )
    };
    let stderr_text = {
        let captured = stderr_buf
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        String::from_utf8_lossy(&captured.bytes).into_owned()
    };
    if stdout_truncated {
        log(&format!(
            "stdout exceeded {} bytes and was truncated",
            limit.unwrap_or_default()
        ));
    }

    let exit_code = status.and_then(|status| status.code());
    let mut result = if timed_out {
        ExecutionResult::error(format!(
            "worker timed out after {}s",
            ctx.timeout.as_secs()
        ))
    } else {
        parse_framed_output(&stdout_text)
    };
    if stdout_truncated && !result.is_success() && !timed_out {
        let detail = result.error.take().unwrap_or_default();
        result.error = Some(format!(
            "worker output exceeded the {}-byte cap; {detail}",
            limit.unwrap_or_default()
        ));
    }
    if !result.is_success() && !timed_out && exit_code != Some(0) {
        let detail = result.error.take().unwrap_or_default();
        result.error = Some(format!(
            "worker exited with {}: {detail}; stderr tail: {}",
            exit_code
                .map(|code| format!("code {code}"))
                .unwrap_or_else(|| "a signal".to_string()),
            tail(&stderr_text)
        ));
    }
    if let Some(warning) = result.normalize() {
        log(&warning);
    }

    let duration = started.elapsed();
    append_text(
        &ctx.run_log,
        &format!(
            "=== finished exit_code={} timed_out={timed_out} stdout_truncated={stdout_truncated} duration_ms={} status={:?} ===\n--- stdout tail ---\n{}\n",
            exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "none".to_string()),
            duration.as_millis(),
            result.status,
            tail(&stdout_text)
        ),
    );

    Ok(WorkerRun {
        result,
        exit_code,
        timed_out,
        stdout_truncated,
        stdout: stdout_text,
        stderr: stderr_text,
        duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_truncates_but_remembers_overflow() {
        let mut captured = CapturedOutput::default();
        captured.push(b"hello", Some(8));
        captured.push(b"world", Some(8));
        assert_eq!(captured.bytes, b"hellowor");
        assert!(captured.truncated);
        captured.push(b"more", Some(8));
        assert_eq!(captured.bytes.len(), 8);
    }

    #[test]
    fn uncapped_capture_keeps_everything() {
        let mut captured = CapturedOutput::default();
        for _ in 0..100 {
            captured.push(&[b'x'; 1000], None);
        }
        assert_eq!(captured.bytes.len(), 100_000);
        assert!(!captured.truncated);
    }
}
