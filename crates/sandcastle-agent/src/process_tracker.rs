//! Tool-server process supervision
//!
//! The tracker spawns tool-server child processes, watches them exit and
//! records what happened. It never restarts anything on its own: a crash is
//! recorded as state (`crashed` plus the tail of stderr) and the caller
//! decides whether to call [`ProcessTracker::restart`].
//!
//! Each live process is owned by one supervisor task. The task holds the
//! `Child`, so a process has an OS handle exactly while its status is
//! `starting` or `running`.

use crate::config::ProcessTrackerConfig;
use crate::error::{Result, SandboxError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Environment variable carrying a network process's assigned port
pub const PORT_ENV: &str = "PORT";

/// How long a crashed process's stderr reader gets to reach EOF
const STDERR_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Lifecycle status of a tracked process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    /// A caller is running an install step before the first start
    Installing,
    /// Spawn in progress
    Starting,
    /// Process is up
    Running,
    /// Stopped on request
    Stopped,
    /// Spawn itself failed
    Failed,
    /// Exited without being asked to
    Crashed,
}

impl ProcessStatus {
    /// Whether the process has a live OS handle
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

/// How callers reach the tool server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessTransport {
    /// RPC over the child's stdin/stdout
    Stdio,
    /// RPC over a loopback socket on the assigned port
    Network,
}

/// Snapshot of a tracked process
#[derive(Debug, Clone, Serialize)]
pub struct ManagedProcess {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub transport: ProcessTransport,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub restart_count: u32,
    pub max_restarts: u32,
}

/// The stdin/stdout pair of a stdio tool server
#[derive(Debug)]
pub struct StdioHandles {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

struct Supervisor {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Supervisor {
    /// Ask the task to terminate its child and wait until it has
    async fn shutdown(self, name: &str) {
        let _ = self.stop_tx.send(());
        if let Err(e) = self.task.await {
            tracing::warn!(process = %name, error = %e, "Supervisor task ended abnormally");
        }
    }
}

struct ProcessEntry {
    info: ManagedProcess,
    supervisor: Option<Supervisor>,
    stdio: Option<StdioHandles>,
    // Bumped on every spawn so a stale supervisor cannot touch a newer process
    generation: u64,
}

type ProcessMap = Arc<Mutex<HashMap<String, ProcessEntry>>>;

/// Bounded buffer keeping the last bytes written to stderr
#[derive(Debug)]
struct StderrTail {
    buf: VecDeque<u8>,
    cap: usize,
}

impl StderrTail {
    fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap),
            cap,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend(bytes);
        let overflow = self.buf.len().saturating_sub(self.cap);
        self.buf.drain(..overflow);
    }

    fn contents(&self) -> String {
        let bytes: Vec<u8> = self.buf.iter().copied().collect();
        String::from_utf8_lossy(&bytes).trim().to_string()
    }
}

/// Starts, supervises and stops tool-server processes
pub struct ProcessTracker {
    config: ProcessTrackerConfig,
    processes: ProcessMap,
}

impl std::fmt::Debug for ProcessTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTracker")
            .field("config", &self.config)
            .field("tracked", &self.processes.lock().len())
            .finish()
    }
}

impl ProcessTracker {
    pub fn new(config: ProcessTrackerConfig) -> Self {
        Self {
            config,
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start a tool server spoken to over its stdin/stdout
    ///
    /// Take the pipes with [`ProcessTracker::take_stdio`].
    pub async fn start_stdio(
        &self,
        name: &str,
        command: &str,
        args: &[String],
        env: HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<ManagedProcess> {
        let info = self.new_record(name, command, args, env, cwd, ProcessTransport::Stdio, None);
        self.launch(info).await
    }

    /// Start a tool server that listens on `port`
    ///
    /// The port is passed in the `PORT` environment variable.
    pub async fn start_network(
        &self,
        name: &str,
        command: &str,
        args: &[String],
        env: HashMap<String, String>,
        port: u16,
        cwd: Option<&Path>,
    ) -> Result<ManagedProcess> {
        let info = self.new_record(
            name,
            command,
            args,
            env,
            cwd,
            ProcessTransport::Network,
            Some(port),
        );
        self.launch(info).await
    }

    #[allow(clippy::too_many_arguments)]
    fn new_record(
        &self,
        name: &str,
        command: &str,
        args: &[String],
        env: HashMap<String, String>,
        cwd: Option<&Path>,
        transport: ProcessTransport,
        port: Option<u16>,
    ) -> ManagedProcess {
        ManagedProcess {
            name: name.to_string(),
            command: command.to_string(),
            args: args.to_vec(),
            env,
            cwd: cwd.map(Path::to_path_buf),
            transport,
            status: ProcessStatus::Starting,
            pid: None,
            port,
            started_at: None,
            exit_code: None,
            error: None,
            restart_count: 0,
            max_restarts: self.config.default_max_restarts,
        }
    }

    /// Record an `installing` placeholder while the caller prepares a server
    ///
    /// Returns `false` if a live process already holds the name.
    pub fn mark_installing(&self, name: &str, command: &str) -> bool {
        let mut processes = self.processes.lock();
        if let Some(entry) = processes.get_mut(name) {
            if entry.info.status.is_live() {
                return false;
            }
            entry.info.status = ProcessStatus::Installing;
            entry.info.error = None;
            return true;
        }

        let mut info = self.new_record(
            name,
            command,
            &[],
            HashMap::new(),
            None,
            ProcessTransport::Stdio,
            None,
        );
        info.status = ProcessStatus::Installing;
        processes.insert(
            name.to_string(),
            ProcessEntry {
                info,
                supervisor: None,
                stdio: None,
                generation: 0,
            },
        );
        tracing::debug!(process = %name, "Marked process as installing");
        true
    }

    async fn launch(&self, mut info: ManagedProcess) -> Result<ManagedProcess> {
        let name = info.name.clone();

        let is_live = self
            .processes
            .lock()
            .get(&name)
            .is_some_and(|entry| entry.info.status.is_live());
        if is_live {
            tracing::info!(process = %name, "Process already running, stopping it first");
            self.stop(&name).await;
        }

        let mut command = Command::new(&info.command);
        command
            .args(&info.args)
            .envs(&info.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match info.transport {
            ProcessTransport::Stdio => {
                command.stdin(Stdio::piped());
            }
            ProcessTransport::Network => {
                command.stdin(Stdio::null());
            }
        }
        if let Some(port) = info.port {
            command.env(PORT_ENV, port.to_string());
        }
        if let Some(cwd) = &info.cwd {
            command.current_dir(cwd);
        }

        let mut processes = self.processes.lock();
        let generation = processes.get(&name).map_or(0, |e| e.generation) + 1;

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(process = %name, command = %info.command, error = %e, "Failed to spawn process");
                info.status = ProcessStatus::Failed;
                info.error = Some(e.to_string());
                processes.insert(
                    name.clone(),
                    ProcessEntry {
                        info,
                        supervisor: None,
                        stdio: None,
                        generation,
                    },
                );
                return Err(SandboxError::SpawnFailed {
                    name,
                    reason: e.to_string(),
                });
            }
        };

        info.pid = child.id();
        info.status = ProcessStatus::Running;
        info.started_at = Some(Utc::now());

        let stdout = child.stdout.take();
        let stdio = match (info.transport, child.stdin.take(), stdout) {
            (ProcessTransport::Stdio, Some(stdin), Some(stdout)) => Some(StdioHandles { stdin, stdout }),
            (ProcessTransport::Network, _, Some(stdout)) => {
                tokio::spawn(log_stdout(name.clone(), stdout));
                None
            }
            _ => None,
        };

        let stderr = child
            .stderr
            .take()
            .map(|stderr| spawn_stderr_reader(stderr, self.config.stderr_tail_bytes));

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(
            child,
            stop_rx,
            stderr,
            SupervisorContext {
                name: name.clone(),
                generation,
                processes: self.processes.clone(),
                stop_timeout: self.config.stop_timeout,
            },
        ));

        tracing::info!(
            process = %name,
            pid = ?info.pid,
            port = ?info.port,
            transport = ?info.transport,
            "Started process"
        );

        let snapshot = info.clone();
        processes.insert(
            name,
            ProcessEntry {
                info,
                supervisor: Some(Supervisor { stop_tx, task }),
                stdio,
                generation,
            },
        );
        Ok(snapshot)
    }

    /// Stop a process: SIGTERM, wait `stop_timeout`, then SIGKILL
    ///
    /// Always leaves the process `stopped`. Returns `true` for any tracked
    /// name, including ones that were already stopped or crashed, and
    /// `false` only for unknown names.
    pub async fn stop(&self, name: &str) -> bool {
        let supervisor = {
            let mut processes = self.processes.lock();
            let Some(entry) = processes.get_mut(name) else {
                return false;
            };
            entry.info.status = ProcessStatus::Stopped;
            entry.stdio = None;
            entry.supervisor.take()
        };

        let was_running = supervisor.is_some();
        if let Some(supervisor) = supervisor {
            supervisor.shutdown(name).await;
        }

        if let Some(entry) = self.processes.lock().get_mut(name) {
            entry.info.pid = None;
        }

        if was_running {
            tracing::info!(process = %name, "Stopped process");
        } else {
            tracing::debug!(process = %name, "Stop requested for a process that was not running");
        }
        true
    }

    /// Stop every tracked process concurrently
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.processes.lock().keys().cloned().collect();
        futures_util::future::join_all(names.iter().map(|name| self.stop(name))).await;
    }

    /// Stop a process and forget it
    pub async fn remove(&self, name: &str) -> bool {
        if !self.stop(name).await {
            return false;
        }
        let removed = self.processes.lock().remove(name).is_some();
        if removed {
            tracing::debug!(process = %name, "Removed process");
        }
        removed
    }

    /// Restart a stopped, crashed or failed process with its original settings
    ///
    /// Counts against the process's `max_restarts` budget.
    pub async fn restart(&self, name: &str) -> Result<ManagedProcess> {
        let mut info = {
            let processes = self.processes.lock();
            let entry = processes.get(name).ok_or_else(|| SandboxError::ProcessNotFound {
                name: name.to_string(),
            })?;
            if entry.info.restart_count >= entry.info.max_restarts {
                return Err(SandboxError::RestartLimitExceeded {
                    name: name.to_string(),
                    restarts: entry.info.restart_count,
                    max: entry.info.max_restarts,
                });
            }
            entry.info.clone()
        };

        info.restart_count += 1;
        info.status = ProcessStatus::Starting;
        info.pid = None;
        info.exit_code = None;
        info.error = None;

        tracing::info!(
            process = %name,
            attempt = info.restart_count,
            max = info.max_restarts,
            "Restarting process"
        );
        self.launch(info).await
    }

    /// Hand the stdin/stdout of a stdio process to the caller
    ///
    /// Returns `None` for network processes or if the pipes were already taken.
    pub fn take_stdio(&self, name: &str) -> Option<StdioHandles> {
        self.processes.lock().get_mut(name)?.stdio.take()
    }

    pub fn get(&self, name: &str) -> Option<ManagedProcess> {
        self.processes.lock().get(name).map(|e| e.info.clone())
    }

    /// Snapshots of every tracked process, sorted by name
    pub fn list(&self) -> Vec<ManagedProcess> {
        let mut list: Vec<ManagedProcess> =
            self.processes.lock().values().map(|e| e.info.clone()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }
}

struct SupervisorContext {
    name: String,
    generation: u64,
    processes: ProcessMap,
    stop_timeout: Duration,
}

async fn supervise(
    mut child: Child,
    mut stop_rx: oneshot::Receiver<()>,
    stderr: Option<(Arc<Mutex<StderrTail>>, JoinHandle<()>)>,
    ctx: SupervisorContext,
) {
    tokio::select! {
        exit = child.wait() => {
            // State flips before stderr is drained; the tail is attached later
            let Some(summary) = record_exit(&ctx, exit) else {
                if let Some((_, reader)) = stderr {
                    reader.abort();
                }
                return;
            };
            let tail = match stderr {
                Some((tail, reader)) => drain_stderr(tail, reader).await,
                None => String::new(),
            };
            attach_stderr(&ctx, summary, tail);
        }
        _ = &mut stop_rx => {
            terminate(&mut child, ctx.stop_timeout, &ctx.name).await;
            if let Some((_, reader)) = stderr {
                reader.abort();
            }
        }
    }
}

/// Mark the exit in the process record; returns the crash summary if it was one
fn record_exit(ctx: &SupervisorContext, exit: std::io::Result<ExitStatus>) -> Option<String> {
    let mut processes = ctx.processes.lock();
    let entry = processes.get_mut(&ctx.name)?;
    if entry.generation != ctx.generation {
        return None;
    }

    entry.info.pid = None;
    entry.supervisor = None;
    entry.stdio = None;

    if entry.info.status == ProcessStatus::Stopped {
        return None;
    }

    let (code, summary) = match exit {
        Ok(status) => describe_exit(status),
        Err(e) => (None, format!("wait failed: {}", e)),
    };

    entry.info.status = ProcessStatus::Crashed;
    entry.info.exit_code = code;
    entry.info.error = Some(summary.clone());
    Some(summary)
}

/// Wait for the reader to hit EOF, up to the grace period
///
/// Descendants that inherited stderr can hold it open; the reader is aborted
/// rather than left running.
async fn drain_stderr(tail: Arc<Mutex<StderrTail>>, mut reader: JoinHandle<()>) -> String {
    if tokio::time::timeout(STDERR_DRAIN_GRACE, &mut reader).await.is_err() {
        reader.abort();
    }
    let contents = tail.lock().contents();
    contents
}

fn attach_stderr(ctx: &SupervisorContext, summary: String, tail: String) {
    let mut processes = ctx.processes.lock();
    let Some(entry) = processes.get_mut(&ctx.name) else {
        return;
    };

    let error = if tail.is_empty() {
        summary
    } else {
        format!("{}: {}", summary, tail)
    };

    tracing::warn!(
        process = %ctx.name,
        exit_code = ?entry.info.exit_code,
        restarts = entry.info.restart_count,
        max_restarts = entry.info.max_restarts,
        error = %error,
        "Process crashed"
    );

    // A restart may have replaced the record while stderr drained
    if entry.generation == ctx.generation && entry.info.status == ProcessStatus::Crashed {
        entry.info.error = Some(error);
    }
}

fn describe_exit(status: ExitStatus) -> (Option<i32>, String) {
    if let Some(code) = status.code() {
        return (Some(code), format!("exited with code {}", code));
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return (None, format!("terminated by signal {}", signal));
        }
    }

    (None, "exited".to_string())
}

async fn terminate(child: &mut Child, timeout: Duration, name: &str) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid belongs to a child we still own and have not reaped
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            tracing::warn!(process = %name, ?timeout, "Process ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(process = %name, error = %e, "Failed to kill process");
            }
        }
    }
}

fn spawn_stderr_reader(
    mut stderr: ChildStderr,
    cap: usize,
) -> (Arc<Mutex<StderrTail>>, JoinHandle<()>) {
    let tail = Arc::new(Mutex::new(StderrTail::new(cap)));
    let sink = tail.clone();
    let reader = tokio::spawn(async move {
        let mut chunk = [0u8; 1024];
        loop {
            match stderr.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => sink.lock().push(&chunk[..n]),
            }
        }
    });
    (tail, reader)
}

async fn log_stdout(name: String, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(process = %name, line = %line, "stdout");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn tracker() -> ProcessTracker {
        ProcessTracker::new(ProcessTrackerConfig {
            stop_timeout: Duration::from_millis(500),
            default_max_restarts: 1,
            stderr_tail_bytes: 1000,
        })
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    async fn wait_for_status(tracker: &ProcessTracker, name: &str, status: ProcessStatus) -> ManagedProcess {
        for _ in 0..500 {
            if let Some(process) = tracker.get(name) {
                if process.status == status {
                    return process;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never reached {:?}: {:?}", name, status, tracker.get(name));
    }

    async fn wait_for_error(tracker: &ProcessTracker, name: &str, needle: &str) -> String {
        for _ in 0..500 {
            if let Some(error) = tracker.get(name).and_then(|p| p.error) {
                if error.contains(needle) {
                    return error;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} error never mentioned {:?}: {:?}", name, needle, tracker.get(name));
    }

    #[test]
    fn test_stderr_tail_keeps_last_bytes() {
        let mut tail = StderrTail::new(5);
        tail.push(b"hello ");
        tail.push(b"world");
        assert_eq!(tail.contents(), "world");
    }

    #[tokio::test]
    async fn test_stdio_round_trip() {
        let tracker = tracker();
        let process = tracker
            .start_stdio("echo", "cat", &[], HashMap::new(), None)
            .await
            .unwrap();
        assert_eq!(process.status, ProcessStatus::Running);
        assert!(process.pid.is_some());

        let mut stdio = tracker.take_stdio("echo").unwrap();
        assert!(tracker.take_stdio("echo").is_none());

        stdio.stdin.write_all(b"ping\n").await.unwrap();
        let mut lines = BufReader::new(stdio.stdout).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "ping");

        assert!(tracker.stop("echo").await);
        let stopped = tracker.get("echo").unwrap();
        assert_eq!(stopped.status, ProcessStatus::Stopped);
        assert!(stopped.pid.is_none());
    }

    #[tokio::test]
    async fn test_crash_records_exit_code_and_stderr() {
        let tracker = tracker();
        tracker
            .start_stdio("boom", "sh", &sh("echo kaboom >&2; exit 3"), HashMap::new(), None)
            .await
            .unwrap();

        let crashed = wait_for_status(&tracker, "boom", ProcessStatus::Crashed).await;
        assert_eq!(crashed.exit_code, Some(3));
        assert!(crashed.pid.is_none());

        let error = wait_for_error(&tracker, "boom", "kaboom").await;
        assert!(error.contains("code 3"), "{error}");
    }

    #[tokio::test]
    async fn test_crash_is_recorded_before_inherited_stderr_closes() {
        let tracker = tracker();
        tracker
            .start_stdio(
                "orphaner",
                "sh",
                &sh("echo leftover >&2; sleep 2 & exit 1"),
                HashMap::new(),
                None,
            )
            .await
            .unwrap();
        let started = std::time::Instant::now();

        let crashed = wait_for_status(&tracker, "orphaner", ProcessStatus::Crashed).await;
        assert!(started.elapsed() < STDERR_DRAIN_GRACE, "{:?}", started.elapsed());
        assert_eq!(crashed.exit_code, Some(1));
        assert!(crashed.pid.is_none());
        assert!(crashed.error.unwrap().contains("code 1"));

        // The sleeping grandchild still holds stderr; the tail arrives after the grace period
        let error = wait_for_error(&tracker, "orphaner", "leftover").await;
        assert!(error.starts_with("exited with code 1"), "{error}");
    }

    #[tokio::test]
    async fn test_network_process_gets_port_and_env() {
        let tracker = tracker();
        let env = HashMap::from([("GREETING".to_string(), "hi".to_string())]);
        let process = tracker
            .start_network(
                "net",
                "sh",
                &sh("echo \"$GREETING:$PORT\" >&2; exit 1"),
                env,
                4567,
                None,
            )
            .await
            .unwrap();
        assert_eq!(process.port, Some(4567));
        assert!(tracker.take_stdio("net").is_none());

        let crashed = wait_for_status(&tracker, "net", ProcessStatus::Crashed).await;
        assert_eq!(crashed.exit_code, Some(1));
        wait_for_error(&tracker, "net", "hi:4567").await;
    }

    #[tokio::test]
    async fn test_spawn_failure_marks_failed() {
        let tracker = tracker();
        let err = tracker
            .start_stdio("ghost", "/nonexistent/tool-server", &[], HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::SpawnFailed { .. }));

        let failed = tracker.get("ghost").unwrap();
        assert_eq!(failed.status, ProcessStatus::Failed);
        assert!(failed.error.is_some());
        assert!(failed.pid.is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let tracker = tracker();
        tracker
            .start_stdio("sleeper", "sleep", &["30".to_string()], HashMap::new(), None)
            .await
            .unwrap();

        assert!(tracker.stop("sleeper").await);
        assert!(tracker.stop("sleeper").await);
        assert_eq!(tracker.get("sleeper").unwrap().status, ProcessStatus::Stopped);
        assert!(!tracker.stop("unknown").await);
    }

    #[tokio::test]
    async fn test_stop_kills_process_ignoring_sigterm() {
        let tracker = tracker();
        tracker
            .start_stdio("stubborn", "sh", &sh("trap '' TERM; sleep 2"), HashMap::new(), None)
            .await
            .unwrap();
        // Give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        assert!(tracker.stop("stubborn").await);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(tracker.get("stubborn").unwrap().status, ProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn test_restart_honours_budget() {
        let tracker = tracker();
        tracker
            .start_stdio("flaky", "sh", &sh("exit 2"), HashMap::new(), None)
            .await
            .unwrap();
        wait_for_status(&tracker, "flaky", ProcessStatus::Crashed).await;

        let restarted = tracker.restart("flaky").await.unwrap();
        assert_eq!(restarted.restart_count, 1);
        wait_for_status(&tracker, "flaky", ProcessStatus::Crashed).await;

        let err = tracker.restart("flaky").await.unwrap_err();
        assert!(matches!(
            err,
            SandboxError::RestartLimitExceeded { restarts: 1, max: 1, .. }
        ));
        assert!(matches!(
            tracker.restart("missing").await.unwrap_err(),
            SandboxError::ProcessNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_start_replaces_live_process() {
        let tracker = tracker();
        let first = tracker
            .start_stdio("srv", "sleep", &["30".to_string()], HashMap::new(), None)
            .await
            .unwrap();
        let second = tracker
            .start_stdio("srv", "sleep", &["30".to_string()], HashMap::new(), None)
            .await
            .unwrap();

        assert_ne!(first.pid, second.pid);
        assert_eq!(tracker.list().len(), 1);
        assert_eq!(tracker.get("srv").unwrap().status, ProcessStatus::Running);
        tracker.stop_all().await;
        assert_eq!(tracker.get("srv").unwrap().status, ProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn test_mark_installing_and_remove() {
        let tracker = tracker();
        assert!(tracker.mark_installing("pending", "npx"));
        assert_eq!(tracker.get("pending").unwrap().status, ProcessStatus::Installing);

        assert!(tracker.remove("pending").await);
        assert!(tracker.get("pending").is_none());
        assert!(!tracker.remove("pending").await);
    }
}
