//! Module process supervision.
//!
//! Each instance runs one server process per module in its own process group. A monitor
//! task detects exits, restarts with exponential backoff under a per-module budget, and
//! leaves a module `Crashed` once the budget is spent. Modules never affect each other.

use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::shared::{Module, PortBlock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const LOG_MAX_LINES: usize = 500;

/// Lines included in a status snapshot.
const STATUS_TAIL_LINES: usize = 50;

/// Consecutive failed HTTP probes on a live process before it is treated as crashed.
const PROBE_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Running,
    /// Exited unexpectedly; a restart is scheduled within the budget.
    Restarting,
    /// Exited and the restart budget is spent. Only a manual restart revives it.
    Crashed,
    Stopped,
}

/// Bounded ring buffer of the most recent output lines.
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::with_capacity(LOG_MAX_LINES)
    }
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
        }
    }

    /// Up to `limit` most recent lines, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<String> {
        let start = self.lines.len().saturating_sub(limit);
        self.lines.iter().skip(start).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Snapshot of one module process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub module: Module,
    pub port: u16,
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub recent_output: Vec<String>,
}

#[derive(Debug)]
struct ManagedProcess {
    module: Module,
    command: String,
    cwd: PathBuf,
    port: u16,
    pid: Option<u32>,
    state: ProcessState,
    restart_count: u32,
    probe_failures: u32,
    last_error: Option<String>,
    logs: SharedLog,
    child: Option<Child>,
}

type SharedLog = Arc<std::sync::Mutex<LogBuffer>>;

fn push_log(log: &SharedLog, line: String) {
    if let Ok(mut buf) = log.lock() {
        buf.push_line(line);
    }
}

fn tail_log(log: &SharedLog, limit: usize) -> Vec<String> {
    log.lock().map(|buf| buf.tail(limit)).unwrap_or_default()
}

/// Expands `{port}` and `{module}` in a command template.
pub fn render_command(template: &str, port: u16, module: Module) -> String {
    template
        .replace("{port}", &port.to_string())
        .replace("{module}", module.as_str())
}

fn build_command(command_line: &str) -> Command {
    #[cfg(unix)]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command_line);
        cmd
    }
    #[cfg(not(unix))]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command_line);
        cmd
    }
}

/// SIGTERM to the process group, bounded wait, then SIGKILL.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: plain syscall; the group id is the child's pid because it was spawned
        // with `process_group(0)`.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        let _ = child.start_kill();
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        #[cfg(unix)]
        if let Some(pid) = pid {
            // SAFETY: as above.
            unsafe {
                libc::killpg(pid as libc::pid_t, libc::SIGKILL);
            }
        }
        let _ = child.kill().await;
    }
}

/// Supervises the four module processes of one instance.
pub struct ProcessManager {
    label: String,
    config: Arc<SandboxConfig>,
    processes: HashMap<Module, Arc<Mutex<ManagedProcess>>>,
    http: reqwest::Client,
    shutting_down: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessManager {
    /// `workspace` holds one subdirectory per module; `ports` is the instance's port block.
    /// `http` is shared across instances and only used for health probes.
    pub fn new(
        label: impl Into<String>,
        workspace: PathBuf,
        ports: PortBlock,
        config: Arc<SandboxConfig>,
        http: reqwest::Client,
    ) -> Self {
        let processes = Module::ALL
            .into_iter()
            .map(|module| {
                let port = ports.port(module);
                let managed = ManagedProcess {
                    module,
                    command: render_command(&config.server_command, port, module),
                    cwd: workspace.join(module.dir_name()),
                    port,
                    pid: None,
                    state: ProcessState::NotStarted,
                    restart_count: 0,
                    probe_failures: 0,
                    last_error: None,
                    logs: Arc::new(std::sync::Mutex::new(LogBuffer::default())),
                    child: None,
                };
                (module, Arc::new(Mutex::new(managed)))
            })
            .collect();

        Self {
            label: label.into(),
            config,
            processes,
            http,
            shutting_down: AtomicBool::new(false),
            monitor: Mutex::new(None),
        }
    }

    fn entry(&self, module: Module) -> SandboxResult<&Arc<Mutex<ManagedProcess>>> {
        self.processes
            .get(&module)
            .ok_or_else(|| SandboxError::UnknownModule(module.to_string()))
    }

    pub async fn port(&self, module: Module) -> SandboxResult<u16> {
        Ok(self.entry(module)?.lock().await.port)
    }

    /// Spawns the module if it is not already running.
    pub async fn start(&self, module: Module) -> SandboxResult<()> {
        let entry = self.entry(module)?;
        let mut p = entry.lock().await;
        if p.state == ProcessState::Running && p.child.is_some() {
            return Ok(());
        }
        self.spawn_locked(&mut p)
    }

    fn spawn_locked(&self, p: &mut ManagedProcess) -> SandboxResult<()> {
        std::fs::create_dir_all(&p.cwd)?;

        let mut cmd = build_command(&p.command);
        cmd.current_dir(&p.cwd)
            .env("PORT", p.port.to_string())
            .env("DEVLABO_MODULE", p.module.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let msg = format!("spawn `{}` failed: {e}", p.command);
                p.last_error = Some(msg.clone());
                return Err(SandboxError::Process(msg));
            }
        };

        if let Some(out) = child.stdout.take() {
            let logs = p.logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    push_log(&logs, line);
                }
            });
        }
        if let Some(err) = child.stderr.take() {
            let logs = p.logs.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    push_log(&logs, line);
                }
            });
        }

        p.pid = child.id();
        p.child = Some(child);
        p.state = ProcessState::Running;
        p.probe_failures = 0;
        info!(
            target: "devlabo::process",
            instance = %self.label,
            module = %p.module,
            pid = ?p.pid,
            port = p.port,
            "module process started"
        );
        Ok(())
    }

    /// Starts all modules, waits (best effort, concurrently) for each to become healthy, then
    /// launches the monitor. A spawn failure stops everything and fails the start.
    pub async fn start_all(self: &Arc<Self>) -> SandboxResult<()> {
        self.shutting_down.store(false, Ordering::SeqCst);
        for module in Module::ALL {
            if let Err(e) = self.start(module).await {
                self.stop_all().await;
                return Err(SandboxError::InstanceStartFailure(format!("{module}: {e}")));
            }
        }

        let timeout = self.config.startup_timeout();
        let ready = futures_util::future::join_all(
            Module::ALL.into_iter().map(|m| self.wait_ready(m, timeout)),
        )
        .await;
        for (module, ok) in Module::ALL.into_iter().zip(ready) {
            if !ok {
                warn!(
                    target: "devlabo::process",
                    instance = %self.label,
                    module = %module,
                    "module not healthy within startup timeout, continuing"
                );
            }
        }

        let weak = Arc::downgrade(self);
        let interval = self.config.health_interval();
        let handle = tokio::spawn(Self::monitor_loop(weak, interval));
        if let Some(previous) = self.monitor.lock().await.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn monitor_loop(manager: Weak<ProcessManager>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else {
                break;
            };
            if manager.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            for module in Module::ALL {
                manager.check(module).await;
            }
        }
    }

    /// One liveness check. Returns true when the module is running and healthy.
    pub async fn check(self: &Arc<Self>, module: Module) -> bool {
        let Ok(entry) = self.entry(module) else {
            return false;
        };
        let port = {
            let mut p = entry.lock().await;
            if p.state != ProcessState::Running {
                return false;
            }
            let exited = match p.child.as_mut().map(|c| c.try_wait()) {
                Some(Ok(None)) => None,
                Some(Ok(Some(status))) => Some(format!("exited with {status}")),
                Some(Err(e)) => Some(format!("wait failed: {e}")),
                None => Some("process handle missing".to_string()),
            };
            if let Some(reason) = exited {
                let delay = self.handle_crash(&mut p, reason);
                self.schedule_restart(module, delay);
                return false;
            }
            if !self.config.http_probe {
                return true;
            }
            p.port
        };

        let healthy = self.probe(port).await;
        let mut p = entry.lock().await;
        if p.state != ProcessState::Running {
            return false;
        }
        if healthy {
            p.probe_failures = 0;
            return true;
        }
        p.probe_failures += 1;
        if p.probe_failures >= PROBE_FAILURE_THRESHOLD {
            let pid = p.pid;
            if let Some(mut child) = p.child.take() {
                terminate(&mut child, pid, self.config.grace_period()).await;
            }
            let reason = format!("{} consecutive failed health probes", p.probe_failures);
            let delay = self.handle_crash(&mut p, reason);
            self.schedule_restart(module, delay);
        }
        false
    }

    /// HTTP probe: any status below 500 counts as healthy.
    async fn probe(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{port}/");
        match self
            .http
            .get(&url)
            .timeout(self.config.probe_timeout())
            .send()
            .await
        {
            Ok(resp) => resp.status().as_u16() < 500,
            Err(_) => false,
        }
    }

    async fn wait_ready(&self, module: Module, timeout: Duration) -> bool {
        let Ok(entry) = self.entry(module) else {
            return false;
        };
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let port = {
                let mut p = entry.lock().await;
                let alive = matches!(p.child.as_mut().map(|c| c.try_wait()), Some(Ok(None)));
                if !alive {
                    return false;
                }
                if !self.config.http_probe {
                    return true;
                }
                p.port
            };
            if self.probe(port).await {
                debug!(target: "devlabo::process", instance = %self.label, module = %module, "module healthy");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Marks the module `Restarting` and returns the backoff before the next attempt, or
    /// leaves it `Crashed` and returns `None` once the budget is spent.
    fn handle_crash(&self, p: &mut ManagedProcess, reason: String) -> Option<Duration> {
        p.child = None;
        p.pid = None;
        p.restart_count += 1;
        p.last_error = Some(reason.clone());

        if p.restart_count > self.config.restart_limit {
            p.state = ProcessState::Crashed;
            error!(
                target: "devlabo::process",
                instance = %self.label,
                module = %p.module,
                restarts = p.restart_count - 1,
                reason = %reason,
                output = ?tail_log(&p.logs, 5),
                "module crashed, restart budget exhausted"
            );
            return None;
        }

        p.state = ProcessState::Restarting;
        let delay = self.config.restart_backoff(p.restart_count - 1);
        warn!(
            target: "devlabo::process",
            instance = %self.label,
            module = %p.module,
            attempt = p.restart_count,
            reason = %reason,
            "module crashed, restarting in {:?}",
            delay
        );
        Some(delay)
    }

    fn schedule_restart(self: &Arc<Self>, module: Module, delay: Option<Duration>) {
        let Some(delay) = delay else {
            return;
        };
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = manager.upgrade() {
                manager.restart_after_crash(module).await;
            }
        });
    }

    async fn restart_after_crash(self: Arc<Self>, module: Module) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let Ok(entry) = self.entry(module) else {
            return;
        };
        let mut p = entry.lock().await;
        // A manual restart or stop may have happened during the backoff.
        if p.state != ProcessState::Restarting {
            return;
        }
        if let Err(e) = self.spawn_locked(&mut p) {
            let delay = self.handle_crash(&mut p, e.to_string());
            self.schedule_restart(module, delay);
        }
    }

    /// Stops one module: SIGTERM to its group, grace period, then SIGKILL.
    pub async fn stop(&self, module: Module) -> SandboxResult<()> {
        let entry = self.entry(module)?;
        let mut p = entry.lock().await;
        let pid = p.pid;
        if let Some(mut child) = p.child.take() {
            terminate(&mut child, pid, self.config.grace_period()).await;
            info!(target: "devlabo::process", instance = %self.label, module = %module, pid = ?pid, "module process stopped");
        }
        p.pid = None;
        if p.state != ProcessState::NotStarted {
            p.state = ProcessState::Stopped;
        }
        Ok(())
    }

    /// Stops the monitor and every module, concurrently.
    pub async fn stop_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(handle) = self.monitor.lock().await.take() {
            handle.abort();
        }
        let results =
            futures_util::future::join_all(Module::ALL.into_iter().map(|m| self.stop(m))).await;
        for (module, result) in Module::ALL.into_iter().zip(results) {
            if let Err(e) = result {
                warn!(target: "devlabo::process", instance = %self.label, module = %module, error = %e, "stop failed");
            }
        }
    }

    /// Stops and starts one module and resets its restart budget.
    pub async fn restart(self: &Arc<Self>, module: Module) -> SandboxResult<()> {
        self.stop(module).await?;
        {
            let entry = self.entry(module)?;
            let mut p = entry.lock().await;
            p.restart_count = 0;
            p.probe_failures = 0;
            p.last_error = None;
            self.spawn_locked(&mut p)?;
        }
        if !self.wait_ready(module, self.config.startup_timeout()).await {
            warn!(target: "devlabo::process", instance = %self.label, module = %module, "restarted module not healthy yet");
        }
        Ok(())
    }

    pub async fn state(&self, module: Module) -> SandboxResult<ProcessState> {
        Ok(self.entry(module)?.lock().await.state)
    }

    pub async fn status(&self, module: Module) -> SandboxResult<ProcessStatus> {
        let entry = self.entry(module)?;
        let p = entry.lock().await;
        let recent_output = tail_log(&p.logs, STATUS_TAIL_LINES);
        Ok(ProcessStatus {
            module: p.module,
            port: p.port,
            pid: p.pid,
            state: p.state,
            restart_count: p.restart_count,
            last_error: p.last_error.clone(),
            recent_output,
        })
    }

    pub async fn all_status(&self) -> Vec<ProcessStatus> {
        let mut out = Vec::with_capacity(Module::ALL.len());
        for module in Module::ALL {
            if let Ok(status) = self.status(module).await {
                out.push(status);
            }
        }
        out
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        // Best effort: kill any group still alive when the manager goes away without stop_all.
        for entry in self.processes.values() {
            if let Ok(mut p) = entry.try_lock() {
                if let Some(mut child) = p.child.take() {
                    #[cfg(unix)]
                    if let Some(pid) = p.pid {
                        // SAFETY: plain syscall on a group this manager created.
                        unsafe {
                            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
                        }
                    }
                    let _ = child.start_kill();
                }
            }
        }
    }
}
