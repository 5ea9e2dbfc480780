//! Process supervisor - owns the inference service process.
//!
//! Flow:
//! 1. Spawn the service, status goes to STARTING (the prober promotes it to READY)
//! 2. Watch for exit; an exit nobody asked for marks the service CRASHED
//! 3. Respawn after an exponential backoff, up to the restart budget
//! 4. On stop: SIGTERM, bounded grace period, then kill
//!
//! A single control task owns the process handle, so at most one process is
//! live and a respawn never overlaps a process that is still exiting.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::config::{LaunchConfig, RestartPolicy};
use crate::status::{ServiceStatus, StatusBoard};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Io(#[from] std::io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("service not ready after {0:?}")]
    ReadyTimeout(Duration),
    #[error("supervisor is not running")]
    NotRunning,
}

/// How a service process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// None when terminated by a signal.
    pub code: Option<i32>,
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// A live service process.
#[async_trait]
pub trait ServiceProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Wait for the process to exit. Must be cancel-safe.
    async fn wait(&mut self) -> std::io::Result<ProcessExit>;

    /// Ask the process to shut down (SIGTERM on unix).
    fn terminate(&mut self) -> std::io::Result<()>;

    /// Force-terminate the process.
    fn kill(&mut self) -> std::io::Result<()>;
}

/// Extension point for different launch strategies.
pub trait ServiceSpawner: Send + Sync {
    fn spawn(&self, config: &LaunchConfig) -> Result<Box<dyn ServiceProcess>, SpawnError>;
}

/// Launches the configured executable as a child process.
pub struct CommandSpawner;

impl ServiceSpawner for CommandSpawner {
    fn spawn(&self, config: &LaunchConfig) -> Result<Box<dyn ServiceProcess>, SpawnError> {
        let mut command = Command::new(&config.executable);
        command
            .args(&config.args)
            .envs(config.process_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        let pid = child.id();
        tracing::info!(
            executable = %config.executable.display(),
            pid = ?pid,
            port = config.port,
            "Spawned inference service"
        );

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr");
        }

        Ok(Box::new(ChildProcess { child }))
    }
}

/// Forward service output lines into tracing.
fn forward_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                tracing::info!(target: "neurolet::service", stream, "{}", trimmed);
            }
        }
    });
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl ServiceProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> std::io::Result<ProcessExit> {
        let status = self.child.wait().await?;
        Ok(ProcessExit {
            code: status.code(),
        })
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> std::io::Result<()> {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            // Already reaped.
            return Ok(());
        };
        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.child.start_kill()
    }
}

#[derive(Debug)]
enum ControlRequest {
    Stop,
    Restart,
}

struct SupervisorInner {
    config: LaunchConfig,
    restart: RestartPolicy,
    grace_period: Duration,
    spawner: Arc<dyn ServiceSpawner>,
    board: StatusBoard,
}

struct Running {
    commands: mpsc::Sender<ControlRequest>,
    task: JoinHandle<()>,
}

/// Owner of the inference service process.
pub struct ProcessSupervisor {
    inner: Arc<SupervisorInner>,
    running: Mutex<Option<Running>>,
}

impl ProcessSupervisor {
    pub fn new(
        config: LaunchConfig,
        restart: RestartPolicy,
        grace_period: Duration,
        spawner: Arc<dyn ServiceSpawner>,
        board: StatusBoard,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                config,
                restart,
                grace_period,
                spawner,
                board,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        self.inner.board.current()
    }

    /// Spawn the service and start supervising it.
    ///
    /// A failed first spawn is returned to the caller, but supervision still
    /// starts: the next attempt follows the restart backoff. Calling `start`
    /// while already supervising is a no-op.
    pub async fn start(&self) -> Result<(), SpawnError> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            tracing::debug!("Supervisor already running");
            return Ok(());
        }

        let (first, result) = match self.inner.spawner.spawn(&self.inner.config) {
            Ok(process) => {
                self.inner.board.mark_starting(0);
                (Some(process), Ok(()))
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to spawn inference service");
                self.inner.board.mark_crashed(format!("spawn failed: {e}"));
                (None, Err(e))
            }
        };

        let (tx, rx) = mpsc::channel(4);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.supervise(first, rx).await });
        *running = Some(Running { commands: tx, task });

        result
    }

    /// Wait until the service accepts work, without blocking the caller's thread.
    pub async fn await_ready(&self, timeout: Duration) -> Result<ServiceStatus, SupervisorError> {
        let mut rx = self.inner.board.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(|s| s.accepts_work())).await {
            Ok(Ok(status)) => Ok(status.clone()),
            Ok(Err(_)) => Err(SupervisorError::NotRunning),
            Err(_) => {
                tracing::warn!(?timeout, "Inference service not ready in time");
                Err(SupervisorError::ReadyTimeout(timeout))
            }
        }
    }

    /// Reset the restart budget and respawn now if the supervisor gave up.
    pub async fn restart(&self) -> Result<(), SpawnError> {
        {
            let running = self.running.lock().await;
            if let Some(r) = running.as_ref()
                && !r.task.is_finished()
                && r.commands.send(ControlRequest::Restart).await.is_ok()
            {
                return Ok(());
            }
        }
        self.start().await
    }

    /// Stop the service: SIGTERM, grace period, then kill. Idempotent.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(Running { commands, task }) = running.take() else {
            return;
        };
        // A closed channel means the control task already exited.
        let _ = commands.send(ControlRequest::Stop).await;
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Supervisor task failed");
        }
    }
}

enum RunEnd {
    Stopped,
    Exited,
}

impl SupervisorInner {
    async fn supervise(
        self: Arc<Self>,
        mut current: Option<Box<dyn ServiceProcess>>,
        mut commands: mpsc::Receiver<ControlRequest>,
    ) {
        let mut restarts: u32 = 0;

        loop {
            if let Some(process) = current.take() {
                match self.run_until_exit(process, &mut commands, &mut restarts).await {
                    RunEnd::Stopped => {
                        self.board.mark_stopped();
                        return;
                    }
                    RunEnd::Exited => {}
                }
            }

            restarts = restarts.saturating_add(1);
            if !self.wait_for_restart(&mut commands, &mut restarts).await {
                self.board.mark_stopped();
                return;
            }

            current = match self.spawner.spawn(&self.config) {
                Ok(process) => {
                    self.board.mark_starting(restarts);
                    Some(process)
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        attempt = restarts,
                        "Failed to respawn inference service"
                    );
                    self.board.mark_crashed(format!("spawn failed: {e}"));
                    None
                }
            };
        }
    }

    async fn run_until_exit(
        &self,
        mut process: Box<dyn ServiceProcess>,
        commands: &mut mpsc::Receiver<ControlRequest>,
        restarts: &mut u32,
    ) -> RunEnd {
        let pid = process.id();
        let mut status_rx = self.board.subscribe();
        // A probe may have landed between mark_starting and subscribe.
        if status_rx.borrow_and_update().is_ready() {
            *restarts = 0;
        }

        loop {
            tokio::select! {
                exit = process.wait() => {
                    self.on_process_exit(pid, exit);
                    return RunEnd::Exited;
                }
                cmd = commands.recv() => match cmd {
                    Some(ControlRequest::Restart) => {
                        tracing::debug!("Restart requested while service is running, ignoring");
                    }
                    Some(ControlRequest::Stop) | None => {
                        self.graceful_stop(process.as_mut(), pid).await;
                        return RunEnd::Stopped;
                    }
                },
                Ok(()) = status_rx.changed() => {
                    // Reaching READY earns a fresh restart budget.
                    if status_rx.borrow_and_update().is_ready() {
                        *restarts = 0;
                    }
                }
            }
        }
    }

    fn on_process_exit(&self, pid: Option<u32>, exit: std::io::Result<ProcessExit>) {
        let detail = match exit {
            Ok(exit) => format!("service exited unexpectedly ({exit})"),
            Err(e) => format!("failed to wait for service: {e}"),
        };
        tracing::warn!(pid = ?pid, %detail, "Inference service exited");
        self.board.mark_crashed(detail);
    }

    /// Sleep out the backoff for restart number `restarts`.
    ///
    /// Returns false if a stop was requested. Past the restart budget this
    /// waits for an explicit restart.
    async fn wait_for_restart(
        &self,
        commands: &mut mpsc::Receiver<ControlRequest>,
        restarts: &mut u32,
    ) -> bool {
        if *restarts > self.restart.max_restarts {
            let detail = format!(
                "gave up after {} restarts; explicit restart required",
                self.restart.max_restarts
            );
            tracing::error!(max_restarts = self.restart.max_restarts, "Restart budget exhausted");
            self.board.mark_crashed(detail);
            return match commands.recv().await {
                Some(ControlRequest::Restart) => {
                    tracing::info!("Explicit restart requested");
                    *restarts = 0;
                    true
                }
                Some(ControlRequest::Stop) | None => false,
            };
        }

        let delay = self.restart.delay_for(*restarts);
        tracing::info!(attempt = *restarts, delay = ?delay, "Scheduling service restart");
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            cmd = commands.recv() => match cmd {
                Some(ControlRequest::Restart) => {
                    tracing::info!("Explicit restart requested");
                    *restarts = 0;
                    true
                }
                Some(ControlRequest::Stop) | None => false,
            },
        }
    }

    async fn graceful_stop(&self, process: &mut dyn ServiceProcess, pid: Option<u32>) {
        tracing::info!(pid = ?pid, grace = ?self.grace_period, "Stopping inference service");
        if let Err(e) = process.terminate() {
            tracing::warn!(pid = ?pid, error = %e, "Failed to signal inference service");
        }

        match tokio::time::timeout(self.grace_period, process.wait()).await {
            Ok(Ok(exit)) => tracing::info!(pid = ?pid, %exit, "Inference service stopped"),
            Ok(Err(e)) => {
                tracing::warn!(pid = ?pid, error = %e, "Failed to wait for inference service")
            }
            Err(_) => {
                tracing::warn!(pid = ?pid, "Inference service ignored SIGTERM, killing");
                if let Err(e) = process.kill() {
                    tracing::error!(pid = ?pid, error = %e, "Failed to kill inference service");
                }
                if let Err(e) = process.wait().await {
                    tracing::warn!(pid = ?pid, error = %e, "Failed to reap inference service");
                }
            }
        }
    }
}
