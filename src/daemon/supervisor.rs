//! Forwarding engine process supervision.
//!
//! ```text
//! NotStarted -> Starting -> Running -> (Exited | Crashed) -> Backoff -> Starting ...
//!                                                         \-> Failed   (retries exhausted)
//! any -> ShuttingDown -> Stopped
//! ```
//!
//! The engine always starts idle; readiness is published on a watch channel
//! with a generation number that increases on every successful start, which is
//! what the reconciler and the event monitor key their re-apply logic on.

use super::backoff::{BackoffEngine, BackoffStep, RetryPolicy, RetryState};
use super::control::EngineControl;
use super::log_buffer::{LogBuffer, LogSource};
use super::shutdown::ShutdownHandle;
use super::state::EngineWriter;
use crate::config::EngineConfig;
use crate::error::{DaemonError, Result};
use chrono::{DateTime, Utc};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    NotStarted,
    Starting,
    Running,
    /// Exited with status 0 while expected to keep running
    Exited,
    Crashed,
    Backoff,
    ShuttingDown,
    Stopped,
    /// Restart attempts exhausted; needs an operator
    Failed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::NotStarted => "not-started",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Exited => "exited",
            EngineState::Crashed => "crashed",
            EngineState::Backoff => "backoff",
            EngineState::ShuttingDown => "shutting-down",
            EngineState::Stopped => "stopped",
            EngineState::Failed => "failed",
        }
    }
}

/// Published on every engine state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    pub state: EngineState,
    /// Incremented each time the engine becomes Running
    pub generation: u64,
    /// Why the engine last went down; cleared once it is Running again
    pub last_error: Option<String>,
}

impl EngineStatus {
    pub fn initial() -> Self {
        Self {
            state: EngineState::NotStarted,
            generation: 0,
            last_error: None,
        }
    }

    pub fn running(generation: u64) -> Self {
        Self {
            state: EngineState::Running,
            generation,
            last_error: None,
        }
    }
}

/// The live engine process. Replaced, never mutated, on restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorCommand {
    /// Leave terminal `Failed` and try again with fresh retry state
    Rearm,
}

/// Resolved engine command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineLaunch {
    pub program: String,
    pub args: Vec<String>,
}

impl EngineLaunch {
    pub fn new(engine: &EngineConfig, domain_suffix: &str) -> Self {
        let mut args = Vec::new();
        let program = if engine.use_sudo {
            args.push("-n".to_string());
            args.push(engine.binary.clone());
            "sudo".to_string()
        } else {
            engine.binary.clone()
        };
        args.extend(engine.args.iter().cloned());
        args.extend([
            "--idle".to_string(),
            "--api-addr".to_string(),
            format!("127.0.0.1:{}", engine.api_port_for(domain_suffix)),
            "--domain".to_string(),
            domain_suffix.to_string(),
        ]);
        Self { program, args }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorTimings {
    pub startup_timeout: Duration,
    pub health_interval: Duration,
    pub shutdown_grace: Duration,
    pub confirmation_window: Duration,
}

impl SupervisorTimings {
    pub fn new(engine: &EngineConfig, confirmation_window: Duration) -> Self {
        Self {
            startup_timeout: engine.startup_timeout,
            health_interval: engine.health_interval,
            shutdown_grace: engine.shutdown_grace,
            confirmation_window,
        }
    }
}

enum Startup {
    Ready,
    Shutdown,
}

enum RunOutcome {
    Exited(ExitStatus),
    /// The process could not be waited on; it has been killed
    Lost(String),
    Shutdown,
}

enum BackoffOutcome {
    Restart,
    Shutdown,
}

pub struct ProcessSupervisor {
    launch: EngineLaunch,
    endpoint: String,
    control: Arc<dyn EngineControl>,
    writer: EngineWriter,
    status: watch::Sender<EngineStatus>,
    commands: mpsc::UnboundedReceiver<SupervisorCommand>,
    log: Arc<LogBuffer>,
    shutdown: ShutdownHandle,
    backoff: BackoffEngine,
    retry: RetryState,
    timings: SupervisorTimings,
    generation: u64,
}

impl ProcessSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        launch: EngineLaunch,
        endpoint: impl Into<String>,
        control: Arc<dyn EngineControl>,
        writer: EngineWriter,
        status: watch::Sender<EngineStatus>,
        commands: mpsc::UnboundedReceiver<SupervisorCommand>,
        log: Arc<LogBuffer>,
        shutdown: ShutdownHandle,
        policy: RetryPolicy,
        timings: SupervisorTimings,
    ) -> Self {
        let endpoint = endpoint.into();
        writer.modify(|row| row.endpoint = endpoint.clone());
        Self {
            launch,
            endpoint,
            control,
            writer,
            status,
            commands,
            log,
            shutdown,
            backoff: BackoffEngine::new(policy),
            retry: RetryState::new(),
            timings,
            generation: 0,
        }
    }

    pub async fn run(mut self) {
        info!(program = %self.launch.program, "Process supervisor started");

        loop {
            if self.shutdown.is_shutdown() {
                break;
            }

            self.set_state(EngineState::Starting);
            let mut child = match self.spawn() {
                Ok(child) => child,
                Err(e) => {
                    self.record_crash(EngineState::Crashed, e.to_string());
                    match self.back_off().await {
                        BackoffOutcome::Restart => continue,
                        BackoffOutcome::Shutdown => break,
                    }
                }
            };

            match self.await_ready(&mut child).await {
                Ok(Startup::Ready) => {}
                Ok(Startup::Shutdown) => {
                    self.terminate(&mut child).await;
                    break;
                }
                Err(e) => {
                    self.terminate(&mut child).await;
                    self.record_crash(EngineState::Crashed, e.to_string());
                    match self.back_off().await {
                        BackoffOutcome::Restart => continue,
                        BackoffOutcome::Shutdown => break,
                    }
                }
            }

            let handle = self.mark_running(&child);
            let (state, reason) = match self.watch_running(&mut child).await {
                RunOutcome::Shutdown => {
                    self.terminate(&mut child).await;
                    break;
                }
                RunOutcome::Exited(status) if status.success() => {
                    (EngineState::Exited, "engine exited unexpectedly".to_string())
                }
                RunOutcome::Exited(status) => {
                    (EngineState::Crashed, format!("engine exited with {status}"))
                }
                RunOutcome::Lost(reason) => (EngineState::Crashed, reason),
            };
            warn!(pid = handle.pid, state = state.as_str(), "Engine process exited");
            self.record_crash(state, reason);
            match self.back_off().await {
                BackoffOutcome::Restart => continue,
                BackoffOutcome::Shutdown => break,
            }
        }

        self.set_state(EngineState::ShuttingDown);
        self.writer.modify(|row| {
            row.pid = None;
            row.started_at = None;
        });
        self.set_state(EngineState::Stopped);
        info!("Process supervisor stopped");
    }

    fn spawn(&self) -> Result<Child> {
        let mut cmd = Command::new(&self.launch.program);
        cmd.args(&self.launch.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| DaemonError::ProcessCrash {
            reason: format!("failed to spawn {}: {e}", self.launch.program),
        })?;
        info!(pid = ?child.id(), "Spawned engine");
        spawn_log_readers(&mut child, &self.log);
        Ok(child)
    }

    /// Poll health until the engine answers, it exits, or the startup timeout.
    async fn await_ready(&mut self, child: &mut Child) -> Result<Startup> {
        let deadline = Instant::now() + self.timings.startup_timeout;
        let mut poll = tokio::time::interval(self.timings.health_interval);

        loop {
            tokio::select! {
                status = child.wait() => {
                    let reason = match status {
                        Ok(status) => format!("engine exited during startup with {status}"),
                        Err(e) => format!("failed to wait for engine: {e}"),
                    };
                    return Err(DaemonError::ProcessCrash { reason });
                }
                _ = poll.tick() => {
                    match self.control.health().await {
                        Ok(true) => return Ok(Startup::Ready),
                        Ok(false) => debug!("Engine not healthy yet"),
                        Err(e) => debug!(error = %e, "Engine not reachable yet"),
                    }
                    if Instant::now() >= deadline {
                        return Err(DaemonError::StartupTimeout(self.timings.startup_timeout));
                    }
                }
                _ = self.shutdown.wait() => return Ok(Startup::Shutdown),
            }
        }
    }

    fn mark_running(&mut self, child: &Child) -> ProcessHandle {
        self.generation += 1;
        let handle = ProcessHandle {
            pid: child.id().unwrap_or_default(),
            started_at: Utc::now(),
            endpoint: self.endpoint.clone(),
        };
        self.writer.modify(|row| {
            row.state = EngineState::Running;
            row.pid = Some(handle.pid);
            row.started_at = Some(handle.started_at);
            row.endpoint = handle.endpoint.clone();
            row.last_error = None;
        });
        self.status.send_replace(EngineStatus::running(self.generation));
        self.log.push(
            LogSource::Daemon,
            format!("engine running (pid {}, generation {})", handle.pid, self.generation),
        );
        info!(pid = handle.pid, generation = self.generation, "Engine running");
        handle
    }

    async fn watch_running(&mut self, child: &mut Child) -> RunOutcome {
        let confirm = tokio::time::sleep(self.timings.confirmation_window);
        tokio::pin!(confirm);
        let mut confirmed = false;

        loop {
            tokio::select! {
                status = child.wait() => {
                    return match status {
                        Ok(status) => RunOutcome::Exited(status),
                        Err(e) => {
                            error!(error = %e, "Failed to wait for engine");
                            self.terminate(child).await;
                            RunOutcome::Lost(format!("failed to wait for engine: {e}"))
                        }
                    };
                }
                _ = &mut confirm, if !confirmed => {
                    confirmed = true;
                    if self.retry.attempts > 0 {
                        debug!("Engine stable, resetting restart backoff");
                    }
                    self.retry = self.backoff.reset(&self.retry);
                }
                Some(command) = self.commands.recv() => {
                    debug!(?command, "Ignoring supervisor command while running");
                }
                _ = self.shutdown.wait() => return RunOutcome::Shutdown,
            }
        }
    }

    async fn back_off(&mut self) -> BackoffOutcome {
        let (step, next) = self.backoff.schedule(&self.retry, Instant::now());
        self.retry = next;

        match step {
            BackoffStep::Retry(delay) => {
                info!(attempt = self.retry.attempts, ?delay, "Restarting engine after backoff");
                self.set_state(EngineState::Backoff);
                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        Some(SupervisorCommand::Rearm) = self.commands.recv() => {
                            debug!("Rearm requested during backoff, restarting now");
                            break;
                        }
                        _ = self.shutdown.wait() => return BackoffOutcome::Shutdown,
                    }
                }
                self.writer.modify(|row| row.restarts = row.restarts.saturating_add(1));
                BackoffOutcome::Restart
            }
            BackoffStep::Exhausted => {
                error!(
                    attempts = self.retry.attempts,
                    "Engine restart attempts exhausted, giving up"
                );
                self.set_state(EngineState::Failed);
                self.log
                    .push(LogSource::Daemon, "engine failed: restart attempts exhausted");
                loop {
                    tokio::select! {
                        command = self.commands.recv() => match command {
                            Some(SupervisorCommand::Rearm) => {
                                info!("Supervisor re-armed");
                                self.retry = self.backoff.reset(&self.retry);
                                self.writer.modify(|row| row.restarts = row.restarts.saturating_add(1));
                                return BackoffOutcome::Restart;
                            }
                            None => {
                                self.shutdown.wait().await;
                                return BackoffOutcome::Shutdown;
                            }
                        },
                        _ = self.shutdown.wait() => return BackoffOutcome::Shutdown,
                    }
                }
            }
        }
    }

    /// SIGTERM, wait out the grace period, then kill.
    async fn terminate(&mut self, child: &mut Child) {
        self.set_state(EngineState::ShuttingDown);
        let Some(pid) = child.id() else {
            // Already reaped.
            return;
        };
        info!(pid, "Stopping engine gracefully");

        #[cfg(unix)]
        {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        match tokio::time::timeout(self.timings.shutdown_grace, child.wait()).await {
            Ok(_) => debug!(pid, "Engine stopped gracefully"),
            Err(_) => {
                warn!(pid, "Engine did not stop in time, force killing");
                if let Err(e) = child.kill().await {
                    error!(pid, error = %e, "Failed to kill engine");
                }
            }
        }
    }

    fn record_crash(&mut self, state: EngineState, reason: String) {
        warn!(state = state.as_str(), %reason, "Engine down");
        self.log
            .push(LogSource::Daemon, format!("engine {}: {reason}", state.as_str()));
        self.writer.modify(|row| {
            row.state = state;
            row.pid = None;
            row.started_at = None;
            row.last_error = Some(reason.clone());
        });
        self.status.send_replace(EngineStatus {
            state,
            generation: self.generation,
            last_error: Some(reason),
        });
    }

    fn set_state(&self, state: EngineState) {
        let (changed, last_error) = self.writer.modify(|row| {
            let changed = row.state != state;
            row.state = state;
            (changed, row.last_error.clone())
        });
        if changed {
            debug!(state = state.as_str(), "Engine state");
            self.status.send_replace(EngineStatus {
                state,
                generation: self.generation,
                last_error,
            });
        }
    }
}

/// Pipe the engine's stdout and stderr into the log buffer.
fn spawn_log_readers(child: &mut Child, log: &Arc<LogBuffer>) {
    if let Some(stdout) = child.stdout.take() {
        let buf = Arc::clone(log);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buf.push(LogSource::Stdout, line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let buf = Arc::clone(log);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                buf.push(LogSource::Stderr, line);
            }
        });
    }
}
