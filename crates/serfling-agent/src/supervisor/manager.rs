//! Agent process supervisor.
//!
//! Owns the event relay and the agent child process. A watcher task waits
//! on the child; when the agent dies on its own the watcher records the
//! exit status and fires the stop hooks. A requested stop cancels the
//! watcher first, so each termination reaches the stop hooks exactly once.

use std::net::SocketAddr;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use serfling_core::Config;
use serfling_core::Event;
use serfling_core::config::{RelayConfig, SupervisorConfig};

use super::launcher::{AgentLauncher, SerfCommand, default_event_handler};
use crate::hooks::{HookRegistry, HookResult, STOP, WILDCARD};
use crate::relay::{EventRelay, RelayError};
use crate::responder::{ResponderError, ResponderTable};

/// How often [`Supervisor::wait_for_ready`] polls.
const READY_POLL: Duration = Duration::from_millis(100);

/// Observable lifecycle state of the supervised agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    NotStarted,
    Running,
    /// Stopped on request.
    Stopped,
    /// Exited without being asked to.
    Crashed,
}

/// Errors from supervisor operations.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Agent already started (pid {pid})")]
    AlreadyStarted { pid: u32 },

    #[error("Agent is not running")]
    NotRunning,

    #[error("Failed to spawn agent: {reason}")]
    SpawnFailed { reason: String },

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("Agent did not deliver an event within {timeout:?}")]
    ReadyTimeout { timeout: Duration },

    #[error("Agent exited before becoming ready: {status}")]
    Exited { status: ExitStatus },
}

#[derive(Default)]
struct ProcessStatus {
    pid: Option<u32>,
    exit_status: Option<ExitStatus>,
    stopped: bool,
    /// Waiting on the child failed; its fate is unknown.
    lost: bool,
    relay_addr: Option<SocketAddr>,
    received: Option<Arc<AtomicBool>>,
}

impl ProcessStatus {
    fn state(&self) -> AgentState {
        match (self.pid, self.exit_status) {
            (Some(_), None) if !self.lost => AgentState::Running,
            (Some(_), _) => AgentState::Crashed,
            (None, _) if self.stopped => AgentState::Stopped,
            (None, _) => AgentState::NotStarted,
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    relay: Option<EventRelay>,
    watcher: Option<Watcher>,
}

struct Watcher {
    cancel_tx: oneshot::Sender<()>,
    task: JoinHandle<WatchOutcome>,
}

enum WatchOutcome {
    /// The agent exited; status and stop hooks are already handled.
    Exited,
    /// Cancelled by `stop`; the child is handed back still running.
    Cancelled(Child),
}

impl Watcher {
    fn spawn(
        mut child: Child,
        pid: u32,
        status: Arc<Mutex<ProcessStatus>>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let waited = tokio::select! {
                biased;
                _ = cancel_rx => None,
                waited = child.wait() => Some(waited),
            };
            let Some(waited) = waited else {
                return WatchOutcome::Cancelled(child);
            };

            let exit = record_exit(&status, pid, waited);
            fire_stop_hooks(hooks, exit).await;
            WatchOutcome::Exited
        });
        Self { cancel_tx, task }
    }

    /// Stop watching. Returns the child unless the watcher already saw it exit.
    async fn cancel(self) -> Option<Child> {
        // Err means the watcher already finished.
        let _ = self.cancel_tx.send(());
        match self.task.await {
            Ok(WatchOutcome::Cancelled(child)) => Some(child),
            Ok(WatchOutcome::Exited) => None,
            Err(e) => {
                error!(error = %e, "Agent watcher task failed");
                None
            }
        }
    }
}

/// Supervises one agent process and its event relay.
///
/// Hooks and responders may be registered at any time; the relay reads the
/// shared tables on every event.
pub struct Supervisor {
    launcher: Arc<dyn AgentLauncher>,
    relay_config: RelayConfig,
    config: SupervisorConfig,
    hooks: Arc<HookRegistry>,
    responders: Arc<ResponderTable>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    status: Arc<Mutex<ProcessStatus>>,
}

impl Supervisor {
    pub fn new(
        launcher: impl AgentLauncher + 'static,
        relay_config: RelayConfig,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            launcher: Arc::new(launcher),
            relay_config,
            config,
            hooks: Arc::new(HookRegistry::new()),
            responders: Arc::new(ResponderTable::new()),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            status: Arc::new(Mutex::new(ProcessStatus::default())),
        }
    }

    /// Supervisor launching `serf agent` as described by `config`.
    pub fn from_config(config: &Config) -> Self {
        let handler = config
            .supervisor
            .event_handler
            .clone()
            .unwrap_or_else(default_event_handler);
        let launcher = SerfCommand::new(config.agent.clone(), handler);
        Self::new(launcher, config.relay.clone(), config.supervisor.clone())
    }

    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    pub fn responders(&self) -> &Arc<ResponderTable> {
        &self.responders
    }

    /// Start the relay and spawn the agent. Returns the agent's pid.
    ///
    /// A relay that survived an agent crash is reused.
    pub async fn start(&self) -> Result<u32, SupervisorError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(pid) = self.running_pid() {
            return Err(SupervisorError::AlreadyStarted { pid });
        }

        let relay = match lifecycle.relay.take() {
            Some(relay) if relay.is_running() => {
                debug!(addr = %relay.local_addr(), "Reusing event relay");
                relay
            }
            stale => {
                if let Some(stale) = stale {
                    stale.shutdown().await;
                }
                EventRelay::start(
                    self.relay_config.clone(),
                    Arc::clone(&self.hooks),
                    Arc::clone(&self.responders),
                )
                .await?
            }
        };
        relay.reset_received();
        let relay_addr = relay.local_addr();

        let child = match self.spawn_agent(relay_addr) {
            Ok(child) => child,
            Err(e) => {
                relay.shutdown().await;
                return Err(e);
            }
        };
        let Some(pid) = child.id() else {
            relay.shutdown().await;
            return Err(SupervisorError::SpawnFailed {
                reason: "agent exited before reporting a pid".to_string(),
            });
        };

        {
            let mut status = self.status.lock();
            *status = ProcessStatus {
                pid: Some(pid),
                exit_status: None,
                stopped: false,
                lost: false,
                relay_addr: Some(relay_addr),
                received: Some(relay.received_flag()),
            };
        }
        lifecycle.watcher = Some(Watcher::spawn(
            child,
            pid,
            Arc::clone(&self.status),
            Arc::clone(&self.hooks),
        ));
        lifecycle.relay = Some(relay);
        drop(lifecycle);

        info!(pid, relay = %relay_addr, "Agent started");
        Ok(pid)
    }

    fn spawn_agent(&self, relay_addr: SocketAddr) -> Result<Child, SupervisorError> {
        let mut cmd = self
            .launcher
            .command(relay_addr)
            .map_err(|e| SupervisorError::SpawnFailed {
                reason: e.to_string(),
            })?;
        cmd.stdin(Stdio::null()).kill_on_drop(self.config.kill_on_drop);
        cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            reason: e.to_string(),
        })
    }

    /// Stop the agent with the configured timeout.
    pub async fn stop(&self) -> Result<Option<ExitStatus>, SupervisorError> {
        self.stop_with_timeout(self.config.stop_timeout()).await
    }

    /// Interrupt the agent, wait up to `timeout` for it to exit, then kill it.
    ///
    /// The watcher is cancelled before the agent is signalled, so stop hooks
    /// get `None` unless the agent had already exited on its own, in which
    /// case they were fired with its status when that was noticed. The relay
    /// is shut down either way.
    pub async fn stop_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<ExitStatus>, SupervisorError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(pid) = self.running_pid() else {
            return Err(SupervisorError::NotRunning);
        };

        debug!(pid, "Stopping agent");
        let child = match lifecycle.watcher.take() {
            Some(watcher) => watcher.cancel().await,
            None => None,
        };
        let exit = match child {
            Some(mut child) => {
                interrupt(pid);
                fire_stop_hooks(Arc::clone(&self.hooks), None).await;
                wait_or_kill(&mut child, pid, timeout).await
            }
            None => self.status.lock().exit_status,
        };

        if let Some(relay) = lifecycle.relay.take() {
            relay.shutdown().await;
        }
        {
            let mut status = self.status.lock();
            status.pid = None;
            status.stopped = true;
            status.relay_addr = None;
            status.received = None;
            if exit.is_some() {
                status.exit_status = exit;
            }
        }
        drop(lifecycle);

        info!(pid, status = ?exit, "Agent stopped");
        Ok(exit)
    }

    pub fn state(&self) -> AgentState {
        self.status.lock().state()
    }

    /// A process has been spawned and not stopped on request.
    pub fn started(&self) -> bool {
        self.status.lock().pid.is_some()
    }

    /// Started and not yet exited.
    pub fn running(&self) -> bool {
        self.state() == AgentState::Running
    }

    /// Exited without a requested stop.
    pub fn dead(&self) -> bool {
        self.state() == AgentState::Crashed
    }

    pub fn pid(&self) -> Option<u32> {
        self.status.lock().pid
    }

    /// Exit status of the last agent process, once it has exited.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status.lock().exit_status
    }

    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.status.lock().relay_addr
    }

    /// Running and the relay has received at least one event since start.
    pub fn ready(&self) -> bool {
        let status = self.status.lock();
        status.state() == AgentState::Running
            && status
                .received
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Poll until [`Self::ready`] or `timeout` elapses.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<(), SupervisorError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.ready() {
                return Ok(());
            }
            match self.state() {
                AgentState::Running => {}
                AgentState::Crashed => {
                    if let Some(status) = self.exit_status() {
                        return Err(SupervisorError::Exited { status });
                    }
                    return Err(SupervisorError::NotRunning);
                }
                AgentState::NotStarted | AgentState::Stopped => {
                    return Err(SupervisorError::NotRunning);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SupervisorError::ReadyTimeout { timeout });
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    fn running_pid(&self) -> Option<u32> {
        let status = self.status.lock();
        match status.state() {
            AgentState::Running => status.pid,
            _ => None,
        }
    }

    pub fn on_member_join<F>(&self, hook: F)
    where
        F: Fn(&Event) -> HookResult + Send + Sync + 'static,
    {
        self.hooks.register("member_join", hook);
    }

    pub fn on_member_leave<F>(&self, hook: F)
    where
        F: Fn(&Event) -> HookResult + Send + Sync + 'static,
    {
        self.hooks.register("member_leave", hook);
    }

    pub fn on_member_failed<F>(&self, hook: F)
    where
        F: Fn(&Event) -> HookResult + Send + Sync + 'static,
    {
        self.hooks.register("member_failed", hook);
    }

    pub fn on_member_update<F>(&self, hook: F)
    where
        F: Fn(&Event) -> HookResult + Send + Sync + 'static,
    {
        self.hooks.register("member_update", hook);
    }

    pub fn on_member_reap<F>(&self, hook: F)
    where
        F: Fn(&Event) -> HookResult + Send + Sync + 'static,
    {
        self.hooks.register("member_reap", hook);
    }

    /// Hook for user events.
    pub fn on_user<F>(&self, hook: F)
    where
        F: Fn(&Event) -> HookResult + Send + Sync + 'static,
    {
        self.hooks.register("user", hook);
    }

    /// Same as [`Self::on_user`].
    pub fn on_user_event<F>(&self, hook: F)
    where
        F: Fn(&Event) -> HookResult + Send + Sync + 'static,
    {
        self.on_user(hook);
    }

    /// Hook for user events named `name`.
    pub fn on_user_named<F>(&self, name: &str, hook: F)
    where
        F: Fn(&Event) -> HookResult + Send + Sync + 'static,
    {
        let name = name.to_string();
        self.hooks.register("user", move |event| {
            if event.user_event_name() == Some(name.as_str()) {
                hook(event)
            } else {
                Ok(())
            }
        });
    }

    /// Hook for every query, answered or not.
    pub fn on_query<F>(&self, hook: F)
    where
        F: Fn(&Event) -> HookResult + Send + Sync + 'static,
    {
        self.hooks.register("query", hook);
    }

    /// Hook for every event.
    pub fn on_event<F>(&self, hook: F)
    where
        F: Fn(&Event) -> HookResult + Send + Sync + 'static,
    {
        self.hooks.register(WILDCARD, hook);
    }

    /// Hook for agent termination.
    pub fn on_stop<F>(&self, hook: F)
    where
        F: Fn(Option<ExitStatus>) -> HookResult + Send + Sync + 'static,
    {
        debug!(hook = STOP, "Registering stop hook");
        self.hooks.register_stop(hook);
    }

    /// Answer queries named `name` with the bytes `responder` returns.
    pub fn respond<F, R>(
        &self,
        name: &str,
        override_existing: bool,
        responder: F,
    ) -> Result<(), ResponderError>
    where
        F: Fn(&Event) -> anyhow::Result<R> + Send + Sync + 'static,
        R: Into<Vec<u8>>,
    {
        self.responders.register(name, override_existing, responder)
    }
}

/// Record how a watched agent ended. A failed wait leaves no status but
/// still marks the agent as no longer running.
fn record_exit(
    status: &Mutex<ProcessStatus>,
    pid: u32,
    waited: std::io::Result<ExitStatus>,
) -> Option<ExitStatus> {
    let mut status = status.lock();
    match waited {
        Ok(exit) => {
            warn!(pid, status = %exit, "Agent exited unexpectedly");
            status.exit_status = Some(exit);
            Some(exit)
        }
        Err(e) => {
            error!(pid, error = %e, "Failed to wait for agent");
            status.lost = true;
            None
        }
    }
}

async fn fire_stop_hooks(hooks: Arc<HookRegistry>, status: Option<ExitStatus>) {
    if let Err(e) = tokio::task::spawn_blocking(move || hooks.fire_stop(status)).await {
        error!(error = %e, "Stop hooks task failed");
    }
}

#[cfg(unix)]
fn interrupt(pid: u32) {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        warn!(pid, "Agent pid out of range; cannot send SIGINT");
        return;
    };
    // SAFETY: pid comes from a Child we spawned and have not reaped yet.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(raw, libc::SIGINT) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            debug!(pid, "Agent already exited");
        } else {
            warn!(pid, error = %err, "Failed to send SIGINT");
        }
    }
}

#[cfg(not(unix))]
fn interrupt(pid: u32) {
    debug!(pid, "SIGINT unsupported on this platform; agent will be killed");
}

async fn wait_or_kill(child: &mut Child, pid: u32, timeout: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            info!(pid, %status, "Agent exited gracefully");
            Some(status)
        }
        Ok(Err(e)) => {
            warn!(pid, error = %e, "Error waiting for agent");
            child.kill().await.ok();
            child.try_wait().ok().flatten()
        }
        Err(_) => {
            warn!(pid, ?timeout, "Timeout waiting for graceful shutdown, killing");
            if let Err(e) = child.kill().await {
                warn!(pid, error = %e, "Failed to kill agent");
            }
            child.wait().await.ok()
        }
    }
}
