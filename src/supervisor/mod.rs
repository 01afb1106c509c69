//! Worker process supervisor
//!
//! A single actor task owns the lifecycle state and the worker process.
//! Callers talk to it through a cloneable [`SupervisorHandle`]: mutating
//! operations are queued on an mpsc mailbox and handled one at a time, while
//! status reads come from a `watch` channel the actor publishes to after
//! every transition, so they never wait on the actor or the child.

mod actor;
pub mod logs;
pub mod process;
pub mod throttle;
pub mod xmrig;

pub use logs::{LogBuffer, LogLine, OutputStream};
pub use process::{LaunchCommand, WorkerControl, WorkerSignal};
pub use throttle::ThrottleSettings;
pub use xmrig::XmrigPreview;

use crate::error::{Error, Result};
use crate::types::{ExitInfo, MiningConfig, StartOutcome, StateTag, StopOutcome, SupervisorStatus};
use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;
use uuid::Uuid;

/// Process-level settings fixed for the lifetime of the supervisor
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    /// Worker executable
    pub miner_path: PathBuf,
    /// Arguments placed before the derived ones (wrappers such as `nice -n 10 xmrig`)
    pub launcher_args: Vec<String>,
    /// Arguments appended after the derived ones
    pub miner_args: Vec<String>,
    /// Where to write the XMRig JSON config; enables `--config` launch mode
    pub xmrig_config_path: Option<PathBuf>,
    /// Wait after the graceful termination signal before killing
    pub grace_period: Duration,
    /// Window in which an exiting worker counts as a failed spawn
    pub spawn_check: Duration,
    /// Wait for the exit notification after a forced kill
    pub kill_timeout: Duration,
    /// Worker output lines kept for `/logs`
    pub log_capacity: usize,
    pub mailbox_capacity: usize,
    /// Suspend the worker while host CPU usage is above a target; off when `None`
    pub throttle: Option<ThrottleSettings>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            miner_path: PathBuf::from("xmrig"),
            launcher_args: Vec::new(),
            miner_args: Vec::new(),
            xmrig_config_path: None,
            grace_period: Duration::from_secs(10),
            spawn_check: Duration::from_secs(1),
            kill_timeout: Duration::from_secs(5),
            log_capacity: 1000,
            mailbox_capacity: 32,
            throttle: None,
        }
    }
}

/// Messages handled by the supervisor actor
#[derive(Debug)]
pub(crate) enum Command {
    Start {
        config: MiningConfig,
        reply: oneshot::Sender<Result<StartOutcome>>,
    },
    Stop {
        reply: oneshot::Sender<StopOutcome>,
    },
    /// Pushed by the exit watcher of run `run_id`
    Exited { run_id: Uuid, exit: ExitInfo },
    /// A status read observed `Failed` for run `run_id`
    Acknowledge { run_id: Uuid },
    WriteConfig {
        config: MiningConfig,
        reply: oneshot::Sender<Result<XmrigPreview>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the supervisor actor
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<SupervisorStatus>,
    logs: LogBuffer,
}

impl SupervisorHandle {
    /// Start the actor on the current tokio runtime
    ///
    /// The actor runs until [`shutdown`](Self::shutdown) is called or every
    /// handle is dropped; either way a live worker is terminated.
    pub fn spawn(settings: SupervisorSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.mailbox_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(SupervisorStatus::idle());
        let logs = LogBuffer::new(settings.log_capacity);

        let actor = actor::Actor::new(settings, rx, tx.downgrade(), status_tx, logs.clone());
        tokio::spawn(actor.run());

        Self {
            tx,
            status_rx,
            logs,
        }
    }

    /// Launch a worker with `config`
    ///
    /// Fails with [`Error::Conflict`] unless the supervisor is idle or failed,
    /// and with [`Error::Spawn`] if the worker cannot be started or exits
    /// within the spawn-check window.
    pub async fn start(&self, config: MiningConfig) -> Result<StartOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { config, reply }).await?;
        rx.await
            .map_err(|_| Error::channel_closed("supervisor dropped the start request"))?
    }

    /// Stop the worker, if any; idempotent
    pub async fn stop(&self) -> Result<StopOutcome> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop { reply }).await?;
        rx.await
            .map_err(|_| Error::channel_closed("supervisor dropped the stop request"))
    }

    /// Current status without waiting on the actor
    ///
    /// Returning a `Failed` status acknowledges it: the actor moves back to
    /// `Idle`, keeping the last configuration and exit for display.
    pub fn status(&self) -> SupervisorStatus {
        let mut status = self.status_rx.borrow().clone();

        if status.state.is_active() {
            status.uptime_seconds = status
                .started_at
                .map(|at| (Utc::now() - at).num_seconds().max(0) as u64);
        }

        if status.state == StateTag::Failed {
            if let Some(run_id) = status.run_id {
                if let Err(e) = self.tx.try_send(Command::Acknowledge { run_id }) {
                    debug!(%run_id, "Failure acknowledgement not queued: {}", e);
                }
            }
        }

        status
    }

    /// Status updates as published by the actor, without acknowledgement
    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_rx.clone()
    }

    /// Write the XMRig config for `config` without starting a worker
    pub async fn write_config(&self, config: MiningConfig) -> Result<XmrigPreview> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::WriteConfig { config, reply }).await?;
        rx.await
            .map_err(|_| Error::channel_closed("supervisor dropped the config request"))?
    }

    /// Last `count` output lines of the current or most recent run
    pub fn logs(&self, count: usize) -> Vec<LogLine> {
        self.logs.tail(count)
    }

    pub fn log_capacity(&self) -> usize {
        self.logs.capacity()
    }

    /// Terminate any worker and stop the actor
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await
            .map_err(|_| Error::channel_closed("supervisor dropped the shutdown request"))
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::channel_closed("supervisor is not running"))
    }
}
