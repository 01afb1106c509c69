//! The task that owns the worker slot

use super::logs::LogBuffer;
use super::process::{spawn_worker, wait_for_exit, LaunchCommand, WorkerProcess};
use super::throttle;
use super::xmrig::{self, XmrigPreview};
use super::{Command, SupervisorSettings};
use crate::error::{Error, Result};
use crate::types::{
    ExitInfo, MiningConfig, StartOutcome, StateTag, StopOutcome, SupervisorStatus,
};
use crate::utils::format_duration;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub(super) struct Actor {
    settings: SupervisorSettings,
    rx: mpsc::Receiver<Command>,
    /// Weak so that dropping every handle still closes the mailbox
    self_tx: mpsc::WeakSender<Command>,
    status_tx: watch::Sender<SupervisorStatus>,
    logs: LogBuffer,

    state: StateTag,
    reason: Option<String>,
    worker: Option<WorkerProcess>,
    throttle: Option<CancellationToken>,
    run_id: Option<Uuid>,
    started_at: Option<DateTime<Utc>>,
    last_config: Option<MiningConfig>,
    exit: Option<ExitInfo>,
}

impl Actor {
    pub(super) fn new(
        settings: SupervisorSettings,
        rx: mpsc::Receiver<Command>,
        self_tx: mpsc::WeakSender<Command>,
        status_tx: watch::Sender<SupervisorStatus>,
        logs: LogBuffer,
    ) -> Self {
        Self {
            settings,
            rx,
            self_tx,
            status_tx,
            logs,
            state: StateTag::Idle,
            reason: None,
            worker: None,
            throttle: None,
            run_id: None,
            started_at: None,
            last_config: None,
            exit: None,
        }
    }

    pub(super) async fn run(mut self) {
        debug!("Supervisor actor started");

        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Start { config, reply } => {
                    let result = self.handle_start(config).await;
                    let _ = reply.send(result);
                }
                Command::Stop { reply } => {
                    let outcome = self.handle_stop().await;
                    let _ = reply.send(outcome);
                }
                Command::Exited { run_id, exit } => self.handle_exited(run_id, exit),
                Command::Acknowledge { run_id } => self.handle_acknowledge(run_id),
                Command::WriteConfig { config, reply } => {
                    let result = self.handle_write_config(&config).await;
                    let _ = reply.send(result);
                }
                Command::Shutdown { reply } => {
                    self.handle_stop().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }

        self.stop_throttle();
        if let Some(mut worker) = self.worker.take() {
            warn!(pid = ?worker.pid(), "Supervisor closing with a live worker, terminating it");
            worker
                .terminate(self.settings.grace_period, self.settings.kill_timeout)
                .await;
        }
        debug!("Supervisor actor stopped");
    }

    async fn handle_start(&mut self, config: MiningConfig) -> Result<StartOutcome> {
        if !self.state.accepts_start() {
            return Err(Error::conflict(format!(
                "a worker is already {}",
                self.state
            )));
        }

        let run_id = Uuid::new_v4();
        self.run_id = Some(run_id);
        self.started_at = None;
        self.exit = None;
        self.reason = None;
        self.last_config = Some(config.clone());
        self.logs.clear();
        self.transition(StateTag::Starting);

        let launch = LaunchCommand::build(&self.settings, &config);
        info!(%run_id, command = %launch, "Launching worker");

        if let Some(path) = self.settings.xmrig_config_path.clone() {
            if let Err(e) = xmrig::write(&path, &config).await {
                let reason = format!("failed to write XMRig config {}: {}", path.display(), e);
                self.fail(reason.clone(), None);
                return Err(Error::spawn(reason));
            }
        }

        let worker = match spawn_worker(&launch, self.logs.clone()) {
            Ok(worker) => worker,
            Err(e) => {
                let reason = match e {
                    Error::Spawn { message } => message,
                    other => other.to_string(),
                };
                self.fail(reason.clone(), None);
                return Err(Error::spawn(reason));
            }
        };

        if let Ok(exit) = timeout(self.settings.spawn_check, worker.wait_exit()).await {
            let reason = format!("worker exited during startup: {}", exit.reason);
            self.fail(reason.clone(), Some(exit));
            return Err(Error::spawn(reason));
        }

        let started_at = Utc::now();
        let pid = worker.pid();
        self.started_at = Some(started_at);
        self.watch_exit(run_id, &worker);
        if let Some(settings) = self.settings.throttle.clone() {
            let cancel = CancellationToken::new();
            throttle::spawn(settings, run_id, worker.control(), cancel.clone());
            self.throttle = Some(cancel);
        }
        self.worker = Some(worker);
        self.transition(StateTag::Running);

        Ok(StartOutcome {
            run_id,
            pid,
            started_at,
            config,
        })
    }

    async fn handle_stop(&mut self) -> StopOutcome {
        let previous_state = self.state;
        if self.worker.is_some() {
            // Published before the worker is taken so the pid stays visible
            self.transition(StateTag::Stopping);
        }

        let Some(mut worker) = self.worker.take() else {
            if previous_state == StateTag::Failed {
                self.reason = None;
                self.transition(StateTag::Idle);
            }
            return StopOutcome {
                was_running: false,
                previous_state,
                forced: false,
                exit: None,
            };
        };

        let ran_for = self
            .started_at
            .map(|at| (Utc::now() - at).num_seconds().max(0) as u64)
            .unwrap_or_default();
        self.stop_throttle();
        let (exit, forced) = worker
            .terminate(self.settings.grace_period, self.settings.kill_timeout)
            .await;

        info!(
            run_id = ?self.run_id,
            code = ?exit.code,
            signal = ?exit.signal,
            forced,
            uptime = %format_duration(ran_for),
            "Worker stopped"
        );

        self.exit = Some(exit.clone());
        self.started_at = None;
        self.transition(StateTag::Idle);

        StopOutcome {
            was_running: true,
            previous_state,
            forced,
            exit: Some(exit),
        }
    }

    fn handle_exited(&mut self, run_id: Uuid, exit: ExitInfo) {
        if self.run_id != Some(run_id) || self.state != StateTag::Running {
            debug!(%run_id, "Ignoring exit of a run that is no longer current");
            return;
        }

        error!(%run_id, code = ?exit.code, signal = ?exit.signal, "Worker exited unexpectedly");
        self.stop_throttle();
        self.worker = None;
        let reason = Error::runtime(&exit.reason).to_string();
        self.fail(reason, Some(exit));
    }

    fn handle_acknowledge(&mut self, run_id: Uuid) {
        if self.state == StateTag::Failed && self.run_id == Some(run_id) {
            self.reason = None;
            self.transition(StateTag::Idle);
        }
    }

    async fn handle_write_config(&mut self, config: &MiningConfig) -> Result<XmrigPreview> {
        if self.state.is_active() {
            return Err(Error::conflict(format!(
                "cannot rewrite the configuration while a worker is {}",
                self.state
            )));
        }

        let path = self
            .settings
            .xmrig_config_path
            .as_deref()
            .ok_or_else(|| Error::config("no XMRig config path is configured"))?;

        xmrig::write(path, config).await
    }

    /// Forward the worker's exit into the mailbox
    fn watch_exit(&self, run_id: Uuid, worker: &WorkerProcess) {
        let exit_rx = worker.exit_receiver();
        let self_tx = self.self_tx.clone();

        tokio::spawn(async move {
            let exit = wait_for_exit(exit_rx).await;
            // Upgrade only now so an idle watcher never keeps the mailbox open
            if let Some(tx) = self_tx.upgrade() {
                let _ = tx.send(Command::Exited { run_id, exit }).await;
            }
        });
    }

    fn stop_throttle(&mut self) {
        if let Some(cancel) = self.throttle.take() {
            cancel.cancel();
        }
    }

    fn fail(&mut self, reason: String, exit: Option<ExitInfo>) {
        warn!(run_id = ?self.run_id, %reason, "Worker failed");
        self.reason = Some(reason);
        self.started_at = None;
        if exit.is_some() {
            self.exit = exit;
        }
        self.transition(StateTag::Failed);
    }

    fn transition(&mut self, to: StateTag) {
        if self.state != to {
            info!(run_id = ?self.run_id, from = %self.state, to = %to, "Supervisor state changed");
        }
        self.state = to;
        self.publish();
    }

    fn publish(&self) {
        let status = SupervisorStatus {
            state: self.state,
            reason: self.reason.clone(),
            run_id: self.run_id,
            pid: self.worker.as_ref().and_then(WorkerProcess::pid),
            started_at: self.started_at,
            uptime_seconds: None,
            last_config: self.last_config.as_ref().map(MiningConfig::redacted),
            exit: self.exit.clone(),
        };
        self.status_tx.send_replace(status);
    }
}

#[cfg(test)]
mod tests {
    use crate::supervisor::{SupervisorHandle, SupervisorSettings, ThrottleSettings};
    use crate::types::{MiningConfig, StateTag, DEFAULT_PASSWORD};
    use crate::Error;
    use assert_matches::assert_matches;
    use std::path::PathBuf;
    use std::time::Duration;

    fn config() -> MiningConfig {
        MiningConfig::new(
            1,
            2.0,
            "pool.supportxmr.com:443".to_string(),
            "4".repeat(95),
            "w1".to_string(),
            DEFAULT_PASSWORD.to_string(),
            false,
        )
    }

    fn shell(script: &str) -> SupervisorSettings {
        SupervisorSettings {
            miner_path: PathBuf::from("/bin/sh"),
            launcher_args: vec!["-c".to_string(), script.to_string(), "xmrig".to_string()],
            grace_period: Duration::from_secs(2),
            spawn_check: Duration::from_millis(200),
            ..SupervisorSettings::default()
        }
    }

    #[tokio::test]
    async fn test_stop_when_idle_is_noop() {
        let supervisor = SupervisorHandle::spawn(SupervisorSettings::default());
        let outcome = supervisor.stop().await.unwrap();
        assert!(!outcome.was_running);
        assert_eq!(outcome.previous_state, StateTag::Idle);
        assert_eq!(supervisor.status().state, StateTag::Idle);
    }

    #[tokio::test]
    async fn test_missing_executable_fails_start() {
        let settings = SupervisorSettings {
            miner_path: PathBuf::from("/nonexistent/xmrig"),
            ..SupervisorSettings::default()
        };
        let supervisor = SupervisorHandle::spawn(settings);

        let err = supervisor.start(config()).await.unwrap_err();
        assert_matches!(err, Error::Spawn { .. });

        let status = supervisor.status();
        assert_eq!(status.state, StateTag::Failed);
        assert!(status.reason.unwrap().contains("not found"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_immediate_exit_is_spawn_error() {
        let supervisor = SupervisorHandle::spawn(shell("exit 1"));
        let err = supervisor.start(config()).await.unwrap_err();
        assert_matches!(err, Error::Spawn { ref message } if message.contains("status 1"));
        assert_eq!(supervisor.status().exit.unwrap().code, Some(1));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_then_stop() {
        let supervisor = SupervisorHandle::spawn(shell("exec sleep 30"));

        let outcome = supervisor.start(config()).await.unwrap();
        let status = supervisor.status();
        assert_eq!(status.state, StateTag::Running);
        assert_eq!(status.run_id, Some(outcome.run_id));
        assert_eq!(status.pid, outcome.pid);
        assert_eq!(status.last_config.unwrap().worker_id, "w1");

        let stopped = supervisor.stop().await.unwrap();
        assert!(stopped.was_running);
        assert!(!stopped.forced);
        assert_eq!(stopped.previous_state, StateTag::Running);

        let status = supervisor.status();
        assert_eq!(status.state, StateTag::Idle);
        assert_eq!(status.pid, None);
        assert!(status.last_config.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_second_start_conflicts() {
        let supervisor = SupervisorHandle::spawn(shell("exec sleep 30"));
        supervisor.start(config()).await.unwrap();

        let err = supervisor.start(config()).await.unwrap_err();
        assert_matches!(err, Error::Conflict { .. });

        supervisor.shutdown().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runtime_exit_is_failed_then_acknowledged() {
        let supervisor = SupervisorHandle::spawn(shell("sleep 0.5; exit 3"));
        supervisor.start(config()).await.unwrap();

        let mut updates = supervisor.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            updates.wait_for(|s| s.state == StateTag::Failed),
        )
        .await
        .unwrap()
        .unwrap();

        let failed = supervisor.status();
        assert_eq!(failed.state, StateTag::Failed);
        assert_eq!(failed.exit.as_ref().unwrap().code, Some(3));

        // The read above acknowledged the failure
        tokio::time::timeout(
            Duration::from_secs(5),
            updates.wait_for(|s| s.state == StateTag::Idle),
        )
        .await
        .unwrap()
        .unwrap();
        let idle = supervisor.status();
        assert_eq!(idle.state, StateTag::Idle);
        assert_eq!(idle.exit.unwrap().code, Some(3));
        assert!(idle.last_config.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_allowed_after_failure() {
        let supervisor = SupervisorHandle::spawn(shell("exit 1"));
        assert!(supervisor.start(config()).await.is_err());
        assert!(supervisor.start(config()).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_throttled_worker_stops_gracefully() {
        let mut settings = shell("while :; do :; done");
        // Any measurable usage is over target, so the worker spends most of
        // each interval suspended
        settings.throttle = Some(ThrottleSettings {
            target_cpu_percent: 0.0,
            interval: Duration::from_millis(400),
            sample_window: Duration::from_millis(100),
        });
        let supervisor = SupervisorHandle::spawn(settings);
        supervisor.start(config()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;

        let stopped = supervisor.stop().await.unwrap();
        assert!(stopped.was_running);
        assert!(!stopped.forced);
        assert_eq!(stopped.exit.unwrap().signal, Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_write_config_requires_path() {
        let supervisor = SupervisorHandle::spawn(SupervisorSettings::default());
        let err = supervisor.write_config(config()).await.unwrap_err();
        assert_matches!(err, Error::Config { .. });
    }

    #[tokio::test]
    async fn test_write_config_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xmrig.json");
        let supervisor = SupervisorHandle::spawn(SupervisorSettings {
            xmrig_config_path: Some(path.clone()),
            ..SupervisorSettings::default()
        });

        let preview = supervisor.write_config(config()).await.unwrap();
        assert_eq!(preview.path, path);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_shutdown_closes_handle() {
        let supervisor = SupervisorHandle::spawn(SupervisorSettings::default());
        supervisor.shutdown().await.unwrap();
        let err = supervisor.stop().await.unwrap_err();
        assert_matches!(err, Error::ChannelClosed { .. });
    }
}
