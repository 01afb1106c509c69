//! Worker process control
//!
//! Derives the command line from a validated configuration, spawns the
//! worker with its output drained into a [`LogBuffer`], and hands back a
//! [`WorkerProcess`] whose exit is observed by a dedicated watcher task.
//!
//! On unix the worker leads its own process group. Signals address the
//! whole group, so processes started by a wrapper in `launcher_args` are
//! stopped with it. Only the watcher, which owns and reaps the child,
//! delivers signals, and it stops doing so once the child is reaped.

use super::logs::{LogBuffer, OutputLineCodec, OutputStream};
use super::SupervisorSettings;
use crate::error::{Error, Result};
use crate::types::{ExitInfo, MiningConfig};
use futures::StreamExt;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

/// Program and arguments used to launch the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LaunchCommand {
    /// Derive the command line; the same inputs always give the same command
    pub fn build(settings: &SupervisorSettings, config: &MiningConfig) -> Self {
        let mut args = settings.launcher_args.clone();

        if let Some(path) = &settings.xmrig_config_path {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        } else {
            args.extend([
                "--url".to_string(),
                config.pool_url().to_string(),
                "--user".to_string(),
                config.wallet_address().to_string(),
                "--pass".to_string(),
                config.password().to_string(),
                "--rig-id".to_string(),
                config.worker_id().to_string(),
                "--threads".to_string(),
                config.cpu_cores_num().to_string(),
                "--coin".to_string(),
                "monero".to_string(),
                "--no-color".to_string(),
            ]);
            if config.tls() {
                args.push("--tls".to_string());
            }
        }

        args.extend(settings.miner_args.iter().cloned());

        Self {
            program: settings.miner_path.clone(),
            args,
        }
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        let mut hide_next = false;
        for arg in &self.args {
            if hide_next {
                write!(f, " ***")?;
                hide_next = false;
            } else {
                write!(f, " {}", arg)?;
                hide_next = arg == "--pass";
            }
        }
        Ok(())
    }
}

/// Signals the watcher can deliver to the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// SIGTERM, followed by SIGCONT so a suspended worker can act on it
    Terminate,
    Kill,
    Suspend,
    Resume,
}

/// Cloneable sender of signals to a live worker
#[derive(Debug, Clone)]
pub struct WorkerControl {
    tx: mpsc::UnboundedSender<WorkerSignal>,
}

impl WorkerControl {
    /// Queue `signal`; false once the worker has been reaped
    pub fn signal(&self, signal: WorkerSignal) -> bool {
        self.tx.send(signal).is_ok()
    }

    pub fn suspend(&self) -> bool {
        self.signal(WorkerSignal::Suspend)
    }

    pub fn resume(&self) -> bool {
        self.signal(WorkerSignal::Resume)
    }

    /// Resolves once the worker has been reaped
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// A spawned worker
///
/// The OS child handle lives in the watcher task; this side keeps the pid,
/// the exit notification and the kill switch. Dropping it kills the child.
#[derive(Debug)]
pub struct WorkerProcess {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    control: WorkerControl,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl WorkerProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Receiver that turns `Some` once the worker has exited
    pub fn exit_receiver(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// Exit info if the worker already terminated
    pub fn exit_now(&self) -> Option<ExitInfo> {
        self.exit_rx.borrow().clone()
    }

    pub fn control(&self) -> WorkerControl {
        self.control.clone()
    }

    /// Wait until the watcher reports the exit
    pub async fn wait_exit(&self) -> ExitInfo {
        wait_for_exit(self.exit_rx.clone()).await
    }

    /// Ask the worker to exit, forcing it after `grace`
    ///
    /// Returns the exit and whether the kill was forced.
    pub async fn terminate(&mut self, grace: Duration, kill_timeout: Duration) -> (ExitInfo, bool) {
        if let Some(exit) = self.exit_now() {
            return (exit, false);
        }

        let grace = if cfg!(unix) && self.control.signal(WorkerSignal::Terminate) {
            grace
        } else {
            Duration::ZERO
        };

        if let Ok(exit) = timeout(grace, self.wait_exit()).await {
            return (exit, false);
        }

        warn!(
            pid = ?self.pid,
            grace_ms = grace.as_millis() as u64,
            "Worker still running after grace period, killing"
        );
        if let Some(kill) = self.kill_tx.take() {
            let _ = kill.send(());
        }

        match timeout(kill_timeout, self.wait_exit()).await {
            Ok(exit) => (exit, true),
            Err(_) => {
                let err = Error::timeout("waiting for the killed worker to exit");
                warn!(pid = ?self.pid, "{}", err);
                (ExitInfo::unknown(err.to_string()), true)
            }
        }
    }
}

/// Wait on an exit receiver until it carries a value
pub async fn wait_for_exit(mut exit_rx: watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    let exit = match exit_rx.wait_for(Option::is_some).await {
        Ok(exit) => exit.clone(),
        Err(_) => None,
    };
    exit.unwrap_or_else(|| ExitInfo::unknown("worker watcher stopped without an exit status"))
}

#[cfg(unix)]
fn signal_group(pgid: libc::pid_t, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions
    let ret = unsafe { libc::kill(-pgid, signal) };
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Deliver `signal` to an unreaped child and its process group
#[cfg(unix)]
fn deliver(child: &mut Child, pgid: Option<libc::pid_t>, signal: WorkerSignal) -> io::Result<()> {
    let Some(pgid) = pgid else {
        return match signal {
            WorkerSignal::Kill => child.start_kill(),
            _ => Ok(()),
        };
    };

    match signal {
        WorkerSignal::Terminate => {
            signal_group(pgid, libc::SIGTERM)?;
            signal_group(pgid, libc::SIGCONT)
        }
        WorkerSignal::Kill => signal_group(pgid, libc::SIGKILL),
        WorkerSignal::Suspend => signal_group(pgid, libc::SIGSTOP),
        WorkerSignal::Resume => signal_group(pgid, libc::SIGCONT),
    }
}

#[cfg(not(unix))]
fn deliver(child: &mut Child, _pgid: Option<i32>, signal: WorkerSignal) -> io::Result<()> {
    match signal {
        WorkerSignal::Kill => child.start_kill(),
        _ => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "only forced termination is supported on this platform",
        )),
    }
}

/// Launch the worker and start its watcher and output drains
pub fn spawn_worker(launch: &LaunchCommand, logs: LogBuffer) -> Result<WorkerProcess> {
    debug!(command = %launch, "Spawning worker");

    let mut command = Command::new(&launch.program);
    command
        .args(&launch.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|e| Error::spawn(spawn_failure_reason(&launch.program, &e)))?;

    let pid = child.id();
    // The child leads a new group whose id is its pid
    let pgid = pid.and_then(|pid| i32::try_from(pid).ok());

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(drain(stdout, OutputStream::Stdout, logs.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain(stderr, OutputStream::Stderr, logs));
    }

    let (exit_tx, exit_rx) = watch::channel(None);
    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                // Fires on an explicit kill and when the WorkerProcess is dropped
                _ = &mut kill_rx => {
                    if let Err(e) = deliver(&mut child, pgid, WorkerSignal::Kill) {
                        warn!(pid = ?pid, "Failed to kill worker: {}", e);
                    }
                    break child.wait().await;
                }
                Some(signal) = signal_rx.recv() => {
                    debug!(pid = ?pid, ?signal, "Signalling worker");
                    if let Err(e) = deliver(&mut child, pgid, signal) {
                        warn!(pid = ?pid, ?signal, "Failed to signal worker: {}", e);
                    }
                }
            }
        };
        // No more signals once the leader is reaped
        drop(signal_rx);

        // Whatever the leader left behind in its group goes with it
        #[cfg(unix)]
        if let Some(pgid) = pgid {
            if signal_group(pgid, libc::SIGKILL).is_ok() {
                debug!(pid = ?pid, "Killed processes left in the worker group");
            }
        }

        let exit = match status {
            Ok(status) => ExitInfo::from_status(status),
            Err(e) => ExitInfo::unknown(format!("failed to collect worker exit status: {}", e)),
        };
        info!(pid = ?pid, code = ?exit.code, signal = ?exit.signal, "Worker exited");
        let _ = exit_tx.send(Some(exit));
    });

    info!(pid = ?pid, program = %launch.program.display(), "Worker spawned");

    Ok(WorkerProcess {
        pid,
        exit_rx,
        control: WorkerControl { tx: signal_tx },
        kill_tx: Some(kill_tx),
    })
}

fn spawn_failure_reason(program: &std::path::Path, err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => format!("executable not found: {}", program.display()),
        io::ErrorKind::PermissionDenied => {
            format!("permission denied executing {}", program.display())
        }
        _ => format!("could not execute {}: {}", program.display(), err),
    }
}

/// Read a pipe to EOF so the worker never blocks on a full buffer
async fn drain<R>(pipe: R, stream: OutputStream, logs: LogBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut lines = FramedRead::new(pipe, OutputLineCodec::default());

    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                debug!(target: "worker_output", ?stream, "{}", line);
                logs.push(stream, line);
            }
            Err(e) => {
                warn!(?stream, "Stopped reading worker output: {}", e);
                break;
            }
        }
    }
}
