//! Core types for the mining supervisor
//!
//! The request-side configuration shape, the validated configuration the
//! supervisor launches from, and the lifecycle/status types reported back.

use crate::utils::redact_wallet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::ExitStatus;
use uuid::Uuid;

/// Password sent to the pool when the request does not provide one
pub const DEFAULT_PASSWORD: &str = "x";

/// Mining configuration exactly as submitted, before validation
///
/// Every field is optional so that missing values are reported as field
/// errors together with all other violations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMiningConfig {
    #[serde(default)]
    pub cpu_cores_num: Option<i64>,
    #[serde(default, alias = "cpu_ram")]
    pub cpu_ram_gb: Option<f64>,
    #[serde(default)]
    pub pool_url: Option<String>,
    #[serde(default)]
    pub wallet_address: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub tls: Option<bool>,
}

/// Validated, canonical mining configuration
///
/// Only [`crate::validator::ConfigValidator`] constructs this type and it
/// has no mutators; every start request gets a fresh instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MiningConfig {
    cpu_cores_num: u32,
    cpu_ram_gb: f64,
    pool_url: String,
    wallet_address: String,
    worker_id: String,
    password: String,
    tls: bool,
}

impl MiningConfig {
    pub(crate) fn new(
        cpu_cores_num: u32,
        cpu_ram_gb: f64,
        pool_url: String,
        wallet_address: String,
        worker_id: String,
        password: String,
        tls: bool,
    ) -> Self {
        Self {
            cpu_cores_num,
            cpu_ram_gb,
            pool_url,
            wallet_address,
            worker_id,
            password,
            tls,
        }
    }

    /// Number of mining threads
    pub fn cpu_cores_num(&self) -> u32 {
        self.cpu_cores_num
    }

    pub fn cpu_ram_gb(&self) -> f64 {
        self.cpu_ram_gb
    }

    /// Pool address as `host:port`, optionally with a scheme prefix
    pub fn pool_url(&self) -> &str {
        &self.pool_url
    }

    pub fn wallet_address(&self) -> &str {
        &self.wallet_address
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    /// Display form with the wallet address truncated
    pub fn redacted(&self) -> MiningConfigView {
        MiningConfigView {
            cpu_cores_num: self.cpu_cores_num,
            cpu_ram_gb: self.cpu_ram_gb,
            pool_url: self.pool_url.clone(),
            wallet_address: redact_wallet(&self.wallet_address),
            worker_id: self.worker_id.clone(),
            tls: self.tls,
        }
    }
}

/// Configuration as shown in status responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiningConfigView {
    pub cpu_cores_num: u32,
    pub cpu_ram_gb: f64,
    pub pool_url: String,
    pub wallet_address: String,
    pub worker_id: String,
    pub tls: bool,
}

/// Lifecycle state of the single worker slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateTag {
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl StateTag {
    /// Whether a new start request may proceed from this state
    pub fn accepts_start(self) -> bool {
        matches!(self, StateTag::Idle | StateTag::Failed)
    }

    /// Whether a worker process is (or may be) alive
    pub fn is_active(self) -> bool {
        matches!(
            self,
            StateTag::Starting | StateTag::Running | StateTag::Stopping
        )
    }
}

impl fmt::Display for StateTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateTag::Idle => write!(f, "idle"),
            StateTag::Starting => write!(f, "starting"),
            StateTag::Running => write!(f, "running"),
            StateTag::Stopping => write!(f, "stopping"),
            StateTag::Failed => write!(f, "failed"),
        }
    }
}

/// How a worker process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if killed by one
    pub signal: Option<i32>,
    /// Exit code was zero
    pub success: bool,
    pub reason: String,
    pub exited_at: DateTime<Utc>,
}

impl ExitInfo {
    /// Interpret an OS exit status (nonzero code or any signal is a failure)
    pub fn from_status(status: ExitStatus) -> Self {
        let code = status.code();
        let signal = exit_signal(&status);
        let reason = match (code, signal) {
            (Some(0), _) => "worker exited with status 0".to_string(),
            (Some(code), _) => format!("worker exited with status {}", code),
            (None, Some(signal)) => format!("worker terminated by signal {}", signal),
            (None, None) => "worker terminated for an unknown reason".to_string(),
        };

        Self {
            code,
            signal,
            success: status.success(),
            reason,
            exited_at: Utc::now(),
        }
    }

    /// Exit whose status could not be collected
    pub fn unknown(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: None,
            success: false,
            reason: reason.into(),
            exited_at: Utc::now(),
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Point-in-time view of the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub state: StateTag,
    /// Failure reason while `Failed`
    pub reason: Option<String>,
    pub run_id: Option<Uuid>,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: Option<u64>,
    pub last_config: Option<MiningConfigView>,
    pub exit: Option<ExitInfo>,
}

impl SupervisorStatus {
    pub fn idle() -> Self {
        Self {
            state: StateTag::Idle,
            reason: None,
            run_id: None,
            pid: None,
            started_at: None,
            uptime_seconds: None,
            last_config: None,
            exit: None,
        }
    }
}

/// Result of a successful start
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub run_id: Uuid,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub config: MiningConfig,
}

/// Result of a stop request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopOutcome {
    pub was_running: bool,
    pub previous_state: StateTag,
    /// Worker had to be killed after the grace period
    pub forced: bool,
    pub exit: Option<ExitInfo>,
}
