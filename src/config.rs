//! Configuration management for the mining supervisor
//!
//! Supports configuration via command line arguments, environment variables,
//! and configuration files (YAML/JSON). Options given on the command line or
//! in the environment take precedence over the file.

use crate::supervisor::{SupervisorSettings, ThrottleSettings};
use crate::types::RawMiningConfig;
use crate::validator::ValidationDefaults;
use crate::{Error, Result};
use clap::parser::ValueSource;
use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Log output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact single-line output
    Plain,
    /// Multi-line human readable output
    Pretty,
    /// One JSON object per event
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Plain => write!(f, "plain"),
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Complete configuration for the supervisor service
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "mining-supervisor",
    version = env!("CARGO_PKG_VERSION"),
    about = "HTTP-controlled supervisor for an XMRig miner process",
    long_about = "Starts, stops and monitors a single XMRig worker process on request, reporting worker state and host resources over HTTP"
)]
pub struct Config {
    /// Print the parsed configuration and exit
    #[arg(long)]
    #[serde(skip)]
    pub print_config: bool,

    /// Write an example mining configuration to FILE and exit
    #[arg(long, value_name = "FILE")]
    #[serde(skip)]
    pub write_example_config: Option<PathBuf>,

    /// Configuration file path (YAML or JSON)
    #[arg(long, value_name = "FILE", env = "MINING_SUPERVISOR_CONFIG_FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,

    /// HTTP interface to listen on
    #[arg(short = 'i', long, default_value = "0.0.0.0", env = "MINING_SUPERVISOR_INTERFACE")]
    #[serde(default = "default_interface")]
    pub interface: String,

    /// HTTP port to listen on
    #[arg(short = 'p', long, default_value = "8000", env = "MINING_SUPERVISOR_PORT")]
    #[serde(default = "default_port")]
    pub port: u16,

    /// Allowed CORS origin ("*" for any); CORS is disabled when unset
    #[arg(long, env = "MINING_SUPERVISOR_CORS_ORIGIN")]
    #[serde(default)]
    pub cors_origin: Option<String>,

    /// Miner executable
    #[arg(short = 'm', long, default_value = "xmrig", env = "MINING_SUPERVISOR_MINER_PATH")]
    #[serde(default = "default_miner_path")]
    pub miner_path: PathBuf,

    /// Argument placed before the derived miner arguments (repeatable)
    #[arg(long = "launcher-arg", value_name = "ARG", allow_hyphen_values = true)]
    #[serde(default)]
    pub launcher_args: Vec<String>,

    /// Extra argument appended to the miner command line (repeatable)
    #[arg(long = "miner-arg", value_name = "ARG", allow_hyphen_values = true)]
    #[serde(default)]
    pub miner_args: Vec<String>,

    /// Write the XMRig JSON config here and launch with --config
    #[arg(long, value_name = "FILE", env = "MINING_SUPERVISOR_XMRIG_CONFIG")]
    #[serde(default)]
    pub xmrig_config_path: Option<PathBuf>,

    /// Wait after SIGTERM before killing the worker
    #[arg(long, default_value = "10s", env = "MINING_SUPERVISOR_GRACE_PERIOD")]
    #[serde(default = "default_grace_period")]
    pub grace_period: String,

    /// Window in which an exiting worker counts as a failed start
    #[arg(long, default_value = "1s", env = "MINING_SUPERVISOR_SPAWN_CHECK")]
    #[serde(default = "default_spawn_check")]
    pub spawn_check: String,

    /// Wait for the worker to be reaped after a forced kill
    #[arg(long, default_value = "5s", env = "MINING_SUPERVISOR_KILL_TIMEOUT")]
    #[serde(default = "default_kill_timeout")]
    pub kill_timeout: String,

    /// RAM allowance (GB) applied when a request omits cpu_ram_gb
    #[arg(long, default_value = "2", env = "MINING_SUPERVISOR_DEFAULT_CPU_RAM_GB")]
    #[serde(default = "default_cpu_ram_gb")]
    pub default_cpu_ram_gb: f64,

    /// Worker id applied when a request omits worker_id
    #[arg(long, default_value = "mining-supervisor", env = "MINING_SUPERVISOR_DEFAULT_WORKER_ID")]
    #[serde(default = "default_worker_id")]
    pub default_worker_id: String,

    /// Use TLS to the pool when a request does not say
    #[arg(long, env = "MINING_SUPERVISOR_DEFAULT_TLS")]
    #[serde(default)]
    pub default_tls: bool,

    /// Worker output lines kept in memory
    #[arg(long, default_value = "1000", env = "MINING_SUPERVISOR_LOG_BUFFER_LINES")]
    #[serde(default = "default_log_buffer_lines")]
    pub log_buffer_lines: usize,

    /// CPU usage sampling window for /status and /system ("0s" disables it)
    #[arg(long, default_value = "200ms", env = "MINING_SUPERVISOR_METRICS_SAMPLE_WINDOW")]
    #[serde(default = "default_metrics_sample_window")]
    pub metrics_sample_window: String,

    /// Suspend the worker while host CPU usage is above this percentage
    #[arg(long, value_name = "PERCENT", env = "MINING_SUPERVISOR_THROTTLE_TARGET")]
    #[serde(default)]
    pub throttle_target: Option<f32>,

    /// How often the throttle samples CPU usage
    #[arg(long, default_value = "5s", env = "MINING_SUPERVISOR_THROTTLE_INTERVAL")]
    #[serde(default = "default_throttle_interval")]
    pub throttle_interval: String,

    /// Log level
    #[arg(short = 'l', long, default_value = "info", env = "MINING_SUPERVISOR_LOG_LEVEL")]
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Log format
    #[arg(long, default_value = "plain", env = "MINING_SUPERVISOR_LOG_FORMAT")]
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Also write logs to this file
    #[arg(long, value_name = "FILE", env = "MINING_SUPERVISOR_LOG_FILE")]
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// Options a configuration file may set unless given on the command line
macro_rules! merge_fields {
    ($cli:ident, $file:ident, $explicit:ident; $($field:ident),* $(,)?) => {
        $(
            if !$explicit(stringify!($field)) {
                $cli.$field = $file.$field;
            }
        )*
    };
}

impl Config {
    /// Load configuration from the process arguments and optional file
    pub async fn load() -> Result<Self> {
        let matches = Self::command().get_matches();
        Self::from_matches(&matches).await
    }

    /// Load configuration from an explicit argument list
    pub async fn load_from<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::command()
            .try_get_matches_from(args)
            .map_err(|e| Error::config(e.to_string()))?;
        Self::from_matches(&matches).await
    }

    async fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let mut config =
            Self::from_arg_matches(matches).map_err(|e| Error::config(e.to_string()))?;

        if let Some(config_file) = config.config_file.clone() {
            let file_config = Self::load_from_file(&config_file).await?;
            let explicit = |id: &str| {
                matches!(
                    matches.value_source(id),
                    Some(ValueSource::CommandLine) | Some(ValueSource::EnvVariable)
                )
            };
            config = config.merge_with_file(file_config, explicit);
            info!(path = %config_file.display(), "Loaded configuration file");
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    async fn load_from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;

        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(Error::from)
        } else {
            // Default to YAML
            serde_yaml::from_str(&content).map_err(Error::from)
        }
    }

    /// Merge CLI config with file config (explicit CLI/env values win)
    fn merge_with_file(mut self, file: Self, explicit: impl Fn(&str) -> bool) -> Self {
        merge_fields!(self, file, explicit;
            interface,
            port,
            cors_origin,
            miner_path,
            launcher_args,
            miner_args,
            xmrig_config_path,
            grace_period,
            spawn_check,
            kill_timeout,
            default_cpu_ram_gb,
            default_worker_id,
            default_tls,
            log_buffer_lines,
            metrics_sample_window,
            throttle_target,
            throttle_interval,
            log_level,
            log_format,
            log_file,
        );
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;

        if self.miner_path.as_os_str().is_empty() {
            return Err(Error::config("Miner path must not be empty"));
        }

        self.grace_period_duration()?;
        self.spawn_check_duration()?;
        let kill_timeout = self.kill_timeout_duration()?;
        if kill_timeout.is_zero() {
            return Err(Error::config("Kill timeout must be greater than 0"));
        }
        self.metrics_sample_window_duration()?;

        if let Some(target) = self.throttle_target {
            if !target.is_finite() || target <= 0.0 || target > 100.0 {
                return Err(Error::config(
                    "Throttle target must be a percentage between 0 and 100",
                ));
            }
            if self.throttle_interval_duration()?.is_zero() {
                return Err(Error::config("Throttle interval must be greater than 0"));
            }
        }

        if !self.default_cpu_ram_gb.is_finite() || self.default_cpu_ram_gb <= 0.0 {
            return Err(Error::config("Default CPU RAM must be a positive number"));
        }

        if self.default_worker_id.trim().is_empty() {
            return Err(Error::config("Default worker id must not be empty"));
        }

        Ok(())
    }

    /// Get HTTP socket address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .interface
            .parse()
            .map_err(|e| Error::config(format!("Invalid interface address: {}", e)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Get grace period duration
    pub fn grace_period_duration(&self) -> Result<Duration> {
        parse_duration("grace period", &self.grace_period)
    }

    /// Get spawn check duration
    pub fn spawn_check_duration(&self) -> Result<Duration> {
        parse_duration("spawn check", &self.spawn_check)
    }

    /// Get kill timeout duration
    pub fn kill_timeout_duration(&self) -> Result<Duration> {
        parse_duration("kill timeout", &self.kill_timeout)
    }

    /// Get CPU sampling window
    pub fn metrics_sample_window_duration(&self) -> Result<Duration> {
        parse_duration("metrics sample window", &self.metrics_sample_window)
    }

    /// Get throttle sampling interval
    pub fn throttle_interval_duration(&self) -> Result<Duration> {
        parse_duration("throttle interval", &self.throttle_interval)
    }

    /// Throttle settings, if a target is configured
    pub fn throttle_settings(&self) -> Result<Option<ThrottleSettings>> {
        let Some(target) = self.throttle_target else {
            return Ok(None);
        };
        let interval = self.throttle_interval_duration()?;
        Ok(Some(ThrottleSettings {
            target_cpu_percent: target,
            interval,
            sample_window: interval.min(Duration::from_secs(1)),
        }))
    }

    /// Settings for the process supervisor
    pub fn supervisor_settings(&self) -> Result<SupervisorSettings> {
        Ok(SupervisorSettings {
            miner_path: self.miner_path.clone(),
            launcher_args: self.launcher_args.clone(),
            miner_args: self.miner_args.clone(),
            xmrig_config_path: self.xmrig_config_path.clone(),
            grace_period: self.grace_period_duration()?,
            spawn_check: self.spawn_check_duration()?,
            kill_timeout: self.kill_timeout_duration()?,
            log_capacity: self.log_buffer_lines,
            throttle: self.throttle_settings()?,
            ..SupervisorSettings::default()
        })
    }

    /// Defaults applied to mining requests
    pub fn validation_defaults(&self) -> ValidationDefaults {
        ValidationDefaults {
            cpu_ram_gb: self.default_cpu_ram_gb,
            worker_id: self.default_worker_id.clone(),
            tls: self.default_tls,
        }
    }
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| Error::config(format!("Invalid {} '{}': {}", name, value, e)))
}

/// Example mining request used as a template for `/start` and `/config`
pub fn example_mining_config() -> RawMiningConfig {
    RawMiningConfig {
        cpu_cores_num: Some(2),
        cpu_ram_gb: Some(default_cpu_ram_gb()),
        pool_url: Some("pool.supportxmr.com:443".to_string()),
        wallet_address: Some("YOUR_MONERO_WALLET_ADDRESS".to_string()),
        worker_id: Some("worker-01".to_string()),
        password: Some(crate::types::DEFAULT_PASSWORD.to_string()),
        tls: Some(true),
    }
}

/// Write the example mining request as pretty JSON
pub async fn write_example_config(path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(&example_mining_config())?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;
    Ok(())
}

// Default value functions for serde
fn default_interface() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8000 }
fn default_miner_path() -> PathBuf { PathBuf::from("xmrig") }
fn default_grace_period() -> String { "10s".to_string() }
fn default_spawn_check() -> String { "1s".to_string() }
fn default_kill_timeout() -> String { "5s".to_string() }
fn default_cpu_ram_gb() -> f64 { 2.0 }
fn default_worker_id() -> String { "mining-supervisor".to_string() }
fn default_log_buffer_lines() -> usize { 1000 }
fn default_metrics_sample_window() -> String { "200ms".to_string() }
fn default_throttle_interval() -> String { "5s".to_string() }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_log_format() -> LogFormat { LogFormat::Plain }

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_defaults() {
        let config = Config::try_parse_from(["mining-supervisor"]).unwrap();

        assert_eq!(config.port, 8000);
        assert_eq!(config.miner_path, PathBuf::from("xmrig"));
        assert_eq!(config.log_level, LogLevel::Info);
        assert_eq!(config.log_format, LogFormat::Plain);
        assert_eq!(config.grace_period_duration().unwrap(), Duration::from_secs(10));
        assert!(config.launcher_args.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_repeated_args() {
        let config = Config::try_parse_from([
            "mining-supervisor",
            "--launcher-arg",
            "-n",
            "--launcher-arg",
            "10",
            "--miner-arg",
            "--donate-level=1",
        ])
        .unwrap();
        assert_eq!(config.launcher_args, vec!["-n", "10"]);
        assert_eq!(config.miner_args, vec!["--donate-level=1"]);
    }

    #[tokio::test]
    async fn test_config_from_yaml() {
        let yaml_content = r#"
port: 9100
miner_path: /opt/xmrig/xmrig
grace_period: 3s
launcher_args: ["-n", "10"]
default_worker_id: rig-7
log_format: json
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", yaml_content).unwrap();

        let config = Config::load_from_file(temp_file.path()).await.unwrap();

        assert_eq!(config.port, 9100);
        assert_eq!(config.miner_path, PathBuf::from("/opt/xmrig/xmrig"));
        assert_eq!(config.grace_period_duration().unwrap(), Duration::from_secs(3));
        assert_eq!(config.launcher_args, vec!["-n", "10"]);
        assert_eq!(config.default_worker_id, "rig-7");
        assert_eq!(config.log_format, LogFormat::Json);
        // Unset options fall back to defaults
        assert_eq!(config.spawn_check, "1s");
    }

    #[tokio::test]
    async fn test_cli_overrides_file() {
        let mut temp_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(temp_file, r#"{{"port": 9100, "interface": "127.0.0.1"}}"#).unwrap();
        let path = temp_file.path().to_str().unwrap().to_string();

        let config = Config::load_from(["mining-supervisor", "--config-file", &path, "--port", "9200"])
            .await
            .unwrap();

        assert_eq!(config.port, 9200);
        assert_eq!(config.interface, "127.0.0.1");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let config = Config::try_parse_from(["mining-supervisor", "--grace-period", "soon"]).unwrap();
        assert!(config.validate().is_err());

        let config = Config::try_parse_from(["mining-supervisor", "--interface", "nowhere"]).unwrap();
        assert!(config.socket_addr().is_err());

        let config =
            Config::try_parse_from(["mining-supervisor", "--default-cpu-ram-gb", "0"]).unwrap();
        assert!(config.validate().is_err());

        let config =
            Config::try_parse_from(["mining-supervisor", "--throttle-target", "150"]).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_throttle_settings() {
        let config = Config::try_parse_from(["mining-supervisor"]).unwrap();
        assert_eq!(config.supervisor_settings().unwrap().throttle, None);

        let config = Config::try_parse_from([
            "mining-supervisor",
            "--throttle-target",
            "75",
            "--throttle-interval",
            "20s",
        ])
        .unwrap();
        assert!(config.validate().is_ok());

        let throttle = config.supervisor_settings().unwrap().throttle.unwrap();
        assert_eq!(throttle.target_cpu_percent, 75.0);
        assert_eq!(throttle.interval, Duration::from_secs(20));
        assert_eq!(throttle.sample_window, Duration::from_secs(1));
    }

    #[test]
    fn test_supervisor_settings() {
        let config = Config::try_parse_from([
            "mining-supervisor",
            "--grace-period",
            "500ms",
            "--xmrig-config-path",
            "/tmp/xmrig.json",
        ])
        .unwrap();

        let settings = config.supervisor_settings().unwrap();
        assert_eq!(settings.grace_period, Duration::from_millis(500));
        assert_eq!(settings.xmrig_config_path, Some(PathBuf::from("/tmp/xmrig.json")));
        assert_eq!(settings.log_capacity, 1000);

        let defaults = config.validation_defaults();
        assert_eq!(defaults.worker_id, "mining-supervisor");
        assert_eq!(defaults.cpu_ram_gb, 2.0);
    }

    #[tokio::test]
    async fn test_write_example_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mining.json");

        write_example_config(&path).await.unwrap();

        let raw: RawMiningConfig =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw, example_mining_config());
    }
}
