//! Host resource inspection
//!
//! Reads CPU, memory, temperature and uptime figures on demand. Every call samples a fresh
//! `sysinfo::System`, so concurrent callers share nothing. A metric that
//! cannot be read is reported as `null` and listed in `unavailable`; the
//! snapshot itself never fails.

use crate::error::Error;
use crate::utils::{bytes_to_gib, current_timestamp_secs, format_bytes, percentage};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use sysinfo::{Components, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tracing::{debug, warn};

/// System load averages
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// Point-in-time host metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Logical cores
    pub cpu_cores: usize,
    pub physical_cores: Option<usize>,
    /// Average usage across all cores, 0-100
    pub cpu_usage_percent: Option<f32>,
    pub per_core_usage_percent: Vec<f32>,
    /// Bytes
    pub memory_total: Option<u64>,
    pub memory_used: Option<u64>,
    pub memory_available: Option<u64>,
    /// Whole GiB, for display
    pub memory_total_gb: Option<u64>,
    pub memory_available_gb: Option<u64>,
    pub memory_usage_percent: Option<f64>,
    /// Degrees Celsius of the sensor that best represents the CPU
    pub cpu_temperature: Option<f32>,
    pub uptime_seconds: Option<u64>,
    pub load_average: Option<LoadAverage>,
    pub host_name: Option<String>,
    /// Names of the fields that could not be read
    pub unavailable: Vec<String>,
    /// Unix seconds
    pub sampled_at: u64,
}

/// Raw figures as read from the platform, before degradation rules apply
#[derive(Debug, Clone, Default)]
struct Readings {
    logical_cores: usize,
    physical_cores: Option<usize>,
    per_core_usage: Vec<f32>,
    cpu_sampled: bool,
    memory_total: u64,
    memory_used: u64,
    memory_available: u64,
    /// Sensor label and reading
    temperatures: Vec<(String, f32)>,
    uptime: u64,
    load_average: Option<LoadAverage>,
    host_name: Option<String>,
}

impl ResourceSnapshot {
    fn from_readings(readings: Readings) -> Self {
        let mut unavailable = Vec::new();

        let cpu_usage_percent = if readings.cpu_sampled && !readings.per_core_usage.is_empty() {
            let sum: f32 = readings.per_core_usage.iter().sum();
            Some(sum / readings.per_core_usage.len() as f32)
        } else {
            unavailable.push("cpu_usage_percent".to_string());
            None
        };

        // sysinfo reports zero when /proc/meminfo (or its equivalent) is unreadable
        let (memory_total, memory_used, memory_available) = if readings.memory_total > 0 {
            (
                Some(readings.memory_total),
                Some(readings.memory_used),
                Some(readings.memory_available),
            )
        } else {
            unavailable.extend(
                ["memory_total", "memory_used", "memory_available"]
                    .iter()
                    .map(|s| s.to_string()),
            );
            (None, None, None)
        };

        let cpu_temperature = cpu_temperature(&readings.temperatures);
        if cpu_temperature.is_none() {
            unavailable.push("cpu_temperature".to_string());
        }

        let uptime_seconds = if readings.uptime > 0 {
            Some(readings.uptime)
        } else {
            unavailable.push("uptime_seconds".to_string());
            None
        };

        if readings.load_average.is_none() {
            unavailable.push("load_average".to_string());
        }

        Self {
            cpu_cores: readings.logical_cores,
            physical_cores: readings.physical_cores,
            cpu_usage_percent,
            per_core_usage_percent: if readings.cpu_sampled {
                readings.per_core_usage
            } else {
                Vec::new()
            },
            memory_total,
            memory_used,
            memory_available,
            memory_total_gb: memory_total.map(bytes_to_gib),
            memory_available_gb: memory_available.map(bytes_to_gib),
            memory_usage_percent: memory_total
                .zip(memory_used)
                .map(|(total, used)| percentage(used as f64, total as f64)),
            cpu_temperature,
            uptime_seconds,
            load_average: readings.load_average,
            host_name: readings.host_name,
            unavailable,
            sampled_at: current_timestamp_secs(),
        }
    }

    /// Snapshot used when sampling itself could not run
    pub fn unavailable() -> Self {
        Self::from_readings(Readings {
            logical_cores: num_cpus::get(),
            ..Readings::default()
        })
    }
}

/// Sensor labels that identify the CPU package, most specific first
const CPU_SENSOR_HINTS: [&str; 5] = ["package", "tctl", "tdie", "coretemp", "cpu"];

/// Pick the CPU reading among the host's sensors
///
/// Falls back to the first usable reading when no label looks like a CPU.
fn cpu_temperature(sensors: &[(String, f32)]) -> Option<f32> {
    let usable: Vec<_> = sensors
        .iter()
        .filter(|(_, celsius)| celsius.is_finite() && *celsius > 0.0)
        .collect();

    CPU_SENSOR_HINTS
        .iter()
        .find_map(|hint| {
            usable
                .iter()
                .find(|(label, _)| label.to_lowercase().contains(hint))
        })
        .or_else(|| usable.first())
        .map(|(_, celsius)| *celsius)
}

/// Stateless reader of host metrics
#[derive(Debug, Clone)]
pub struct ResourceInspector {
    cpu_sample_window: Duration,
}

impl ResourceInspector {
    /// Create an inspector; CPU usage is measured over `cpu_sample_window`
    ///
    /// A zero window skips CPU usage sampling. Non-zero windows are raised to
    /// sysinfo's minimum update interval.
    pub fn new(cpu_sample_window: Duration) -> Self {
        let cpu_sample_window = if cpu_sample_window.is_zero() {
            cpu_sample_window
        } else {
            cpu_sample_window.max(MINIMUM_CPU_UPDATE_INTERVAL)
        };
        Self { cpu_sample_window }
    }

    pub fn cpu_sample_window(&self) -> Duration {
        self.cpu_sample_window
    }

    /// Take a snapshot of the host
    pub async fn snapshot(&self) -> ResourceSnapshot {
        let window = self.cpu_sample_window;
        match tokio::task::spawn_blocking(move || read_host(window)).await {
            Ok(readings) => ResourceSnapshot::from_readings(readings),
            Err(e) => {
                let err = Error::metrics_unavailable(format!("sampling task failed: {}", e));
                warn!("{}", err);
                ResourceSnapshot::unavailable()
            }
        }
    }
}

impl Default for ResourceInspector {
    fn default() -> Self {
        Self::new(MINIMUM_CPU_UPDATE_INTERVAL)
    }
}

fn read_host(cpu_window: Duration) -> Readings {
    let mut sys = System::new();

    let cpu_sampled = !cpu_window.is_zero();
    if cpu_sampled {
        // Usage is a delta between two refreshes
        sys.refresh_cpu_usage();
        std::thread::sleep(cpu_window);
        sys.refresh_cpu_usage();
    }
    sys.refresh_memory();

    let load = System::load_average();
    let load_average = if cfg!(unix) {
        Some(LoadAverage {
            one: load.one,
            five: load.five,
            fifteen: load.fifteen,
        })
    } else {
        None
    };

    let temperatures = Components::new_with_refreshed_list()
        .list()
        .iter()
        .map(|component| (component.label().to_string(), component.temperature()))
        .collect();

    let physical = num_cpus::get_physical();
    let readings = Readings {
        logical_cores: num_cpus::get(),
        physical_cores: (physical > 0).then_some(physical),
        per_core_usage: sys.cpus().iter().map(|cpu| cpu.cpu_usage()).collect(),
        cpu_sampled,
        memory_total: sys.total_memory(),
        memory_used: sys.used_memory(),
        memory_available: sys.available_memory(),
        temperatures,
        uptime: System::uptime(),
        load_average,
        host_name: System::host_name(),
    };

    debug!(
        cores = readings.logical_cores,
        memory_total = %format_bytes(readings.memory_total),
        "Sampled host metrics"
    );
    readings
}
