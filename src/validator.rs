//! Mining configuration validation
//!
//! Turns a [`RawMiningConfig`] into a canonical [`MiningConfig`], reporting
//! every violated field at once. The only host input is the detected core
//! count (and total memory when known), captured in [`HostLimits`].

use crate::error::{Error, Result, ValidationErrors};
use crate::types::{MiningConfig, RawMiningConfig, DEFAULT_PASSWORD};
use sysinfo::System;
use tracing::debug;

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Monero base58 alphabet (no 0, O, I, l)
const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Standard and subaddress length
const WALLET_LEN_STANDARD: usize = 95;
/// Integrated address length
const WALLET_LEN_INTEGRATED: usize = 106;

/// Host capacity a configuration is checked against
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostLimits {
    /// Logical cores available for mining threads
    pub logical_cores: usize,
    /// Total physical memory, if it could be read
    pub memory_total_bytes: Option<u64>,
}

impl HostLimits {
    /// Read the limits of the current host
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let total = sys.total_memory();

        let limits = Self {
            logical_cores: num_cpus::get(),
            memory_total_bytes: (total > 0).then_some(total),
        };
        debug!(
            logical_cores = limits.logical_cores,
            memory_total_bytes = ?limits.memory_total_bytes,
            "Detected host limits"
        );
        limits
    }

    pub fn new(logical_cores: usize, memory_total_bytes: Option<u64>) -> Self {
        Self {
            logical_cores,
            memory_total_bytes,
        }
    }

    fn memory_total_gb(&self) -> Option<f64> {
        self.memory_total_bytes.map(|b| b as f64 / BYTES_PER_GIB)
    }
}

/// Values applied to optional fields the request leaves out
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationDefaults {
    pub cpu_ram_gb: f64,
    pub worker_id: String,
    pub tls: bool,
}

impl Default for ValidationDefaults {
    fn default() -> Self {
        Self {
            cpu_ram_gb: 2.0,
            worker_id: "mining-supervisor".to_string(),
            tls: false,
        }
    }
}

/// Validates submitted mining configurations
#[derive(Debug, Clone)]
pub struct ConfigValidator {
    limits: HostLimits,
    defaults: ValidationDefaults,
}

impl ConfigValidator {
    pub fn new(limits: HostLimits, defaults: ValidationDefaults) -> Self {
        Self { limits, defaults }
    }

    pub fn limits(&self) -> HostLimits {
        self.limits
    }

    /// Validate a raw configuration, collecting all violations
    pub fn validate(&self, raw: &RawMiningConfig) -> Result<MiningConfig> {
        let mut errors = ValidationErrors::new();

        let cpu_cores_num = self.check_cores(raw.cpu_cores_num, &mut errors);
        let cpu_ram_gb = self.check_ram(raw.cpu_ram_gb, &mut errors);
        let pool_url = check_pool_url(raw.pool_url.as_deref(), &mut errors);
        let wallet_address = check_wallet(raw.wallet_address.as_deref(), &mut errors);

        let worker_id = match raw.worker_id.as_deref().map(str::trim) {
            None => self.defaults.worker_id.clone(),
            Some("") => {
                errors.push("worker_id", "must not be empty");
                String::new()
            }
            Some(id) => id.to_string(),
        };

        let password = match raw.password.as_deref() {
            None | Some("") => DEFAULT_PASSWORD.to_string(),
            Some(password) => password.to_string(),
        };

        if !errors.is_empty() {
            debug!(fields = %errors, "Rejected mining configuration");
            return Err(Error::Validation(errors));
        }

        Ok(MiningConfig::new(
            cpu_cores_num,
            cpu_ram_gb,
            pool_url,
            wallet_address,
            worker_id,
            password,
            raw.tls.unwrap_or(self.defaults.tls),
        ))
    }

    fn check_cores(&self, value: Option<i64>, errors: &mut ValidationErrors) -> u32 {
        let Some(cores) = value else {
            errors.push("cpu_cores_num", "is required");
            return 0;
        };

        if cores <= 0 {
            errors.push("cpu_cores_num", "must be a positive integer");
            return 0;
        }

        if cores as u64 > self.limits.logical_cores as u64 {
            errors.push(
                "cpu_cores_num",
                format!(
                    "{} exceeds the {} logical cores available on this host",
                    cores, self.limits.logical_cores
                ),
            );
            return 0;
        }

        cores as u32
    }

    fn check_ram(&self, value: Option<f64>, errors: &mut ValidationErrors) -> f64 {
        let ram = value.unwrap_or(self.defaults.cpu_ram_gb);

        if !ram.is_finite() || ram <= 0.0 {
            errors.push("cpu_ram_gb", "must be a positive number");
            return 0.0;
        }

        if let Some(total) = self.limits.memory_total_gb() {
            if ram > total {
                errors.push(
                    "cpu_ram_gb",
                    format!("{} exceeds the {:.1} GB of memory on this host", ram, total),
                );
            }
        }

        ram
    }
}

fn check_pool_url(value: Option<&str>, errors: &mut ValidationErrors) -> String {
    let url = match value.map(str::trim) {
        None | Some("") => {
            errors.push("pool_url", "is required");
            return String::new();
        }
        Some(url) => url,
    };

    if let Err(message) = split_pool_url(url) {
        errors.push("pool_url", message);
    }

    url.to_string()
}

/// Split a pool address into host and port, ignoring a `scheme://` prefix
pub fn split_pool_url(url: &str) -> std::result::Result<(&str, u16), String> {
    let address = match url.split_once("://") {
        Some((scheme, rest)) => {
            let valid_scheme = !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
            if !valid_scheme {
                return Err(format!("has an invalid scheme '{}'", scheme));
            }
            rest
        }
        None => url,
    };

    let Some((host, port)) = address.rsplit_once(':') else {
        return Err("must be in host:port form".to_string());
    };

    if host.is_empty() || host.contains(|c: char| c.is_whitespace() || c == '/') {
        return Err(format!("has an invalid host '{}'", host));
    }

    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("has an invalid port '{}'", port)),
        Ok(port) => Ok((host, port)),
    }
}

fn check_wallet(value: Option<&str>, errors: &mut ValidationErrors) -> String {
    let wallet = match value.map(str::trim) {
        None | Some("") => {
            errors.push("wallet_address", "is required");
            return String::new();
        }
        Some(wallet) => wallet,
    };

    if !is_monero_address_shape(wallet) {
        errors.push(
            "wallet_address",
            format!(
                "must be a Monero address: {} or {} base58 characters starting with 4 or 8",
                WALLET_LEN_STANDARD, WALLET_LEN_INTEGRATED
            ),
        );
    }

    wallet.to_string()
}

/// Shape check only; the checksum is not verified
///
/// Addresses must be complete. An elided form such as `4Ab9...`, as used
/// in documentation, fails on both length and alphabet.
pub fn is_monero_address_shape(address: &str) -> bool {
    let len_ok = matches!(address.len(), WALLET_LEN_STANDARD | WALLET_LEN_INTEGRATED);
    let prefix_ok = address.starts_with('4') || address.starts_with('8');
    let alphabet_ok = address.chars().all(|c| BASE58_ALPHABET.contains(c));

    len_ok && prefix_ok && alphabet_ok
}
