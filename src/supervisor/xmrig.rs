//! XMRig configuration file generation
//!
//! Builds the JSON document XMRig reads with `--config`, derived from a
//! validated [`MiningConfig`].

use crate::error::Result;
use crate::types::MiningConfig;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::info;

/// Summary of a generated configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct XmrigPreview {
    pub path: PathBuf,
    pub cpu_threads: u32,
    /// Huge-page memory pool size
    pub memory_pool: u64,
    pub pool_url: String,
}

/// Memory pool entries: 2 per thread, bounded by half the RAM allowance in MB
pub fn memory_pool(config: &MiningConfig) -> u64 {
    let threads = u64::from(config.cpu_cores_num());
    let ram_bound = (config.cpu_ram_gb() * 1024.0 / 2.0).floor().max(0.0) as u64;
    ram_bound.min(threads * 2)
}

/// Generate the XMRig JSON configuration
pub fn generate(config: &MiningConfig) -> Value {
    let threads = config.cpu_cores_num() as usize;
    // -1 leaves thread affinity to the OS
    let rx_threads: Vec<i32> = vec![-1; threads];

    json!({
        "api": {
            "id": null,
            "worker-id": config.worker_id(),
        },
        "http": {
            "enabled": false,
        },
        "autosave": false,
        "background": false,
        "colors": false,
        "randomx": {
            "init": -1,
            "mode": "auto",
            "1gb-pages": false,
            "numa": true,
        },
        "cpu": {
            "enabled": true,
            "huge-pages": true,
            "memory-pool": memory_pool(config),
            "max-threads-hint": 100,
            "rx": rx_threads,
        },
        "opencl": { "enabled": false },
        "cuda": { "enabled": false },
        "pools": [
            {
                "coin": "monero",
                "url": config.pool_url(),
                "user": config.wallet_address(),
                "pass": config.password(),
                "rig-id": config.worker_id(),
                "keepalive": true,
                "enabled": true,
                "tls": config.tls(),
            }
        ],
        "print-time": 60,
        "health-print-time": 60,
        "retries": 5,
        "retry-pause": 5,
        "syslog": false,
        "watch": false,
        "pause-on-battery": false,
        "pause-on-active": false,
    })
}

/// Write the generated configuration to `path`
pub async fn write(path: &Path, config: &MiningConfig) -> Result<XmrigPreview> {
    let document = generate(config);
    let bytes = serde_json::to_vec_pretty(&document)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await?;

    info!(path = %path.display(), "Wrote XMRig configuration");

    Ok(XmrigPreview {
        path: path.to_path_buf(),
        cpu_threads: config.cpu_cores_num(),
        memory_pool: memory_pool(config),
        pool_url: config.pool_url().to_string(),
    })
}
