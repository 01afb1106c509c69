//! Utility functions and helpers
//!
//! Formatting and small conversions shared by the API and the supervisor.

use std::time::{SystemTime, UNIX_EPOCH};

const BYTES_PER_GIB: u64 = 1024 * 1024 * 1024;

/// Get current timestamp in seconds since Unix epoch
pub fn current_timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Format bytes as a human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format duration as a human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else if seconds < 86400 {
        let hours = seconds / 3600;
        let minutes = (seconds % 3600) / 60;
        let secs = seconds % 60;
        format!("{}h {}m {}s", hours, minutes, secs)
    } else {
        let days = seconds / 86400;
        let hours = (seconds % 86400) / 3600;
        format!("{}d {}h", days, hours)
    }
}

/// Whole GiB contained in a byte count
pub fn bytes_to_gib(bytes: u64) -> u64 {
    bytes / BYTES_PER_GIB
}

/// Calculate percentage
pub fn percentage(value: f64, total: f64) -> f64 {
    if total == 0.0 {
        0.0
    } else {
        (value / total) * 100.0
    }
}

/// Shorten a wallet address for display, keeping both ends
pub fn redact_wallet(address: &str) -> String {
    const KEEP: usize = 6;
    let chars: Vec<char> = address.chars().collect();
    if chars.len() <= KEEP * 2 {
        return "*".repeat(chars.len());
    }

    let head: String = chars[..KEEP].iter().collect();
    let tail: String = chars[chars.len() - KEEP..].iter().collect();
    format!("{}...{}", head, tail)
}
