//! Mining Supervisor
//!
//! An HTTP-controlled supervisor for a single XMRig worker process:
//! - Validates mining configurations against host capacity
//! - Starts, stops and watches exactly one worker at a time
//! - Reports worker state and host resources on demand
//! - Keeps the worker's recent output for inspection

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod resources;
pub mod supervisor;
pub mod types;
pub mod utils;
pub mod validator;

pub use config::Config;
pub use error::{Error, Result};
pub use resources::{ResourceInspector, ResourceSnapshot};
pub use supervisor::{SupervisorHandle, SupervisorSettings};
pub use types::*;
pub use validator::{ConfigValidator, HostLimits, ValidationDefaults};

/// Application information
pub const APP_NAME: &str = "mining-supervisor";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
