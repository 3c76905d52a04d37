//! Command Runner - quick shell commands for the Droppy terminal overlay
//!
//! This module runs a single command line in the user's login shell with:
//! - A hard wall-clock timeout
//! - An output-size ceiling
//! - Exactly-once resolution between the exit, timeout and truncation paths

pub mod config;
pub mod platform;
pub mod runner;
pub mod sandbox;

pub use config::{ConfigError, RunnerConfig, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT_SECS};
pub use platform::{Platform, UserEnvironment};
pub use runner::{CommandExecutionRequest, CommandExecutionResult, CommandRunner, RunnerError};
pub use sandbox::{Sandbox, SandboxConfig, SandboxError};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging to stderr
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "command_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
