//! Droppy Updater - installs a new Droppy build from a disk image
//!
//! The updater runs as a separate helper process after the app has handed
//! over. It:
//! - Terminates the running instance
//! - Mounts the update image and swaps the app bundle
//! - Clears the quarantine flag and cleans up after itself
//! - Publishes every step so a progress window can follow along

pub mod config;
pub mod installer;
pub mod job;
pub mod steps;
pub mod system;

pub use config::{ConfigError, UpdaterConfig};
pub use installer::{InstallError, Installer};
pub use job::{UpdateJob, UsageError, USAGE};
pub use steps::{InstallProgress, InstallStep};
pub use system::{MacSystem, SystemError, SystemOps, SystemResult};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging to stderr
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "droppy_updater=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
