//! Platform and user environment detection for the login shell

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Platform identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    Linux,
    MacOS,
    Unknown,
}

impl Platform {
    /// Get current platform
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOS
        } else {
            Platform::Unknown
        }
    }

    /// Get platform name as string
    pub fn name(&self) -> &str {
        match self {
            Platform::Linux => "linux",
            Platform::MacOS => "macos",
            Platform::Unknown => "unknown",
        }
    }

    /// Shell used when neither the passwd entry nor `$SHELL` names one
    pub fn default_shell(&self) -> &str {
        match self {
            Platform::MacOS => "/bin/zsh",
            Platform::Linux | Platform::Unknown => "/bin/sh",
        }
    }
}

/// The invoking user's home directory and login shell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEnvironment {
    /// Home directory, used as the working directory of every command
    pub home_dir: PathBuf,

    /// Absolute path of the login shell
    pub shell: PathBuf,
}

impl UserEnvironment {
    /// Resolve the current user's environment
    pub fn detect() -> Self {
        let platform = Platform::current();
        let account = Self::account_entry();

        let home_dir = account
            .as_ref()
            .map(|(home, _)| home.clone())
            .filter(|home| !home.as_os_str().is_empty())
            .or_else(|| env::var_os("HOME").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("/"));

        let shell = account
            .map(|(_, shell)| shell)
            .filter(|shell| !shell.as_os_str().is_empty())
            .or_else(|| env::var_os("SHELL").map(PathBuf::from))
            .and_then(|shell| Self::resolve_shell(&shell))
            .unwrap_or_else(|| PathBuf::from(platform.default_shell()));

        debug!(home = %home_dir.display(), shell = %shell.display(), "Detected user environment");

        Self { home_dir, shell }
    }

    /// Resolve a shell name to an absolute path, looking it up in PATH if needed
    pub fn resolve_shell(shell: &Path) -> Option<PathBuf> {
        if shell.is_absolute() {
            return Some(shell.to_path_buf());
        }

        which::which(shell).ok()
    }

    #[cfg(unix)]
    fn account_entry() -> Option<(PathBuf, PathBuf)> {
        use nix::unistd::{Uid, User};

        match User::from_uid(Uid::current()) {
            Ok(Some(user)) => Some((user.dir, user.shell)),
            Ok(None) => None,
            Err(e) => {
                debug!("passwd lookup failed: {}", e);
                None
            }
        }
    }

    #[cfg(not(unix))]
    fn account_entry() -> Option<(PathBuf, PathBuf)> {
        None
    }
}
