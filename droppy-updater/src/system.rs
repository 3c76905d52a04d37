//! Operating-system side effects used by the installer
//!
//! Everything the installer does to processes, volumes and files goes
//! through [`SystemOps`], so the step machine can be driven against fakes.

use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Failure of a single OS call or external tool
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SystemError {
    #[error("{tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("{0}: {1}")]
    Io(PathBuf, String),

    #[error("Signal to process {0} failed: {1}")]
    Signal(i32, String),

    #[error("Not supported on this platform")]
    NotSupported,
}

impl SystemError {
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        SystemError::ToolFailed {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

pub type SystemResult<T> = Result<T, SystemError>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SystemOps: Send + Sync {
    /// Forcefully terminate a process
    async fn terminate_process(&self, pid: i32) -> SystemResult<()>;

    /// Whether a process with this id still exists
    async fn is_process_running(&self, pid: i32) -> bool;

    /// Attach a disk image at a fixed mount point
    async fn attach_image(&self, image: &Path, mount_point: &Path) -> SystemResult<()>;

    /// Detach whatever is mounted at the mount point
    async fn detach_image(&self, mount_point: &Path) -> SystemResult<()>;

    async fn path_exists(&self, path: &Path) -> bool;

    /// Remove a file or directory tree with the current privileges
    async fn remove_path(&self, path: &Path) -> SystemResult<()>;

    /// Remove a file or directory tree after asking for administrator rights
    async fn remove_path_elevated(&self, path: &Path) -> SystemResult<()>;

    /// Copy an app bundle, preserving links and metadata
    async fn copy_bundle(&self, from: &Path, to: &Path) -> SystemResult<()>;

    /// Clear the download quarantine flag recursively
    async fn strip_quarantine(&self, path: &Path) -> SystemResult<()>;

    async fn remove_file(&self, path: &Path) -> SystemResult<()>;

    /// Show a location in the file browser
    async fn reveal_in_file_browser(&self, path: &Path) -> SystemResult<()>;

    /// Launch an installed app bundle
    async fn launch_app(&self, path: &Path) -> SystemResult<()>;
}

/// Real implementation backed by macOS tools
#[derive(Debug, Clone, Default)]
pub struct MacSystem;

impl MacSystem {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a tool from PATH, falling back to its usual location
    fn tool_path(name: &str, fallback: &str) -> PathBuf {
        which::which(name).unwrap_or_else(|_| PathBuf::from(fallback))
    }

    /// Run a tool to completion, turning a non-zero exit into an error
    async fn run_tool(name: &str, fallback: &str, args: &[&OsStr]) -> SystemResult<()> {
        let program = Self::tool_path(name, fallback);
        debug!(tool = %program.display(), ?args, "Running tool");

        let output = Command::new(&program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SystemError::tool(name, e.to_string()))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("exited with {}", output.status)
        } else {
            stderr
        };

        Err(SystemError::tool(name, message))
    }
}

/// AppleScript that removes `path` with administrator privileges
pub fn elevated_remove_script(path: &Path) -> String {
    let quoted = shell_quote(&path.to_string_lossy());
    let escaped = quoted.replace('\\', "\\\\").replace('"', "\\\"");

    format!(
        "do shell script \"rm -rf {}\" with administrator privileges",
        escaped
    )
}

/// Single-quote a string for /bin/sh
fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "'\\''"))
}

#[async_trait]
impl SystemOps for MacSystem {
    #[cfg(unix)]
    async fn terminate_process(&self, pid: i32) -> SystemResult<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(pid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(SystemError::Signal(pid, e.to_string())),
        }
    }

    #[cfg(not(unix))]
    async fn terminate_process(&self, _pid: i32) -> SystemResult<()> {
        Err(SystemError::NotSupported)
    }

    #[cfg(unix)]
    async fn is_process_running(&self, pid: i32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // EPERM means the process exists but belongs to someone else
        matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
    }

    #[cfg(not(unix))]
    async fn is_process_running(&self, _pid: i32) -> bool {
        false
    }

    async fn attach_image(&self, image: &Path, mount_point: &Path) -> SystemResult<()> {
        Self::run_tool(
            "hdiutil",
            "/usr/bin/hdiutil",
            &[
                OsStr::new("attach"),
                image.as_os_str(),
                OsStr::new("-mountpoint"),
                mount_point.as_os_str(),
                OsStr::new("-nobrowse"),
                OsStr::new("-noautoopen"),
                OsStr::new("-quiet"),
            ],
        )
        .await
    }

    async fn detach_image(&self, mount_point: &Path) -> SystemResult<()> {
        Self::run_tool(
            "hdiutil",
            "/usr/bin/hdiutil",
            &[
                OsStr::new("detach"),
                mount_point.as_os_str(),
                OsStr::new("-force"),
                OsStr::new("-quiet"),
            ],
        )
        .await
    }

    async fn path_exists(&self, path: &Path) -> bool {
        tokio::fs::symlink_metadata(path).await.is_ok()
    }

    async fn remove_path(&self, path: &Path) -> SystemResult<()> {
        let metadata = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|e| SystemError::Io(path.to_path_buf(), e.to_string()))?;

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };

        result.map_err(|e| SystemError::Io(path.to_path_buf(), e.to_string()))
    }

    async fn remove_path_elevated(&self, path: &Path) -> SystemResult<()> {
        let script = elevated_remove_script(path);

        Self::run_tool(
            "osascript",
            "/usr/bin/osascript",
            &[OsStr::new("-e"), OsStr::new(&script)],
        )
        .await
    }

    async fn copy_bundle(&self, from: &Path, to: &Path) -> SystemResult<()> {
        Self::run_tool(
            "ditto",
            "/usr/bin/ditto",
            &[from.as_os_str(), to.as_os_str()],
        )
        .await
    }

    async fn strip_quarantine(&self, path: &Path) -> SystemResult<()> {
        Self::run_tool(
            "xattr",
            "/usr/bin/xattr",
            &[OsStr::new("-dr"), OsStr::new("com.apple.quarantine"), path.as_os_str()],
        )
        .await
    }

    async fn remove_file(&self, path: &Path) -> SystemResult<()> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| SystemError::Io(path.to_path_buf(), e.to_string()))
    }

    async fn reveal_in_file_browser(&self, path: &Path) -> SystemResult<()> {
        Self::run_tool("open", "/usr/bin/open", &[path.as_os_str()]).await
    }

    async fn launch_app(&self, path: &Path) -> SystemResult<()> {
        Self::run_tool("open", "/usr/bin/open", &[path.as_os_str()]).await
    }
}
