//! Update job built from the helper's command-line arguments

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub const USAGE: &str = "Usage: DroppyUpdater <dmg_path> <app_path> <old_pid>";

/// Precondition failures, reported before any work starts
#[derive(Error, Debug, PartialEq, Eq)]
pub enum UsageError {
    #[error("expected 3 arguments, got {0}")]
    MissingArguments(usize),

    #[error("invalid process id: {0}")]
    InvalidPid(String),
}

/// One update, from disk image to installed bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateJob {
    /// Disk image holding the new bundle
    pub source_image_path: PathBuf,

    /// Where the bundle is installed
    pub destination_app_path: PathBuf,

    /// Running instance to terminate first
    pub caller_pid: i32,
}

impl UpdateJob {
    pub fn new(
        source_image_path: impl Into<PathBuf>,
        destination_app_path: impl Into<PathBuf>,
        caller_pid: i32,
    ) -> Self {
        Self {
            source_image_path: source_image_path.into(),
            destination_app_path: destination_app_path.into(),
            caller_pid,
        }
    }

    /// Build a job from positional arguments (program name excluded)
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self, UsageError> {
        let [dmg, app, pid, ..] = args else {
            return Err(UsageError::MissingArguments(args.len()));
        };

        let pid = pid.as_ref();
        let caller_pid = pid
            .trim()
            .parse::<i32>()
            .ok()
            .filter(|pid| *pid > 0)
            .ok_or_else(|| UsageError::InvalidPid(pid.to_string()))?;

        Ok(Self::new(dmg.as_ref(), app.as_ref(), caller_pid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_args() {
        let job = UpdateJob::from_args(&[
            "/tmp/Droppy.dmg",
            "/Applications/Droppy.app",
            "4242",
        ])
        .unwrap();

        assert_eq!(job.source_image_path, PathBuf::from("/tmp/Droppy.dmg"));
        assert_eq!(
            job.destination_app_path,
            PathBuf::from("/Applications/Droppy.app")
        );
        assert_eq!(job.caller_pid, 4242);
    }

    #[test]
    fn test_too_few_arguments() {
        let err = UpdateJob::from_args(&["/tmp/Droppy.dmg", "/Applications/Droppy.app"])
            .unwrap_err();
        assert_eq!(err, UsageError::MissingArguments(2));

        let none: [&str; 0] = [];
        assert_eq!(
            UpdateJob::from_args(&none).unwrap_err(),
            UsageError::MissingArguments(0)
        );
    }

    #[test]
    fn test_invalid_pid() {
        for pid in ["abc", "-1", "0", ""] {
            let err = UpdateJob::from_args(&["a.dmg", "b.app", pid]).unwrap_err();
            assert_eq!(err, UsageError::InvalidPid(pid.to_string()));
        }
    }
}
