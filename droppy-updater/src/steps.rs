//! Install steps and the observable progress state

use serde::{Deserialize, Serialize};
use std::fmt;

/// Installer steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStep {
    /// Terminate the running instance
    Closing,

    /// Attach the disk image
    Mounting,

    /// Delete the old bundle
    Removing,

    /// Copy the new bundle and clear quarantine
    Installing,

    /// Detach the image and delete the image file
    Cleaning,

    /// Terminal success
    Complete,
}

impl InstallStep {
    /// All steps in order
    pub const ALL: [InstallStep; 6] = [
        InstallStep::Closing,
        InstallStep::Mounting,
        InstallStep::Removing,
        InstallStep::Installing,
        InstallStep::Cleaning,
        InstallStep::Complete,
    ];

    /// Zero-based position, for progress bars
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// The step after this one, `None` once complete
    pub fn next(&self) -> Option<InstallStep> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Text shown next to the progress indicator
    pub fn title(&self) -> &'static str {
        match self {
            InstallStep::Closing => "Closing Droppy...",
            InstallStep::Mounting => "Mounting update...",
            InstallStep::Removing => "Removing old version...",
            InstallStep::Installing => "Installing new version...",
            InstallStep::Cleaning => "Cleaning up...",
            InstallStep::Complete => "Update complete!",
        }
    }
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// What observers see: the current step, and an error once one occurred
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallProgress {
    pub step: InstallStep,
    pub error: Option<String>,
}

impl InstallProgress {
    pub fn started() -> Self {
        Self {
            step: InstallStep::Closing,
            error: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.step == InstallStep::Complete && self.error.is_none()
    }

    /// No further transitions will be published
    pub fn is_terminal(&self) -> bool {
        self.is_failed() || self.step == InstallStep::Complete
    }

    /// Fraction of the run finished, in `0.0..=1.0`
    pub fn fraction(&self) -> f32 {
        self.step.index() as f32 / InstallStep::Complete.index() as f32
    }
}

impl Default for InstallProgress {
    fn default() -> Self {
        Self::started()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_are_ordered() {
        for pair in InstallStep::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0].next(), Some(pair[1]));
        }
        assert_eq!(InstallStep::Complete.next(), None);
    }

    #[test]
    fn test_progress_terminal_states() {
        let mut progress = InstallProgress::started();
        assert!(!progress.is_terminal());
        assert_eq!(progress.fraction(), 0.0);

        progress.step = InstallStep::Complete;
        assert!(progress.is_complete());
        assert!(progress.is_terminal());
        assert_eq!(progress.fraction(), 1.0);

        let failed = InstallProgress {
            step: InstallStep::Mounting,
            error: Some("Failed to mount update image".to_string()),
        };
        assert!(failed.is_failed());
        assert!(failed.is_terminal());
        assert!(!failed.is_complete());
    }

    #[test]
    fn test_progress_serializes_snake_case() {
        let json = serde_json::to_string(&InstallProgress::started()).unwrap();
        assert_eq!(json, r#"{"step":"closing","error":null}"#);
    }
}
