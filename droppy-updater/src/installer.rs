//! Installer state machine
//!
//! Runs Closing → Mounting → Removing → Installing → Cleaning → Complete
//! strictly in order. The first fatal error is published as the terminal
//! state; nothing is published after it.

use crate::config::UpdaterConfig;
use crate::job::UpdateJob;
use crate::steps::{InstallProgress, InstallStep};
use crate::system::{SystemOps, SystemResult};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Fatal installer errors, worded for the user
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallError {
    #[error("Failed to mount update image")]
    MountFailed,

    #[error("Could not find app in update image")]
    BundleMissing,

    #[error(
        "Could not remove the old version. Move it to the Trash manually, \
         then drag the new version from the update volume into Applications."
    )]
    RemoveFailed,

    #[error("Failed to install: {0}")]
    CopyFailed(String),
}

impl InstallError {
    /// Step during which this error is raised
    pub fn step(&self) -> InstallStep {
        match self {
            InstallError::MountFailed | InstallError::BundleMissing => InstallStep::Mounting,
            InstallError::RemoveFailed => InstallStep::Removing,
            InstallError::CopyFailed(_) => InstallStep::Installing,
        }
    }
}

pub struct Installer {
    job: UpdateJob,
    config: UpdaterConfig,
    system: Arc<dyn SystemOps>,
    observers: Vec<mpsc::UnboundedSender<InstallProgress>>,
    history: Vec<InstallProgress>,
}

impl Installer {
    pub fn new(job: UpdateJob, config: UpdaterConfig, system: Arc<dyn SystemOps>) -> Self {
        Self {
            job,
            config,
            system,
            observers: Vec::new(),
            history: vec![InstallProgress::started()],
        }
    }

    pub fn job(&self) -> &UpdateJob {
        &self.job
    }

    /// Receiver that gets the current state, then every later one in order
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<InstallProgress> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(self.progress());
        self.observers.push(tx);
        rx
    }

    /// Latest published state
    pub fn progress(&self) -> InstallProgress {
        self.history
            .last()
            .cloned()
            .unwrap_or_else(InstallProgress::started)
    }

    /// Every state published so far, in order
    pub fn transitions(&self) -> &[InstallProgress] {
        &self.history
    }

    /// Run every step; stops at the first fatal error
    pub async fn run(&mut self) -> Result<(), InstallError> {
        info!(
            image = %self.job.source_image_path.display(),
            destination = %self.job.destination_app_path.display(),
            pid = self.job.caller_pid,
            "Starting update"
        );

        self.close_running_instance().await;

        self.advance(InstallStep::Mounting);
        if let Err(e) = self.mount_image().await {
            return Err(self.fail(e));
        }

        self.advance(InstallStep::Removing);
        if let Err(e) = self.remove_old_bundle().await {
            return Err(self.fail(e));
        }

        self.advance(InstallStep::Installing);
        if let Err(e) = self.install_bundle().await {
            return Err(self.fail(e));
        }

        self.advance(InstallStep::Cleaning);
        self.clean_up().await;

        self.advance(InstallStep::Complete);
        info!("Update complete");

        Ok(())
    }

    /// Open the freshly installed bundle
    pub async fn launch_installed_app(&self) -> SystemResult<()> {
        self.system.launch_app(&self.job.destination_app_path).await
    }

    async fn close_running_instance(&self) {
        let pid = self.job.caller_pid;

        if let Err(e) = self.system.terminate_process(pid).await {
            warn!(pid, "Failed to terminate running instance: {}", e);
        }

        for _ in 0..self.config.termination_poll_attempts {
            if !self.system.is_process_running(pid).await {
                debug!(pid, "Running instance has exited");
                return;
            }
            tokio::time::sleep(self.config.termination_poll_interval()).await;
        }

        // The old instance may still hold files open; carry on regardless
        warn!(pid, "Running instance did not exit in time, continuing");
    }

    async fn mount_image(&self) -> Result<(), InstallError> {
        let mount_point = &self.config.mount_point;

        if let Err(e) = self
            .system
            .attach_image(&self.job.source_image_path, mount_point)
            .await
        {
            error!("Mount failed: {}", e);
            return Err(InstallError::MountFailed);
        }

        let bundle = self.config.mounted_bundle();
        if !self.system.path_exists(&bundle).await {
            error!(bundle = %bundle.display(), "Bundle missing from update image");

            // Leave the fixed mount point free for the next attempt
            if let Err(e) = self.system.detach_image(mount_point).await {
                warn!("Failed to detach update image: {}", e);
            }
            return Err(InstallError::BundleMissing);
        }

        Ok(())
    }

    async fn remove_old_bundle(&self) -> Result<(), InstallError> {
        let destination = &self.job.destination_app_path;

        if !self.system.path_exists(destination).await {
            debug!("No previous install to remove");
            return Ok(());
        }

        if let Err(e) = self.system.remove_path(destination).await {
            warn!("Direct removal failed, asking for administrator rights: {}", e);

            if let Err(e) = self.system.remove_path_elevated(destination).await {
                warn!("Elevated removal failed: {}", e);
            }
        }

        if !self.system.path_exists(destination).await {
            return Ok(());
        }

        error!(destination = %destination.display(), "Old version is still present");

        for location in [&self.config.applications_dir, &self.config.mount_point] {
            if let Err(e) = self.system.reveal_in_file_browser(location).await {
                warn!(location = %location.display(), "Failed to reveal location: {}", e);
            }
        }

        Err(InstallError::RemoveFailed)
    }

    async fn install_bundle(&self) -> Result<(), InstallError> {
        let destination = &self.job.destination_app_path;

        self.system
            .copy_bundle(&self.config.mounted_bundle(), destination)
            .await
            .map_err(|e| {
                error!("Copy failed: {}", e);
                InstallError::CopyFailed(e.to_string())
            })?;

        if let Err(e) = self.system.strip_quarantine(destination).await {
            warn!("Failed to clear quarantine flag: {}", e);
        }

        Ok(())
    }

    async fn clean_up(&self) {
        if let Err(e) = self.system.detach_image(&self.config.mount_point).await {
            warn!("Failed to detach update image: {}", e);
        }

        if let Err(e) = self.system.remove_file(&self.job.source_image_path).await {
            warn!("Failed to delete update image: {}", e);
        }
    }

    /// Move forward to `step`; ignored after an error or for backward moves
    fn advance(&mut self, step: InstallStep) {
        let current = self.progress();
        if current.is_terminal() || step <= current.step {
            debug!(?step, ?current, "Ignoring transition");
            return;
        }

        info!("{}", step.title());
        self.publish(InstallProgress { step, error: None });
    }

    /// Publish the terminal error state and hand the error back
    fn fail(&mut self, error: InstallError) -> InstallError {
        let current = self.progress();
        if !current.is_terminal() {
            self.publish(InstallProgress {
                step: current.step,
                error: Some(error.to_string()),
            });
        }
        error
    }

    fn publish(&mut self, progress: InstallProgress) {
        // Observers that went away are dropped
        self.observers
            .retain(|observer| observer.send(progress.clone()).is_ok());
        self.history.push(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{MockSystemOps, SystemError};
    use std::path::PathBuf;

    fn job() -> UpdateJob {
        UpdateJob::new("/tmp/Droppy.dmg", "/Applications/Droppy.app", 4242)
    }

    fn fast_config() -> UpdaterConfig {
        UpdaterConfig {
            termination_poll_attempts: 3,
            termination_poll_interval_ms: 0,
            ..Default::default()
        }
    }

    fn steps(installer: &Installer) -> Vec<InstallStep> {
        installer.transitions().iter().map(|p| p.step).collect()
    }

    /// Closing succeeds and the old instance is already gone
    fn expect_closed(mock: &mut MockSystemOps) {
        mock.expect_terminate_process()
            .withf(|pid| *pid == 4242)
            .times(1)
            .returning(|_| Ok(()));
        mock.expect_is_process_running().returning(|_| false);
    }

    #[tokio::test]
    async fn test_mount_failure_halts_before_removing() {
        let mut mock = MockSystemOps::new();
        expect_closed(&mut mock);
        mock.expect_attach_image()
            .withf(|image, mount| {
                image.to_path_buf() == PathBuf::from("/tmp/Droppy.dmg")
                    && mount.to_path_buf() == PathBuf::from("/Volumes/DroppyUpdate")
            })
            .times(1)
            .returning(|_, _| Err(SystemError::tool("hdiutil", "corrupt image")));
        mock.expect_remove_path().times(0);
        mock.expect_copy_bundle().times(0);

        let mut installer = Installer::new(job(), fast_config(), Arc::new(mock));
        let err = installer.run().await.unwrap_err();

        assert_eq!(err, InstallError::MountFailed);
        assert_eq!(err.step(), InstallStep::Mounting);
        assert_eq!(
            steps(&installer),
            [InstallStep::Closing, InstallStep::Mounting, InstallStep::Mounting]
        );

        let last = installer.progress();
        assert_eq!(last.error.as_deref(), Some("Failed to mount update image"));
        assert!(last.is_terminal());
    }

    #[tokio::test]
    async fn test_copy_failure_reports_reason() {
        let mut mock = MockSystemOps::new();
        expect_closed(&mut mock);
        mock.expect_attach_image().returning(|_, _| Ok(()));
        mock.expect_path_exists().returning(|path| {
            path.to_path_buf() == PathBuf::from("/Volumes/DroppyUpdate/Droppy.app")
        });
        mock.expect_copy_bundle()
            .withf(|from, to| {
                from.to_path_buf() == PathBuf::from("/Volumes/DroppyUpdate/Droppy.app")
                    && to.to_path_buf() == PathBuf::from("/Applications/Droppy.app")
            })
            .returning(|_, _| Err(SystemError::tool("ditto", "No space left on device")));
        mock.expect_strip_quarantine().times(0);
        mock.expect_detach_image().times(0);

        let mut installer = Installer::new(job(), fast_config(), Arc::new(mock));
        let err = installer.run().await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "Failed to install: ditto failed: No space left on device"
        );
        assert_eq!(installer.progress().step, InstallStep::Installing);
    }

    #[tokio::test]
    async fn test_missing_bundle_detaches_image() {
        let mut mock = MockSystemOps::new();
        expect_closed(&mut mock);
        mock.expect_attach_image().times(1).returning(|_, _| Ok(()));
        mock.expect_path_exists().returning(|_| false);
        mock.expect_detach_image()
            .withf(|mount| mount.to_path_buf() == PathBuf::from("/Volumes/DroppyUpdate"))
            .times(1)
            .returning(|_| Err(SystemError::tool("hdiutil", "resource busy")));
        mock.expect_remove_path().times(0);

        let mut installer = Installer::new(job(), fast_config(), Arc::new(mock));
        let err = installer.run().await.unwrap_err();

        assert_eq!(err, InstallError::BundleMissing);
        assert_eq!(installer.progress().step, InstallStep::Mounting);
    }

    #[tokio::test]
    async fn test_best_effort_failures_do_not_stop_the_run() {
        let mut mock = MockSystemOps::new();
        mock.expect_terminate_process()
            .returning(|pid| Err(SystemError::Signal(pid, "EPERM".to_string())));
        mock.expect_is_process_running().returning(|_| true);
        mock.expect_attach_image().returning(|_, _| Ok(()));
        mock.expect_path_exists().returning(|path| {
            path.to_path_buf() == PathBuf::from("/Volumes/DroppyUpdate/Droppy.app")
        });
        mock.expect_copy_bundle().returning(|_, _| Ok(()));
        mock.expect_strip_quarantine()
            .returning(|_| Err(SystemError::tool("xattr", "No such xattr")));
        mock.expect_detach_image()
            .returning(|_| Err(SystemError::tool("hdiutil", "resource busy")));
        mock.expect_remove_file()
            .returning(|p| Err(SystemError::Io(p.to_path_buf(), "denied".to_string())));

        let mut installer = Installer::new(job(), fast_config(), Arc::new(mock));
        installer.run().await.unwrap();

        assert_eq!(steps(&installer), InstallStep::ALL);
        assert!(installer.progress().is_complete());
    }

    #[tokio::test]
    async fn test_elevated_removal_fallback() {
        let removed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let mut mock = MockSystemOps::new();
        expect_closed(&mut mock);
        mock.expect_attach_image().returning(|_, _| Ok(()));

        let flag = removed.clone();
        mock.expect_path_exists().returning(move |path| {
            path.to_path_buf() == PathBuf::from("/Volumes/DroppyUpdate/Droppy.app")
                || (path.to_path_buf() == PathBuf::from("/Applications/Droppy.app")
                    && !flag.load(std::sync::atomic::Ordering::SeqCst))
        });
        mock.expect_remove_path()
            .times(1)
            .returning(|p| Err(SystemError::Io(p.to_path_buf(), "Permission denied".to_string())));

        let flag = removed.clone();
        mock.expect_remove_path_elevated()
            .times(1)
            .returning(move |_| {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            });
        mock.expect_reveal_in_file_browser().times(0);
        mock.expect_copy_bundle().returning(|_, _| Ok(()));
        mock.expect_strip_quarantine().returning(|_| Ok(()));
        mock.expect_detach_image().returning(|_| Ok(()));
        mock.expect_remove_file().returning(|_| Ok(()));

        let mut installer = Installer::new(job(), fast_config(), Arc::new(mock));
        installer.run().await.unwrap();
        assert!(installer.progress().is_complete());
    }

    #[tokio::test]
    async fn test_no_transitions_after_failure() {
        let mut installer = Installer::new(job(), fast_config(), Arc::new(MockSystemOps::new()));

        installer.advance(InstallStep::Mounting);
        let err = installer.fail(InstallError::BundleMissing);
        assert_eq!(err, InstallError::BundleMissing);

        installer.advance(InstallStep::Removing);
        installer.fail(InstallError::RemoveFailed);

        assert_eq!(installer.transitions().len(), 3);
        let last = installer.progress();
        assert_eq!(last.step, InstallStep::Mounting);
        assert_eq!(last.error.as_deref(), Some("Could not find app in update image"));
    }

    #[tokio::test]
    async fn test_subscribers_see_every_transition() {
        let mut installer = Installer::new(job(), fast_config(), Arc::new(MockSystemOps::new()));
        let mut rx = installer.subscribe();

        installer.advance(InstallStep::Mounting);
        installer.fail(InstallError::MountFailed);
        drop(installer);

        let mut seen = Vec::new();
        while let Some(progress) = rx.recv().await {
            seen.push(progress);
        }

        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], InstallProgress::started());
        assert_eq!(seen[1].step, InstallStep::Mounting);
        assert!(seen[2].is_failed());
    }

    #[tokio::test]
    async fn test_steps_never_move_backwards() {
        let mut installer = Installer::new(job(), fast_config(), Arc::new(MockSystemOps::new()));

        installer.advance(InstallStep::Installing);
        installer.advance(InstallStep::Mounting);
        installer.advance(InstallStep::Installing);

        assert_eq!(steps(&installer), [InstallStep::Closing, InstallStep::Installing]);
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(InstallError::MountFailed.to_string(), "Failed to mount update image");
        assert_eq!(
            InstallError::BundleMissing.to_string(),
            "Could not find app in update image"
        );
        assert!(InstallError::RemoveFailed.to_string().contains("manually"));
        assert_eq!(InstallError::RemoveFailed.step(), InstallStep::Removing);
        assert_eq!(
            InstallError::CopyFailed("disk full".to_string()).step(),
            InstallStep::Installing
        );
    }

    #[test]
    fn test_mounted_bundle_follows_config() {
        let config = UpdaterConfig {
            mount_point: PathBuf::from("/tmp/mnt"),
            bundle_name: "Droppy Beta.app".to_string(),
            ..Default::default()
        };
        assert_eq!(config.mounted_bundle(), PathBuf::from("/tmp/mnt/Droppy Beta.app"));
    }
}
