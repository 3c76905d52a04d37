//! Login-shell sandbox: command construction, environment and termination

use crate::platform::UserEnvironment;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command as TokioCommand;
use tracing::{debug, warn};

/// Time a process group gets to exit after SIGTERM before it is killed
pub const KILL_GRACE: Duration = Duration::from_millis(500);

/// Sandbox errors
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Failed to signal process group {0}: {1}")]
    SignalFailed(u32, String),

    #[error("Process signalling not supported on this platform")]
    NotSupported,
}

/// Settings applied to every spawned command
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Shell launched with `-l -c`
    pub shell: PathBuf,

    /// Working directory
    pub working_dir: PathBuf,

    /// Exported as HOME so the login shell finds the user's profiles
    pub home_dir: PathBuf,

    /// Extra environment overrides, applied after the terminal defaults
    pub env_overrides: HashMap<String, String>,
}

impl SandboxConfig {
    /// Build a config from the detected user environment
    pub fn for_user(user: &UserEnvironment) -> Self {
        Self {
            shell: user.shell.clone(),
            working_dir: user.home_dir.clone(),
            home_dir: user.home_dir.clone(),
            env_overrides: HashMap::new(),
        }
    }
}

/// Builds and tears down login-shell subprocesses
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    /// Create new sandbox
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Environment layered on top of the inherited one.
    ///
    /// The terminal variables make colorized tools behave, HOME and SHELL
    /// match what a login shell would see.
    pub fn environment(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("TERM".to_string(), "xterm-256color".to_string()),
            ("COLORTERM".to_string(), "truecolor".to_string()),
            ("LANG".to_string(), "en_US.UTF-8".to_string()),
            (
                "HOME".to_string(),
                self.config.home_dir.to_string_lossy().to_string(),
            ),
            (
                "SHELL".to_string(),
                self.config.shell.to_string_lossy().to_string(),
            ),
        ];

        let mut overrides: Vec<_> = self.config.env_overrides.iter().collect();
        overrides.sort();
        for (key, value) in overrides {
            env.retain(|(k, _)| k != key);
            env.push((key.clone(), value.clone()));
        }

        env
    }

    /// Wrap a command line in `<shell> -l -c <command>`
    ///
    /// The child gets its own process group so that `terminate` reaches
    /// everything the shell started.
    pub fn wrap_command(&self, command_line: &str) -> TokioCommand {
        let mut cmd = TokioCommand::new(&self.config.shell);
        cmd.arg("-l").arg("-c").arg(command_line);
        cmd.current_dir(&self.config.working_dir);
        cmd.envs(self.environment());

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        debug!(
            shell = %self.config.shell.display(),
            cwd = %self.config.working_dir.display(),
            "Wrapped command in login shell"
        );

        cmd
    }

    /// Send SIGTERM to the whole process group led by `pid`, then SIGKILL
    /// after [`KILL_GRACE`] if the group is still there.
    ///
    /// The follow-up runs on a spawned task, so this must be called from
    /// within a tokio runtime.
    #[cfg(unix)]
    pub fn terminate(pid: u32) -> Result<(), SandboxError> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let group = Pid::from_raw(pid as i32);

        match killpg(group, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(()),
            Err(e) => return Err(SandboxError::SignalFailed(pid, e.to_string())),
        }

        tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;

            match killpg(group, Signal::SIGKILL) {
                Ok(()) => debug!(pid, "Sent SIGKILL to process group"),
                Err(Errno::ESRCH) => {}
                Err(e) => warn!(pid, "Failed to kill process group: {}", e),
            }
        });

        Ok(())
    }

    #[cfg(not(unix))]
    pub fn terminate(_pid: u32) -> Result<(), SandboxError> {
        Err(SandboxError::NotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> SandboxConfig {
        SandboxConfig {
            shell: PathBuf::from("/bin/sh"),
            working_dir: PathBuf::from("/tmp"),
            home_dir: PathBuf::from("/home/droppy"),
            env_overrides: HashMap::new(),
        }
    }

    fn lookup<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
        env.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_environment_defaults() {
        let sandbox = Sandbox::new(test_config());
        let env = sandbox.environment();

        assert_eq!(lookup(&env, "TERM"), Some("xterm-256color"));
        assert_eq!(lookup(&env, "COLORTERM"), Some("truecolor"));
        assert_eq!(lookup(&env, "LANG"), Some("en_US.UTF-8"));
        assert_eq!(lookup(&env, "HOME"), Some("/home/droppy"));
        assert_eq!(lookup(&env, "SHELL"), Some("/bin/sh"));
    }

    #[test]
    fn test_environment_overrides_replace_defaults() {
        let mut config = test_config();
        config
            .env_overrides
            .insert("LANG".to_string(), "C".to_string());
        config
            .env_overrides
            .insert("DROPPY".to_string(), "1".to_string());

        let env = Sandbox::new(config).environment();

        assert_eq!(lookup(&env, "LANG"), Some("C"));
        assert_eq!(lookup(&env, "DROPPY"), Some("1"));
        assert_eq!(env.iter().filter(|(k, _)| k == "LANG").count(), 1);
    }

    #[test]
    fn test_wrap_command_uses_login_shell() {
        let sandbox = Sandbox::new(test_config());
        let cmd = sandbox.wrap_command("echo hi");
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), "/bin/sh");
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, ["-l", "-c", "echo hi"]);
        assert_eq!(std_cmd.get_current_dir(), Some(std::path::Path::new("/tmp")));
    }

    #[test]
    fn test_home_is_independent_of_working_dir() {
        let user = UserEnvironment {
            home_dir: PathBuf::from("/Users/droppy"),
            shell: PathBuf::from("/bin/zsh"),
        };
        let mut config = SandboxConfig::for_user(&user);
        config.working_dir = PathBuf::from("/tmp/project");

        let env = Sandbox::new(config).environment();
        assert_eq!(lookup(&env, "HOME"), Some("/Users/droppy"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_missing_group_is_ok() {
        assert!(Sandbox::terminate(i32::MAX as u32).is_ok());
    }
}
