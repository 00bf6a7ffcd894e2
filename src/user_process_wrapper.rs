// src/user_process_wrapper.rs
// User Process Wrapper: runs a command as a provisioned worker user via
// `sudo -u <user> -i bash -c`, reusing ProcessWrapper's PTY/streaming
// machinery underneath.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{Result, SupervisorError};
use crate::process_wrapper::ProcessWrapper;
use crate::store::{ExtractionStore, SessionStore};
use crate::user_manager::{GitConfig, UserManager, WorkerRole, WorkerUser};

/// Wraps a `ProcessWrapper` so the child runs as a specific OS worker user
/// rather than as the supervising process's own user.
pub struct UserProcessWrapper {
    user: WorkerUser,
    inner: ProcessWrapper,
}

impl UserProcessWrapper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_manager: &UserManager,
        username: &str,
        logs_dir: &Path,
        environment_name: Option<&str>,
        command: &str,
        args: &[String],
        environment_config_path: Option<&Path>,
        session_store: Option<Arc<dyn SessionStore>>,
        extraction_store: Option<Arc<dyn ExtractionStore>>,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Result<Self> {
        let user = user_manager
            .get(username)
            .cloned()
            .ok_or_else(|| SupervisorError::UserNotRegistered(username.to_string()))?;

        if !user_manager.can_sudo() {
            return Err(SupervisorError::SudoUnavailable);
        }

        let shell_cmd = std::iter::once(command.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");

        let inner = ProcessWrapper::new(
            &user.username,
            logs_dir,
            environment_name,
            "sudo",
            &[
                "-u".to_string(),
                user.username.clone(),
                "-i".to_string(),
                "bash".to_string(),
                "-c".to_string(),
                shell_cmd,
            ],
            environment_config_path,
            session_store,
            extraction_store,
            batch_size,
            flush_interval,
        )?;

        Ok(UserProcessWrapper { user, inner })
    }

    pub fn username(&self) -> &str {
        &self.user.username
    }

    pub fn role(&self) -> WorkerRole {
        self.user.role
    }

    pub fn workspace_dir(&self) -> &str {
        &self.user.workspace_dir
    }

    pub fn git_config(&self) -> &GitConfig {
        &self.user.git_config
    }

    pub fn feedback_path(&self) -> PathBuf {
        PathBuf::from(&self.user.workspace_dir).join("data/feedback")
    }

    pub fn inner(&self) -> &ProcessWrapper {
        &self.inner
    }

    pub fn start(&self) -> Result<()> {
        let role = match self.user.role {
            WorkerRole::Worker => "worker",
            WorkerRole::Manager => "manager",
        };
        std::env::set_var("ARCHITECT_ROLE", role);
        self.inner.start()
    }

    pub fn wait(&self) -> Result<i32> {
        self.inner.wait()
    }

    pub fn stop(&self) -> Result<i32> {
        self.inner.stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unknown_user_is_rejected() {
        let dir = tempdir().unwrap();
        let registry_path = dir.path().join("users.json");
        let manager = UserManager::load(&registry_path).unwrap();

        let result = UserProcessWrapper::new(
            &manager,
            "nobody-registered",
            dir.path(),
            None,
            "/bin/echo",
            &["hi".to_string()],
            None,
            None,
            None,
            crate::extractor::DEFAULT_BATCH_SIZE,
            crate::extractor::DEFAULT_FLUSH_INTERVAL,
        );
        assert!(matches!(result, Err(SupervisorError::UserNotRegistered(_))));
    }
}
