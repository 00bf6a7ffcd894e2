// src/user_manager.rs
// User Manager: OS worker-user provisioning plus a JSON-backed registry.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::errors::{Result, SupervisorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    Worker,
    Manager,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerUser {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub home_dir: String,
    pub workspace_dir: String,
    pub role: WorkerRole,
    pub git_config: GitConfig,
    pub ssh_key_path: String,
    #[serde(default)]
    pub metadata: Map<String, serde_json::Value>,
}

fn backup_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".backup");
    PathBuf::from(s)
}

fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let backup = backup_path(path);
    let had_original = path.exists();
    if had_original {
        fs::rename(path, &backup)?;
    }
    match fs::write(path, contents) {
        Ok(()) => {
            if had_original {
                let _ = fs::remove_file(&backup);
            }
            Ok(())
        }
        Err(e) => {
            if had_original {
                let _ = fs::rename(&backup, path);
            }
            Err(SupervisorError::IoError(e))
        }
    }
}

pub struct UserManager {
    registry_path: PathBuf,
    users: HashMap<String, WorkerUser>,
}

impl UserManager {
    pub fn load(registry_path: &Path) -> Result<Self> {
        let users = if registry_path.exists() {
            let raw = fs::read_to_string(registry_path)?;
            serde_json::from_str(&raw)?
        } else {
            HashMap::new()
        };
        Ok(UserManager {
            registry_path: registry_path.to_path_buf(),
            users,
        })
    }

    fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.users)?;
        atomic_write(&self.registry_path, json.as_bytes())
    }

    pub fn list(&self) -> Vec<&WorkerUser> {
        self.users.values().collect()
    }

    pub fn get(&self, username: &str) -> Option<&WorkerUser> {
        self.users.get(username)
    }

    /// Idempotent on the registry (fails if already registered) but never
    /// re-creates an OS user that already exists.
    pub fn create_worker_user(
        &mut self,
        username: &str,
        role: WorkerRole,
        git_config: GitConfig,
    ) -> Result<WorkerUser> {
        if self.users.contains_key(username) {
            return Err(SupervisorError::UserAlreadyRegistered(username.to_string()));
        }

        let (uid, gid, home_dir) = if let Some(existing) = os_user_info(username) {
            existing
        } else {
            create_os_user(username)?;
            os_user_info(username).ok_or_else(|| {
                SupervisorError::UserProvisioningFailed(format!(
                    "useradd for '{username}' reported success but the user cannot be found"
                ))
            })?
        };

        let workspace_dir = format!("{home_dir}/workspace");
        fs::create_dir_all(&workspace_dir)?;

        let ssh_dir = format!("{home_dir}/.ssh");
        fs::create_dir_all(&ssh_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&ssh_dir, fs::Permissions::from_mode(0o700));
        }

        write_git_config(&home_dir, &git_config)?;

        let user = WorkerUser {
            username: username.to_string(),
            uid,
            gid,
            home_dir,
            workspace_dir,
            role,
            git_config,
            ssh_key_path: format!("{ssh_dir}/id_ed25519"),
            metadata: Map::new(),
        };

        self.users.insert(username.to_string(), user.clone());
        self.save()?;
        Ok(user)
    }

    pub fn setup_shared_git_repo(&self, repo_path: &Path, group: &str, workers: &[&str]) -> Result<()> {
        if !group_exists(group) {
            run_privileged(&["groupadd", group])?;
        }
        for worker in workers {
            run_privileged(&["usermod", "-aG", group, worker])?;
        }
        run_privileged(&["chgrp", "-R", group, &repo_path.to_string_lossy()])?;
        run_privileged(&["chmod", "-R", "g+rwX", &repo_path.to_string_lossy()])?;
        run_privileged(&["chmod", "g+s", &repo_path.to_string_lossy()])?;
        Ok(())
    }

    pub fn verify_user_exists(&self, username: &str) -> bool {
        os_user_info(username).is_some()
    }

    pub fn can_sudo(&self) -> bool {
        Command::new("sudo")
            .args(["-n", "true"])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    pub fn get_current_user(&self) -> String {
        std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

fn os_user_info(username: &str) -> Option<(u32, u32, String)> {
    let output = Command::new("getent").args(["passwd", username]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let line = String::from_utf8_lossy(&output.stdout);
    let fields: Vec<&str> = line.trim().split(':').collect();
    if fields.len() < 6 {
        return None;
    }
    let uid = fields[2].parse().ok()?;
    let gid = fields[3].parse().ok()?;
    Some((uid, gid, fields[5].to_string()))
}

fn group_exists(group: &str) -> bool {
    Command::new("getent")
        .args(["group", group])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn create_os_user(username: &str) -> Result<()> {
    run_privileged(&["useradd", "-m", "-s", "/bin/bash", username])
}

fn run_privileged(args: &[&str]) -> Result<()> {
    let status = Command::new("sudo")
        .arg("-n")
        .args(args)
        .status()
        .map_err(|e| SupervisorError::UserProvisioningFailed(e.to_string()))?;
    if status.success() {
        Ok(())
    } else {
        Err(SupervisorError::UserProvisioningFailed(format!(
            "command '{}' exited with {status}",
            args.join(" ")
        )))
    }
}

fn write_git_config(home_dir: &str, git: &GitConfig) -> Result<()> {
    let mut contents = format!("[user]\n    name = {}\n    email = {}\n", git.name, git.email);
    if git.token.is_some() {
        contents.push_str("[credential]\n    helper = store\n");
    }
    fs::write(format!("{home_dir}/.gitconfig"), contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_worker_user_twice_fails_second_time() {
        let dir = tempdir().unwrap();
        let registry_path = dir.path().join("users.json");
        let mut manager = UserManager::load(&registry_path).unwrap();
        manager.users.insert(
            "alice".to_string(),
            WorkerUser {
                username: "alice".to_string(),
                uid: 1000,
                gid: 1000,
                home_dir: "/home/alice".to_string(),
                workspace_dir: "/home/alice/workspace".to_string(),
                role: WorkerRole::Worker,
                git_config: GitConfig {
                    name: "Alice".to_string(),
                    email: "alice@example.com".to_string(),
                    token: None,
                },
                ssh_key_path: "/home/alice/.ssh/id_ed25519".to_string(),
                metadata: Map::new(),
            },
        );

        let result = manager.create_worker_user(
            "alice",
            WorkerRole::Worker,
            GitConfig {
                name: "Alice".to_string(),
                email: "alice@example.com".to_string(),
                token: None,
            },
        );
        assert!(matches!(result, Err(SupervisorError::UserAlreadyRegistered(_))));
        assert_eq!(manager.list().len(), 1);
    }

    #[test]
    fn registry_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let registry_path = dir.path().join("users.json");
        let mut manager = UserManager::load(&registry_path).unwrap();
        manager.users.insert(
            "bob".to_string(),
            WorkerUser {
                username: "bob".to_string(),
                uid: 1001,
                gid: 1001,
                home_dir: "/home/bob".to_string(),
                workspace_dir: "/home/bob/workspace".to_string(),
                role: WorkerRole::Manager,
                git_config: GitConfig {
                    name: "Bob".to_string(),
                    email: "bob@example.com".to_string(),
                    token: Some("tok".to_string()),
                },
                ssh_key_path: "/home/bob/.ssh/id_ed25519".to_string(),
                metadata: Map::new(),
            },
        );
        manager.save().unwrap();

        let reloaded = UserManager::load(&registry_path).unwrap();
        assert!(reloaded.get("bob").is_some());
    }
}
