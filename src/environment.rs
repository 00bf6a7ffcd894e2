// src/environment.rs
// Environment Model: sandbox definition, validation gates, working-tree
// setup/cleanup, and the mediator for all constraint/config mutations.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::{Result, SupervisorError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConstraints {
    #[serde(default)]
    pub allow_write: bool,
    #[serde(default)]
    pub allow_delete: bool,
    #[serde(default)]
    pub allow_network: bool,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default)]
    pub restricted_paths: Vec<String>,
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    #[serde(default)]
    pub denied_commands: Vec<String>,
}

fn default_max_file_size_mb() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    #[serde(default)]
    pub track_outcomes: bool,
    #[serde(default)]
    pub auto_report_errors: bool,
    #[serde(default)]
    pub collect_metrics: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub working_dir: String,
    #[serde(default)]
    pub user: Option<String>,
    pub constraints: EnvironmentConstraints,
    pub feedback_config: FeedbackConfig,
}

#[derive(Debug, Deserialize)]
struct EnvironmentsFile {
    #[allow(dead_code)]
    version: u32,
    environments: Vec<Environment>,
    default_environment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentChange {
    pub timestamp: chrono::DateTime<Utc>,
    pub environment: String,
    pub changed_by: String,
    pub change_type: String,
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
    pub reason: String,
    #[serde(default)]
    pub broadcast_to: Vec<String>,
    #[serde(default)]
    pub acknowledged_by: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentStatus {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub active_agents: Vec<String>,
    pub last_updated: chrono::DateTime<Utc>,
    pub working_dir_size_bytes: u64,
    pub databases_ready: bool,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
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

fn dir_size(path: &Path) -> u64 {
    let mut total = 0u64;
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    for entry in entries.flatten() {
        let p = entry.path();
        if p.is_dir() {
            total += dir_size(&p);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

pub struct EnvironmentManager {
    config_path: PathBuf,
    environment: Environment,
}

impl EnvironmentManager {
    pub fn load(config_path: &Path, name: Option<&str>) -> Result<Self> {
        let raw = fs::read_to_string(config_path)?;
        let file: EnvironmentsFile = serde_json::from_str(&raw)?;

        let target = name.unwrap_or(&file.default_environment);
        let environment = file
            .environments
            .into_iter()
            .find(|e| e.name == target)
            .ok_or_else(|| SupervisorError::EnvironmentNotFound(target.to_string()))?;

        Ok(EnvironmentManager {
            config_path: config_path.to_path_buf(),
            environment,
        })
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn validate_working_directory(&self) -> Result<()> {
        let current = std::env::current_dir()?;
        let expected = PathBuf::from(&self.environment.working_dir);
        if current != expected {
            return Err(SupervisorError::SandboxViolation(format!(
                "current directory {} does not match environment working directory {}",
                current.display(),
                expected.display()
            )));
        }
        Ok(())
    }

    pub fn enforce_working_directory(&self) -> Result<()> {
        std::env::set_current_dir(&self.environment.working_dir).map_err(|e| {
            SupervisorError::SandboxViolation(format!(
                "cannot enter working directory {}: {e}",
                self.environment.working_dir
            ))
        })
    }

    pub fn validate_path(&self, p: &Path) -> Result<PathBuf> {
        let abs = if p.is_absolute() {
            p.to_path_buf()
        } else {
            PathBuf::from(&self.environment.working_dir).join(p)
        };
        let abs_str = abs.to_string_lossy().to_string();

        for restricted in &self.environment.constraints.restricted_paths {
            if restricted == "*" || abs_str.starts_with(restricted.as_str()) {
                return Err(SupervisorError::SandboxViolation(format!(
                    "path {abs_str} is restricted"
                )));
            }
        }
        Ok(abs)
    }

    pub fn validate_command(&self, cmd: &str) -> Result<()> {
        for denied in &self.environment.constraints.denied_commands {
            if cmd.contains(denied.as_str()) {
                return Err(SupervisorError::SandboxViolation(format!(
                    "command matches denied pattern '{denied}'"
                )));
            }
        }

        let allowed = &self.environment.constraints.allowed_commands;
        if !allowed.is_empty() {
            let first_token = cmd.split_whitespace().next().unwrap_or("");
            let ok = allowed.iter().any(|a| a == "*" || first_token.starts_with(a.as_str()));
            if !ok {
                return Err(SupervisorError::SandboxViolation(format!(
                    "command '{cmd}' is not in the allowed list"
                )));
            }
        }
        Ok(())
    }

    pub fn validate_write(&self, p: &Path) -> Result<PathBuf> {
        if !self.environment.constraints.allow_write {
            return Err(SupervisorError::SandboxViolation(
                "writes are disallowed in this environment".to_string(),
            ));
        }
        self.validate_path(p)
    }

    pub fn validate_delete(&self, p: &Path) -> Result<PathBuf> {
        if !self.environment.constraints.allow_delete {
            return Err(SupervisorError::SandboxViolation(
                "deletes are disallowed in this environment".to_string(),
            ));
        }
        self.validate_path(p)
    }

    pub fn validate_network(&self) -> Result<()> {
        if !self.environment.constraints.allow_network {
            return Err(SupervisorError::SandboxViolation(
                "network access is disallowed in this environment".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_file_size(&self, bytes: u64) -> Result<()> {
        let max = self.environment.constraints.max_file_size_mb * 1024 * 1024;
        if bytes > max {
            return Err(SupervisorError::SandboxViolation(format!(
                "file size {bytes} exceeds the {max} byte limit"
            )));
        }
        Ok(())
    }

    fn status_path(&self) -> PathBuf {
        PathBuf::from(&self.environment.working_dir)
            .join("data")
            .join("status")
            .join(format!("{}.json", self.environment.name))
    }

    fn load_status(&self) -> EnvironmentStatus {
        let path = self.status_path();
        fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| EnvironmentStatus {
                name: self.environment.name.clone(),
                status: "initializing".to_string(),
                active_agents: Vec::new(),
                last_updated: Utc::now(),
                working_dir_size_bytes: 0,
                databases_ready: false,
                metadata: serde_json::Map::new(),
            })
    }

    fn save_status(&self, status: &EnvironmentStatus) -> Result<()> {
        let json = serde_json::to_string_pretty(status)?;
        atomic_write(&self.status_path(), json.as_bytes())
    }

    /// Create the working tree for (environment, agent) and mark it ready.
    pub fn setup(&self, agent: &str) -> Result<()> {
        let root = PathBuf::from(&self.environment.working_dir);
        fs::create_dir_all(&root)?;
        set_mode(&root, 0o750);

        for dir in [
            "data",
            "data/feedback",
            "data/patterns",
            "data/training",
            "data/status",
            "logs",
            "logs/agents",
            "config",
            "tmp",
        ] {
            let path = root.join(dir);
            fs::create_dir_all(&path)?;
            set_mode(&path, 0o750);
        }

        for db in ["feedback", "patterns", "training", "extraction"] {
            let path = root.join("data").join(db);
            if !path.exists() {
                fs::File::create(&path)?;
            }
            set_mode(&path, 0o640);
        }

        std::env::set_var("ARCHITECT_ENV", &self.environment.name);
        std::env::set_var("ARCHITECT_AGENT", agent);
        std::env::set_var("ARCHITECT_WORKING_DIR", &self.environment.working_dir);
        std::env::set_var("ARCHITECT_DATA_DIR", root.join("data").to_string_lossy().to_string());
        std::env::set_var("ARCHITECT_LOGS_DIR", root.join("logs").to_string_lossy().to_string());
        std::env::set_var("ARCHITECT_CONFIG_DIR", root.join("config").to_string_lossy().to_string());

        let env_file = format!(
            "ALLOW_WRITE={}\nALLOW_DELETE={}\nALLOW_NETWORK={}\nMAX_FILE_SIZE_MB={}\nTRACK_OUTCOMES={}\nAUTO_REPORT_ERRORS={}\nCOLLECT_METRICS={}\n",
            self.environment.constraints.allow_write,
            self.environment.constraints.allow_delete,
            self.environment.constraints.allow_network,
            self.environment.constraints.max_file_size_mb,
            self.environment.feedback_config.track_outcomes,
            self.environment.feedback_config.auto_report_errors,
            self.environment.feedback_config.collect_metrics,
        );
        fs::write(root.join(".architect_env"), env_file)?;

        let mut status = self.load_status();
        status.status = "ready".to_string();
        status.databases_ready = true;
        status.last_updated = Utc::now();
        if !status.active_agents.contains(&agent.to_string()) {
            status.active_agents.push(agent.to_string());
        }
        status.working_dir_size_bytes = dir_size(&root);
        self.save_status(&status)?;

        Ok(())
    }

    pub fn cleanup(&self, agent: &str) -> Result<()> {
        let mut status = self.load_status();
        status.active_agents.retain(|a| a != agent);
        status.last_updated = Utc::now();
        self.save_status(&status)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

/// Mediates all mutations of an environment's constraints/feedback config.
pub struct EnvironmentConfigUpdater {
    config_path: PathBuf,
    environment_name: String,
}

impl EnvironmentConfigUpdater {
    pub fn new(config_path: &Path, environment_name: &str) -> Self {
        EnvironmentConfigUpdater {
            config_path: config_path.to_path_buf(),
            environment_name: environment_name.to_string(),
        }
    }

    fn change_log_path(&self) -> PathBuf {
        self.config_path
            .parent()
            .map(|p| p.join("environment_changes.jsonl"))
            .unwrap_or_else(|| PathBuf::from("environment_changes.jsonl"))
    }

    fn notifications_dir(&self) -> PathBuf {
        self.config_path
            .parent()
            .map(|p| p.join("notifications"))
            .unwrap_or_else(|| PathBuf::from("notifications"))
    }

    pub fn update_constraint(
        &self,
        field: &str,
        new_value: Value,
        changed_by: &str,
        reason: &str,
    ) -> Result<EnvironmentChange> {
        self.update_field("constraint", field, new_value, changed_by, reason)
    }

    pub fn update_feedback_config(
        &self,
        field: &str,
        new_value: Value,
        changed_by: &str,
        reason: &str,
    ) -> Result<EnvironmentChange> {
        self.update_field("config", field, new_value, changed_by, reason)
    }

    fn update_field(
        &self,
        change_type: &str,
        field: &str,
        new_value: Value,
        changed_by: &str,
        reason: &str,
    ) -> Result<EnvironmentChange> {
        let raw = fs::read_to_string(&self.config_path)?;
        let mut file: EnvironmentsFile = serde_json::from_str(&raw)?;
        let env = file
            .environments
            .iter_mut()
            .find(|e| e.name == self.environment_name)
            .ok_or_else(|| SupervisorError::EnvironmentNotFound(self.environment_name.clone()))?;

        let old_value = if change_type == "constraint" {
            read_constraint_field(&env.constraints, field)?
        } else {
            read_feedback_field(&env.feedback_config, field)?
        };

        if change_type == "constraint" {
            write_constraint_field(&mut env.constraints, field, &new_value)?;
        } else {
            write_feedback_field(&mut env.feedback_config, field, &new_value)?;
        }

        let serialized = serde_json::to_string_pretty(&file_round_trip(&file))?;
        atomic_write(&self.config_path, serialized.as_bytes())?;

        let change = EnvironmentChange {
            timestamp: Utc::now(),
            environment: self.environment_name.clone(),
            changed_by: changed_by.to_string(),
            change_type: change_type.to_string(),
            field: field.to_string(),
            old_value,
            new_value,
            reason: reason.to_string(),
            broadcast_to: Vec::new(),
            acknowledged_by: Vec::new(),
        };
        self.append_change(&change)?;
        println!(
            "[audit] {} changed {}.{} from {} to {} ({})",
            changed_by, self.environment_name, field, change.old_value, change.new_value, reason
        );
        Ok(change)
    }

    fn append_change(&self, change: &EnvironmentChange) -> Result<()> {
        let path = self.change_log_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", serde_json::to_string(change)?)?;
        Ok(())
    }

    pub fn broadcast_change(&self, change: &EnvironmentChange, agents: &[&str]) -> Result<()> {
        let dir = self.notifications_dir();
        fs::create_dir_all(&dir)?;
        for agent in agents {
            let path = dir.join(format!("{agent}_notifications.jsonl"));
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(file, "{}", serde_json::to_string(change)?)?;
        }
        Ok(())
    }
}

fn file_round_trip(file: &EnvironmentsFile) -> Value {
    json!({
        "version": file.version,
        "environments": file.environments,
        "default_environment": file.default_environment,
    })
}

fn read_constraint_field(c: &EnvironmentConstraints, field: &str) -> Result<Value> {
    Ok(match field {
        "allow_write" => json!(c.allow_write),
        "allow_delete" => json!(c.allow_delete),
        "allow_network" => json!(c.allow_network),
        "max_file_size_mb" => json!(c.max_file_size_mb),
        "restricted_paths" => json!(c.restricted_paths),
        "allowed_commands" => json!(c.allowed_commands),
        "denied_commands" => json!(c.denied_commands),
        other => {
            return Err(SupervisorError::ConfigError(format!(
                "unknown constraint field '{other}'"
            )))
        }
    })
}

fn write_constraint_field(c: &mut EnvironmentConstraints, field: &str, value: &Value) -> Result<()> {
    let type_err = || SupervisorError::ConfigError(format!("invalid value type for field '{field}'"));
    match field {
        "allow_write" => c.allow_write = value.as_bool().ok_or_else(type_err)?,
        "allow_delete" => c.allow_delete = value.as_bool().ok_or_else(type_err)?,
        "allow_network" => c.allow_network = value.as_bool().ok_or_else(type_err)?,
        "max_file_size_mb" => c.max_file_size_mb = value.as_u64().ok_or_else(type_err)?,
        "restricted_paths" => {
            c.restricted_paths = serde_json::from_value(value.clone()).map_err(|_| type_err())?
        }
        "allowed_commands" => {
            c.allowed_commands = serde_json::from_value(value.clone()).map_err(|_| type_err())?
        }
        "denied_commands" => {
            c.denied_commands = serde_json::from_value(value.clone()).map_err(|_| type_err())?
        }
        other => {
            return Err(SupervisorError::ConfigError(format!(
                "unknown constraint field '{other}'"
            )))
        }
    }
    Ok(())
}

fn read_feedback_field(f: &FeedbackConfig, field: &str) -> Result<Value> {
    Ok(match field {
        "track_outcomes" => json!(f.track_outcomes),
        "auto_report_errors" => json!(f.auto_report_errors),
        "collect_metrics" => json!(f.collect_metrics),
        other => {
            return Err(SupervisorError::ConfigError(format!(
                "unknown feedback field '{other}'"
            )))
        }
    })
}

fn write_feedback_field(f: &mut FeedbackConfig, field: &str, value: &Value) -> Result<()> {
    let type_err = || SupervisorError::ConfigError(format!("invalid value type for field '{field}'"));
    match field {
        "track_outcomes" => f.track_outcomes = value.as_bool().ok_or_else(type_err)?,
        "auto_report_errors" => f.auto_report_errors = value.as_bool().ok_or_else(type_err)?,
        "collect_metrics" => f.collect_metrics = value.as_bool().ok_or_else(type_err)?,
        other => {
            return Err(SupervisorError::ConfigError(format!(
                "unknown feedback field '{other}'"
            )))
        }
    }
    Ok(())
}

pub fn dedup_active_agents(agents: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    agents
        .iter()
        .filter(|a| seen.insert((*a).clone()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_config(dir: &Path) -> PathBuf {
        let path = dir.join("environments.json");
        let doc = json!({
            "version": 1,
            "default_environment": "dev",
            "environments": [{
                "name": "dev",
                "description": "development",
                "working_dir": dir.join("work").to_string_lossy(),
                "user": null,
                "constraints": {
                    "allow_write": false,
                    "allow_delete": false,
                    "allow_network": false,
                    "max_file_size_mb": 10,
                    "restricted_paths": ["/etc"],
                    "allowed_commands": [],
                    "denied_commands": ["rm -rf"]
                },
                "feedback_config": {
                    "track_outcomes": true,
                    "auto_report_errors": true,
                    "collect_metrics": false
                }
            }]
        });
        fs::write(&path, doc.to_string()).unwrap();
        path
    }

    #[test]
    fn s5_sandbox_write_fails() {
        let dir = tempdir().unwrap();
        let config_path = write_config(dir.path());
        let manager = EnvironmentManager::load(&config_path, Some("dev")).unwrap();
        let target = dir.path().join("work/srv/data/x");
        let result = manager.validate_write(&target);
        assert!(result.is_err());
        assert!(!target.exists());
    }

    #[test]
    fn restricted_path_rejected() {
        let dir = tempdir().unwrap();
        let config_path = write_config(dir.path());
        let manager = EnvironmentManager::load(&config_path, Some("dev")).unwrap();
        assert!(manager.validate_path(Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn denied_command_substring_rejected() {
        let dir = tempdir().unwrap();
        let config_path = write_config(dir.path());
        let manager = EnvironmentManager::load(&config_path, Some("dev")).unwrap();
        assert!(manager.validate_command("rm -rf /").is_err());
        assert!(manager.validate_command("ls -la").is_ok());
    }

    #[test]
    fn unknown_environment_errors() {
        let dir = tempdir().unwrap();
        let config_path = write_config(dir.path());
        assert!(matches!(
            EnvironmentManager::load(&config_path, Some("missing")),
            Err(SupervisorError::EnvironmentNotFound(_))
        ));
    }

    #[test]
    fn s8_change_log_records_constraint_update() {
        let dir = tempdir().unwrap();
        let config_path = write_config(dir.path());
        let updater = EnvironmentConfigUpdater::new(&config_path, "dev");
        updater
            .update_constraint("allow_delete", json!(true), "u", "reason")
            .unwrap();

        let log = fs::read_to_string(config_path.parent().unwrap().join("environment_changes.jsonl")).unwrap();
        let change: EnvironmentChange = serde_json::from_str(log.lines().next().unwrap()).unwrap();
        assert_eq!(change.old_value, json!(false));
        assert_eq!(change.new_value, json!(true));
        assert_eq!(change.change_type, "constraint");
        assert_eq!(change.field, "allow_delete");
    }

    #[test]
    fn setup_creates_layout_and_marks_ready() {
        let dir = tempdir().unwrap();
        let config_path = write_config(dir.path());
        let manager = EnvironmentManager::load(&config_path, Some("dev")).unwrap();
        manager.setup("agent-a").unwrap();

        let root = dir.path().join("work");
        assert!(root.join("data/feedback").is_dir());
        assert!(root.join("data/status").is_dir());
        assert!(root.join(".architect_env").is_file());

        manager.cleanup("agent-a").unwrap();
        let status = manager.load_status();
        assert!(!status.active_agents.contains(&"agent-a".to_string()));
    }
}
