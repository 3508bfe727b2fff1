use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration rejected: {0}")]
    Validation(ValidationReport),

    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration parse error at {path}: {message}")]
    Parse { path: String, message: String },
}

/// System Configuration - strongly typed, serialized to
/// `runtime/state/config.json` (or a `.toml` twin chosen by extension).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfig {
    pub max_concurrent_workers: u32,
    /// Per-task timeout in seconds.
    pub default_timeout: u64,
    pub worker_memory_limit: String,
    pub worker_cpu_limit: String,
    pub default_ai_adapter: String,
    pub default_model: String,
    pub container_runtime: ContainerRuntimeKind,
    pub allowed_docker_commands: Vec<String>,
    pub message_queue_type: MessageQueueKind,
    pub git_credential_type: GitCredentialKind,
    pub git_ssh_agent_enabled: bool,
    pub state_retention_days: u32,
    pub integration_branch: String,
    /// Dashboard auto-refresh interval in milliseconds.
    pub auto_refresh_interval: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerRuntimeKind {
    Dod,
    Rootless,
    Dind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageQueueKind {
    File,
    Sqlite,
    Redis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitCredentialKind {
    DeployKey,
    Token,
    SshAgent,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workers: 3,
            default_timeout: 300,
            worker_memory_limit: "4g".to_string(),
            worker_cpu_limit: "2".to_string(),
            default_ai_adapter: "ollama".to_string(),
            default_model: "llama3.2:1b".to_string(),
            container_runtime: ContainerRuntimeKind::Dod,
            allowed_docker_commands: ["run", "stop", "rm", "logs", "inspect"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            message_queue_type: MessageQueueKind::File,
            git_credential_type: GitCredentialKind::Token,
            git_ssh_agent_enabled: false,
            state_retention_days: 7,
            integration_branch: "develop".to_string(),
            auto_refresh_interval: 5000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s): {}", self.errors.len(), self.errors.join("; "))
    }
}

/// Settings Manager - validated access to the system configuration.
///
/// `validate` is a pure function of its input; `apply` refuses invalid
/// configurations without touching the current one; subscribers receive
/// every applied change for hot reload.
#[derive(Debug)]
pub struct SettingsManager {
    path: PathBuf,
    current: RwLock<SystemConfig>,
    change_tx: broadcast::Sender<SystemConfig>,
}

impl SettingsManager {
    pub fn new(path: impl Into<PathBuf>) -> ConfigResult<Self> {
        let path = path.into();
        let initial = Self::load_from(&path)?;
        let (change_tx, _) = broadcast::channel(16);
        Ok(Self {
            path,
            current: RwLock::new(initial),
            change_tx,
        })
    }

    pub fn current(&self) -> SystemConfig {
        self.current.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemConfig> {
        self.change_tx.subscribe()
    }

    pub fn validate(config: &SystemConfig) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if config.max_concurrent_workers == 0 {
            errors.push("maxConcurrentWorkers must be at least 1".to_string());
        }
        if config.default_timeout == 0 {
            errors.push("defaultTimeout must be positive".to_string());
        }
        if config.worker_memory_limit.trim().is_empty() {
            errors.push("workerMemoryLimit must be non-empty".to_string());
        }
        if config.worker_cpu_limit.trim().is_empty() {
            errors.push("workerCpuLimit must be non-empty".to_string());
        }
        if config.default_ai_adapter.trim().is_empty() {
            errors.push("defaultAiAdapter must be non-empty".to_string());
        }
        if config.default_model.trim().is_empty() {
            errors.push("defaultModel must be non-empty".to_string());
        }
        if config.allowed_docker_commands.is_empty() {
            errors.push("allowedDockerCommands must list at least one command".to_string());
        }
        if config.state_retention_days == 0 {
            errors.push("stateRetentionDays must be at least 1".to_string());
        }
        if config.integration_branch.trim().is_empty() {
            errors.push("integrationBranch must be non-empty".to_string());
        }
        if config.auto_refresh_interval == 0 {
            errors.push("autoRefreshInterval must be positive".to_string());
        }

        if config.container_runtime == ContainerRuntimeKind::Dind {
            warnings.push(
                "containerRuntime=dind runs a privileged nested daemon; prefer dod".to_string(),
            );
        }
        if config.git_ssh_agent_enabled {
            warnings.push(
                "gitSshAgentEnabled forwards the host ssh-agent into workers".to_string(),
            );
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Replaces the current configuration. Invalid input is rejected and the
    /// current configuration is left unchanged.
    pub fn apply(&self, config: SystemConfig) -> ConfigResult<ValidationReport> {
        let report = Self::validate(&config);
        if !report.valid {
            return Err(ConfigError::Validation(report));
        }
        for warning in &report.warnings {
            warn!(warning, "configuration warning");
        }
        *self.current.write() = config.clone();
        let _ = self.change_tx.send(config);
        Ok(report)
    }

    /// Persists the current configuration atomically (`.tmp` + rename).
    pub fn save(&self) -> ConfigResult<()> {
        let config = self.current();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        let rendered = Self::render(&self.path, &config)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, rendered).map_err(|e| ConfigError::Io {
            path: tmp.display().to_string(),
            source: e,
        })?;
        fs::rename(&tmp, &self.path).map_err(|e| ConfigError::Io {
            path: self.path.display().to_string(),
            source: e,
        })?;
        info!(path = %self.path.display(), "saved configuration");
        Ok(())
    }

    /// Re-reads the file and applies it; validation failures leave the
    /// in-memory configuration unchanged.
    pub fn reload(&self) -> ConfigResult<SystemConfig> {
        let loaded = Self::load_from(&self.path)?;
        self.apply(loaded.clone())?;
        Ok(loaded)
    }

    /// Missing files yield the defaults; a present but unparsable file is an
    /// error, not a silent reset.
    fn load_from(path: &Path) -> ConfigResult<SystemConfig> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(SystemConfig::default())
            }
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };

        if Self::is_toml(path) {
            toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })
        } else {
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })
        }
    }

    fn render(path: &Path, config: &SystemConfig) -> ConfigResult<String> {
        if Self::is_toml(path) {
            toml::to_string_pretty(config).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })
        } else {
            serde_json::to_string_pretty(config).map_err(|e| ConfigError::Parse {
                path: path.display().to_string(),
                message: e.to_string(),
            })
        }
    }

    fn is_toml(path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == "toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let report = SettingsManager::validate(&SystemConfig::default());
        assert!(report.valid);
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn validate_is_idempotent() {
        let mut config = SystemConfig::default();
        config.container_runtime = ContainerRuntimeKind::Dind;
        config.integration_branch = String::new();

        let first = SettingsManager::validate(&config);
        let second = SettingsManager::validate(&config);
        assert_eq!(first, second);
        assert!(!first.valid);
    }

    #[test]
    fn warnings_for_dind_and_ssh_agent() {
        let mut config = SystemConfig::default();
        config.container_runtime = ContainerRuntimeKind::Dind;
        config.git_ssh_agent_enabled = true;

        let report = SettingsManager::validate(&config);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn apply_rejects_invalid_and_keeps_current() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SettingsManager::new(tmp.path().join("config.json")).unwrap();

        let mut bad = SystemConfig::default();
        bad.max_concurrent_workers = 0;

        let err = manager.apply(bad).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
        assert_eq!(manager.current(), SystemConfig::default());
    }

    #[test]
    fn save_load_round_trips_exactly() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        let manager = SettingsManager::new(&path).unwrap();

        let mut config = SystemConfig::default();
        config.max_concurrent_workers = 5;
        config.git_ssh_agent_enabled = true;
        config.auto_refresh_interval = 12345;
        config.allowed_docker_commands = vec!["run".to_string(), "rm".to_string()];
        manager.apply(config.clone()).unwrap();
        manager.save().unwrap();

        let reopened = SettingsManager::new(&path).unwrap();
        assert_eq!(reopened.current(), config);
    }

    #[test]
    fn toml_path_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        let manager = SettingsManager::new(&path).unwrap();
        manager.save().unwrap();

        let reopened = SettingsManager::new(&path).unwrap();
        assert_eq!(reopened.current(), SystemConfig::default());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SettingsManager::new(tmp.path().join("absent.json")).unwrap();
        assert_eq!(manager.current(), SystemConfig::default());
    }

    #[test]
    fn reload_picks_up_external_edits_and_rejects_bad_ones() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        let manager = SettingsManager::new(&path).unwrap();
        manager.save().unwrap();

        let mut edited = SystemConfig::default();
        edited.integration_branch = "main".to_string();
        std::fs::write(&path, serde_json::to_string_pretty(&edited).unwrap()).unwrap();
        manager.reload().unwrap();
        assert_eq!(manager.current().integration_branch, "main");

        edited.max_concurrent_workers = 0;
        std::fs::write(&path, serde_json::to_string_pretty(&edited).unwrap()).unwrap();
        assert!(manager.reload().is_err());
        // The invalid file never reaches the live configuration.
        assert_eq!(manager.current().integration_branch, "main");
        assert_eq!(manager.current().max_concurrent_workers, 3);
    }

    #[test]
    fn subscribers_see_applied_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = SettingsManager::new(tmp.path().join("config.json")).unwrap();
        let mut rx = manager.subscribe();

        let mut config = SystemConfig::default();
        config.max_concurrent_workers = 9;
        manager.apply(config).unwrap();

        let seen = rx.try_recv().unwrap();
        assert_eq!(seen.max_concurrent_workers, 9);
    }
}
