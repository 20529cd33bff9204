//! Configuration management for the device backup tool.
//!
//! Loads configuration from TOML file with environment variable overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides `[backup] root`.
pub const ENV_BACKUP_ROOT: &str = "DEVICE_BACKUP_ROOT";
/// Overrides `[log] level`.
pub const ENV_LOG_LEVEL: &str = "DEVICE_BACKUP_LOG_LEVEL";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// An external program plus any leading arguments (for wrappers such as
/// `sudo` or a shell). Per-call arguments are appended after `args`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfig {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// A command for this tool with the leading arguments already applied.
    pub fn command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args);
        command
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Tool that performs the backup
    #[serde(default = "default_backup_tool")]
    pub backup: ToolConfig,

    /// Tool that answers device property queries
    #[serde(default = "default_info_tool")]
    pub info: ToolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory holding all backups; default output directory
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Seconds between SIGTERM and SIGKILL when cancelling
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    /// Backups kept per device by `prune`
    #[serde(default = "default_keep_per_device")]
    pub keep_per_device: usize,

    /// Timeout for the encryption status query
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_backup_tool() -> ToolConfig {
    ToolConfig::new("idevicebackup2")
}

fn default_info_tool() -> ToolConfig {
    ToolConfig::new("ideviceinfo")
}

fn default_root() -> PathBuf {
    PathBuf::from("/var/lib/device-backup")
}

fn default_cancel_grace_secs() -> u64 {
    5
}

fn default_keep_per_device() -> usize {
    3
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            backup: default_backup_tool(),
            info: default_info_tool(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            cancel_grace_secs: default_cancel_grace_secs(),
            keep_per_device: default_keep_per_device(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl BackupConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Applies `DEVICE_BACKUP_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(root) = lookup(ENV_BACKUP_ROOT).filter(|v| !v.is_empty()) {
            self.backup.root = PathBuf::from(root);
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL).filter(|v| !v.is_empty()) {
            self.log.level = level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.tools.backup.program, "idevicebackup2");
        assert_eq!(config.tools.info.program, "ideviceinfo");
        assert_eq!(config.backup.cancel_grace(), Duration::from_secs(5));
        assert_eq!(config.backup.keep_per_device, 3);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[tools.backup]
program = "sh"
args = ["-c", "exit 0", "tool"]

[backup]
root = "/srv/backups"
keep_per_device = 1
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.tools.backup.args, vec!["-c", "exit 0", "tool"]);
        assert_eq!(config.tools.info.program, "ideviceinfo");
        assert_eq!(config.backup.root, PathBuf::from("/srv/backups"));
        assert_eq!(config.backup.keep_per_device, 1);
        assert_eq!(config.backup.probe_timeout_secs, 10);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[backup]\nkeep_per_device = \"many\"\n").unwrap();
        assert!(Config::from_file(&path).is_err());
        assert!(Config::from_file(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_BACKUP_ROOT, "/tmp/backups"),
            (ENV_LOG_LEVEL, ""),
        ]);
        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.backup.root, PathBuf::from("/tmp/backups"));
        assert_eq!(config.log.level, "info");
    }
}
