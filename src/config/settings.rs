use crate::error::{AppError, AppResult};
use crate::ssh::KnownHostsPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub jobs: JobSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_port")]
    pub default_port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval: u32,
    #[serde(default)]
    pub known_hosts_policy: KnownHostsPolicy,
    #[serde(default)]
    pub known_hosts_file: Option<PathBuf>,
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_keepalive() -> u32 {
    60
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            default_port: default_port(),
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval: default_keepalive(),
            known_hosts_policy: KnownHostsPolicy::default(),
            known_hosts_file: None,
        }
    }
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// The known_hosts file to check, `<config>/known_hosts` unless overridden.
    pub fn known_hosts_path(&self, config_dir: &Path) -> PathBuf {
        self.known_hosts_file
            .clone()
            .unwrap_or_else(|| config_dir.join("known_hosts"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_executable_permissions")]
    pub executable_permissions: String,
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub journal: bool,
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_executable_permissions() -> String {
    "700".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            executable_permissions: default_executable_permissions(),
            staging_dir: None,
            journal: true,
        }
    }
}

impl JobSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Root under which jump-host scratch directories are created.
    pub fn staging_root(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl AppSettings {
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let settings: AppSettings = toml::from_str(&content)?;
            settings.validate()?;
            Ok(settings)
        } else {
            let settings = AppSettings::default();
            settings.save(config_dir)?;
            Ok(settings)
        }
    }

    pub fn save(&self, config_dir: &Path) -> AppResult<()> {
        std::fs::create_dir_all(config_dir)?;
        let config_path = config_dir.join("config.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    fn validate(&self) -> AppResult<()> {
        crate::sftp::parse_permissions(&self.jobs.executable_permissions).map_err(|_| {
            AppError::Config(format!(
                "jobs.executable_permissions must be octal, got {:?}",
                self.jobs.executable_permissions
            ))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_written_on_first_load() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AppSettings::load(dir.path()).unwrap();
        assert_eq!(settings.ssh.default_port, 22);
        assert_eq!(settings.jobs.poll_interval(), Duration::from_secs(1));
        assert_eq!(settings.jobs.executable_permissions, "700");
        assert!(dir.path().join("config.toml").exists());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[jobs]\npoll_interval_ms = 250\n\n[ssh]\nknown_hosts_policy = \"strict\"\n",
        )
        .unwrap();
        let settings = AppSettings::load(dir.path()).unwrap();
        assert_eq!(settings.jobs.poll_interval_ms, 250);
        assert_eq!(settings.ssh.known_hosts_policy, KnownHostsPolicy::Strict);
        assert_eq!(settings.ssh.keepalive_interval, 60);
        assert!(settings.jobs.journal);
    }

    #[test]
    fn test_rejects_non_octal_permissions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[jobs]\nexecutable_permissions = \"rwx\"\n",
        )
        .unwrap();
        assert!(AppSettings::load(dir.path()).is_err());
    }
}
