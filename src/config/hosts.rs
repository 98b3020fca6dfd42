use crate::error::{AppError, AppResult};
use crate::keychain::SecretStore;
use crate::ssh::{is_local_hostname, AuthorizationHandler, ConnectionConfiguration};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How a host authenticates, as written in hosts.toml.
///
/// `kind` is one of `console`, `text`, `keypath`, `local` or `keychain`;
/// `option` is the kind-specific value (credentials file, key file,
/// `user@host` for the console, keychain entry name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub kind: String,
    #[serde(default)]
    pub option: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            kind: "console".to_string(),
            option: None,
        }
    }
}

/// Named target host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostProfile {
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub delete_working_directory: bool,
}

fn default_port() -> u16 {
    22
}

impl HostProfile {
    pub fn new(name: impl Into<String>, host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: default_port(),
            username: username.into(),
            auth: AuthConfig::default(),
            delete_working_directory: false,
        }
    }

    /// Build the immutable connection configuration for this profile.
    pub fn to_connection_configuration(
        &self,
        secrets: &SecretStore,
    ) -> AppResult<Arc<ConnectionConfiguration>> {
        let mut auth = AuthorizationHandler::from_kind(&self.auth.kind, self.auth.option.as_deref())?
            .with_secret_store(secrets.clone());

        // Values from a credentials file win over the profile.
        if auth.hostname().is_empty() && !self.host.is_empty() {
            auth.set_hostname(&self.host);
        }
        if auth.username().is_empty() && !self.username.is_empty() {
            auth.set_username(&self.username);
        }
        auth.set_port(self.port);

        if auth.hostname().is_empty() {
            return Err(AppError::InvalidConfig(format!(
                "Host profile {} has no host name",
                self.name
            )));
        }

        Ok(Arc::new(ConnectionConfiguration::new(
            self.name.clone(),
            auth,
            self.delete_working_directory,
        )))
    }
}

/// hosts.toml file format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostsFile {
    #[serde(default)]
    pub hosts: Vec<HostProfile>,
}

/// Host profiles keyed by name
pub struct HostBook {
    hosts: BTreeMap<String, HostProfile>,
    config_path: PathBuf,
    secrets: SecretStore,
}

impl HostBook {
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let config_path = config_dir.join("hosts.toml");
        let hosts = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let file: HostsFile = toml::from_str(&content)?;
            file.hosts
                .into_iter()
                .map(|h| (h.name.clone(), h))
                .collect()
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            hosts,
            config_path,
            secrets: SecretStore::new(config_dir),
        })
    }

    pub fn save(&self) -> AppResult<()> {
        let hosts: Vec<_> = self.hosts.values().cloned().collect();
        let content = toml::to_string_pretty(&HostsFile { hosts })?;
        std::fs::write(&self.config_path, content)?;
        Ok(())
    }

    pub fn list(&self) -> Vec<HostProfile> {
        self.hosts.values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<&HostProfile> {
        self.hosts.get(name)
    }

    pub fn add(&mut self, profile: HostProfile) -> AppResult<()> {
        self.hosts.insert(profile.name.clone(), profile);
        self.save()
    }

    pub fn remove(&mut self, name: &str) -> AppResult<()> {
        self.hosts
            .remove(name)
            .ok_or_else(|| AppError::Config(format!("Host profile {} not found", name)))?;
        self.save()
    }

    pub fn secrets(&self) -> &SecretStore {
        &self.secrets
    }

    /// Resolve a host name to a connection configuration.
    ///
    /// Unknown names that denote this machine resolve to a local-host
    /// configuration; any other unknown name is an error.
    pub fn resolve(&self, name: &str) -> AppResult<Arc<ConnectionConfiguration>> {
        if let Some(profile) = self.hosts.get(name) {
            return profile.to_connection_configuration(&self.secrets);
        }
        if is_local_hostname(name) {
            let auth = AuthorizationHandler::from_kind("local", None)?;
            return Ok(Arc::new(ConnectionConfiguration::new(name, auth, false)));
        }
        Err(AppError::Config(format!("Host profile {} not found", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_hosts(dir: &Path, content: &str) {
        std::fs::write(dir.join("hosts.toml"), content).unwrap();
    }

    #[test]
    fn test_load_and_resolve_keypath_profile() {
        let dir = tempfile::tempdir().unwrap();
        write_hosts(
            dir.path(),
            r#"
[[hosts]]
name = "cluster"
host = "cluster.example.org"
port = 2222
username = "alice"
delete_working_directory = true

[hosts.auth]
kind = "keypath"
option = "/home/alice/.ssh/id_ed25519"
"#,
        );
        let book = HostBook::load(dir.path()).unwrap();
        let config = book.resolve("cluster").unwrap();
        assert_eq!(config.name(), "cluster");
        assert!(config.delete_working_directory());
        assert_eq!(config.authorization().hostname(), "cluster.example.org");
        assert_eq!(config.authorization().username(), "alice");
        assert_eq!(config.authorization().port(), 2222);
    }

    #[test]
    fn test_localhost_resolves_without_profile() {
        let dir = tempfile::tempdir().unwrap();
        let book = HostBook::load(dir.path()).unwrap();
        let config = book.resolve("localhost").unwrap();
        assert!(config.is_local());
        assert!(book.resolve("nowhere.example.org").is_err());
    }

    #[test]
    fn test_add_and_remove_persist() {
        let dir = tempfile::tempdir().unwrap();
        let mut book = HostBook::load(dir.path()).unwrap();
        book.add(HostProfile::new("b", "b.example.org", "bob")).unwrap();

        let reloaded = HostBook::load(dir.path()).unwrap();
        assert_eq!(reloaded.list().len(), 1);
        assert_eq!(reloaded.get("b").unwrap().username, "bob");

        book.remove("b").unwrap();
        assert!(book.remove("b").is_err());
    }

    #[test]
    fn test_profile_without_host_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let book = HostBook::load(dir.path()).unwrap();
        let profile = HostProfile::new("empty", "", "bob");
        let err = profile.to_connection_configuration(book.secrets()).unwrap_err();
        assert!(matches!(err, AppError::InvalidConfig(_)));
    }
}
