use crate::commands::{Command, CommandFactory};
use crate::config::{AppSettings, HostBook, JobFile};
use crate::error::AppResult;
use crate::logging::JobJournal;
use crate::ssh::ConnectionManager;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything a front end needs, built once and passed around.
pub struct AppState {
    pub config_dir: PathBuf,
    pub settings: Arc<RwLock<AppSettings>>,
    pub hosts: Arc<RwLock<HostBook>>,
    pub connections: Arc<ConnectionManager>,
    pub journal: Option<Arc<JobJournal>>,
}

impl AppState {
    pub fn new(config_dir: &Path) -> AppResult<Self> {
        std::fs::create_dir_all(config_dir)?;

        let settings = AppSettings::load(config_dir)?;
        let hosts = HostBook::load(config_dir)?;
        let connections = ConnectionManager::new(&settings, config_dir);

        let journal = if settings.jobs.journal {
            match JobJournal::new(config_dir) {
                Ok(journal) => Some(journal),
                Err(e) => {
                    tracing::warn!("Job journal disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        tracing::info!("sshjob config dir: {:?}", config_dir);
        Ok(Self {
            config_dir: config_dir.to_path_buf(),
            settings: Arc::new(RwLock::new(settings)),
            hosts: Arc::new(RwLock::new(hosts)),
            connections: Arc::new(connections),
            journal,
        })
    }

    pub fn command_factory(&self) -> CommandFactory {
        CommandFactory::new(
            self.connections.clone(),
            self.settings.read().jobs.clone(),
            self.journal.clone(),
        )
    }

    /// Resolve the hosts of a job file and build its command.
    pub fn command_for(&self, job: JobFile) -> AppResult<Command> {
        let hosts = self.hosts.read();
        let first = hosts.resolve(&job.host)?;
        let factory = self.command_factory();
        match job.execution_host.as_deref() {
            Some(name) => {
                let second = hosts.resolve(name)?;
                Ok(factory.command_via(job.command, first, second))
            }
            None => Ok(factory.command(job.command, first)),
        }
    }

    /// Close every pooled connection.
    pub fn shutdown(&self) -> bool {
        let clean = self.connections.close_all_connections();
        if !clean {
            tracing::warn!("Some connections did not close cleanly");
        }
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandConfiguration;

    #[test]
    fn test_state_bootstraps_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("sshjob");
        let state = AppState::new(&config_dir).unwrap();
        assert!(config_dir.join("config.toml").exists());
        assert!(state.journal.is_some());
        assert!(state.connections.list_connections().is_empty());
        assert!(state.shutdown());
    }

    #[test]
    fn test_local_job_builds_local_command() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(dir.path()).unwrap();
        let job = JobFile {
            host: "localhost".to_string(),
            execution_host: None,
            command: CommandConfiguration::new(1, "true"),
        };
        assert!(matches!(state.command_for(job).unwrap(), Command::Local(_)));
    }

    #[test]
    fn test_unknown_host_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(dir.path()).unwrap();
        let job = JobFile {
            host: "nowhere-profile".to_string(),
            execution_host: None,
            command: CommandConfiguration::new(1, "true"),
        };
        assert!(state.command_for(job).is_err());
    }
}
