use super::monitor::{self, PollOutcome};
use super::{CancelToken, CommandConfiguration, CommandStatus, Lifecycle};
use crate::config::JobSettings;
use crate::error::{AppError, AppResult};
use crate::logging::{sanitize, JobJournal, JobStage};
use crate::ssh::local_hostname;
use std::path::Path;
use std::process::{Child, Command as Process, Stdio};
use std::sync::Arc;
use std::time::Duration;

/// A job run as child processes of this one.
pub struct LocalCommand {
    config: CommandConfiguration,
    poll_interval: Duration,
    lifecycle: Lifecycle,
    token: CancelToken,
}

impl LocalCommand {
    pub fn new(
        config: CommandConfiguration,
        settings: &JobSettings,
        journal: Option<Arc<JobJournal>>,
    ) -> Self {
        let lifecycle = Lifecycle::new(config.command_id(), journal);
        Self {
            config,
            poll_interval: settings.poll_interval(),
            lifecycle,
            token: CancelToken::new(),
        }
    }

    pub fn status(&self) -> CommandStatus {
        self.lifecycle.status()
    }

    pub fn configuration(&self) -> &CommandConfiguration {
        &self.config
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn execute(&mut self) -> CommandStatus {
        if self.lifecycle.status().is_terminal() {
            return self.lifecycle.status();
        }
        if let Err(e) = self.config.validate() {
            return self.lifecycle.transition(JobStage::Setup, e.status(), e.to_string());
        }

        let working_directory = self.config.working_directory().to_string();
        if !Path::new(&working_directory).is_dir() {
            return self.lifecycle.transition(
                JobStage::Setup,
                CommandStatus::Failed,
                format!("Working directory {} does not exist", working_directory),
            );
        }

        self.config.set_hostname(local_hostname());
        // cmd.exe searches the working directory on its own.
        if cfg!(unix) {
            let in_place = Path::new(&working_directory)
                .join(self.config.executable().trim())
                .is_file();
            self.config.set_launch_in_place(in_place);
        }
        self.config.executable_name();
        if let Err(e) = self.config.create_output_files() {
            return self.lifecycle.transition(JobStage::Setup, CommandStatus::Failed, e.to_string());
        }

        let stages = self.config.split_command().to_vec();
        for (i, stage) in stages.iter().enumerate() {
            self.lifecycle.transition(
                JobStage::Launch,
                CommandStatus::Launching,
                format!("stage {}: {}", i, sanitize(stage)),
            );
            let status = match self.run_stage(stage, &working_directory) {
                Ok(status) => status,
                Err(e) => e.status(),
            };
            if status != CommandStatus::Success {
                return self.lifecycle.transition(
                    JobStage::Monitor,
                    status,
                    format!("stage {} ended {}", i, status),
                );
            }
        }

        if let Err(e) = self.config.collect_output() {
            tracing::warn!("Could not read back output of command {}: {}", self.config.command_id(), e);
        }
        self.lifecycle
            .transition(JobStage::Finish, CommandStatus::Success, "completed")
    }

    fn run_stage(&mut self, stage: &str, working_directory: &str) -> AppResult<CommandStatus> {
        let files = self.config.open_output_files()?;
        let mut child = shell(stage)
            .current_dir(working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::from(files.out))
            .stderr(Stdio::from(files.err))
            .spawn()
            .map_err(|e| AppError::Execution(format!("Failed to start `{}`: {}", stage, e)))?;

        self.lifecycle.transition(
            JobStage::Launch,
            CommandStatus::Running,
            format!("pid {}", child.id()),
        );
        let outcome = monitor::poll(self.poll_interval, &self.token, || {
            Ok(child.try_wait()?.map(|status| status.code().unwrap_or(-1)))
        });

        match outcome {
            Ok(PollOutcome::Canceled) => {
                stop(&mut child);
                Ok(CommandStatus::Canceled)
            }
            Ok(exited) => Ok(exited.status()),
            Err(e) => {
                stop(&mut child);
                Err(e)
            }
        }
    }
}

fn shell(line: &str) -> Process {
    if cfg!(windows) {
        let mut process = Process::new("cmd");
        process.arg("/C").arg(line);
        process
    } else {
        let mut process = Process::new("sh");
        process.arg("-c").arg(line);
        process
    }
}

fn stop(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::debug!("Kill of pid {} failed: {}", child.id(), e);
    }
    if let Err(e) = child.wait() {
        tracing::warn!("Reaping pid {} failed: {}", child.id(), e);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    fn settings() -> JobSettings {
        JobSettings {
            poll_interval_ms: 50,
            ..JobSettings::default()
        }
    }

    fn job(dir: &Path, executable: &str) -> CommandConfiguration {
        let mut config = CommandConfiguration::new(11, executable);
        config.set_working_directory(&dir.to_string_lossy());
        config.set_out_file_name(dir.join("job.out").to_string_lossy());
        config.set_err_file_name(dir.join("job.err").to_string_lossy());
        config
    }

    #[test]
    fn test_success_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("in.dat"), b"payload\n").unwrap();
        let mut config = job(dir.path(), "cat");
        config.add_input_file("input", "in.dat");

        let mut command = LocalCommand::new(config, &settings(), None);
        assert_eq!(command.execute(), CommandStatus::Success);
        assert_eq!(command.configuration().std_output(), "payload\n");
        assert_eq!(command.status(), CommandStatus::Success);
    }

    #[test]
    fn test_script_in_working_directory_runs_by_bare_name() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("run.sh");
        fs::write(&script, b"#!/bin/sh\necho \"ran with $1\"\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(dir.path().join("in.dat"), b"x").unwrap();
        let mut config = job(dir.path(), "run.sh");
        config.add_input_file("input", "in.dat");

        let mut command = LocalCommand::new(config, &settings(), None);
        assert_eq!(command.execute(), CommandStatus::Success);
        assert_eq!(command.configuration().full_command(), "./run.sh in.dat");
        assert_eq!(command.configuration().std_output(), "ran with in.dat\n");
    }

    #[test]
    fn test_nonzero_exit_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut command = LocalCommand::new(job(dir.path(), "exit 3"), &settings(), None);
        assert_eq!(command.execute(), CommandStatus::Failed);
        // Terminal states are final.
        assert_eq!(command.execute(), CommandStatus::Failed);
    }

    #[test]
    fn test_stages_stop_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let line = format!("false; touch {}", marker.display());
        let mut command = LocalCommand::new(job(dir.path(), &line), &settings(), None);
        assert_eq!(command.execute(), CommandStatus::Failed);
        assert!(!marker.exists());
    }

    #[test]
    fn test_missing_working_directory_is_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = job(dir.path(), "true");
        config.set_working_directory("/definitely/not/here");
        let mut command = LocalCommand::new(config, &settings(), None);
        assert_eq!(command.execute(), CommandStatus::Failed);
    }

    #[test]
    fn test_invalid_configuration_is_infoerror() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = job(dir.path(), "true");
        config.set_out_file_name("");
        let mut command = LocalCommand::new(config, &settings(), None);
        assert_eq!(command.execute(), CommandStatus::InfoError);
    }

    #[test]
    fn test_cancel_stops_running_job() {
        let dir = tempfile::tempdir().unwrap();
        let mut command = LocalCommand::new(job(dir.path(), "sleep 30"), &settings(), None);
        let token = command.cancel_token();
        let canceler = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            token.cancel();
        });
        let start = std::time::Instant::now();
        assert_eq!(command.execute(), CommandStatus::Canceled);
        assert!(start.elapsed() < Duration::from_secs(5));
        canceler.join().unwrap();
    }
}
