//! Jobs run over SSH.
//!
//! The pipeline is transfer, launch, monitor, finish. Launch and monitor
//! share one channel lease per stage of the command line, so a job holds
//! its connection's channels from the moment a stage starts until it exits.

use super::configuration::OutputFiles;
use super::monitor::{self, PollOutcome};
use super::{CancelToken, CommandConfiguration, CommandStatus, Lifecycle};
use crate::config::JobSettings;
use crate::error::{AppError, AppResult};
use crate::files::{file_name, RemoteFileHandler};
use crate::logging::{sanitize, JobJournal, JobStage};
use crate::sftp::{self, parse_permissions, shell_quote};
use crate::ssh::{is_would_block, ChannelLease, Connection, ConnectionConfiguration, ConnectionManager};
use ssh2::{Channel, Session};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const READ_BUFFER_BYTES: usize = 32 * 1024;

/// Prefix of the line each stage echoes to stderr with its exit code
const EXIT_MARKER: &str = "__sshjob_exit=";

/// A file to stage before launch
#[derive(Debug, Clone, PartialEq, Eq)]
struct Staged {
    path: String,
    executable: bool,
}

pub struct RemoteCommand {
    manager: Arc<ConnectionManager>,
    config: CommandConfiguration,
    connection_config: Arc<ConnectionConfiguration>,
    execution_config: Option<Arc<ConnectionConfiguration>>,
    connection: Option<Arc<Connection>>,
    poll_interval: Duration,
    executable_permissions: String,
    staging_root: PathBuf,
    lifecycle: Lifecycle,
    token: CancelToken,
}

impl RemoteCommand {
    /// `connection_config` is where the job's files live. With an
    /// `execution_config` the files are staged from there to the execution
    /// host through this machine, and the job runs on the execution host.
    pub fn new(
        manager: Arc<ConnectionManager>,
        config: CommandConfiguration,
        connection_config: Arc<ConnectionConfiguration>,
        execution_config: Option<Arc<ConnectionConfiguration>>,
        settings: &JobSettings,
        journal: Option<Arc<JobJournal>>,
    ) -> Self {
        let lifecycle = Lifecycle::new(config.command_id(), journal);
        Self {
            manager,
            config,
            connection_config,
            execution_config,
            connection: None,
            poll_interval: settings.poll_interval(),
            executable_permissions: settings.executable_permissions.clone(),
            staging_root: settings.staging_root(),
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

    /// The connection later stages run on. After a jump-host transfer this
    /// is the forwarded connection.
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    pub fn execute(&mut self) -> CommandStatus {
        if self.lifecycle.status().is_terminal() {
            return self.lifecycle.status();
        }
        if let Err(e) = self.config.validate() {
            return self.fail(JobStage::Setup, e);
        }

        let target = self
            .execution_config
            .as_ref()
            .unwrap_or(&self.connection_config)
            .clone();
        self.config.set_hostname(target.hostname());
        self.config.executable_name();
        if let Err(e) = self.config.create_output_files() {
            return self.fail(JobStage::Setup, e);
        }

        match self.manager.open_connection(self.connection_config.clone()) {
            Ok(conn) => self.connection = Some(conn),
            Err(e) => return self.fail(JobStage::Setup, e),
        }

        let status = self.transfer_files();
        if status.is_terminal() {
            return status;
        }

        let conn = match self.connection.clone() {
            Some(conn) => conn,
            None => {
                return self.fail(
                    JobStage::Launch,
                    AppError::ConnectionNotFound(target.name().to_string()),
                )
            }
        };
        let mut outputs = match self.config.open_output_files() {
            Ok(files) => files,
            Err(e) => return self.fail(JobStage::Launch, e),
        };

        let stages = self.config.split_command().to_vec();
        for (i, stage) in stages.iter().enumerate() {
            let mut lease = conn.lease();
            let status = self.process_job(&mut lease, i, stage);
            if status != CommandStatus::Running {
                return status;
            }
            let status = self.monitor_job(&mut lease, &mut outputs);
            if status != CommandStatus::Success {
                return status;
            }
        }
        drop(outputs);

        self.finish_job(&conn)
    }

    fn fail(&mut self, stage: JobStage, error: AppError) -> CommandStatus {
        self.lifecycle.transition(stage, error.status(), error.to_string())
    }

    /// Stage the executable and input files into the remote working
    /// directory. Returns PROCESSING to continue or a terminal status.
    fn transfer_files(&mut self) -> CommandStatus {
        let staged = self.staged_files();
        self.lifecycle.transition(
            JobStage::Transfer,
            CommandStatus::Processing,
            format!("staging {} file(s)", staged.len()),
        );

        let permissions = match parse_permissions(&self.executable_permissions) {
            Ok(mode) => mode,
            Err(e) => return self.fail(JobStage::Transfer, e),
        };
        let base = match self.connection.clone() {
            Some(conn) => conn,
            None => {
                let name = self.connection_config.name().to_string();
                return self.fail(JobStage::Transfer, AppError::ConnectionNotFound(name));
            }
        };

        let result = match self.execution_config.clone() {
            None => self.stage_direct(&base, &staged, permissions),
            Some(second) => self.stage_through(&base, second, &staged, permissions),
        };
        match result {
            Ok(executable_staged) => {
                if executable_staged {
                    self.config.set_launch_in_place(true);
                    self.config.executable_name();
                }
                self.lifecycle.status()
            }
            Err(e) => self.fail(JobStage::Transfer, e),
        }
    }

    /// Upload straight to the job's host. `true` if the executable was
    /// among the files staged.
    fn stage_direct(&self, conn: &Arc<Connection>, staged: &[Staged], permissions: u32) -> AppResult<bool> {
        let mut handler = RemoteFileHandler::new(conn.clone());
        let destination = format!("{}:{}", conn.config().hostname(), self.remote_directory());
        let mut executable_staged = false;
        for file in staged {
            if file.executable && !Path::new(&file.path).is_file() {
                tracing::debug!("{} is not a local file; not staging it", file.path);
                continue;
            }
            handler.set_permissions(file.executable.then_some(permissions));
            copy(&mut handler, &file.path, &destination)?;
            executable_staged |= file.executable;
        }
        Ok(executable_staged)
    }

    /// Two-legged staging: files come down from `base` into a scratch
    /// directory here, then go up to `second` through a connection
    /// forwarded over `base`. The active connection becomes the forwarded
    /// one.
    fn stage_through(
        &mut self,
        base: &Arc<Connection>,
        second: Arc<ConnectionConfiguration>,
        staged: &[Staged],
        permissions: u32,
    ) -> AppResult<bool> {
        let scratch = self
            .staging_root
            .join(format!("sshjob-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&scratch).map_err(|e| {
            AppError::DestinationUnavailable(format!("Cannot create {}: {}", scratch.display(), e))
        })?;

        let result = self.relay(base, second, staged, permissions, &scratch);

        if let Err(e) = fs::remove_dir_all(&scratch) {
            tracing::warn!("Could not remove staging directory {}: {}", scratch.display(), e);
        }

        let (forwarded, executable_staged) = result?;
        tracing::info!(
            "Command {} rebound from {} to {}",
            self.config.command_id(),
            base.name(),
            forwarded.name()
        );
        self.connection = Some(forwarded);
        Ok(executable_staged)
    }

    fn relay(
        &self,
        base: &Arc<Connection>,
        second: Arc<ConnectionConfiguration>,
        staged: &[Staged],
        permissions: u32,
        scratch: &Path,
    ) -> AppResult<(Arc<Connection>, bool)> {
        let scratch_dir = format!("{}/", scratch.to_string_lossy());
        let source_host = base.config().hostname().to_string();

        let mut download = RemoteFileHandler::new(base.clone());
        let mut local_copies = Vec::new();
        for file in staged {
            let designation = format!("{}:{}", source_host, file.path);
            if file.executable && !download.exists(&designation)? {
                tracing::debug!("{} is not a file on {}; not staging it", file.path, base.name());
                continue;
            }
            copy(&mut download, &designation, &scratch_dir)?;
            local_copies.push(Staged {
                path: scratch.join(file_name(&file.path)).to_string_lossy().to_string(),
                executable: file.executable,
            });
        }

        let forwarded = self.manager.open_forwarding_connection(base, second)?;
        let mut upload = RemoteFileHandler::new(forwarded.clone());
        let destination = format!("{}:{}", forwarded.config().hostname(), self.remote_directory());
        for file in &local_copies {
            upload.set_permissions(file.executable.then_some(permissions));
            copy(&mut upload, &file.path, &destination)?;
        }
        let executable_staged = local_copies.iter().any(|f| f.executable);
        Ok((forwarded, executable_staged))
    }

    /// Launch one stage on a fresh execution channel.
    fn process_job(&mut self, lease: &mut ChannelLease<'_>, index: usize, stage: &str) -> CommandStatus {
        self.lifecycle.transition(
            JobStage::Launch,
            CommandStatus::Launching,
            format!("stage {} on {}", index, lease.connection().name()),
        );
        let line = self.remote_line(stage);
        match lease.open_exec(&line) {
            Ok(_) => self.lifecycle.transition(
                JobStage::Launch,
                CommandStatus::Running,
                format!("stage {}: {}", index, sanitize(&line)),
            ),
            Err(e) => self.lifecycle.transition(JobStage::Launch, CommandStatus::Failed, e.to_string()),
        }
    }

    /// Poll the running stage, copying its output into the local files.
    /// SUCCESS means the stage exited 0 and the pipeline may continue.
    fn monitor_job(&mut self, lease: &mut ChannelLease<'_>, outputs: &mut OutputFiles) -> CommandStatus {
        let session = lease.session().clone();
        let mut buf = vec![0u8; READ_BUFFER_BYTES];
        let mut marker = ExitMarker::default();
        let outcome = monitor::poll(self.poll_interval, &self.token, || {
            check_stage(lease, &session, outputs, &mut marker, &mut buf)
        });

        match outcome {
            Ok(PollOutcome::Exited(0)) => {
                tracing::debug!("Command {} stage exited 0", self.config.command_id());
                CommandStatus::Success
            }
            Ok(PollOutcome::Exited(code)) => self.lifecycle.transition(
                JobStage::Monitor,
                CommandStatus::Failed,
                format!("exited with {}", code),
            ),
            Ok(PollOutcome::Canceled) => {
                if !lease.close() {
                    tracing::warn!("Channels of canceled command did not close cleanly");
                }
                self.lifecycle
                    .transition(JobStage::Monitor, CommandStatus::Canceled, "canceled")
            }
            Err(e) => self.lifecycle.transition(
                JobStage::Monitor,
                CommandStatus::Failed,
                AppError::Execution(e.to_string()).to_string(),
            ),
        }
    }

    /// Remove the remote working directory if asked to, release the
    /// channels and read the output back. Cleanup failures are only logged.
    fn finish_job(&mut self, conn: &Connection) -> CommandStatus {
        {
            let mut lease = conn.lease();
            let directory = self.config.remote_working_directory().trim_end_matches('/');
            if conn.config().delete_working_directory() && is_removable(directory) {
                match lease.sftp().and_then(|channel| sftp::remove_all(channel, directory)) {
                    Ok(()) => tracing::info!("Removed {} on {}", directory, conn.name()),
                    Err(e) => tracing::warn!("Could not remove {} on {}: {}", directory, conn.name(), e),
                }
            }
            if !lease.close() {
                tracing::warn!("Channels on {} did not close cleanly", conn.name());
            }
        }

        if let Err(e) = self.config.collect_output() {
            tracing::warn!("Could not read back output of command {}: {}", self.config.command_id(), e);
        }
        self.lifecycle
            .transition(JobStage::Finish, CommandStatus::Success, "completed")
    }

    fn remote_directory(&self) -> String {
        let directory = self.config.remote_working_directory().trim_end_matches('/');
        if directory.is_empty() {
            "./".to_string()
        } else {
            format!("{}/", directory)
        }
    }

    /// The executable as a stageable file name, if it is one.
    fn executable_file(&self) -> Option<String> {
        let executable = self.config.executable().trim();
        if executable.contains("${") || executable.contains(';') || executable.contains(char::is_whitespace) {
            return None;
        }
        Some(executable.trim_start_matches("./").to_string())
    }

    fn staged_files(&self) -> Vec<Staged> {
        let working_directory = self.config.working_directory();
        let resolve = |path: &str| {
            if Path::new(path).is_absolute() {
                path.to_string()
            } else {
                format!("{}{}", working_directory, path)
            }
        };

        let mut staged = Vec::new();
        if let Some(executable) = self.executable_file() {
            staged.push(Staged {
                path: resolve(&executable),
                executable: true,
            });
        }
        for path in self.config.input_files().values() {
            staged.push(Staged {
                path: resolve(path),
                executable: false,
            });
        }
        staged
    }

    /// The shell line for one stage: change into the remote working
    /// directory, fix line endings of Windows-authored scripts, run, then
    /// report the exit code on stderr.
    fn remote_line(&self, stage: &str) -> String {
        let mut line = String::new();
        let directory = self.config.remote_working_directory();
        if !directory.is_empty() {
            line.push_str(&format!("cd {} && ", shell_quote(directory)));
        }
        if self.config.is_windows() {
            if let Some(script) = self.executable_file() {
                line.push_str(&format!("sed -i 's/\\r$//' {} && ", shell_quote(file_name(&script))));
            }
        }
        let stage = stage.trim().trim_end_matches(';').trim_end();
        line.push_str(&format!("{}; echo \"{}$?\" >&2", stage, EXIT_MARKER));
        line
    }
}

fn copy(handler: &mut RemoteFileHandler, source: &str, destination: &str) -> AppResult<()> {
    match handler.copy(source, destination)? {
        CommandStatus::Success => Ok(()),
        status => Err(AppError::Transfer(format!(
            "Copy of {} to {} ended {}",
            source, destination, status
        ))),
    }
}

fn is_removable(directory: &str) -> bool {
    !matches!(directory, "" | "." | ".." | "~" | "/")
}

/// One poll of a running stage: drain available output without blocking,
/// and collect the exit code once the remote side has closed.
fn check_stage(
    lease: &mut ChannelLease<'_>,
    session: &Session,
    outputs: &mut OutputFiles,
    marker: &mut ExitMarker,
    buf: &mut [u8],
) -> AppResult<Option<i32>> {
    let channel = lease
        .exec_channel()
        .ok_or_else(|| AppError::Execution("Execution channel is gone".to_string()))?;

    session.set_blocking(false);
    let drained = drain(channel, outputs, marker, buf);
    let finished = channel.eof();
    session.set_blocking(true);
    drained?;

    if !finished {
        return Ok(None);
    }
    drain(channel, outputs, marker, buf)?;
    marker.finish(&mut outputs.err)?;
    outputs.err.flush()?;
    channel.wait_close()?;
    if let Some(signal) = channel.exit_signal()?.exit_signal {
        tracing::warn!("Remote job killed by signal {}", signal);
        return Ok(Some(-1));
    }
    match marker.code {
        Some(code) => Ok(Some(code)),
        None => {
            // The stage line ended before its echo, e.g. on `exit`.
            let status = channel.exit_status()?;
            if status == 0 {
                tracing::warn!("Remote stage closed without reporting an exit code");
                Ok(Some(-1))
            } else {
                Ok(Some(status))
            }
        }
    }
}

fn drain(
    channel: &mut Channel,
    outputs: &mut OutputFiles,
    marker: &mut ExitMarker,
    buf: &mut [u8],
) -> io::Result<()> {
    copy_available(&mut *channel, buf, |data| outputs.out.write_all(data))?;
    copy_available(&mut channel.stderr(), buf, |data| marker.feed(data, &mut outputs.err))?;
    outputs.out.flush()?;
    outputs.err.flush()
}

fn copy_available(
    reader: &mut impl Read,
    buf: &mut [u8],
    mut sink: impl FnMut(&[u8]) -> io::Result<()>,
) -> io::Result<()> {
    loop {
        match reader.read(buf) {
            Ok(0) => return Ok(()),
            Ok(n) => sink(&buf[..n])?,
            Err(ref e) if is_would_block(e) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Splits the exit-code line off a stage's stderr. Lines are passed
/// through whole; a trailing partial line is held until the next chunk.
#[derive(Debug, Default)]
struct ExitMarker {
    pending: Vec<u8>,
    code: Option<i32>,
}

impl ExitMarker {
    fn feed(&mut self, data: &[u8], writer: &mut impl Write) -> io::Result<()> {
        self.pending.extend_from_slice(data);
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            self.line(&line, writer)?;
        }
        Ok(())
    }

    fn finish(&mut self, writer: &mut impl Write) -> io::Result<()> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.line(&line, writer)?;
        }
        Ok(())
    }

    fn line(&mut self, line: &[u8], writer: &mut impl Write) -> io::Result<()> {
        let marker = EXIT_MARKER.as_bytes();
        let start = line.windows(marker.len()).rposition(|w| w == marker);
        if let Some(start) = start {
            let code = std::str::from_utf8(&line[start + marker.len()..])
                .ok()
                .and_then(|rest| rest.trim().parse::<i32>().ok());
            if let Some(code) = code {
                self.code = Some(code);
                // Output without a final newline shares the marker's line.
                return writer.write_all(&line[..start]);
            }
        }
        writer.write_all(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::connection::tests::remote_config;
    use crate::ssh::Connector;

    struct Unreachable;

    impl Connector for Unreachable {
        fn open(&self, config: Arc<ConnectionConfiguration>) -> AppResult<Connection> {
            Err(AppError::Connection(format!("{} unreachable", config.name())))
        }

        fn open_forwarded(
            &self,
            _: &Arc<Connection>,
            config: Arc<ConnectionConfiguration>,
        ) -> AppResult<Connection> {
            Err(AppError::Connection(format!("{} unreachable", config.name())))
        }
    }

    fn job(dir: &Path) -> CommandConfiguration {
        let mut config = CommandConfiguration::new(5, "./run.sh");
        config.add_input_file("input", "in.dat");
        config.set_working_directory(&dir.to_string_lossy());
        config.set_remote_working_directory("/tmp/job1");
        config.set_out_file_name(dir.join("job.out").to_string_lossy());
        config.set_err_file_name(dir.join("job.err").to_string_lossy());
        config.set_os("linux");
        config
    }

    fn command(config: CommandConfiguration, second: Option<Arc<ConnectionConfiguration>>) -> RemoteCommand {
        RemoteCommand::new(
            Arc::new(ConnectionManager::with_connector(Arc::new(Unreachable))),
            config,
            remote_config("cluster"),
            second,
            &JobSettings::default(),
            None,
        )
    }

    #[test]
    fn test_unreachable_host_is_infoerror() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = command(job(dir.path()), None);
        assert_eq!(remote.execute(), CommandStatus::InfoError);
        assert!(remote.connection().is_none());
        // Terminal states are final.
        assert_eq!(remote.execute(), CommandStatus::InfoError);
    }

    #[test]
    fn test_unreachable_jump_host_is_infoerror() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = command(job(dir.path()), Some(remote_config("final")));
        assert_eq!(remote.execute(), CommandStatus::InfoError);
        assert_eq!(remote.configuration().hostname(), "remote.example.org");
    }

    #[test]
    fn test_invalid_configuration_never_connects() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = job(dir.path());
        config.set_executable("");
        let mut remote = command(config, None);
        assert_eq!(remote.execute(), CommandStatus::InfoError);
    }

    #[test]
    fn test_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = job(dir.path());
        config.add_input_file("mesh", "/data/mesh.exo");
        let remote = command(config, None);
        let wd = remote.configuration().working_directory().to_string();
        assert_eq!(
            remote.staged_files(),
            vec![
                Staged { path: format!("{}run.sh", wd), executable: true },
                Staged { path: format!("{}in.dat", wd), executable: false },
                Staged { path: "/data/mesh.exo".to_string(), executable: false },
            ]
        );
    }

    #[test]
    fn test_installed_executable_is_not_staged() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = job(dir.path());
        config.set_executable("${installDir}solver");
        let remote = command(config, None);
        assert!(remote.executable_file().is_none());
        assert!(remote.staged_files().iter().all(|f| !f.executable));
    }

    #[test]
    fn test_remote_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut remote = command(job(dir.path()), None);
        assert_eq!(
            remote.remote_line("./run.sh in.dat;"),
            "cd /tmp/job1 && ./run.sh in.dat; echo \"__sshjob_exit=$?\" >&2"
        );

        remote.config.set_os("Windows 10");
        assert_eq!(
            remote.remote_line("./run.sh in.dat;"),
            "cd /tmp/job1 && sed -i 's/\\r$//' run.sh && ./run.sh in.dat; echo \"__sshjob_exit=$?\" >&2"
        );

        remote.config.set_remote_working_directory("");
        remote.config.set_os("darwin");
        assert_eq!(remote.remote_line("ls"), "ls; echo \"__sshjob_exit=$?\" >&2");
        assert_eq!(remote.remote_directory(), "./");
    }

    #[test]
    fn test_staged_script_launches_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = job(dir.path());
        config.set_executable("run.sh");
        let mut remote = command(config, None);
        remote.config.executable_name();
        assert_eq!(remote.config.split_command(), ["run.sh in.dat;"]);

        // What transfer_files does once the script is on the host.
        remote.config.set_launch_in_place(true);
        remote.config.executable_name();
        let stage = remote.config.split_command()[0].clone();
        assert_eq!(
            remote.remote_line(&stage),
            "cd /tmp/job1 && ./run.sh in.dat; echo \"__sshjob_exit=$?\" >&2"
        );
    }

    #[test]
    fn test_exit_marker_is_split_from_stderr() {
        let mut marker = ExitMarker::default();
        let mut err = Vec::new();
        marker.feed(b"warning: low mem", &mut err).unwrap();
        assert!(err.is_empty());
        marker.feed(b"ory\n__sshjob_e", &mut err).unwrap();
        marker.feed(b"xit=3\n", &mut err).unwrap();
        marker.finish(&mut err).unwrap();
        assert_eq!(err, b"warning: low memory\n");
        assert_eq!(marker.code, Some(3));
    }

    #[test]
    fn test_exit_marker_after_unterminated_output() {
        let mut marker = ExitMarker::default();
        let mut err = Vec::new();
        marker.feed(b"no newline__sshjob_exit=0\n", &mut err).unwrap();
        marker.finish(&mut err).unwrap();
        assert_eq!(err, b"no newline");
        assert_eq!(marker.code, Some(0));
    }

    #[test]
    fn test_missing_exit_marker_leaves_code_unknown() {
        let mut marker = ExitMarker::default();
        let mut err = Vec::new();
        marker.feed(b"Segmentation fault\n__sshjob_exit=", &mut err).unwrap();
        marker.finish(&mut err).unwrap();
        assert_eq!(marker.code, None);
        assert_eq!(err, b"Segmentation fault\n__sshjob_exit=");
    }

    #[test]
    fn test_removable_directories() {
        assert!(is_removable("/tmp/job1"));
        assert!(!is_removable(""));
        assert!(!is_removable("."));
        assert!(!is_removable("~"));
    }
}
