use sshjob::commands::{Command, CommandConfiguration, CommandFactory, CommandStatus};
use sshjob::config::{JobFile, JobSettings};
use sshjob::error::{AppError, AppResult};
use sshjob::logging::JournalFilter;
use sshjob::ssh::{AuthorizationHandler, Connection, ConnectionConfiguration, ConnectionManager, Connector};
use sshjob::AppState;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

/// Connector for hosts that never answer
#[derive(Default)]
struct Unreachable {
    attempts: AtomicUsize,
}

impl Connector for Unreachable {
    fn open(&self, config: Arc<ConnectionConfiguration>) -> AppResult<Connection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(AppError::Connection(format!("{} is unreachable", config.hostname())))
    }

    fn open_forwarded(
        &self,
        _base: &Arc<Connection>,
        config: Arc<ConnectionConfiguration>,
    ) -> AppResult<Connection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(AppError::Connection(format!("{} is unreachable", config.hostname())))
    }
}

fn remote_config(name: &str, target: &str) -> Arc<ConnectionConfiguration> {
    let auth = AuthorizationHandler::from_kind("console", Some(target)).unwrap();
    Arc::new(ConnectionConfiguration::new(name, auth, false))
}

fn job_in(dir: &Path, executable: &str) -> CommandConfiguration {
    let mut config = CommandConfiguration::new(21, executable);
    config.set_working_directory(&dir.to_string_lossy());
    config.set_remote_working_directory("/tmp/sshjob-21");
    config.set_out_file_name(dir.join("job.out").to_string_lossy());
    config.set_err_file_name(dir.join("job.err").to_string_lossy());
    config
}

#[cfg(unix)]
#[test]
fn test_local_job_file_runs_to_success() -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = tempdir()?;
    let work = tempdir()?;
    fs::create_dir(work.path().join("data"))?;
    fs::write(work.path().join("data").join("in.dat"), "42\n")?;

    let job_path = work.path().join("job.toml");
    fs::write(
        &job_path,
        format!(
            r#"
host = "localhost"

[command]
command_id = 5
executable = "cat"
working_directory = "data"
out_file_name = "{out}"
err_file_name = "{err}"

[command.input_files]
input = "in.dat"
"#,
            out = work.path().join("job5.out").display(),
            err = work.path().join("job5.err").display(),
        ),
    )?;

    let state = AppState::new(config_dir.path())?;
    let mut command = state.command_for(JobFile::load(&job_path)?)?;
    assert!(matches!(command, Command::Local(_)));

    assert_eq!(command.execute(), CommandStatus::Success);
    assert_eq!(command.configuration().std_output(), "42\n");
    assert_eq!(command.configuration().full_command(), "cat in.dat");

    // Header lines stay in the file but never reach the captured output.
    let raw = fs::read_to_string(work.path().join("job5.out"))?;
    assert!(raw.starts_with("# Logfile type : standard output"));

    let journal = state.journal.clone().expect("journal enabled by default");
    let filter = JournalFilter {
        command_id: Some(5),
        ..Default::default()
    };
    let entries = journal.recent(50, Some(&filter));
    assert_eq!(entries.last().map(|e| e.status), Some(CommandStatus::Success));

    assert!(state.shutdown());
    Ok(())
}

#[test]
fn test_unreachable_host_is_infoerror() {
    let dir = tempdir().unwrap();
    let connector = Arc::new(Unreachable::default());
    let manager = Arc::new(ConnectionManager::with_connector(connector.clone()));
    let factory = CommandFactory::new(manager.clone(), JobSettings::default(), None);

    let mut command = factory.command(
        job_in(dir.path(), "./run.sh"),
        remote_config("cluster", "alice@cluster.invalid"),
    );
    assert!(matches!(command, Command::Remote(_)));
    assert_eq!(command.execute(), CommandStatus::InfoError);
    assert_eq!(command.status(), CommandStatus::InfoError);
    assert_eq!(CommandStatus::InfoError.exit_code(), 2);

    // A terminal command does not try again.
    assert_eq!(command.execute(), CommandStatus::InfoError);
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    assert!(manager.list_connections().is_empty());
}

#[test]
fn test_unreachable_jump_source_is_infoerror() {
    let dir = tempdir().unwrap();
    let manager = Arc::new(ConnectionManager::with_connector(Arc::new(Unreachable::default())));
    let factory = CommandFactory::new(manager, JobSettings::default(), None);

    let mut command = factory.command_via(
        job_in(dir.path(), "./run.sh"),
        remote_config("storage", "bob@storage.invalid"),
        remote_config("compute", "bob@compute.invalid"),
    );
    assert_eq!(command.execute(), CommandStatus::InfoError);
}

#[test]
fn test_cancel_before_execute_is_final() {
    let dir = tempdir().unwrap();
    let manager = Arc::new(ConnectionManager::with_connector(Arc::new(Unreachable::default())));
    let factory = CommandFactory::new(manager, JobSettings::default(), None);

    let mut command = factory.command(
        job_in(dir.path(), "./run.sh"),
        remote_config("cluster", "alice@cluster.invalid"),
    );
    command.cancel();
    assert!(command.cancel_token().is_canceled());
    let status = command.execute();
    assert!(status.is_terminal());
    assert_eq!(command.execute(), status);
}

#[test]
fn test_invalid_job_is_infoerror_without_connecting() {
    let dir = tempdir().unwrap();
    let connector = Arc::new(Unreachable::default());
    let manager = Arc::new(ConnectionManager::with_connector(connector.clone()));
    let factory = CommandFactory::new(manager, JobSettings::default(), None);

    let mut config = job_in(dir.path(), "./run.sh");
    config.set_out_file_name("");
    let mut command = factory.command(config, remote_config("cluster", "alice@cluster.invalid"));
    assert_eq!(command.execute(), CommandStatus::InfoError);
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
}
