#![cfg(unix)]

//! Remote pipeline against a real sshd on localhost.
//!
//! Every test returns early when passwordless key login to localhost is not
//! available, so these only do work on machines set up for it.

use sshjob::commands::{CommandConfiguration, CommandStatus, RemoteCommand};
use sshjob::config::{AppSettings, JobSettings};
use sshjob::files::RemoteFileHandler;
use sshjob::ssh::{AuthorizationHandler, ConnectionConfiguration, ConnectionManager};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tempfile::TempDir;

fn localhost_key() -> Option<PathBuf> {
    let ssh_dir = dirs::home_dir()?.join(".ssh");
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|path| path.exists())
}

/// A key that logs in to localhost without a passphrase or password
fn usable_localhost_key() -> Option<PathBuf> {
    let key = localhost_key()?;
    let output = Command::new("ssh")
        .arg("-i")
        .arg(&key)
        .args([
            "-o",
            "IdentitiesOnly=yes",
            "-o",
            "ConnectTimeout=2",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "PasswordAuthentication=no",
            "-o",
            "BatchMode=yes",
            "localhost",
            "echo",
            "test",
        ])
        .output();

    match output {
        Ok(result) if result.status.success() => Some(key),
        _ => None,
    }
}

fn get_localhost_test_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
}

fn localhost(name: &str, key: &Path) -> Arc<ConnectionConfiguration> {
    let mut auth = AuthorizationHandler::from_kind("keypath", Some(&key.to_string_lossy())).unwrap();
    auth.set_hostname("localhost");
    auth.set_username(&get_localhost_test_user());
    Arc::new(ConnectionConfiguration::new(name, auth, true))
}

/// Config dir, manager and job settings for one test
fn fixture(staging: &Path) -> (TempDir, Arc<ConnectionManager>, JobSettings) {
    let config_dir = TempDir::new().unwrap();
    let manager = Arc::new(ConnectionManager::new(&AppSettings::default(), config_dir.path()));
    let settings = JobSettings {
        poll_interval_ms: 100,
        staging_dir: Some(staging.to_path_buf()),
        ..JobSettings::default()
    };
    (config_dir, manager, settings)
}

/// A job running `run.sh in.dat` from `work`, staged into `remote`
fn script_job(work: &Path, remote: &Path, script: &str) -> CommandConfiguration {
    let run = work.join("run.sh");
    fs::write(&run, script).unwrap();
    fs::set_permissions(&run, fs::Permissions::from_mode(0o644)).unwrap();
    fs::write(work.join("in.dat"), "42\n").unwrap();

    let mut config = CommandConfiguration::new(77, "run.sh");
    config.add_input_file("input", "in.dat");
    config.set_working_directory(&work.to_string_lossy());
    config.set_remote_working_directory(remote.to_string_lossy());
    config.set_os("linux");
    config.set_out_file_name(work.join("job.out").to_string_lossy());
    config.set_err_file_name(work.join("job.err").to_string_lossy());
    config
}

#[test]
fn test_localhost_job_runs_staged_script() {
    let Some(key) = usable_localhost_key() else {
        eprintln!("Skipping integration test: Cannot SSH to localhost");
        return;
    };

    let work = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let remote = scratch.path().join("job77");
    let (_config_dir, manager, settings) = fixture(scratch.path());

    let config = script_job(work.path(), &remote, "#!/bin/sh\ncat \"$1\"\necho staged >&2\n");
    let mut command = RemoteCommand::new(
        manager.clone(),
        config,
        localhost("local-sshd", &key),
        None,
        &settings,
        None,
    );

    assert_eq!(command.execute(), CommandStatus::Success);
    assert_eq!(command.configuration().full_command(), "./run.sh in.dat");
    assert_eq!(command.configuration().std_output(), "42\n");
    assert_eq!(command.configuration().err_output(), "staged\n");
    assert!(!remote.exists(), "remote working directory should be removed");
    assert!(manager.close_all_connections());
}

#[test]
fn test_localhost_job_reports_exit_code() {
    let Some(key) = usable_localhost_key() else {
        eprintln!("Skipping integration test: Cannot SSH to localhost");
        return;
    };

    let work = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let (_config_dir, manager, settings) = fixture(scratch.path());

    let config = script_job(
        work.path(),
        &scratch.path().join("job77"),
        "#!/bin/sh\necho broken >&2\nexit 3\n",
    );
    let mut command = RemoteCommand::new(
        manager,
        config,
        localhost("local-sshd", &key),
        None,
        &settings,
        None,
    );

    assert_eq!(command.execute(), CommandStatus::Failed);
    let err = fs::read_to_string(work.path().join("job.err")).unwrap();
    assert!(err.contains("broken"));
    assert!(!err.contains("__sshjob_exit"));
}

#[test]
fn test_localhost_transfer_keeps_permissions() {
    let Some(key) = usable_localhost_key() else {
        eprintln!("Skipping integration test: Cannot SSH to localhost");
        return;
    };

    let local = TempDir::new().unwrap();
    let remote = TempDir::new().unwrap();
    let back = TempDir::new().unwrap();
    let (_config_dir, manager, _) = fixture(remote.path());

    let source = local.path().join("solver.sh");
    fs::write(&source, "#!/bin/sh\necho solved\n").unwrap();
    let conn = manager.open_connection(localhost("local-sshd", &key)).unwrap();
    let mut handler = RemoteFileHandler::new(conn);

    handler.set_permissions(Some(0o755));
    let uploaded = format!("localhost:{}/bin/", remote.path().display());
    assert_eq!(
        handler.copy(&source.to_string_lossy(), &uploaded).unwrap(),
        CommandStatus::Success
    );
    let staged = remote.path().join("bin").join("solver.sh");
    assert_eq!(fs::metadata(&staged).unwrap().permissions().mode() & 0o777, 0o755);

    let downloaded = format!("localhost:{}", staged.display());
    let target = format!("{}/", back.path().display());
    assert_eq!(handler.copy(&downloaded, &target).unwrap(), CommandStatus::Success);
    let copy = back.path().join("solver.sh");
    assert_eq!(fs::read(&copy).unwrap(), fs::read(&source).unwrap());
    assert_eq!(fs::metadata(&copy).unwrap().permissions().mode() & 0o777, 0o755);
}

#[test]
fn test_localhost_jump_stages_through_this_machine() {
    let Some(key) = usable_localhost_key() else {
        eprintln!("Skipping integration test: Cannot SSH to localhost");
        return;
    };

    let work = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    let remote = scratch.path().join("job77");
    let (_config_dir, manager, settings) = fixture(staging.path());

    let config = script_job(work.path(), &remote, "#!/bin/sh\ncat \"$1\"\n");
    let mut command = RemoteCommand::new(
        manager.clone(),
        config,
        localhost("hop-a", &key),
        Some(localhost("hop-b", &key)),
        &settings,
        None,
    );

    assert_eq!(command.execute(), CommandStatus::Success);
    assert_eq!(command.configuration().std_output(), "42\n");
    let active = command.connection().unwrap();
    assert_eq!(active.name(), "hop-b");
    assert!(active.is_forwarded());
    assert_eq!(fs::read_dir(staging.path()).unwrap().count(), 0);
    assert!(manager.close_all_connections());
}
