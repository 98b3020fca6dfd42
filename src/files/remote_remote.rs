use super::{looks_like_file, parent_dir, resolve_destination, split_host, strip_host, HandleType};
use crate::commands::CommandStatus;
use crate::error::{AppError, AppResult};
use crate::sftp::{self, shell_quote, SftpTransfer, TransferOp};
use crate::ssh::Connection;
use std::sync::Arc;

/// Transfers between two remote hosts, driven from the source host with
/// `scp`. The source host must be able to authenticate to the destination
/// on its own.
pub struct RemoteRemoteFileHandler {
    source: Arc<Connection>,
    destination: Arc<Connection>,
    permissions: Option<u32>,
}

impl RemoteRemoteFileHandler {
    pub fn new(source: Arc<Connection>, destination: Arc<Connection>) -> Self {
        Self {
            source,
            destination,
            permissions: None,
        }
    }

    pub fn source_connection(&self) -> &Arc<Connection> {
        &self.source
    }

    pub fn destination_connection(&self) -> &Arc<Connection> {
        &self.destination
    }

    pub fn set_permissions(&mut self, permissions: Option<u32>) {
        self.permissions = permissions;
    }

    /// `ls` on whichever host the path names; the source host by default.
    pub fn exists(&self, path: &str) -> AppResult<bool> {
        let conn = match split_host(path) {
            (Some(host), _) if host.eq_ignore_ascii_case(self.destination.config().hostname()) => {
                &self.destination
            }
            _ => &self.source,
        };
        let (_, path) = strip_host(path, conn.config())?;
        ls(conn, path)
    }

    pub fn check_existence(&mut self, source: &str, destination: &str) -> AppResult<String> {
        let (source, destination) = self.strip(source, destination)?;
        self.prepare(source, destination)
    }

    pub fn copy(&mut self, source: &str, destination: &str) -> AppResult<CommandStatus> {
        self.transfer(source, destination, TransferOp::Copy)
    }

    pub fn move_file(&mut self, source: &str, destination: &str) -> AppResult<CommandStatus> {
        self.transfer(source, destination, TransferOp::Move)
    }

    fn strip<'a>(&self, source: &'a str, destination: &'a str) -> AppResult<(&'a str, &'a str)> {
        let (_, source) = strip_host(source, self.source.config())?;
        let (_, destination) = strip_host(destination, self.destination.config())?;
        Ok((source, destination))
    }

    fn prepare(&self, source: &str, destination: &str) -> AppResult<String> {
        if !ls(&self.source, source)? {
            return Err(AppError::PathUnavailable(format!(
                "{} does not exist on {}",
                source,
                self.source.name()
            )));
        }

        let mut lease = self.destination.lease();
        let (is_dir, _) = lease.run(&format!("test -d {}", shell_quote(destination)))?;
        let destination_is_dir = is_dir == 0;
        let directory = if destination_is_dir || !looks_like_file(destination) {
            destination
        } else {
            parent_dir(destination)
        };
        if !directory.is_empty() && !destination_is_dir {
            let (status, output) = lease.run(&format!("mkdir -p {}", shell_quote(directory)))?;
            if status != 0 {
                return Err(AppError::DestinationUnavailable(format!(
                    "Cannot create {} on {}: {}",
                    directory,
                    self.destination.name(),
                    output.trim()
                )));
            }
        }
        Ok(resolve_destination(source, destination, destination_is_dir))
    }

    fn transfer(&mut self, source: &str, destination: &str, op: TransferOp) -> AppResult<CommandStatus> {
        let (source, destination) = self.strip(source, destination)?;
        let target = self.prepare(source, destination)?;
        match self.run_transfer(source, &target, op) {
            Ok(()) => {
                tracing::info!(
                    "{:?} {}:{} -> {}:{}",
                    op,
                    self.source.name(),
                    source,
                    self.destination.name(),
                    target
                );
                Ok(CommandStatus::Success)
            }
            Err(e) => {
                tracing::error!("Remote-to-remote transfer of {} failed: {}", source, e);
                Ok(CommandStatus::Failed)
            }
        }
    }

    fn run_transfer(&self, source: &str, target: &str, op: TransferOp) -> AppResult<()> {
        let transfer = SftpTransfer {
            source: source.to_string(),
            destination: target.to_string(),
            permissions: None,
            handle_type: HandleType::RemoteOtherRemote,
            op,
            peer: Some(self.destination.config().clone()),
        };
        transfer.run(&mut self.source.lease())?;

        if let Some(mode) = self.permissions {
            let mut lease = self.destination.lease();
            sftp::chmod(lease.sftp()?, target, mode)?;
        }
        Ok(())
    }
}

fn ls(conn: &Connection, path: &str) -> AppResult<bool> {
    let (status, _) = conn.lease().run(&format!("ls -d {}", shell_quote(path)))?;
    Ok(status == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::connection::tests::offline_connection;

    #[test]
    fn test_foreign_prefix_fails_fast() {
        let mut handler = RemoteRemoteFileHandler::new(
            Arc::new(offline_connection("b")),
            Arc::new(offline_connection("c")),
        );
        let err = handler
            .copy("nowhere.example.org:/data/in.dat", "/scratch")
            .unwrap_err();
        assert!(matches!(err, AppError::PathUnavailable(_)));
    }
}
