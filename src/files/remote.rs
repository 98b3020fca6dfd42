use super::{local_target_available, looks_like_file, parent_dir, resolve_destination, strip_host, HandleType};
use crate::commands::CommandStatus;
use crate::error::{AppError, AppResult};
use crate::sftp::{self, SftpTransfer, TransferOp};
use crate::ssh::Connection;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Transfers between this machine and one connected host, or within that
/// host.
pub struct RemoteFileHandler {
    conn: Arc<Connection>,
    permissions: Option<u32>,
    handle_type: Option<HandleType>,
}

/// A classified transfer with both ends resolved
struct Plan {
    source: String,
    destination: String,
    handle_type: HandleType,
}

impl RemoteFileHandler {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            permissions: None,
            handle_type: None,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn set_permissions(&mut self, permissions: Option<u32>) {
        self.permissions = permissions;
    }

    pub fn handle_type(&self) -> Option<HandleType> {
        self.handle_type
    }

    /// Remote stat first; a path that only exists locally still counts.
    pub fn exists(&self, path: &str) -> AppResult<bool> {
        let (explicit, path) = strip_host(path, self.conn.config())?;
        let mut lease = self.conn.lease();
        match lease.sftp().and_then(|channel| sftp::exists(channel, path)) {
            Ok(true) => return Ok(true),
            Ok(false) => {}
            Err(e) => tracing::debug!("Remote stat of {} failed: {}", path, e),
        }
        Ok(!explicit && Path::new(path).exists())
    }

    pub fn check_existence(&mut self, source: &str, destination: &str) -> AppResult<String> {
        Ok(self.prepare(source, destination)?.destination)
    }

    pub fn copy(&mut self, source: &str, destination: &str) -> AppResult<CommandStatus> {
        self.transfer(source, destination, TransferOp::Copy)
    }

    pub fn move_file(&mut self, source: &str, destination: &str) -> AppResult<CommandStatus> {
        self.transfer(source, destination, TransferOp::Move)
    }

    fn transfer(&mut self, source: &str, destination: &str, op: TransferOp) -> AppResult<CommandStatus> {
        let plan = self.prepare(source, destination)?;
        let transfer = SftpTransfer {
            source: plan.source,
            destination: plan.destination,
            permissions: self.permissions,
            handle_type: plan.handle_type,
            op,
            peer: None,
        };
        Ok(transfer.execute(&self.conn))
    }

    /// Find the source, classify the transfer and create the destination
    /// directory on whichever side it lives.
    fn prepare(&mut self, source: &str, destination: &str) -> AppResult<Plan> {
        let config = self.conn.config().clone();
        let (source_explicit, source) = strip_host(source, &config)?;
        let (destination_explicit, destination) = strip_host(destination, &config)?;

        let mut lease = self.conn.lease();
        let channel = lease.sftp()?;

        let source_local = !source_explicit && Path::new(source).exists();
        if !source_local && !sftp::exists(channel, source)? {
            return Err(AppError::PathUnavailable(format!(
                "{} exists neither locally nor on {}",
                source,
                config.name()
            )));
        }

        let destination_local =
            !source_local && !destination_explicit && local_target_available(destination);
        let handle_type = HandleType::classify(source_local, destination_local);

        let destination_is_dir = if handle_type.destination_is_remote() {
            sftp::is_dir(channel, destination)
        } else {
            Path::new(destination).is_dir()
        };
        let directory = if destination_is_dir || !looks_like_file(destination) {
            destination
        } else {
            parent_dir(destination)
        };

        if !directory.is_empty() {
            if handle_type.destination_is_remote() {
                sftp::mkdir_all(channel, directory)?;
            } else {
                fs::create_dir_all(directory).map_err(|e| {
                    AppError::DestinationUnavailable(format!("Cannot create {}: {}", directory, e))
                })?;
            }
        }

        tracing::debug!(
            "{} -> {} on {} classified as {:?}",
            source,
            destination,
            config.name(),
            handle_type
        );
        self.handle_type = Some(handle_type);
        Ok(Plan {
            source: source.to_string(),
            destination: resolve_destination(source, destination, destination_is_dir),
            handle_type,
        })
    }
}
