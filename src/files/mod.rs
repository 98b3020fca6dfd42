//! File existence, copy and move across local and remote hosts.

pub mod browser;
pub mod local;
pub mod remote;
pub mod remote_remote;

pub use browser::{FileBrowser, Listing};
pub use local::LocalFileHandler;
pub use remote::RemoteFileHandler;
pub use remote_remote::RemoteRemoteFileHandler;

use crate::commands::CommandStatus;
use crate::error::{AppError, AppResult};
use crate::sftp::parse_permissions;
use crate::ssh::{ConnectionConfiguration, ConnectionManager};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Direction of a transfer, derived from where source and destination live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleType {
    LocalRemote,
    RemoteLocal,
    RemoteRemote,
    RemoteOtherRemote,
}

impl HandleType {
    /// Classify a single-connection transfer. Checked in order: a local
    /// source uploads, otherwise a local destination downloads, otherwise
    /// both ends are on the connected host.
    pub fn classify(source_local: bool, destination_local: bool) -> HandleType {
        if source_local {
            HandleType::LocalRemote
        } else if destination_local {
            HandleType::RemoteLocal
        } else {
            HandleType::RemoteRemote
        }
    }

    /// Whether the destination of this transfer is on a remote host
    pub fn destination_is_remote(self) -> bool {
        !matches!(self, HandleType::RemoteLocal)
    }
}

/// Does the last path segment carry an extension?
pub fn looks_like_file(path: &str) -> bool {
    let trimmed = path.trim_end_matches(['/', '\\']);
    if trimmed.len() != path.len() {
        return false;
    }
    let last = trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed);
    match last.rfind('.') {
        Some(0) | None => false,
        Some(i) => i + 1 < last.len(),
    }
}

/// Final segment of a local or remote path
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['/', '\\']);
    trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed)
}

/// Parent of a local or remote path, without the trailing separator
pub fn parent_dir(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['/', '\\']);
    match trimmed.rfind(['/', '\\']) {
        Some(0) => "/",
        Some(i) => &trimmed[..i],
        None => "",
    }
}

/// The full destination path for `source`: directory destinations get the
/// source's file name appended.
pub fn resolve_destination(source: &str, destination: &str, destination_is_dir: bool) -> String {
    if destination_is_dir || !looks_like_file(destination) {
        let separator = if destination.contains('\\') { '\\' } else { '/' };
        let base = destination.trim_end_matches(['/', '\\']);
        format!("{}{}{}", base, separator, file_name(source))
    } else {
        destination.to_string()
    }
}

/// Split a `host:path` designation.
///
/// Returns `(Some(host), path)` for a host prefix and `(None, path)`
/// otherwise. Windows drive letters are not host prefixes.
pub fn split_host(designation: &str) -> (Option<&str>, &str) {
    if let Some((host, path)) = designation.split_once(':') {
        let is_host = host.len() > 1
            && !host.contains(['/', '\\'])
            && host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "._-@".contains(c));
        if is_host {
            let host = host.rsplit('@').next().unwrap_or(host);
            return (Some(host), path);
        }
    }
    (None, designation)
}

/// Strip a host prefix naming `config`. A prefix naming some other host
/// fails instead of guessing.
pub(crate) fn strip_host<'a>(
    designation: &'a str,
    config: &ConnectionConfiguration,
) -> AppResult<(bool, &'a str)> {
    match split_host(designation) {
        (None, path) => Ok((false, path)),
        (Some(host), path) => {
            if host.eq_ignore_ascii_case(config.hostname()) || host == config.name() {
                Ok((true, path))
            } else {
                Err(AppError::PathUnavailable(format!(
                    "{} names host {}, but this handler is connected to {}",
                    designation,
                    host,
                    config.hostname()
                )))
            }
        }
    }
}

/// Local existence of a path or, failing that, its parent directory
pub(crate) fn local_target_available(path: &str) -> bool {
    let p = Path::new(path);
    p.exists() || p.parent().map(|parent| parent.is_dir()).unwrap_or(false)
}

/// Local, remote or remote-to-remote file operations
pub enum FileHandler {
    Local(LocalFileHandler),
    Remote(RemoteFileHandler),
    RemoteRemote(RemoteRemoteFileHandler),
}

impl std::fmt::Debug for FileHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FileHandler::Local(_) => "Local",
            FileHandler::Remote(_) => "Remote",
            FileHandler::RemoteRemote(_) => "RemoteRemote",
        };
        f.debug_tuple(name).finish_non_exhaustive()
    }
}

impl FileHandler {
    pub fn exists(&self, path: &str) -> AppResult<bool> {
        match self {
            FileHandler::Local(h) => Ok(h.exists(path)),
            FileHandler::Remote(h) => h.exists(path),
            FileHandler::RemoteRemote(h) => h.exists(path),
        }
    }

    /// Check the source, classify the transfer and create missing
    /// destination directories. Returns the resolved destination path.
    pub fn check_existence(&mut self, source: &str, destination: &str) -> AppResult<String> {
        match self {
            FileHandler::Local(h) => h.check_existence(source, destination),
            FileHandler::Remote(h) => h.check_existence(source, destination),
            FileHandler::RemoteRemote(h) => h.check_existence(source, destination),
        }
    }

    pub fn copy(&mut self, source: &str, destination: &str) -> AppResult<CommandStatus> {
        match self {
            FileHandler::Local(h) => h.copy(source, destination),
            FileHandler::Remote(h) => h.copy(source, destination),
            FileHandler::RemoteRemote(h) => h.copy(source, destination),
        }
    }

    pub fn move_file(&mut self, source: &str, destination: &str) -> AppResult<CommandStatus> {
        match self {
            FileHandler::Local(h) => h.move_file(source, destination),
            FileHandler::Remote(h) => h.move_file(source, destination),
            FileHandler::RemoteRemote(h) => h.move_file(source, destination),
        }
    }

    /// Permission bits (octal text) for remote destinations
    pub fn set_permissions(&mut self, permissions: &str) -> AppResult<()> {
        let mode = parse_permissions(permissions)?;
        match self {
            FileHandler::Local(_) => {
                tracing::debug!("Ignoring permissions {:o} for a local destination", mode)
            }
            FileHandler::Remote(h) => h.set_permissions(Some(mode)),
            FileHandler::RemoteRemote(h) => h.set_permissions(Some(mode)),
        }
        Ok(())
    }

    /// Direction chosen by the last `check_existence`
    pub fn handle_type(&self) -> Option<HandleType> {
        match self {
            FileHandler::Local(_) => None,
            FileHandler::Remote(h) => h.handle_type(),
            FileHandler::RemoteRemote(_) => Some(HandleType::RemoteOtherRemote),
        }
    }

    fn browser(&self) -> FileBrowser {
        match self {
            FileHandler::Local(_) => FileBrowser::Local,
            FileHandler::Remote(h) => FileBrowser::Remote(h.connection().clone()),
            FileHandler::RemoteRemote(h) => FileBrowser::Remote(h.source_connection().clone()),
        }
    }

    pub fn list_files(&self, top_directory: &str) -> AppResult<Vec<String>> {
        Ok(self.browser().browse(top_directory)?.files)
    }

    pub fn list_directories(&self, top_directory: &str) -> AppResult<Vec<String>> {
        Ok(self.browser().browse(top_directory)?.directories)
    }
}

/// Builds the right [`FileHandler`] for a set of hosts
pub struct FileHandlerFactory;

impl FileHandlerFactory {
    pub fn local() -> FileHandler {
        FileHandler::Local(LocalFileHandler::new())
    }

    /// Local handler for local or absent configurations, remote otherwise.
    pub fn for_configuration(
        manager: &ConnectionManager,
        config: Option<Arc<ConnectionConfiguration>>,
    ) -> AppResult<FileHandler> {
        match config {
            Some(config) if !config.is_local() => {
                let conn = manager.open_connection(config)?;
                Ok(FileHandler::Remote(RemoteFileHandler::new(conn)))
            }
            _ => Ok(Self::local()),
        }
    }

    /// Handler for transfers between two remote hosts. Degrades to the
    /// single-host handlers when either end is local or both are the same.
    pub fn between(
        manager: &ConnectionManager,
        source: Arc<ConnectionConfiguration>,
        destination: Arc<ConnectionConfiguration>,
    ) -> AppResult<FileHandler> {
        if source.is_local() && destination.is_local() {
            return Ok(Self::local());
        }
        if source.is_local() {
            return Self::for_configuration(manager, Some(destination));
        }
        if destination.is_local() || source.name() == destination.name() {
            return Self::for_configuration(manager, Some(source));
        }
        let source_conn = manager.open_connection(source)?;
        let destination_conn = manager.open_connection(destination)?;
        Ok(FileHandler::RemoteRemote(RemoteRemoteFileHandler::new(
            source_conn,
            destination_conn,
        )))
    }
}
