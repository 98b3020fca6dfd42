//! SFTP helpers and the single-shot transfer primitive.
//!
//! Every helper works on a transfer channel borrowed from a
//! [`ChannelLease`], so callers hold the connection's channels exclusively
//! for the whole transfer.

use crate::commands::CommandStatus;
use crate::error::{AppError, AppResult};
use crate::files::HandleType;
use crate::ssh::{ChannelLease, Connection, ConnectionConfiguration};
use serde::{Deserialize, Serialize};
use ssh2::{FileStat, OpenFlags, OpenType, Sftp};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

/// SFTP file/directory entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub modified: Option<i64>,
    pub permissions: String,
}

/// Parse an octal permission string such as `"755"` into a mode.
pub fn parse_permissions(text: &str) -> AppResult<u32> {
    let digits = text.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);
    if digits.is_empty() || digits.len() > 4 {
        return Err(AppError::InvalidConfig(format!("Invalid permissions: {:?}", text)));
    }
    u32::from_str_radix(digits, 8)
        .map_err(|_| AppError::InvalidConfig(format!("Permissions must be octal: {:?}", text)))
}

/// Quote a value for a POSIX shell command line
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:@,=".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Join a remote directory and a name with `/`
pub fn remote_join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Does `path` exist on the remote host?
pub fn exists(sftp: &Sftp, path: &str) -> AppResult<bool> {
    match sftp.stat(Path::new(path)) {
        Ok(_) => Ok(true),
        Err(e) => {
            let io_err: io::Error = e.into();
            if io_err.kind() == io::ErrorKind::NotFound {
                Ok(false)
            } else {
                Err(AppError::Transfer(format!("Failed to stat {}: {}", path, io_err)))
            }
        }
    }
}

pub fn is_dir(sftp: &Sftp, path: &str) -> bool {
    sftp.stat(Path::new(path))
        .map(|stat| stat.is_dir())
        .unwrap_or(false)
}

/// Create `path` and any missing parents, one component at a time.
pub fn mkdir_all(sftp: &Sftp, path: &str) -> AppResult<()> {
    let mut current = String::new();
    if path.starts_with('/') {
        current.push('/');
    }
    for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
        current = remote_join(&current, component);
        if is_dir(sftp, &current) {
            continue;
        }
        if let Err(e) = sftp.mkdir(Path::new(&current), 0o755) {
            // Lost a race with another creator.
            if !is_dir(sftp, &current) {
                return Err(AppError::DestinationUnavailable(format!(
                    "Failed to create directory {}: {}",
                    current, e
                )));
            }
        }
    }
    Ok(())
}

/// Upload a local file or directory tree. Returns bytes written.
pub fn upload(sftp: &Sftp, local: &Path, remote: &str) -> AppResult<u64> {
    if local.is_dir() {
        let mut total = 0;
        for entry in WalkDir::new(local).follow_links(true) {
            let entry = entry?;
            let relative = entry
                .path()
                .strip_prefix(local)
                .map_err(|e| AppError::Transfer(e.to_string()))?;
            let target = relative
                .components()
                .fold(remote.trim_end_matches('/').to_string(), |acc, c| {
                    remote_join(&acc, &c.as_os_str().to_string_lossy())
                });
            if entry.file_type().is_dir() {
                mkdir_all(sftp, &target)?;
            } else {
                total += upload_file(sftp, entry.path(), &target)?;
            }
        }
        Ok(total)
    } else {
        upload_file(sftp, local, remote)
    }
}

fn upload_file(sftp: &Sftp, local: &Path, remote: &str) -> AppResult<u64> {
    let mut source = fs::File::open(local).map_err(|e| {
        AppError::PathUnavailable(format!("Cannot open {}: {}", local.display(), e))
    })?;
    let mut target = sftp
        .open_mode(
            Path::new(remote),
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            0o644,
            OpenType::File,
        )
        .map_err(|e| AppError::Transfer(format!("Failed to create {}: {}", remote, e)))?;
    let written = io::copy(&mut source, &mut target)
        .map_err(|e| AppError::Transfer(format!("Failed to write {}: {}", remote, e)))?;
    tracing::debug!("Uploaded {} -> {} ({} bytes)", local.display(), remote, written);
    Ok(written)
}

/// Download a remote file or directory tree. Returns bytes read.
pub fn download(sftp: &Sftp, remote: &str, local: &Path) -> AppResult<u64> {
    let stat = sftp
        .stat(Path::new(remote))
        .map_err(|e| AppError::PathUnavailable(format!("Cannot stat {}: {}", remote, e)))?;

    if stat.is_dir() {
        fs::create_dir_all(local)?;
        let mut total = 0;
        for (path, entry_stat) in sftp
            .readdir(Path::new(remote))
            .map_err(|e| AppError::Transfer(format!("Failed to list {}: {}", remote, e)))?
        {
            let Some(name) = path.file_name() else {
                continue;
            };
            let name = name.to_string_lossy().to_string();
            if name == "." || name == ".." {
                continue;
            }
            let child = remote_join(remote, &name);
            if entry_stat.is_dir() {
                total += download(sftp, &child, &local.join(&name))?;
            } else {
                total += download_file(sftp, &child, &local.join(&name))?;
            }
        }
        Ok(total)
    } else {
        download_file(sftp, remote, local)
    }
}

fn download_file(sftp: &Sftp, remote: &str, local: &Path) -> AppResult<u64> {
    let mut source = sftp
        .open(Path::new(remote))
        .map_err(|e| AppError::Transfer(format!("Failed to open {}: {}", remote, e)))?;
    if let Some(parent) = local.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut target = fs::File::create(local)?;
    let read = io::copy(&mut source, &mut target)
        .map_err(|e| AppError::Transfer(format!("Failed to read {}: {}", remote, e)))?;
    tracing::debug!("Downloaded {} -> {} ({} bytes)", remote, local.display(), read);
    Ok(read)
}

/// Set permission bits on a remote path
pub fn chmod(sftp: &Sftp, path: &str, mode: u32) -> AppResult<()> {
    let stat = FileStat {
        size: None,
        uid: None,
        gid: None,
        perm: Some(mode),
        atime: None,
        mtime: None,
    };
    sftp.setstat(Path::new(path), stat)
        .map_err(|e| AppError::Transfer(format!("Failed to chmod {:o} {}: {}", mode, path, e)))
}

/// Remove a remote file, or a directory tree depth-first
pub fn remove_all(sftp: &Sftp, path: &str) -> AppResult<()> {
    let stat = sftp
        .lstat(Path::new(path))
        .map_err(|e| AppError::PathUnavailable(format!("Cannot stat {}: {}", path, e)))?;

    if stat.is_dir() {
        let entries = sftp
            .readdir(Path::new(path))
            .map_err(|e| AppError::Transfer(format!("Failed to list {}: {}", path, e)))?;
        for (child, _) in entries {
            let Some(name) = child.file_name() else {
                continue;
            };
            let name = name.to_string_lossy();
            if name == "." || name == ".." {
                continue;
            }
            remove_all(sftp, &remote_join(path, &name))?;
        }
        sftp.rmdir(Path::new(path))
            .map_err(|e| AppError::Transfer(format!("Failed to remove directory {}: {}", path, e)))
    } else {
        sftp.unlink(Path::new(path))
            .map_err(|e| AppError::Transfer(format!("Failed to remove {}: {}", path, e)))
    }
}

/// List a remote directory, directories first
pub fn list_dir(sftp: &Sftp, path: &str) -> AppResult<Vec<SftpEntry>> {
    let path = if path.is_empty() { "." } else { path };
    let entries = sftp
        .readdir(Path::new(path))
        .map_err(|e| AppError::PathUnavailable(format!("Failed to list directory {}: {}", path, e)))?;

    let mut result = Vec::new();
    for (file_path, stat) in entries {
        let name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if name.is_empty() || name == "." || name == ".." {
            continue;
        }

        result.push(SftpEntry {
            path: remote_join(path, &name),
            name,
            is_dir: stat.is_dir(),
            is_symlink: stat.file_type().is_symlink(),
            size: stat.size.unwrap_or(0),
            modified: stat.mtime.map(|t| t as i64),
            permissions: format_permissions(&stat),
        });
    }

    result.sort_by(|a, b| match (a.is_dir, b.is_dir) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
    });

    Ok(result)
}

/// Format file permissions as a string like "rwxr-xr-x"
pub fn format_permissions(stat: &FileStat) -> String {
    let perms = stat.perm.unwrap_or(0);

    let mut s = String::with_capacity(10);
    if stat.is_dir() {
        s.push('d');
    } else if stat.file_type().is_symlink() {
        s.push('l');
    } else {
        s.push('-');
    }

    for shift in [6u32, 3, 0] {
        let bits = (perms >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }

    s
}

/// Copy or move
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOp {
    Copy,
    Move,
}

/// One transfer over one connection. Never retried.
///
/// For [`HandleType::RemoteOtherRemote`] the connection is the source host
/// and `peer` names the destination host it pushes to with `scp`.
/// `permissions` are not applied on the peer; that needs a lease there.
#[derive(Debug, Clone)]
pub struct SftpTransfer {
    pub source: String,
    pub destination: String,
    pub permissions: Option<u32>,
    pub handle_type: HandleType,
    pub op: TransferOp,
    pub peer: Option<Arc<ConnectionConfiguration>>,
}

impl SftpTransfer {
    /// Run the transfer and report SUCCESS or FAILED.
    pub fn execute(&self, conn: &Connection) -> CommandStatus {
        let mut lease = conn.lease();
        match self.run(&mut lease) {
            Ok(()) => {
                tracing::info!(
                    "{:?} {} -> {} on {} ({:?})",
                    self.op,
                    self.source,
                    self.destination,
                    conn.name(),
                    self.handle_type
                );
                CommandStatus::Success
            }
            Err(e) => {
                tracing::error!("Transfer {} -> {} failed: {}", self.source, self.destination, e);
                CommandStatus::Failed
            }
        }
    }

    /// Run the transfer inside an existing lease.
    pub fn run(&self, lease: &mut ChannelLease<'_>) -> AppResult<()> {
        match self.handle_type {
            HandleType::LocalRemote => {
                let sftp = lease.sftp()?;
                upload(sftp, Path::new(&self.source), &self.destination)?;
                if let Some(mode) = self.permissions {
                    chmod(sftp, &self.destination, mode)?;
                }
                if self.op == TransferOp::Move {
                    remove_local(Path::new(&self.source))?;
                }
            }
            HandleType::RemoteLocal => {
                let sftp = lease.sftp()?;
                download(sftp, &self.source, &PathBuf::from(&self.destination))?;
                if let Some(mode) = self.permissions {
                    set_local_permissions(Path::new(&self.destination), mode)?;
                }
                if self.op == TransferOp::Move {
                    remove_all(sftp, &self.source)?;
                }
            }
            HandleType::RemoteRemote => {
                let verb = match self.op {
                    TransferOp::Copy => "cp -r",
                    TransferOp::Move => "mv",
                };
                let command = format!(
                    "{} {} {}",
                    verb,
                    shell_quote(&self.source),
                    shell_quote(&self.destination)
                );
                run_checked(lease, &command)?;
                if let Some(mode) = self.permissions {
                    chmod(lease.sftp()?, &self.destination, mode)?;
                }
            }
            HandleType::RemoteOtherRemote => {
                let peer = self.peer.as_deref().ok_or_else(|| {
                    AppError::Transfer(format!(
                        "No destination host given for {} -> {}",
                        self.source, self.destination
                    ))
                })?;
                run_checked(lease, &scp_command(peer, &self.source, &self.destination))?;
                if self.op == TransferOp::Move {
                    run_checked(lease, &format!("rm -rf {}", shell_quote(&self.source)))?;
                }
            }
        }
        Ok(())
    }
}

fn run_checked(lease: &mut ChannelLease<'_>, command: &str) -> AppResult<()> {
    let (status, output) = lease.run(command)?;
    if status != 0 {
        return Err(AppError::Transfer(format!(
            "`{}` exited with {}: {}",
            command,
            status,
            output.trim()
        )));
    }
    Ok(())
}

/// `scp` invocation run on the source host, pushing to `peer`
pub fn scp_command(peer: &ConnectionConfiguration, source: &str, target: &str) -> String {
    let auth = peer.authorization();
    let remote = if auth.username().is_empty() {
        format!("{}:{}", auth.hostname(), target)
    } else {
        format!("{}@{}:{}", auth.username(), auth.hostname(), target)
    };
    format!(
        "scp -r -o BatchMode=yes -P {} {} {}",
        auth.port(),
        shell_quote(source),
        shell_quote(&remote)
    )
}

#[cfg(unix)]
fn set_local_permissions(path: &Path, mode: u32) -> AppResult<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_local_permissions(_path: &Path, _mode: u32) -> AppResult<()> {
    Ok(())
}

fn remove_local(path: &Path) -> AppResult<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}
