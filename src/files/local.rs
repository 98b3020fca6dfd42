use super::{looks_like_file, resolve_destination, split_host};
use crate::commands::CommandStatus;
use crate::error::{AppError, AppResult};
use crate::ssh::is_local_hostname;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// File operations on this machine.
#[derive(Debug, Default)]
pub struct LocalFileHandler;

impl LocalFileHandler {
    pub fn new() -> Self {
        Self
    }

    pub fn exists(&self, path: &str) -> bool {
        match local_path(path) {
            Ok(path) => Path::new(path).exists(),
            Err(_) => false,
        }
    }

    /// Require the source and make sure the destination directory exists.
    /// Returns the full destination path.
    pub fn check_existence(&self, source: &str, destination: &str) -> AppResult<String> {
        let source = local_path(source)?;
        let destination = local_path(destination)?;

        if !Path::new(source).exists() {
            return Err(AppError::PathUnavailable(format!("{} does not exist", source)));
        }

        let dest_is_dir = Path::new(destination).is_dir();
        let resolved = resolve_destination(source, destination, dest_is_dir);
        let directory = if dest_is_dir || !looks_like_file(destination) {
            Path::new(destination)
        } else {
            Path::new(destination).parent().unwrap_or(Path::new("."))
        };

        if !directory.as_os_str().is_empty() && !directory.is_dir() {
            fs::create_dir_all(directory).map_err(|e| {
                AppError::DestinationUnavailable(format!(
                    "Cannot create {}: {}",
                    directory.display(),
                    e
                ))
            })?;
            tracing::debug!("Created destination directory {}", directory.display());
        }
        Ok(resolved)
    }

    pub fn copy(&self, source: &str, destination: &str) -> AppResult<CommandStatus> {
        let target = self.check_existence(source, destination)?;
        let source = local_path(source)?;
        if Path::new(source) == Path::new(&target) {
            tracing::debug!("{} is already in place", source);
            return Ok(CommandStatus::Success);
        }
        Ok(report(
            copy_tree(Path::new(source), Path::new(&target)),
            "Copy",
            source,
            &target,
        ))
    }

    /// Rename in place when the parent directory and extension stay the
    /// same, otherwise relocate (copy then delete the source).
    pub fn move_file(&self, source: &str, destination: &str) -> AppResult<CommandStatus> {
        let target = self.check_existence(source, destination)?;
        let source = local_path(source)?;

        let result = if is_rename(source, &target) {
            tracing::debug!("Renaming {} -> {}", source, target);
            fs::rename(source, &target).map_err(AppError::from)
        } else {
            tracing::debug!("Relocating {} -> {}", source, target);
            copy_tree(Path::new(source), Path::new(&target))
                .and_then(|_| remove(Path::new(source)))
        };
        Ok(report(result, "Move", source, &target))
    }
}

fn report(result: AppResult<()>, op: &str, source: &str, target: &str) -> CommandStatus {
    match result {
        Ok(()) => {
            tracing::info!("{} {} -> {}", op, source, target);
            CommandStatus::Success
        }
        Err(e) => {
            tracing::error!("{} {} -> {} failed: {}", op, source, target, e);
            CommandStatus::Failed
        }
    }
}

/// Strip a host prefix that names this machine.
fn local_path(designation: &str) -> AppResult<&str> {
    match split_host(designation) {
        (None, path) => Ok(path),
        (Some(host), path) if is_local_hostname(host) => Ok(path),
        (Some(host), _) => Err(AppError::PathUnavailable(format!(
            "{} is on {}, not on this machine",
            designation, host
        ))),
    }
}

/// Same parent and same extension
pub(crate) fn is_rename(source: &str, target: &str) -> bool {
    let (source, target) = (Path::new(source), Path::new(target));
    source.parent() == target.parent() && source.extension() == target.extension()
}

fn copy_tree(source: &Path, target: &Path) -> AppResult<()> {
    if source.is_dir() {
        for entry in WalkDir::new(source) {
            let entry = entry?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| AppError::Transfer(e.to_string()))?;
            let dest = target.join(relative);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&dest)?;
            } else {
                fs::copy(entry.path(), &dest)?;
            }
        }
    } else {
        fs::copy(source, target)?;
    }
    Ok(())
}

fn remove(path: &Path) -> AppResult<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path_str(p: &Path) -> String {
        p.to_string_lossy().to_string()
    }

    #[test]
    fn test_missing_source_is_path_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let handler = LocalFileHandler::new();
        let missing = path_str(&dir.path().join("nope.txt"));
        let err = handler.copy(&missing, &path_str(dir.path())).unwrap_err();
        assert!(matches!(err, AppError::PathUnavailable(_)));
    }

    #[test]
    fn test_copy_into_new_directory() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.dat");
        fs::write(&source, b"data").unwrap();
        let dest = dir.path().join("job1");

        let handler = LocalFileHandler::new();
        let status = handler.copy(&path_str(&source), &path_str(&dest)).unwrap();
        assert_eq!(status, CommandStatus::Success);
        assert_eq!(fs::read(dest.join("in.dat")).unwrap(), b"data");
        assert!(source.exists());
    }

    #[test]
    fn test_copy_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("inputs");
        fs::create_dir_all(source.join("nested")).unwrap();
        fs::write(source.join("nested/a.txt"), b"a").unwrap();
        let dest = dir.path().join("out");

        let handler = LocalFileHandler::new();
        let status = handler.copy(&path_str(&source), &path_str(&dest)).unwrap();
        assert_eq!(status, CommandStatus::Success);
        assert_eq!(fs::read(dest.join("inputs/nested/a.txt")).unwrap(), b"a");
    }

    #[cfg(unix)]
    #[test]
    fn test_move_within_directory_renames() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("file.txt");
        fs::write(&source, b"x").unwrap();
        let inode = fs::metadata(&source).unwrap().ino();
        let target = dir.path().join("renamed.txt");

        let handler = LocalFileHandler::new();
        let status = handler
            .move_file(&path_str(&source), &path_str(&target))
            .unwrap();
        assert_eq!(status, CommandStatus::Success);
        assert!(!source.exists());
        assert_eq!(fs::metadata(&target).unwrap().ino(), inode);
    }

    #[test]
    fn test_move_to_other_directory_relocates() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("file.txt");
        fs::write(&source, b"x").unwrap();
        let dest = dir.path().join("c");

        let handler = LocalFileHandler::new();
        let status = handler.move_file(&path_str(&source), &path_str(&dest)).unwrap();
        assert_eq!(status, CommandStatus::Success);
        assert!(!source.exists());
        assert_eq!(fs::read(dest.join("file.txt")).unwrap(), b"x");
    }

    #[test]
    fn test_is_rename() {
        assert!(is_rename("/a/b/file.txt", "/a/b/renamed.txt"));
        assert!(!is_rename("/a/b/file.txt", "/a/b/file.dat"));
        assert!(!is_rename("/a/b/file.txt", "/a/c/file.txt"));
    }

    #[test]
    fn test_foreign_host_prefix_rejected() {
        let handler = LocalFileHandler::new();
        assert!(!handler.exists("faraway.example.org:/tmp"));
        assert!(handler.exists("localhost:/"));
    }
}
