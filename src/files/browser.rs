use crate::error::AppResult;
use crate::sftp;
use crate::ssh::Connection;
use serde::{Deserialize, Serialize};
use ssh2::Sftp;
use std::sync::Arc;
use walkdir::WalkDir;

/// Files and directories found under a top directory, recursively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub files: Vec<String>,
    pub directories: Vec<String>,
}

pub enum FileBrowser {
    Local,
    Remote(Arc<Connection>),
}

impl FileBrowser {
    pub fn browse(&self, top_directory: &str) -> AppResult<Listing> {
        let mut listing = match self {
            FileBrowser::Local => browse_local(top_directory)?,
            FileBrowser::Remote(conn) => {
                let mut lease = conn.lease();
                let mut listing = Listing::default();
                browse_remote(lease.sftp()?, top_directory, &mut listing)?;
                listing
            }
        };
        listing.files.sort();
        listing.directories.sort();
        Ok(listing)
    }
}

fn browse_local(top_directory: &str) -> AppResult<Listing> {
    let mut listing = Listing::default();
    for entry in WalkDir::new(top_directory).min_depth(1) {
        let entry = entry?;
        let path = entry.path().to_string_lossy().to_string();
        if entry.file_type().is_dir() {
            listing.directories.push(path);
        } else {
            listing.files.push(path);
        }
    }
    Ok(listing)
}

fn browse_remote(channel: &Sftp, directory: &str, listing: &mut Listing) -> AppResult<()> {
    for entry in sftp::list_dir(channel, directory)? {
        if entry.is_dir && !entry.is_symlink {
            listing.directories.push(entry.path.clone());
            browse_remote(channel, &entry.path, listing)?;
        } else {
            listing.files.push(entry.path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_local_listing_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("top.txt"), b"").unwrap();
        fs::write(dir.path().join("a/b/deep.txt"), b"").unwrap();

        let top = dir.path().to_string_lossy().to_string();
        let listing = FileBrowser::Local.browse(&top).unwrap();

        let rel = |paths: &[String]| -> Vec<String> {
            paths
                .iter()
                .map(|p| p.trim_start_matches(top.as_str()).trim_start_matches('/').to_string())
                .collect()
        };
        assert_eq!(rel(&listing.files), vec!["a/b/deep.txt", "top.txt"]);
        assert_eq!(rel(&listing.directories), vec!["a", "a/b"]);
    }

    #[test]
    fn test_missing_directory_is_error() {
        assert!(FileBrowser::Local.browse("/definitely/not/here").is_err());
    }
}
