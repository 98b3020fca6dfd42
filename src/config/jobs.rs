use crate::commands::CommandConfiguration;
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A job description loaded from TOML.
///
/// `host` is where the job's files live. When `execution_host` is set the
/// files are staged from `host` to `execution_host` through this machine
/// and the job runs on `execution_host`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFile {
    pub host: String,
    #[serde(default)]
    pub execution_host: Option<String>,
    pub command: CommandConfiguration,
}

impl JobFile {
    pub fn load(path: &Path) -> AppResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read job file {}: {}", path.display(), e))
        })?;
        let mut job: JobFile = toml::from_str(&content)?;

        // A relative working directory is relative to the job file.
        let wd = job.command.working_directory().to_string();
        if !wd.is_empty() && Path::new(&wd).is_relative() {
            if let Some(parent) = path.parent() {
                let resolved = parent.join(&wd);
                job.command
                    .set_working_directory(&resolved.to_string_lossy());
            }
        }
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_job_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.toml");
        std::fs::write(
            &path,
            r#"
host = "cluster"

[command]
command_id = 7
executable = "./run.sh"
working_directory = "data"
remote_working_directory = "/tmp/job7"
out_file_name = "job7.out"
err_file_name = "job7.err"

[command.input_files]
input = "in.dat"
"#,
        )
        .unwrap();

        let job = JobFile::load(&path).unwrap();
        assert_eq!(job.host, "cluster");
        assert!(job.execution_host.is_none());
        assert_eq!(job.command.command_id(), 7);
        assert_eq!(job.command.input_files().get("input").unwrap(), "in.dat");
        let expected = format!("{}/", dir.path().join("data").to_string_lossy());
        assert_eq!(job.command.working_directory(), expected);
    }

    #[test]
    fn test_missing_job_file() {
        let err = JobFile::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
