pub mod hosts;
pub mod jobs;
pub mod settings;

pub use hosts::*;
pub use jobs::*;
pub use settings::*;

use crate::error::AppResult;
use std::path::PathBuf;

/// Get the sshjob config directory
pub fn get_config_dir() -> AppResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .ok_or_else(|| crate::error::AppError::Config("Could not find config directory".into()))?
        .join("sshjob");

    Ok(config_dir)
}

/// Get the journal directory
pub fn get_logs_dir(config_dir: &std::path::Path) -> PathBuf {
    config_dir.join("logs")
}
