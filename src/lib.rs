pub mod commands;
pub mod config;
pub mod error;
pub mod files;
pub mod keychain;
pub mod logging;
pub mod sftp;
pub mod ssh;
pub mod state;

pub use commands::{Command, CommandConfiguration, CommandFactory, CommandStatus};
pub use error::{AppError, AppResult};
pub use files::{FileHandler, FileHandlerFactory, HandleType};
pub use ssh::{AuthorizationHandler, Connection, ConnectionConfiguration, ConnectionManager};
pub use state::AppState;
