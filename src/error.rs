use crate::commands::CommandStatus;
use serde::Serialize;
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Connection failure: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Credentials unavailable: {0}")]
    CredentialsUnavailable(String),

    #[error("Path unavailable: {0}")]
    PathUnavailable(String),

    #[error("Destination unavailable: {0}")]
    DestinationUnavailable(String),

    #[error("Transfer failure: {0}")]
    Transfer(String),

    #[error("Execution failure: {0}")]
    Execution(String),

    #[error("Canceled: {0}")]
    Canceled(String),

    #[error("Keychain error: {0}")]
    Keychain(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl AppError {
    /// Status a command reports when a stage fails with this error.
    ///
    /// Anything that kept the job from being attempted at all is INFOERROR,
    /// a user cancellation is CANCELED, everything else is FAILED.
    pub fn status(&self) -> CommandStatus {
        match self {
            AppError::Connection(_)
            | AppError::Auth(_)
            | AppError::CredentialsUnavailable(_)
            | AppError::InvalidConfig(_) => CommandStatus::InfoError,
            AppError::Canceled(_) => CommandStatus::Canceled,
            _ => CommandStatus::Failed,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Ssh(_) => "SSH_ERROR",
            AppError::Connection(_) => "CONNECTION_FAILURE",
            AppError::Auth(_) => "AUTH_ERROR",
            AppError::CredentialsUnavailable(_) => "CREDENTIALS_UNAVAILABLE",
            AppError::PathUnavailable(_) => "PATH_UNAVAILABLE",
            AppError::DestinationUnavailable(_) => "DESTINATION_UNAVAILABLE",
            AppError::Transfer(_) => "TRANSFER_FAILURE",
            AppError::Execution(_) => "EXECUTION_FAILURE",
            AppError::Canceled(_) => "CANCELED",
            AppError::Keychain(_) => "KEYCHAIN_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::InvalidConfig(_) => "INVALID_CONFIG",
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::ConnectionNotFound(_) => "CONNECTION_NOT_FOUND",
            AppError::Unknown(_) => "UNKNOWN_ERROR",
        }
    }
}

/// Serializable error for `--json` output
#[derive(Serialize)]
pub struct SerializableError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&AppError> for SerializableError {
    fn from(err: &AppError) -> Self {
        let (message, details) = match err {
            AppError::Auth(msg) => ("Authentication failed".to_string(), Some(msg.clone())),
            AppError::ConnectionNotFound(name) => {
                (format!("Connection {} not found", name), None)
            }
            other => (crate::logging::sanitize(&other.to_string()), None),
        };

        SerializableError {
            code: err.code().to_string(),
            message,
            details,
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        SerializableError::from(self).serialize(serializer)
    }
}

impl From<ssh2::Error> for AppError {
    fn from(err: ssh2::Error) -> Self {
        AppError::Ssh(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<keyring::Error> for AppError {
    fn from(err: keyring::Error) -> Self {
        AppError::Keychain(err.to_string())
    }
}

impl From<walkdir::Error> for AppError {
    fn from(err: walkdir::Error) -> Self {
        match err.into_io_error() {
            Some(io) => AppError::Io(io),
            None => AppError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "filesystem loop detected",
            )),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Unknown(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
