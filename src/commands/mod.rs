//! Jobs: what to run, where, and how far they got.

pub mod configuration;
pub mod local;
pub mod monitor;
pub mod remote;

pub use configuration::CommandConfiguration;
pub use local::LocalCommand;
pub use monitor::{poll, PollOutcome};
pub use remote::RemoteCommand;

use crate::config::JobSettings;
use crate::logging::{sanitize, JobJournal, JobStage, JournalEntry};
use crate::ssh::{is_local_hostname, ConnectionConfiguration, ConnectionManager};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lifecycle of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Processing,
    Launching,
    Running,
    Success,
    Failed,
    Canceled,
    /// The job could not be attempted at all
    #[serde(rename = "INFOERROR")]
    InfoError,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Success
                | CommandStatus::Failed
                | CommandStatus::Canceled
                | CommandStatus::InfoError
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(self, CommandStatus::Failed | CommandStatus::InfoError)
    }

    /// Process exit code for a finished job
    pub fn exit_code(self) -> i32 {
        match self {
            CommandStatus::Success => 0,
            CommandStatus::InfoError => 2,
            CommandStatus::Canceled => 130,
            _ => 1,
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandStatus::Processing => "PROCESSING",
            CommandStatus::Launching => "LAUNCHING",
            CommandStatus::Running => "RUNNING",
            CommandStatus::Success => "SUCCESS",
            CommandStatus::Failed => "FAILED",
            CommandStatus::Canceled => "CANCELED",
            CommandStatus::InfoError => "INFOERROR",
        };
        f.write_str(name)
    }
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Status of one command. Terminal states are final.
pub(crate) struct Lifecycle {
    command_id: i64,
    status: CommandStatus,
    journal: Option<Arc<JobJournal>>,
}

impl Lifecycle {
    pub(crate) fn new(command_id: i64, journal: Option<Arc<JobJournal>>) -> Self {
        Self {
            command_id,
            status: CommandStatus::Processing,
            journal,
        }
    }

    pub(crate) fn status(&self) -> CommandStatus {
        self.status
    }

    /// Move to `next` unless already terminal. Returns the resulting status.
    pub(crate) fn transition(
        &mut self,
        stage: JobStage,
        next: CommandStatus,
        message: impl Into<String>,
    ) -> CommandStatus {
        if self.status.is_terminal() {
            tracing::debug!(
                "Command {} is {}; ignoring {}",
                self.command_id,
                self.status,
                next
            );
            return self.status;
        }
        let message = sanitize(&message.into());
        if next.is_failure() {
            tracing::error!("Command {} {} [{}]: {}", self.command_id, next, stage, message);
        } else {
            tracing::info!("Command {} {} [{}]: {}", self.command_id, next, stage, message);
        }
        if let Some(journal) = &self.journal {
            journal.record(JournalEntry::new(self.command_id, stage, next, message));
        }
        self.status = next;
        next
    }
}

/// A local or remote job
pub enum Command {
    Local(LocalCommand),
    Remote(RemoteCommand),
}

impl Command {
    /// Run the whole pipeline and return its terminal status.
    pub fn execute(&mut self) -> CommandStatus {
        match self {
            Command::Local(c) => c.execute(),
            Command::Remote(c) => c.execute(),
        }
    }

    /// Ask the running job to stop at its next poll.
    pub fn cancel(&self) {
        self.cancel_token().cancel();
    }

    /// Handle for canceling from another thread while `execute` blocks
    pub fn cancel_token(&self) -> CancelToken {
        match self {
            Command::Local(c) => c.cancel_token(),
            Command::Remote(c) => c.cancel_token(),
        }
    }

    pub fn status(&self) -> CommandStatus {
        match self {
            Command::Local(c) => c.status(),
            Command::Remote(c) => c.status(),
        }
    }

    pub fn configuration(&self) -> &CommandConfiguration {
        match self {
            Command::Local(c) => c.configuration(),
            Command::Remote(c) => c.configuration(),
        }
    }
}

/// Builds local or remote commands sharing one connection pool.
pub struct CommandFactory {
    manager: Arc<ConnectionManager>,
    settings: JobSettings,
    journal: Option<Arc<JobJournal>>,
}

impl CommandFactory {
    pub fn new(
        manager: Arc<ConnectionManager>,
        settings: JobSettings,
        journal: Option<Arc<JobJournal>>,
    ) -> Self {
        Self {
            manager,
            settings,
            journal,
        }
    }

    /// Local command for this machine, remote command otherwise.
    pub fn command(
        &self,
        config: CommandConfiguration,
        connection: Arc<ConnectionConfiguration>,
    ) -> Command {
        if is_this_machine(&connection) {
            tracing::debug!("{} is this machine; running locally", connection.name());
            Command::Local(LocalCommand::new(
                config,
                &self.settings,
                self.journal.clone(),
            ))
        } else {
            Command::Remote(RemoteCommand::new(
                self.manager.clone(),
                config,
                connection,
                None,
                &self.settings,
                self.journal.clone(),
            ))
        }
    }

    /// Remote command whose files live on `first` and which runs on
    /// `second`, staged through this machine. When either end is this
    /// machine there is nothing to relay and the other end is used alone.
    pub fn command_via(
        &self,
        config: CommandConfiguration,
        first: Arc<ConnectionConfiguration>,
        second: Arc<ConnectionConfiguration>,
    ) -> Command {
        if is_this_machine(&first) {
            return self.command(config, second);
        }
        if is_this_machine(&second) {
            return self.command(config, first);
        }
        Command::Remote(RemoteCommand::new(
            self.manager.clone(),
            config,
            first,
            Some(second),
            &self.settings,
            self.journal.clone(),
        ))
    }
}

fn is_this_machine(connection: &ConnectionConfiguration) -> bool {
    connection.is_local() || is_local_hostname(connection.hostname())
}
