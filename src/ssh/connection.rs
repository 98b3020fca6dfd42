use super::auth::AuthorizationHandler;
use super::tunnel::Tunnel;
use crate::error::{AppError, AppResult};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use ssh2::{Channel, Session, Sftp};
use std::io::Read;
use std::sync::Arc;

/// Target description for a connection. Immutable once built and shared
/// by reference between the pool and every command that uses it.
#[derive(Debug, Clone)]
pub struct ConnectionConfiguration {
    name: String,
    authorization: AuthorizationHandler,
    delete_working_directory: bool,
}

impl ConnectionConfiguration {
    pub fn new(
        name: impl Into<String>,
        authorization: AuthorizationHandler,
        delete_working_directory: bool,
    ) -> Self {
        Self {
            name: name.into(),
            authorization,
            delete_working_directory,
        }
    }

    /// Pool key
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn authorization(&self) -> &AuthorizationHandler {
        &self.authorization
    }

    pub fn delete_working_directory(&self) -> bool {
        self.delete_working_directory
    }

    pub fn hostname(&self) -> &str {
        self.authorization.hostname()
    }

    pub fn is_local(&self) -> bool {
        self.authorization.is_local()
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Connection info for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub state: ConnectionState,
    pub forwarded: bool,
    pub connected_at: i64,
}

#[derive(Default)]
struct Channels {
    exec: Option<Channel>,
    sftp: Option<Sftp>,
}

/// An authenticated session plus its execution and transfer channels.
///
/// The session lives until [`Connection::disconnect`]. Channels are only
/// reachable through a [`ChannelLease`], which holds them exclusively and
/// closes them when dropped.
pub struct Connection {
    config: Arc<ConnectionConfiguration>,
    session: Session,
    channels: Mutex<Channels>,
    state: RwLock<ConnectionState>,
    connected_at: i64,
    // Declared last: the session is torn down before the tunnel under it.
    tunnel: Option<Tunnel>,
}

impl Connection {
    pub fn new(config: Arc<ConnectionConfiguration>, session: Session, tunnel: Option<Tunnel>) -> Self {
        Self {
            config,
            session,
            channels: Mutex::new(Channels::default()),
            state: RwLock::new(ConnectionState::Connected),
            connected_at: chrono::Utc::now().timestamp(),
            tunnel,
        }
    }

    pub fn config(&self) -> &Arc<ConnectionConfiguration> {
        &self.config
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn is_open(&self) -> bool {
        *self.state.read() == ConnectionState::Connected
    }

    pub fn is_forwarded(&self) -> bool {
        self.tunnel.is_some()
    }

    pub fn info(&self) -> ConnectionInfo {
        let auth = self.config.authorization();
        ConnectionInfo {
            name: self.config.name().to_string(),
            host: auth.hostname().to_string(),
            port: auth.port(),
            username: auth.username().to_string(),
            state: *self.state.read(),
            forwarded: self.is_forwarded(),
            connected_at: self.connected_at,
        }
    }

    /// Take the channels exclusively for one pipeline stage.
    pub fn lease(&self) -> ChannelLease<'_> {
        ChannelLease {
            conn: self,
            channels: self.channels.lock(),
        }
    }

    /// Run `f` against the session while no stage holds the channels.
    pub fn with_session<T>(&self, f: impl FnOnce(&Session) -> T) -> T {
        let _guard = self.channels.lock();
        f(&self.session)
    }

    /// Close the channels and the session.
    pub fn disconnect(&self) -> AppResult<()> {
        let mut channels = self.channels.lock();
        close_channels(&mut channels, self.config.name());
        *self.state.write() = ConnectionState::Disconnected;

        if self.session.authenticated() {
            self.session
                .disconnect(None, "closing", None)
                .map_err(|e| AppError::Ssh(format!("Failed to disconnect {}: {}", self.name(), e)))?;
        }
        tracing::info!("Connection {} closed", self.name());
        Ok(())
    }
}

fn close_channels(channels: &mut Channels, name: &str) -> bool {
    let mut clean = true;
    if let Some(mut exec) = channels.exec.take() {
        if let Err(e) = exec.close().and_then(|_| exec.wait_close()) {
            tracing::warn!("Failed to close execution channel on {}: {}", name, e);
            clean = false;
        }
    }
    if channels.sftp.take().is_some() {
        tracing::debug!("Transfer channel on {} released", name);
    }
    clean
}

/// Exclusive use of a connection's channels for the duration of a stage.
pub struct ChannelLease<'a> {
    conn: &'a Connection,
    channels: MutexGuard<'a, Channels>,
}

impl<'a> ChannelLease<'a> {
    pub fn connection(&self) -> &'a Connection {
        self.conn
    }

    pub fn session(&self) -> &Session {
        &self.conn.session
    }

    /// The transfer channel, opened on first use.
    pub fn sftp(&mut self) -> AppResult<&Sftp> {
        if self.channels.sftp.is_none() {
            let sftp = self.conn.session.sftp().map_err(|e| {
                AppError::Transfer(format!("Failed to open SFTP on {}: {}", self.conn.name(), e))
            })?;
            self.channels.sftp = Some(sftp);
        }
        self.channels
            .sftp
            .as_ref()
            .ok_or_else(|| AppError::Transfer("SFTP channel unavailable".to_string()))
    }

    /// Open a fresh execution channel running `command`, replacing any
    /// previous one.
    pub fn open_exec(&mut self, command: &str) -> AppResult<&mut Channel> {
        if let Some(mut previous) = self.channels.exec.take() {
            if let Err(e) = previous.close() {
                tracing::warn!("Failed to close previous execution channel: {}", e);
            }
        }

        tracing::debug!("Opening execution channel on {}", self.conn.name());
        let mut channel = self.conn.session.channel_session().map_err(|e| {
            AppError::Execution(format!("Failed to open channel on {}: {}", self.conn.name(), e))
        })?;
        channel.exec(command).map_err(|e| {
            AppError::Execution(format!("Failed to start command on {}: {}", self.conn.name(), e))
        })?;

        Ok(self.channels.exec.insert(channel))
    }

    pub fn exec_channel(&mut self) -> Option<&mut Channel> {
        self.channels.exec.as_mut()
    }

    /// Run a short command on its own channel and wait for it.
    ///
    /// Returns the exit status and the combined output.
    pub fn run(&mut self, command: &str) -> AppResult<(i32, String)> {
        let mut channel = self.conn.session.channel_session().map_err(|e| {
            AppError::Execution(format!("Failed to open channel on {}: {}", self.conn.name(), e))
        })?;
        channel.exec(command).map_err(|e| {
            AppError::Execution(format!("Failed to run command on {}: {}", self.conn.name(), e))
        })?;

        let mut output = String::new();
        channel.read_to_string(&mut output)?;
        let mut errors = String::new();
        channel.stderr().read_to_string(&mut errors)?;
        output.push_str(&errors);

        channel.wait_close()?;
        let status = channel.exit_status()?;
        tracing::debug!(
            "Ran `{}` on {}: exit {}",
            crate::logging::sanitize(command),
            self.conn.name(),
            status
        );
        Ok((status, output))
    }

    /// Close the execution and transfer channels now. `false` when a
    /// channel failed to close cleanly.
    pub fn close(&mut self) -> bool {
        close_channels(&mut self.channels, self.conn.name())
    }
}

impl Drop for ChannelLease<'_> {
    fn drop(&mut self) {
        close_channels(&mut self.channels, self.conn.name());
    }
}
