pub mod auth;
pub mod connection;
pub mod session;
pub mod tunnel;

pub use auth::*;
pub use connection::*;
pub use session::*;

use crate::config::AppSettings;
use crate::error::{AppError, AppResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// Pool of live connections keyed by configuration name.
///
/// Opens for the same name are serialized on a per-name gate, so two
/// commands racing for one name end up sharing a single session while
/// other names and lookups proceed.
pub struct ConnectionManager {
    connections: DashMap<String, Arc<Connection>>,
    opening: DashMap<String, Arc<Mutex<()>>>,
    connector: Arc<dyn Connector>,
}

impl ConnectionManager {
    pub fn new(settings: &AppSettings, config_dir: &Path) -> Self {
        let known_hosts = settings.ssh.known_hosts_path(config_dir);
        Self::with_connector(Arc::new(SshConnector::new(settings.ssh.clone(), known_hosts)))
    }

    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            connections: DashMap::new(),
            opening: DashMap::new(),
            connector,
        }
    }

    /// Return the pooled connection for `config.name()` if its session is
    /// still open, otherwise open and pool a new one.
    pub fn open_connection(&self, config: Arc<ConnectionConfiguration>) -> AppResult<Arc<Connection>> {
        let name = config.name().to_string();
        self.open_pooled(&name, || self.connector.open(config))
    }

    /// Open a connection for `config` tunneled through `base`, for
    /// three-host topologies.
    pub fn open_forwarding_connection(
        &self,
        base: &Arc<Connection>,
        config: Arc<ConnectionConfiguration>,
    ) -> AppResult<Arc<Connection>> {
        let name = config.name().to_string();
        if name == base.name() {
            return Err(AppError::InvalidConfig(format!(
                "Forwarded connection {} cannot share its base's name",
                name
            )));
        }
        self.open_pooled(&name, || self.connector.open_forwarded(base, config))
    }

    /// Opens of one name are serialized on that name's gate. The pool map
    /// itself is never locked across a handshake.
    fn open_pooled(
        &self,
        name: &str,
        open: impl FnOnce() -> AppResult<Connection>,
    ) -> AppResult<Arc<Connection>> {
        if let Some(conn) = self.live(name) {
            tracing::debug!("Reusing connection {}", name);
            return Ok(conn);
        }

        let gate = self.opening.entry(name.to_string()).or_default().clone();
        let _held = gate.lock();
        if let Some(conn) = self.live(name) {
            tracing::debug!("Connection {} was opened concurrently", name);
            return Ok(conn);
        }

        let conn = Arc::new(open().map_err(|e| connect_error(name, e))?);
        self.connections.insert(name.to_string(), conn.clone());
        tracing::info!("Connection {} opened", name);
        Ok(conn)
    }

    fn live(&self, name: &str) -> Option<Arc<Connection>> {
        self.connections
            .get(name)
            .map(|c| c.value().clone())
            .filter(|c| c.is_open())
    }

    pub fn get_connection(&self, name: &str) -> Option<Arc<Connection>> {
        self.connections.get(name).map(|c| c.value().clone())
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.connections
            .get(name)
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        self.connections.iter().map(|c| c.info()).collect()
    }

    /// Close `conn` and drop it from the pool. `false` if it was not
    /// pooled or did not close cleanly.
    pub fn close_connection(&self, conn: &Arc<Connection>) -> bool {
        let removed = self
            .connections
            .remove_if(conn.name(), |_, pooled| Arc::ptr_eq(pooled, conn))
            .is_some();
        match conn.disconnect() {
            Ok(()) => removed,
            Err(e) => {
                tracing::warn!("{}", e);
                false
            }
        }
    }

    /// Close every pooled connection. Forwarded connections go first so
    /// their tunnels are torn down before the sessions they ride on.
    pub fn close_all_connections(&self) -> bool {
        let mut all: Vec<Arc<Connection>> = self.connections.iter().map(|c| c.value().clone()).collect();
        all.sort_by_key(|c| !c.is_forwarded());

        let mut clean = true;
        for conn in all {
            clean &= self.close_connection(&conn);
        }
        clean
    }
}

fn connect_error(name: &str, err: AppError) -> AppError {
    match err {
        AppError::Connection(_) | AppError::CredentialsUnavailable(_) | AppError::InvalidConfig(_) => err,
        other => AppError::Connection(format!("{}: {}", name, other)),
    }
}

/// True for the transient "try again" errors of a non-blocking session
pub(crate) fn is_would_block(err: &std::io::Error) -> bool {
    if matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    ) {
        return true;
    }
    let msg = err.to_string().to_lowercase();
    msg.contains("would block")
        || msg.contains("eagain")
        || msg.contains("try again")
        || msg.contains("temporarily unavailable")
        || msg.contains("-37") // libssh2 EAGAIN code
}
