use super::auth::AuthorizationHandler;
use super::connection::{Connection, ConnectionConfiguration};
use super::tunnel::Tunnel;
use crate::config::SshSettings;
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ssh2::{CheckResult, HostKeyType, KnownHostFileKind, KnownHostKeyFormat, Session};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;

/// What to do with a host key that is not in known_hosts.
/// A changed key is always rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KnownHostsPolicy {
    /// Reject unknown hosts
    Strict,
    /// Trust and record unknown hosts
    #[default]
    AcceptNew,
    /// Trust unknown hosts without recording them
    Accept,
}

/// Opens authenticated sessions for the connection pool.
pub trait Connector: Send + Sync {
    /// Open a direct session to the configured host.
    fn open(&self, config: Arc<ConnectionConfiguration>) -> AppResult<Connection>;

    /// Open a session to the configured host tunneled through `base`.
    fn open_forwarded(
        &self,
        base: &Arc<Connection>,
        config: Arc<ConnectionConfiguration>,
    ) -> AppResult<Connection>;
}

/// libssh2-backed connector
pub struct SshConnector {
    settings: SshSettings,
    known_hosts_path: PathBuf,
}

impl SshConnector {
    pub fn new(settings: SshSettings, known_hosts_path: PathBuf) -> Self {
        Self {
            settings,
            known_hosts_path,
        }
    }

    fn connect_tcp(&self, auth: &AuthorizationHandler) -> AppResult<TcpStream> {
        let host = auth.hostname();
        let port = if auth.port() == 0 {
            self.settings.default_port
        } else {
            auth.port()
        };

        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|e| AppError::Connection(format!("Cannot resolve {}:{}: {}", host, port, e)))?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.settings.connect_timeout()) {
                Ok(tcp) => {
                    tcp.set_nodelay(true)?;
                    return Ok(tcp);
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(AppError::Connection(match last_error {
            Some(e) => format!("TCP connect to {}:{} failed: {}", host, port, e),
            None => format!("No addresses for {}:{}", host, port),
        }))
    }

    /// Handshake, verify the host key and authenticate over `tcp`.
    fn establish(&self, tcp: TcpStream, config: &ConnectionConfiguration) -> AppResult<Session> {
        let auth = config.authorization();

        tracing::info!(
            "Connecting to {}@{}:{} ({})",
            auth.username(),
            auth.hostname(),
            auth.port(),
            config.name()
        );

        let mut session = Session::new()
            .map_err(|e| AppError::Ssh(format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.settings.connect_timeout().as_millis() as u32);
        session.set_keepalive(true, self.settings.keepalive_interval);

        session
            .handshake()
            .map_err(|e| AppError::Connection(format!("SSH handshake failed: {}", e)))?;

        self.verify_host_key(&session, auth.hostname(), auth.port())?;
        authenticate(&session, auth)?;

        // Operations after setup may legitimately block for a long time.
        session.set_timeout(0);

        tracing::info!("SSH authentication successful ({})", config.name());
        Ok(session)
    }

    /// Verify the host key against known_hosts under the configured policy
    fn verify_host_key(&self, session: &Session, host: &str, port: u16) -> AppResult<()> {
        let (key, key_type) = session
            .host_key()
            .ok_or_else(|| AppError::Connection("No host key received".to_string()))?;
        let fingerprint = compute_sha256_fingerprint(key);

        let mut known_hosts = session
            .known_hosts()
            .map_err(|e| AppError::Ssh(format!("Failed to create known_hosts: {}", e)))?;
        if self.known_hosts_path.exists() {
            known_hosts
                .read_file(&self.known_hosts_path, KnownHostFileKind::OpenSSH)
                .map_err(|e| AppError::Config(format!("Failed to read known_hosts: {}", e)))?;
        }

        match known_hosts.check_port(host, port, key) {
            CheckResult::Match => {
                tracing::debug!("Host key matched for {}:{}", host, port);
                Ok(())
            }
            CheckResult::NotFound => match self.settings.known_hosts_policy {
                KnownHostsPolicy::Strict => Err(AppError::Connection(format!(
                    "Unknown host key for {}:{} ({})",
                    host, port, fingerprint
                ))),
                KnownHostsPolicy::Accept => {
                    tracing::warn!("Trusting unknown host key for {}:{} ({})", host, port, fingerprint);
                    Ok(())
                }
                KnownHostsPolicy::AcceptNew => {
                    tracing::info!("Recording new host key for {}:{} ({})", host, port, fingerprint);
                    let entry = if port == 22 {
                        host.to_string()
                    } else {
                        format!("[{}]:{}", host, port)
                    };
                    known_hosts
                        .add(
                            &entry,
                            key,
                            &format!("added by sshjob on {}", chrono::Utc::now().format("%Y-%m-%d")),
                            key_format(key_type),
                        )
                        .map_err(|e| AppError::Ssh(format!("Failed to add known host: {}", e)))?;
                    if let Some(parent) = self.known_hosts_path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    known_hosts
                        .write_file(&self.known_hosts_path, KnownHostFileKind::OpenSSH)
                        .map_err(|e| AppError::Ssh(format!("Failed to write known_hosts: {}", e)))?;
                    Ok(())
                }
            },
            CheckResult::Mismatch => {
                tracing::error!(
                    "HOST KEY MISMATCH for {}:{}! Possible MITM attack! ({})",
                    host,
                    port,
                    fingerprint
                );
                Err(AppError::Connection(format!(
                    "Host key for {}:{} has changed; remove the old key from known_hosts if the change is expected",
                    host, port
                )))
            }
            CheckResult::Failure => {
                Err(AppError::Connection("Failed to check known hosts".to_string()))
            }
        }
    }
}

impl Connector for SshConnector {
    fn open(&self, config: Arc<ConnectionConfiguration>) -> AppResult<Connection> {
        let tcp = self.connect_tcp(config.authorization())?;
        let session = self.establish(tcp, &config)?;
        Ok(Connection::new(config, session, None))
    }

    fn open_forwarded(
        &self,
        base: &Arc<Connection>,
        config: Arc<ConnectionConfiguration>,
    ) -> AppResult<Connection> {
        let auth = config.authorization();
        let port = if auth.port() == 0 {
            self.settings.default_port
        } else {
            auth.port()
        };
        let (stream, tunnel) = Tunnel::open(base.clone(), auth.hostname(), port)?;
        let session = self.establish(stream, &config)?;
        tracing::info!("{} reached through {}", config.name(), base.name());
        Ok(Connection::new(config, session, Some(tunnel)))
    }
}

/// Authenticate with the SSH server.
///
/// Key file first, then a password when the handler has one, then any
/// identity offered by ssh-agent.
fn authenticate(session: &Session, auth: &AuthorizationHandler) -> AppResult<()> {
    let username = auth.username();

    if let Some(key_path) = auth.key_path() {
        session
            .userauth_pubkey_file(username, None, key_path, None)
            .map_err(|e| {
                let msg = e.to_string().to_lowercase();
                if msg.contains("passphrase") || msg.contains("decrypt") || msg.contains("parse") {
                    AppError::Auth("Invalid passphrase or key format".to_string())
                } else {
                    AppError::Auth("Private key not accepted by server".to_string())
                }
            })?;
    } else if let Some(password) = auth.password()? {
        session
            .userauth_password(username, &password)
            .map_err(|_| AppError::Auth("Password authentication failed".to_string()))?;
    } else {
        authenticate_agent(session, username)?;
    }

    if !session.authenticated() {
        return Err(AppError::Auth("Authentication failed".to_string()));
    }
    Ok(())
}

fn authenticate_agent(session: &Session, username: &str) -> AppResult<()> {
    let mut agent = session
        .agent()
        .map_err(|_| AppError::Auth("SSH agent not available".to_string()))?;
    agent
        .connect()
        .map_err(|_| AppError::Auth("Failed to connect to SSH agent".to_string()))?;
    agent
        .list_identities()
        .map_err(|_| AppError::Auth("Failed to list SSH agent identities".to_string()))?;

    let identities = agent.identities().unwrap_or_default();
    if identities.is_empty() {
        return Err(AppError::Auth("No identities found in SSH agent".to_string()));
    }

    for identity in identities {
        if agent.userauth(username, &identity).is_ok() {
            return Ok(());
        }
    }
    Err(AppError::Auth("SSH agent authentication failed".to_string()))
}

fn key_format(key_type: HostKeyType) -> KnownHostKeyFormat {
    match key_type {
        HostKeyType::Rsa => KnownHostKeyFormat::SshRsa,
        HostKeyType::Dss => KnownHostKeyFormat::SshDss,
        HostKeyType::Ecdsa256 => KnownHostKeyFormat::Ecdsa256,
        HostKeyType::Ecdsa384 => KnownHostKeyFormat::Ecdsa384,
        HostKeyType::Ecdsa521 => KnownHostKeyFormat::Ecdsa521,
        HostKeyType::Ed25519 => KnownHostKeyFormat::Ed25519,
        _ => KnownHostKeyFormat::Unknown,
    }
}

/// Compute SHA256 fingerprint of a key
pub fn compute_sha256_fingerprint(key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    let result = hasher.finalize();

    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &result);
    format!("SHA256:{}", b64.trim_end_matches('='))
}
