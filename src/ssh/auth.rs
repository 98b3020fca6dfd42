//! Credential and identity providers for target hosts.

use crate::error::{AppError, AppResult};
use crate::keychain::SecretStore;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Where an [`AuthorizationHandler`] gets its secret from.
#[derive(Debug, Clone)]
pub enum AuthKind {
    /// Password typed at the controlling terminal with echo disabled.
    Console,
    /// Whitespace-delimited `username password hostname` file.
    CredentialsFile { path: PathBuf },
    /// Private key file; no password.
    KeyFile { path: PathBuf },
    /// This machine; no secret at all.
    LocalHost,
    /// Password kept in the OS keychain under `password:<key>`.
    Keychain { key: String, store: Option<SecretStore> },
}

/// Supplies credentials and identity for one target host.
#[derive(Debug, Clone)]
pub struct AuthorizationHandler {
    hostname: String,
    username: String,
    port: u16,
    kind: AuthKind,
}

impl AuthorizationHandler {
    pub fn new(kind: AuthKind) -> Self {
        Self {
            hostname: String::new(),
            username: String::new(),
            port: 22,
            kind,
        }
    }

    /// Build a handler from its textual kind and option.
    ///
    /// Kinds are `console`, `text`, `keypath`, `local` and `keychain`.
    pub fn from_kind(kind: &str, option: Option<&str>) -> AppResult<Self> {
        let kind_lower = kind.to_ascii_lowercase();
        let base = match kind_lower.as_str() {
            "console" => AuthKind::Console,
            "text" => AuthKind::CredentialsFile { path: PathBuf::new() },
            "keypath" => AuthKind::KeyFile { path: PathBuf::new() },
            "local" => AuthKind::LocalHost,
            "keychain" => AuthKind::Keychain {
                key: String::new(),
                store: None,
            },
            other => {
                return Err(AppError::InvalidConfig(format!(
                    "Unknown authorization kind: {}",
                    other
                )))
            }
        };

        let mut handler = Self::new(base);
        if let AuthKind::LocalHost = handler.kind {
            handler.hostname = local_hostname();
            handler.username = local_username();
        }
        if let Some(option) = option {
            handler.set_option(option)?;
        } else if matches!(
            handler.kind,
            AuthKind::CredentialsFile { .. } | AuthKind::KeyFile { .. }
        ) {
            return Err(AppError::CredentialsUnavailable(format!(
                "Authorization kind {} requires a file path",
                kind_lower
            )));
        }
        Ok(handler)
    }

    /// Attach the secret store used by the keychain variant.
    pub fn with_secret_store(mut self, secrets: SecretStore) -> Self {
        if let AuthKind::Keychain { ref mut store, .. } = self.kind {
            *store = Some(secrets);
        }
        self
    }

    /// Variant-specific configuration.
    ///
    /// Credentials file: the file path, parsed immediately for username and
    /// hostname. Key file: the private key path. Console: `user@host[:port]`.
    /// Keychain: the entry name. Local host: ignored.
    pub fn set_option(&mut self, option: &str) -> AppResult<()> {
        match self.kind {
            AuthKind::CredentialsFile { ref mut path } => {
                let file = PathBuf::from(option);
                let (username, _password, hostname) = read_credentials(&file)?;
                *path = file;
                self.username = username;
                self.hostname = hostname;
            }
            AuthKind::KeyFile { ref mut path } => {
                *path = expand_home(option);
            }
            AuthKind::Keychain { ref mut key, .. } => {
                *key = option.to_string();
            }
            AuthKind::Console => {
                let (user, rest) = match option.split_once('@') {
                    Some((u, r)) => (Some(u), r),
                    None => (None, option),
                };
                let (host, port) = match rest.rsplit_once(':') {
                    Some((h, p)) => (h, p.parse::<u16>().ok()),
                    None => (rest, None),
                };
                if let Some(user) = user {
                    self.username = user.to_string();
                }
                if !host.is_empty() {
                    self.hostname = host.to_string();
                }
                if let Some(port) = port {
                    self.port = port;
                }
            }
            AuthKind::LocalHost => {}
        }
        Ok(())
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn kind(&self) -> &AuthKind {
        &self.kind
    }

    pub fn set_hostname(&mut self, hostname: &str) {
        self.hostname = hostname.to_string();
    }

    pub fn set_username(&mut self, username: &str) {
        self.username = username.to_string();
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    /// The private key for key-file authentication.
    pub fn key_path(&self) -> Option<&Path> {
        match self.kind {
            AuthKind::KeyFile { ref path } => Some(path.as_path()),
            _ => None,
        }
    }

    /// Whether this handler denotes the machine we are running on.
    pub fn is_local(&self) -> bool {
        matches!(self.kind, AuthKind::LocalHost) || is_local_hostname(&self.hostname)
    }

    /// Fetch the secret for this host.
    ///
    /// The buffer is wiped when dropped. `None` is a valid answer for the
    /// key-file and local-host variants.
    pub fn password(&self) -> AppResult<Option<Zeroizing<String>>> {
        match self.kind {
            AuthKind::Console => {
                let prompt = format!("{}@{}'s password: ", self.username, self.hostname);
                let password = Zeroizing::new(rpassword::prompt_password(prompt).map_err(|e| {
                    AppError::CredentialsUnavailable(format!("Failed to read password: {}", e))
                })?);
                Ok(Some(password))
            }
            AuthKind::CredentialsFile { ref path } => {
                let (_, password, _) = read_credentials(path)?;
                Ok(Some(password))
            }
            AuthKind::Keychain { ref key, ref store } => {
                let store = store.as_ref().ok_or_else(|| {
                    AppError::CredentialsUnavailable("No secret store configured".to_string())
                })?;
                let password = store.password(key)?.ok_or_else(|| {
                    AppError::CredentialsUnavailable(format!("No password stored for {}", key))
                })?;
                Ok(Some(password))
            }
            AuthKind::KeyFile { .. } | AuthKind::LocalHost => Ok(None),
        }
    }
}

/// Parse a credentials file: exactly three whitespace-separated tokens.
fn read_credentials(path: &Path) -> AppResult<(String, Zeroizing<String>, String)> {
    let contents = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
        AppError::CredentialsUnavailable(format!(
            "Cannot read credentials file {}: {}",
            path.display(),
            e
        ))
    })?);

    let tokens: Vec<&str> = contents.split_whitespace().collect();
    if tokens.len() != 3 {
        return Err(AppError::CredentialsUnavailable(format!(
            "Malformed credentials file {}: expected username, password and hostname",
            path.display()
        )));
    }

    Ok((
        tokens[0].to_string(),
        Zeroizing::new(tokens[1].to_string()),
        tokens[2].to_string(),
    ))
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Host name of this machine as reported by the OS.
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

fn local_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}

/// Value comparison of a host name against this machine's names.
pub fn is_local_hostname(name: &str) -> bool {
    let name = name.trim();
    if name.is_empty() {
        return false;
    }
    name.eq_ignore_ascii_case("localhost")
        || name == "127.0.0.1"
        || name == "::1"
        || name.eq_ignore_ascii_case(&local_hostname())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds_file(contents: &str) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), contents).unwrap();
        file
    }

    #[test]
    fn test_credentials_file_parsed() {
        let file = creds_file("alice\ns3cret\ncluster.example.org\n");
        let auth =
            AuthorizationHandler::from_kind("text", Some(&file.path().to_string_lossy())).unwrap();
        assert_eq!(auth.username(), "alice");
        assert_eq!(auth.hostname(), "cluster.example.org");
        assert_eq!(auth.password().unwrap().unwrap().as_str(), "s3cret");
        assert!(!auth.is_local());
    }

    #[test]
    fn test_malformed_credentials_fail_closed() {
        let file = creds_file("alice s3cret");
        let err = AuthorizationHandler::from_kind("text", Some(&file.path().to_string_lossy()))
            .unwrap_err();
        assert!(matches!(err, AppError::CredentialsUnavailable(_)));

        let file = creds_file("alice s3cret host extra");
        assert!(AuthorizationHandler::from_kind("text", Some(&file.path().to_string_lossy())).is_err());
    }

    #[test]
    fn test_missing_credentials_file() {
        let err = AuthorizationHandler::from_kind("text", Some("/no/such/creds.txt")).unwrap_err();
        assert!(matches!(err, AppError::CredentialsUnavailable(_)));
        assert!(AuthorizationHandler::from_kind("text", None).is_err());
    }

    #[test]
    fn test_credentials_reread_on_each_use() {
        let file = creds_file("alice one host");
        let auth =
            AuthorizationHandler::from_kind("text", Some(&file.path().to_string_lossy())).unwrap();
        std::fs::write(file.path(), "alice two host").unwrap();
        assert_eq!(auth.password().unwrap().unwrap().as_str(), "two");
    }

    #[test]
    fn test_key_file_has_no_password() {
        let auth = AuthorizationHandler::from_kind("keypath", Some("/keys/id_rsa")).unwrap();
        assert!(auth.password().unwrap().is_none());
        assert_eq!(auth.key_path(), Some(Path::new("/keys/id_rsa")));
    }

    #[test]
    fn test_local_host() {
        let auth = AuthorizationHandler::from_kind("local", None).unwrap();
        assert!(auth.is_local());
        assert!(auth.password().unwrap().is_none());
        assert_eq!(auth.hostname(), local_hostname());
    }

    #[test]
    fn test_console_option() {
        let auth = AuthorizationHandler::from_kind("console", Some("bob@b.example.org:2200")).unwrap();
        assert_eq!(auth.username(), "bob");
        assert_eq!(auth.hostname(), "b.example.org");
        assert_eq!(auth.port(), 2200);
    }

    #[test]
    fn test_keychain_password() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::file_only(dir.path());
        store.store_password("cluster", "pw").unwrap();

        let auth = AuthorizationHandler::from_kind("keychain", Some("cluster"))
            .unwrap()
            .with_secret_store(store);
        assert_eq!(auth.password().unwrap().unwrap().as_str(), "pw");

        let missing = AuthorizationHandler::from_kind("keychain", Some("other"))
            .unwrap()
            .with_secret_store(SecretStore::file_only(dir.path()));
        assert!(matches!(
            missing.password().unwrap_err(),
            AppError::CredentialsUnavailable(_)
        ));
    }

    #[test]
    fn test_hostname_comparison_is_by_value() {
        let owned = String::from("LOCALHOST");
        assert!(is_local_hostname(&owned));
        assert!(is_local_hostname(&local_hostname()));
        assert!(!is_local_hostname("remote.example.org"));
        assert!(!is_local_hostname(""));
    }

    #[test]
    fn test_unknown_kind() {
        assert!(AuthorizationHandler::from_kind("kerberos", None).is_err());
    }
}
