use crate::error::{AppError, AppResult};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use keyring::Entry;
use rand::RngCore;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const SERVICE_NAME: &str = "sshjob";

/// Secret storage backed by the OS keychain.
///
/// When no keyring backend is usable, secrets go to an AES-256-GCM
/// encrypted file in the config directory. That file is less secure than
/// the OS keychain because its key lives next to it on disk.
#[derive(Debug, Clone)]
pub struct SecretStore {
    config_dir: PathBuf,
    use_keyring: bool,
}

impl SecretStore {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            config_dir: config_dir.to_path_buf(),
            use_keyring: true,
        }
    }

    /// Store that never touches the OS keychain.
    pub fn file_only(config_dir: &Path) -> Self {
        Self {
            config_dir: config_dir.to_path_buf(),
            use_keyring: false,
        }
    }

    fn fallback_path(&self) -> PathBuf {
        self.config_dir.join(".secrets.enc")
    }

    fn key_path(&self) -> PathBuf {
        self.config_dir.join(".keyfile")
    }

    fn get_or_create_fallback_key(&self) -> AppResult<Zeroizing<[u8; 32]>> {
        let key_path = self.key_path();

        if key_path.exists() {
            let key_data = Zeroizing::new(
                fs::read(&key_path)
                    .map_err(|e| AppError::Keychain(format!("Failed to read key file: {}", e)))?,
            );
            if key_data.len() == 32 {
                let mut key = Zeroizing::new([0u8; 32]);
                key.copy_from_slice(&key_data);
                return Ok(key);
            }
        }

        let mut key = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut key[..]);

        fs::create_dir_all(&self.config_dir)?;
        fs::write(&key_path, &key[..])
            .map_err(|e| AppError::Keychain(format!("Failed to write key file: {}", e)))?;
        restrict_permissions(&key_path);

        Ok(key)
    }

    fn load_fallback(&self) -> AppResult<HashMap<String, String>> {
        let path = self.fallback_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }

        let encrypted = fs::read(&path)
            .map_err(|e| AppError::Keychain(format!("Failed to read secrets file: {}", e)))?;
        if encrypted.len() < 12 {
            return Ok(HashMap::new());
        }

        let key = self.get_or_create_fallback_key()?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| AppError::Keychain(format!("Failed to create cipher: {}", e)))?;

        let nonce = Nonce::from_slice(&encrypted[..12]);
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(nonce, &encrypted[12..])
                .map_err(|e| AppError::Keychain(format!("Failed to decrypt secrets: {}", e)))?,
        );

        serde_json::from_slice(&plaintext)
            .map_err(|e| AppError::Keychain(format!("Failed to parse secrets: {}", e)))
    }

    fn save_fallback(&self, store: &HashMap<String, String>) -> AppResult<()> {
        let key = self.get_or_create_fallback_key()?;
        let json = Zeroizing::new(serde_json::to_vec(store)?);

        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| AppError::Keychain(format!("Failed to create cipher: {}", e)))?;

        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, json.as_slice())
            .map_err(|e| AppError::Keychain(format!("Failed to encrypt secrets: {}", e)))?;

        let mut output = nonce_bytes.to_vec();
        output.extend(ciphertext);

        let path = self.fallback_path();
        fs::write(&path, &output)
            .map_err(|e| AppError::Keychain(format!("Failed to write secrets file: {}", e)))?;
        restrict_permissions(&path);

        Ok(())
    }

    /// Store a secret in the OS keychain (with fallback)
    pub fn store(&self, key: &str, secret: &str) -> AppResult<()> {
        if self.use_keyring {
            match Entry::new(SERVICE_NAME, key).and_then(|entry| entry.set_password(secret)) {
                Ok(()) => {
                    tracing::debug!("Stored secret in OS keychain: {}", key);
                    return Ok(());
                }
                Err(e) => tracing::warn!("OS keychain unavailable, using fallback: {}", e),
            }
        }

        let mut store = self.load_fallback()?;
        store.insert(key.to_string(), secret.to_string());
        self.save_fallback(&store)?;
        tracing::warn!("Stored secret in encrypted fallback file: {}", key);
        Ok(())
    }

    /// Retrieve a secret from the OS keychain (with fallback)
    pub fn get(&self, key: &str) -> AppResult<Option<Zeroizing<String>>> {
        if self.use_keyring {
            match Entry::new(SERVICE_NAME, key).and_then(|entry| entry.get_password()) {
                Ok(secret) => return Ok(Some(Zeroizing::new(secret))),
                Err(keyring::Error::NoEntry) => {}
                Err(e) => tracing::debug!("OS keychain get failed, trying fallback: {}", e),
            }
        }

        Ok(self.load_fallback()?.remove(key).map(Zeroizing::new))
    }

    /// Delete a secret from the OS keychain and the fallback file
    pub fn delete(&self, key: &str) -> AppResult<()> {
        if self.use_keyring {
            if let Ok(entry) = Entry::new(SERVICE_NAME, key) {
                match entry.delete_password() {
                    Ok(()) | Err(keyring::Error::NoEntry) => {}
                    Err(e) => tracing::debug!("OS keychain delete failed: {}", e),
                }
            }
        }

        let mut store = self.load_fallback()?;
        if store.remove(key).is_some() {
            self.save_fallback(&store)?;
        }
        Ok(())
    }

    /// Store a host password under `password:<name>`
    pub fn store_password(&self, name: &str, password: &str) -> AppResult<()> {
        self.store(&password_key(name), password)
    }

    /// Look up a host password stored under `password:<name>`
    pub fn password(&self, name: &str) -> AppResult<Option<Zeroizing<String>>> {
        self.get(&password_key(name))
    }
}

fn password_key(name: &str) -> String {
    format!("password:{}", name)
}

fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
            tracing::warn!("Failed to restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::file_only(dir.path());

        store.store_password("cluster", "hunter2").unwrap();
        assert_eq!(store.password("cluster").unwrap().unwrap().as_str(), "hunter2");
        assert!(store.password("other").unwrap().is_none());

        // The file is encrypted.
        let raw = fs::read(dir.path().join(".secrets.enc")).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("hunter2"));

        store.delete("password:cluster").unwrap();
        assert!(store.password("cluster").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_fallback_files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::file_only(dir.path());
        store.store("k", "v").unwrap();
        let mode = fs::metadata(dir.path().join(".keyfile")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
