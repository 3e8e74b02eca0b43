use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::errors::{AppError, AppResult};

/// Named secrets kept outside the process: the OS keyring in normal runs,
/// a process-local map when persistence is switched off or under test.
#[derive(Clone)]
pub struct SecretVault {
    service_name: String,
    backend: SecretBackend,
}

#[derive(Clone)]
enum SecretBackend {
    Keyring,
    Memory(Arc<Mutex<HashMap<String, SecretString>>>),
}

impl SecretVault {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            backend: SecretBackend::Keyring,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            service_name: "in-memory".to_string(),
            backend: SecretBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.backend, SecretBackend::Keyring)
    }

    pub fn read_secret(&self, account: &str) -> AppResult<Option<SecretString>> {
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.get_password() {
                    Ok(value) => Ok(Some(SecretString::from(value))),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(err) => Err(AppError::from(err)),
                }
            }
            SecretBackend::Memory(store) => Ok(store.lock().get(account).cloned()),
        }
    }

    pub fn write_secret(&self, account: &str, secret: &SecretString) -> AppResult<()> {
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                entry.set_password(secret.expose_secret())?;
            }
            SecretBackend::Memory(store) => {
                store.lock().insert(account.to_string(), secret.clone());
            }
        }
        debug!(
            target: "secret_vault",
            service = %self.service_name,
            account,
            "stored secret"
        );
        Ok(())
    }

    pub fn delete(&self, account: &str) -> AppResult<()> {
        match &self.backend {
            SecretBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.delete_password() {
                    Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                    Err(err) => Err(AppError::from(err)),
                }
            }
            SecretBackend::Memory(store) => {
                store.lock().remove(account);
                Ok(())
            }
        }
    }

    pub fn has(&self, account: &str) -> AppResult<bool> {
        self.read_secret(account).map(|secret| secret.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_and_deletes_secret() {
        let vault = SecretVault::in_memory();
        assert!(!vault.has("session").unwrap());

        vault
            .write_secret("session", &SecretString::from("token".to_string()))
            .unwrap();
        let stored = vault.read_secret("session").unwrap().unwrap();
        assert_eq!(stored.expose_secret(), "token");

        vault.delete("session").unwrap();
        assert!(!vault.has("session").unwrap());
        vault.delete("session").unwrap();
    }

    #[test]
    fn clones_share_memory_backend() {
        let vault = SecretVault::in_memory();
        let other = vault.clone();
        other
            .write_secret("session", &SecretString::from("shared".to_string()))
            .unwrap();
        assert!(vault.has("session").unwrap());
        assert!(!vault.is_persistent());
    }
}
