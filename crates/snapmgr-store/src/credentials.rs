//! Credential storage interface. Real deployments back this with the
//! platform secret store (keychain, credential manager, secret service);
//! the in-memory implementation covers tests and session-only use.

use std::collections::HashMap;
use std::sync::Mutex;

use snapmgr_common::{Result, SnapError};

/// Secret-store entries are keyed by `hostname:username`.
pub fn credential_key(hostname: &str, username: &str) -> String {
    format!("{hostname}:{username}")
}

pub trait CredentialStore: Send + Sync {
    fn save_password(&self, hostname: &str, username: &str, password: &str) -> Result<()>;

    fn get_password(&self, hostname: &str, username: &str) -> Result<Option<String>>;

    fn delete_password(&self, hostname: &str, username: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn save_password(&self, hostname: &str, username: &str, password: &str) -> Result<()> {
        let mut secrets = self
            .secrets
            .lock()
            .map_err(|_| SnapError::Store("credential store lock poisoned".to_string()))?;
        secrets.insert(credential_key(hostname, username), password.to_string());
        Ok(())
    }

    fn get_password(&self, hostname: &str, username: &str) -> Result<Option<String>> {
        let secrets = self
            .secrets
            .lock()
            .map_err(|_| SnapError::Store("credential store lock poisoned".to_string()))?;
        Ok(secrets.get(&credential_key(hostname, username)).cloned())
    }

    fn delete_password(&self, hostname: &str, username: &str) -> Result<()> {
        let mut secrets = self
            .secrets
            .lock()
            .map_err(|_| SnapError::Store("credential store lock poisoned".to_string()))?;
        secrets.remove(&credential_key(hostname, username));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        assert_eq!(
            credential_key("vc01.example.net", "admin"),
            "vc01.example.net:admin"
        );
    }

    #[test]
    fn test_save_get_delete() {
        let store = MemoryCredentialStore::new();
        assert_eq!(store.get_password("vc01", "admin").unwrap(), None);

        store.save_password("vc01", "admin", "secret").unwrap();
        assert_eq!(
            store.get_password("vc01", "admin").unwrap().as_deref(),
            Some("secret")
        );

        // Same hostname, different user: separate entry.
        assert_eq!(store.get_password("vc01", "operator").unwrap(), None);

        store.delete_password("vc01", "admin").unwrap();
        assert_eq!(store.get_password("vc01", "admin").unwrap(), None);
    }
}
