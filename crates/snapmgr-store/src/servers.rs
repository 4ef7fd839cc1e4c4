//! Saved server list: hostname/username pairs in a local JSON config file.
//! Passwords never land here.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use snapmgr_common::{Result, SnapError};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedServer {
    pub hostname: String,
    pub username: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServerConfig {
    servers: Vec<SavedServer>,
}

pub struct ServerListStore {
    path: PathBuf,
}

impl ServerListStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// A missing config file is an empty list, not an error.
    pub fn load(&self) -> Result<Vec<SavedServer>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no server config yet");
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        let config: ServerConfig = serde_json::from_str(&raw)
            .map_err(|e| SnapError::Store(format!("invalid server config: {e}")))?;
        Ok(config.servers)
    }

    pub fn save(&self, servers: &[SavedServer]) -> Result<()> {
        let config = ServerConfig {
            servers: servers.to_vec(),
        };
        let raw = serde_json::to_string_pretty(&config)
            .map_err(|e| SnapError::Store(format!("could not encode server config: {e}")))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, raw)?;
        Ok(())
    }

    /// Remembers one server, replacing the stored username if the hostname
    /// is already known. Order of first appearance is preserved.
    pub fn upsert(&self, hostname: &str, username: &str) -> Result<()> {
        let mut servers = self.load()?;
        match servers.iter_mut().find(|s| s.hostname == hostname) {
            Some(existing) => existing.username = username.to_string(),
            None => servers.push(SavedServer {
                hostname: hostname.to_string(),
                username: username.to_string(),
            }),
        }
        self.save(&servers)
    }

    pub fn remove(&self, hostname: &str) -> Result<()> {
        let mut servers = self.load()?;
        servers.retain(|s| s.hostname != hostname);
        self.save(&servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ServerListStore {
        ServerListStore::new(dir.path().join("servers.json"))
    }

    #[test]
    fn test_missing_file_is_empty_list() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).load().unwrap().is_empty());
    }

    #[test]
    fn test_roundtrip_preserves_order() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.upsert("vc02.example.net", "admin").unwrap();
        store.upsert("vc01.example.net", "operator").unwrap();

        let loaded = store.load().unwrap();
        let hosts: Vec<&str> = loaded.iter().map(|s| s.hostname.as_str()).collect();
        assert_eq!(hosts, vec!["vc02.example.net", "vc01.example.net"]);
    }

    #[test]
    fn test_upsert_replaces_username() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.upsert("vc01.example.net", "admin").unwrap();
        store.upsert("vc01.example.net", "operator").unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].username, "operator");
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.upsert("vc01.example.net", "admin").unwrap();
        store.remove("vc01.example.net").unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_a_store_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(&path, "not json").unwrap();
        let err = ServerListStore::new(path).load().unwrap_err();
        assert!(matches!(err, SnapError::Store(_)));
    }
}
