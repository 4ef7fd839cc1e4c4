//! Small local settings: auto-connect preference, first-run flag, and
//! opaque window-geometry blobs keyed by window name.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use snapmgr_common::{Result, SnapError};

pub trait SettingsStore: Send + Sync {
    /// `None` means the user has never been asked.
    fn auto_connect(&self) -> Result<Option<bool>>;
    fn set_auto_connect(&self, enabled: bool) -> Result<()>;

    fn first_run(&self) -> Result<bool>;
    fn mark_first_run_done(&self) -> Result<()>;

    fn geometry(&self, window: &str) -> Result<Option<String>>;
    fn set_geometry(&self, window: &str, blob: &str) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Settings {
    auto_connect: Option<bool>,
    first_run: Option<bool>,
    #[serde(default)]
    geometry: HashMap<String, String>,
}

pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> Result<Settings> {
        if !self.path.exists() {
            return Ok(Settings::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        serde_json::from_str(&raw)
            .map_err(|e| SnapError::Store(format!("invalid settings file: {e}")))
    }

    fn write(&self, settings: &Settings) -> Result<()> {
        let raw = serde_json::to_string_pretty(settings)
            .map_err(|e| SnapError::Store(format!("could not encode settings: {e}")))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, raw)?;
        Ok(())
    }
}

impl SettingsStore for JsonSettingsStore {
    fn auto_connect(&self) -> Result<Option<bool>> {
        Ok(self.read()?.auto_connect)
    }

    fn set_auto_connect(&self, enabled: bool) -> Result<()> {
        let mut settings = self.read()?;
        settings.auto_connect = Some(enabled);
        self.write(&settings)
    }

    fn first_run(&self) -> Result<bool> {
        Ok(self.read()?.first_run.unwrap_or(true))
    }

    fn mark_first_run_done(&self) -> Result<()> {
        let mut settings = self.read()?;
        settings.first_run = Some(false);
        self.write(&settings)
    }

    fn geometry(&self, window: &str) -> Result<Option<String>> {
        Ok(self.read()?.geometry.get(window).cloned())
    }

    fn set_geometry(&self, window: &str, blob: &str) -> Result<()> {
        let mut settings = self.read()?;
        settings
            .geometry
            .insert(window.to_string(), blob.to_string());
        self.write(&settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> JsonSettingsStore {
        JsonSettingsStore::new(dir.path().join("settings.json"))
    }

    #[test]
    fn test_defaults() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        assert_eq!(store.auto_connect().unwrap(), None);
        assert!(store.first_run().unwrap());
        assert_eq!(store.geometry("main").unwrap(), None);
    }

    #[test]
    fn test_auto_connect_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.set_auto_connect(true).unwrap();
        assert_eq!(store.auto_connect().unwrap(), Some(true));
        store.set_auto_connect(false).unwrap();
        assert_eq!(store.auto_connect().unwrap(), Some(false));
    }

    #[test]
    fn test_first_run_flips_once() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.mark_first_run_done().unwrap();
        assert!(!store.first_run().unwrap());
    }

    #[test]
    fn test_geometry_per_window() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.set_geometry("main", "1200x600+40+40").unwrap();
        store.set_geometry("create", "500x400+80+80").unwrap();
        assert_eq!(
            store.geometry("main").unwrap().as_deref(),
            Some("1200x600+40+40")
        );
        assert_eq!(
            store.geometry("create").unwrap().as_deref(),
            Some("500x400+80+80")
        );
    }
}
