use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by an optional JSON seed file
///
/// Uses `ArcSwap` for lock-free reads, providing high performance
/// for frequent configuration access in hot paths. Nothing is persisted
/// back to disk: sessions, rooms and detections do not survive restarts,
/// so the file is read-only seed state.
#[derive(Clone)]
pub struct ConfigStore {
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// Create a store holding the default configuration
    pub fn new(config: AppConfig) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        }
    }

    /// Load configuration from a JSON file, falling back to defaults
    /// when the file does not exist.
    pub async fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let raw = tokio::fs::read_to_string(path).await?;
            serde_json::from_str(&raw).map_err(|e| AppError::Config(e.to_string()))?
        } else {
            AppConfig::default()
        };

        Ok(Self::new(config))
    }

    /// Get current configuration (lock-free, zero-copy)
    ///
    /// Returns an `Arc<AppConfig>` for efficient sharing without cloning.
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Set entire configuration
    pub fn set(&self, config: AppConfig) {
        self.cache.store(Arc::new(config));
        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });
    }

    /// Update configuration with a closure
    ///
    /// Note: This uses a read-modify-write pattern. For concurrent updates,
    /// the last write wins. This is acceptable for configuration changes
    /// which are infrequent and typically user-initiated.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_missing_file_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let store = ConfigStore::load(&path).await.unwrap();
        assert_eq!(store.get().web.http_port, 8080);
    }

    #[tokio::test]
    async fn test_load_seed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, r#"{"engine": {"min_frame_interval_ms": 50}}"#)
            .await
            .unwrap();

        let store = ConfigStore::load(&path).await.unwrap();
        assert_eq!(store.get().engine.min_frame_interval_ms, 50);
        // Untouched sections keep defaults
        assert_eq!(store.get().detector.input_size, 640);
    }

    #[tokio::test]
    async fn test_load_invalid_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        assert!(ConfigStore::load(&path).await.is_err());
    }

    #[test]
    fn test_update() {
        let store = ConfigStore::default();
        store.update(|c| c.web.http_port = 9000);
        assert_eq!(store.get().web.http_port, 9000);
    }
}
