use std::path::Path;

use objloader_cache::CacheConfig;
use objloader_defer::DefermentConfig;
use objloader_download::DownloaderConfig;
use serde::{Deserialize, Serialize};

use crate::error::{LoadError, LoadResult};

/// Settings for one loader instance. Every section may be omitted from a
/// TOML file; missing keys take their defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub cache: CacheConfig,
    pub downloader: DownloaderConfig,
    pub deferment: DefermentConfig,
}

impl LoaderConfig {
    pub fn from_toml_str(text: &str) -> LoadResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| LoadError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> LoadResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| LoadError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> LoadResult<String> {
        toml::to_string_pretty(self).map_err(|e| LoadError::Config(e.to_string()))
    }

    pub fn validate(&self) -> LoadResult<()> {
        self.cache
            .validate()
            .map_err(|e| LoadError::Config(e.to_string()))?;
        self.downloader
            .validate()
            .map_err(|e| LoadError::Config(e.to_string()))?;
        if self.deferment.timeout_ms == 0 {
            return Err(LoadError::Config("deferment.timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = LoaderConfig::default();
        assert_eq!(c.downloader.batch.batch_size, 200);
        assert_eq!(c.downloader.batch.max_wait_ms, 1000);
        assert_eq!(c.cache.write_batch.batch_size, 1000);
        assert_eq!(c.deferment.timeout_ms, 120_000);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = LoaderConfig::from_toml_str(
            r#"
            [downloader.batch]
            batch_size = 50

            [cache]
            offload_writes = false
            "#,
        )
        .unwrap();
        assert_eq!(c.downloader.batch.batch_size, 50);
        assert_eq!(c.downloader.batch.max_wait_ms, 1000);
        assert!(!c.cache.offload_writes);
        assert_eq!(c.cache.max_read_batch, 500);
    }

    #[test]
    fn adaptive_batching_from_toml() {
        let c = LoaderConfig::from_toml_str(
            r#"
            [downloader.adaptive]
            small_graph_threshold = 10
            large_graph_sizes = [500, 2000]
            "#,
        )
        .unwrap();
        assert!(c.downloader.adaptive.enabled);
        assert_eq!(c.downloader.adaptive.small_graph_threshold, 10);
        assert_eq!(c.downloader.adaptive.large_graph_sizes, vec![500, 2000]);
        assert!(LoaderConfig::from_toml_str("[downloader.adaptive]\nlarge_graph_sizes = []\n").is_err());
        assert!(LoaderConfig::from_toml_str("[downloader]\nmax_concurrent_batches = 100000\n").is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = LoaderConfig::from_toml_str("[downloader]\nmax_concurrent_batches = 0\n").unwrap_err();
        assert!(matches!(err, LoadError::Config(_)));
        assert!(LoaderConfig::from_toml_str("cache = 3").is_err());
    }

    #[test]
    fn toml_round_trip_and_file_load() {
        let mut c = LoaderConfig::default();
        c.deferment.timeout_ms = 5_000;
        let text = c.to_toml_string().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("objloader.toml");
        std::fs::write(&path, text).unwrap();
        assert_eq!(LoaderConfig::load(&path).unwrap(), c);
        assert!(matches!(
            LoaderConfig::load(dir.path().join("absent.toml")),
            Err(LoadError::Config(_))
        ));
    }
}
