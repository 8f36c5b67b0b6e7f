//! Ingestion tunables and their cache

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{IngestError, Result};
use crate::store::ConfigStore;

/// Key of the single logical config row
pub const DEFAULT_CONFIG_KEY: &str = "default";

/// Tunables for talking to the external source, persisted in the config store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    /// Source endpoint, queried as `{base_url}?results={n}`
    pub base_url: String,

    /// Rate window limit, and the batch stride between inter-window pauses
    pub requests_per_second: u32,

    /// Inter-window pause in milliseconds
    pub sleep_time: u64,

    /// Records per batch
    pub batch_size: u32,

    /// Inter-batch pause in milliseconds
    pub batch_sleep: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://randomuser.me/api/".to_string(),
            requests_per_second: 5,
            sleep_time: 30_000,
            batch_size: 300,
            batch_sleep: 5_000,
        }
    }
}

impl ApiConfig {
    pub fn sleep_time(&self) -> Duration {
        Duration::from_millis(self.sleep_time)
    }

    pub fn batch_sleep(&self) -> Duration {
        Duration::from_millis(self.batch_sleep)
    }
}

/// Partial update of [`ApiConfig`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfigPatch {
    pub base_url: Option<String>,
    pub requests_per_second: Option<u32>,
    pub sleep_time: Option<u64>,
    pub batch_size: Option<u32>,
    pub batch_sleep: Option<u64>,
}

impl ApiConfigPatch {
    /// Check every present field against its allowed range
    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.base_url {
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| IngestError::config(format!("baseUrl '{url}' is not a valid URL: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(IngestError::config(format!("baseUrl '{url}' must use http or https")));
            }
        }
        check_range("requestsPerSecond", self.requests_per_second.map(u64::from), 1, 10)?;
        check_range("sleepTime", self.sleep_time, 1_000, 60_000)?;
        check_range("batchSize", self.batch_size.map(u64::from), 1, 1_000)?;
        check_range("batchSleep", self.batch_sleep, 1_000, 60_000)?;
        Ok(())
    }

    /// Overlay the present fields onto `base`
    pub fn apply(&self, base: ApiConfig) -> ApiConfig {
        ApiConfig {
            base_url: self.base_url.clone().unwrap_or(base.base_url),
            requests_per_second: self.requests_per_second.unwrap_or(base.requests_per_second),
            sleep_time: self.sleep_time.unwrap_or(base.sleep_time),
            batch_size: self.batch_size.unwrap_or(base.batch_size),
            batch_sleep: self.batch_sleep.unwrap_or(base.batch_sleep),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn check_range(field: &str, value: Option<u64>, min: u64, max: u64) -> Result<()> {
    match value {
        Some(v) if v < min || v > max => {
            Err(IngestError::config(format!("{field} must be between {min} and {max}, got {v}")))
        }
        _ => Ok(()),
    }
}

/// Lazily loaded, explicitly invalidated copy of the persisted [`ApiConfig`].
///
/// `get` loads from the store on first use (creating the default row if it
/// is missing) and then serves the cached value until `invalidate` is called.
/// `update` is the only writer.
pub struct ConfigCache {
    store: Arc<dyn ConfigStore>,
    key: String,
    cached: RwLock<Option<ApiConfig>>,
}

impl ConfigCache {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self::with_key(store, DEFAULT_CONFIG_KEY)
    }

    pub fn with_key(store: Arc<dyn ConfigStore>, key: impl Into<String>) -> Self {
        Self { store, key: key.into(), cached: RwLock::new(None) }
    }

    /// Current config, reloading from the store if the cache is empty
    pub async fn get(&self) -> Result<ApiConfig> {
        if let Some(config) = self.cached.read().await.as_ref() {
            return Ok(config.clone());
        }

        let mut cached = self.cached.write().await;
        if let Some(config) = cached.as_ref() {
            return Ok(config.clone());
        }

        let config = self.load_or_create().await?;
        *cached = Some(config.clone());
        Ok(config)
    }

    /// Drop the cached value so the next `get` reloads
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
        debug!(key = %self.key, "config cache invalidated");
    }

    /// Whether a value is currently cached
    pub async fn is_cached(&self) -> bool {
        self.cached.read().await.is_some()
    }

    /// Merge `patch` onto the persisted config, store it and invalidate the cache
    pub async fn update(&self, patch: &ApiConfigPatch) -> Result<ApiConfig> {
        patch.validate()?;

        let current = self.load_or_create().await?;
        let merged = patch.apply(current);
        self.store.upsert(&self.key, &merged).await?;
        self.invalidate().await;

        info!(key = %self.key, config = ?merged, "ingestion config updated");
        Ok(merged)
    }

    async fn load_or_create(&self) -> Result<ApiConfig> {
        if let Some(config) = self.store.find_by_key(&self.key).await? {
            return Ok(config);
        }

        let defaults = ApiConfig::default();
        if let Some(created) = self.store.create(&self.key, &defaults).await? {
            info!(key = %self.key, "created default ingestion config");
            return Ok(created);
        }

        // Lost the race against a concurrent creator; their row wins.
        self.store
            .find_by_key(&self.key)
            .await?
            .ok_or_else(|| IngestError::config(format!("config '{}' vanished after creation", self.key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryConfigStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts reads so cache hits are observable
    struct CountingStore {
        inner: InMemoryConfigStore,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl ConfigStore for CountingStore {
        async fn find_by_key(&self, key: &str) -> Result<Option<ApiConfig>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.find_by_key(key).await
        }

        async fn create(&self, key: &str, config: &ApiConfig) -> Result<Option<ApiConfig>> {
            self.inner.create(key, config).await
        }

        async fn upsert(&self, key: &str, config: &ApiConfig) -> Result<()> {
            self.inner.upsert(key, config).await
        }
    }

    /// Simulates another process inserting the default row first
    struct RacingStore {
        inner: InMemoryConfigStore,
    }

    #[async_trait]
    impl ConfigStore for RacingStore {
        async fn find_by_key(&self, key: &str) -> Result<Option<ApiConfig>> {
            self.inner.find_by_key(key).await
        }

        async fn create(&self, key: &str, _config: &ApiConfig) -> Result<Option<ApiConfig>> {
            let theirs = ApiConfig { batch_size: 42, ..ApiConfig::default() };
            self.inner.upsert(key, &theirs).await?;
            Ok(None)
        }

        async fn upsert(&self, key: &str, config: &ApiConfig) -> Result<()> {
            self.inner.upsert(key, config).await
        }
    }

    #[tokio::test]
    async fn test_get_creates_defaults_when_missing() {
        let store = Arc::new(InMemoryConfigStore::new());
        let cache = ConfigCache::new(store.clone());

        let config = cache.get().await.unwrap();

        assert_eq!(config, ApiConfig::default());
        assert_eq!(store.find_by_key(DEFAULT_CONFIG_KEY).await.unwrap(), Some(ApiConfig::default()));
    }

    #[tokio::test]
    async fn test_get_serves_from_cache_until_invalidated() {
        let store = Arc::new(CountingStore { inner: InMemoryConfigStore::new(), reads: AtomicUsize::new(0) });
        let cache = ConfigCache::new(store.clone());

        cache.get().await.unwrap();
        let after_first = store.reads.load(Ordering::SeqCst);
        cache.get().await.unwrap();
        cache.get().await.unwrap();
        assert_eq!(store.reads.load(Ordering::SeqCst), after_first);

        cache.invalidate().await;
        assert!(!cache.is_cached().await);
        cache.get().await.unwrap();
        assert_eq!(store.reads.load(Ordering::SeqCst), after_first + 1);
    }

    #[tokio::test]
    async fn test_update_merges_and_forces_reload() {
        let store = Arc::new(InMemoryConfigStore::new());
        let cache = ConfigCache::new(store.clone());
        cache.get().await.unwrap();

        let patch = ApiConfigPatch { batch_size: Some(100), ..Default::default() };
        let merged = cache.update(&patch).await.unwrap();

        assert_eq!(merged.batch_size, 100);
        assert_eq!(merged.requests_per_second, 5);
        assert!(!cache.is_cached().await);
        assert_eq!(cache.get().await.unwrap().batch_size, 100);
    }

    #[tokio::test]
    async fn test_update_on_empty_store_keeps_defaults_for_other_fields() {
        let store = Arc::new(InMemoryConfigStore::new());
        let cache = ConfigCache::new(store.clone());

        let patch = ApiConfigPatch { requests_per_second: Some(2), ..Default::default() };
        cache.update(&patch).await.unwrap();

        let stored = store.find_by_key(DEFAULT_CONFIG_KEY).await.unwrap().unwrap();
        assert_eq!(stored, ApiConfig { requests_per_second: 2, ..ApiConfig::default() });
    }

    #[tokio::test]
    async fn test_concurrent_creator_wins() {
        let store = Arc::new(RacingStore { inner: InMemoryConfigStore::new() });
        let cache = ConfigCache::new(store);

        assert_eq!(cache.get().await.unwrap().batch_size, 42);
    }

    #[tokio::test]
    async fn test_update_rejects_out_of_range_values() {
        let store = Arc::new(InMemoryConfigStore::new());
        let cache = ConfigCache::new(store.clone());

        let patch = ApiConfigPatch { batch_size: Some(5_000), ..Default::default() };
        let err = cache.update(&patch).await.unwrap_err();

        assert!(matches!(err, IngestError::Config(_)));
        assert!(store.find_by_key(DEFAULT_CONFIG_KEY).await.unwrap().is_none());
    }

    #[test]
    fn test_patch_validation() {
        assert!(ApiConfigPatch::default().validate().is_ok());
        assert!(ApiConfigPatch::default().is_empty());

        let ok = ApiConfigPatch {
            base_url: Some("https://example.com/api/".into()),
            requests_per_second: Some(10),
            sleep_time: Some(1_000),
            batch_size: Some(1),
            batch_sleep: Some(60_000),
        };
        assert!(ok.validate().is_ok());

        let bad_url = ApiConfigPatch { base_url: Some("not a url".into()), ..Default::default() };
        assert!(bad_url.validate().is_err());

        let bad_scheme = ApiConfigPatch { base_url: Some("ftp://example.com".into()), ..Default::default() };
        assert!(bad_scheme.validate().is_err());

        let bad_rps = ApiConfigPatch { requests_per_second: Some(0), ..Default::default() };
        assert!(bad_rps.validate().is_err());

        let bad_sleep = ApiConfigPatch { batch_sleep: Some(999), ..Default::default() };
        assert!(bad_sleep.validate().is_err());
    }

    #[test]
    fn test_config_durations() {
        let config = ApiConfig::default();
        assert_eq!(config.sleep_time(), Duration::from_secs(30));
        assert_eq!(config.batch_sleep(), Duration::from_secs(5));
    }
}
