//! On-disk key→value cache with a freshness TTL
//!
//! One JSON file per key holding `{stored_at, value}`. Reads of a missing,
//! stale or unreadable entry are a miss; writes are last-writer-wins.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::EngineResult;
use crate::sources::{FetchOutcome, Source};

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    stored_at: DateTime<Utc>,
    value: T,
}

#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
    ttl: Duration,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self { dir: dir.into(), ttl }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }

    /// Fresh value for `key`, if any
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_at(key, Utc::now())
    }

    pub fn get_at<T: DeserializeOwned>(&self, key: &str, now: DateTime<Utc>) -> Option<T> {
        let path = self.path_for(key);
        let text = fs::read_to_string(&path).ok()?;
        let envelope: Envelope<T> = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable cache entry, ignoring");
                return None;
            }
        };
        if now - envelope.stored_at > self.ttl {
            debug!(key, "Cache entry stale");
            return None;
        }
        Some(envelope.value)
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> EngineResult<()> {
        self.put_at(key, value, Utc::now())
    }

    pub fn put_at<T: Serialize>(&self, key: &str, value: &T, stored_at: DateTime<Utc>) -> EngineResult<()> {
        fs::create_dir_all(&self.dir)?;
        let text = serde_json::to_string(&Envelope { stored_at, value })?;
        fs::write(self.path_for(key), text)?;
        Ok(())
    }
}

/// Read-before-fetch wrapper around a [`Source`]. Only successful fetches
/// are written back.
pub struct CachedSource<S> {
    inner: S,
    cache: FileCache,
    key: String,
}

impl<S> CachedSource<S> {
    pub fn new(inner: S, cache: FileCache, key: impl Into<String>) -> Self {
        Self {
            inner,
            cache,
            key: key.into(),
        }
    }
}

#[async_trait]
impl<T, S> Source<T> for CachedSource<S>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    S: Source<T>,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch(&self, target: NaiveDate) -> FetchOutcome<T> {
        if let Some(value) = self.cache.get::<T>(&self.key) {
            debug!(key = %self.key, "Cache hit");
            return FetchOutcome::Success(value);
        }
        let outcome = self.inner.fetch(target).await;
        if let FetchOutcome::Success(value) = &outcome {
            if let Err(e) = self.cache.put(&self.key, value) {
                warn!(key = %self.key, error = %e, "Failed to write cache entry");
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_fresh_and_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileCache::new(tmp.path(), Duration::hours(48));
        let now = Utc::now();

        cache.put_at("2330.TW_6mo", &vec![1.0, 2.0], now - Duration::hours(47)).unwrap();
        assert_eq!(cache.get_at::<Vec<f64>>("2330.TW_6mo", now), Some(vec![1.0, 2.0]));

        cache.put_at("2330.TW_6mo", &vec![1.0], now - Duration::hours(49)).unwrap();
        assert_eq!(cache.get_at::<Vec<f64>>("2330.TW_6mo", now), None);
    }

    #[test]
    fn test_missing_and_corrupt_entries_are_misses() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileCache::new(tmp.path(), Duration::hours(1));
        assert_eq!(cache.get::<u32>("nothing"), None);

        std::fs::write(tmp.path().join("bad.json"), "{not json").unwrap();
        assert_eq!(cache.get::<u32>("bad"), None);
    }

    struct Counting {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Source<HashMap<String, f64>> for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        async fn fetch(&self, _target: NaiveDate) -> FetchOutcome<HashMap<String, f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            FetchOutcome::Success(HashMap::from([("2330".to_string(), 2.5e10)]))
        }
    }

    #[tokio::test]
    async fn test_cached_source_fetches_once() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileCache::new(tmp.path(), Duration::hours(72));
        let source = CachedSource::new(Counting { calls: AtomicU32::new(0) }, cache, "shares");
        let day = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();

        let first = source.fetch(day).await.success().unwrap();
        let second = source.fetch(day).await.success().unwrap();
        assert_eq!(first, second);
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 1);
    }
}
