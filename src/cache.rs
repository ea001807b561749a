//! TTL cache of parsed directory listings.
//!
//! Sits in front of every getattr/readdir; one entry per remote directory.
//! Mutating operations invalidate the affected directories so the next
//! lookup refetches.

use std::sync::Arc;
use std::time::Duration;

use crate::stat::RemoteStat;

/// Parsed listing of one directory.
pub type DirListing = Arc<Vec<RemoteStat>>;

/// Directory-listing cache keyed by VFS directory path.
pub struct DirCache {
    inner: Option<moka::sync::Cache<String, DirListing>>,
}

impl std::fmt::Debug for DirCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirCache")
            .field("enabled", &self.inner.is_some())
            .finish()
    }
}

impl DirCache {
    /// A cache holding entries for `ttl`; disabled entirely when `enabled`
    /// is false (every lookup then goes to the server).
    pub fn new(enabled: bool, ttl: Duration) -> Self {
        let inner = if enabled && !ttl.is_zero() {
            Some(
                moka::sync::Cache::builder()
                    .max_capacity(10_000)
                    .time_to_live(ttl)
                    .build(),
            )
        } else {
            None
        };
        DirCache { inner }
    }

    /// Cached listing for `dir`, if still fresh.
    pub fn get(&self, dir: &str) -> Option<DirListing> {
        self.inner.as_ref()?.get(dir)
    }

    /// Store a freshly fetched listing.
    pub fn insert(&self, dir: &str, listing: DirListing) {
        if let Some(cache) = &self.inner {
            cache.insert(dir.to_string(), listing);
        }
    }

    /// Drop the listing for `dir`.
    pub fn invalidate(&self, dir: &str) {
        if let Some(cache) = &self.inner {
            cache.invalidate(dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stat::RemoteStat;

    fn listing(names: &[&str]) -> DirListing {
        Arc::new(
            names
                .iter()
                .map(|n| RemoteStat::directory_placeholder(n))
                .collect(),
        )
    }

    #[test]
    fn round_trips_entries() {
        let cache = DirCache::new(true, Duration::from_secs(60));
        cache.insert("/pub", listing(&["a", "b"]));
        let got = cache.get("/pub").unwrap();
        assert_eq!(got.len(), 2);
        assert!(cache.get("/other").is_none());
    }

    #[test]
    fn invalidation_evicts() {
        let cache = DirCache::new(true, Duration::from_secs(60));
        cache.insert("/pub", listing(&["a"]));
        cache.invalidate("/pub");
        assert!(cache.get("/pub").is_none());
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let cache = DirCache::new(false, Duration::from_secs(60));
        cache.insert("/pub", listing(&["a"]));
        assert!(cache.get("/pub").is_none());
    }

    #[test]
    fn zero_ttl_disables() {
        let cache = DirCache::new(true, Duration::ZERO);
        cache.insert("/pub", listing(&["a"]));
        assert!(cache.get("/pub").is_none());
    }
}
