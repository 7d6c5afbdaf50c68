//! Memoization of pure read queries against the sample store.
//!
//! Entries are logically write-once: a key fully describes the computation
//! and its bounds, so a second write for the same key carries the same value.
//! Every read path fails open; a broken cache degrades to direct execution.

mod disk;

pub use disk::DiskCache;

use crate::error::{CacheError, MetricsResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_digest(digest: &[u8]) -> Self {
        use std::fmt::Write;
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(&mut out, "{:02x}", byte);
        }
        Self(out)
    }

    /// Key for entries addressed by raw query text, for operational
    /// invalidation of text-keyed results.
    pub fn from_query_text(query_text: &str) -> Self {
        Self::from_digest(&Sha256::digest(query_text.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub trait ResultCache: Send + Sync {
    fn exists(&self, key: &CacheKey) -> bool;

    /// `Ok(None)` is a cache miss.
    fn read(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError>;

    fn store(&self, key: &CacheKey, value: &[u8]) -> Result<(), CacheError>;

    /// Removing a missing key is not an error.
    fn remove(&self, key: &CacheKey) -> Result<(), CacheError>;
}

/// Always misses and keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCache;

impl ResultCache for NoopCache {
    fn exists(&self, _key: &CacheKey) -> bool {
        false
    }

    fn read(&self, _key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(None)
    }

    fn store(&self, _key: &CacheKey, _value: &[u8]) -> Result<(), CacheError> {
        Ok(())
    }

    fn remove(&self, _key: &CacheKey) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Decoded cached value, or `None` on a miss. Read failures and entries that
/// no longer decode are logged and reported as misses.
pub fn read_cached<T: DeserializeOwned>(cache: &dyn ResultCache, key: &CacheKey) -> Option<T> {
    let bytes = match cache.read(key) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return None,
        Err(err) => {
            tracing::warn!(key = %key, error = %err, "cache read failed; falling back to store");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(key = %key, error = %err, "undecodable cache entry; ignoring it");
            None
        }
    }
}

/// Best-effort write; a failure only costs a recomputation later.
pub fn store_cached<T: Serialize>(cache: &dyn ResultCache, key: &CacheKey, value: &T) {
    let result = serde_json::to_vec(value)
        .map_err(CacheError::from)
        .and_then(|bytes| cache.store(key, &bytes));
    if let Err(err) = result {
        tracing::warn!(key = %key, error = %err, "cache write failed");
    }
}

/// Returns the cached value for `key`, or runs `execute`, caches its result
/// and returns it. Only errors from `execute` reach the caller.
pub async fn cached_query<T, F, Fut>(
    cache: &dyn ResultCache,
    key: &CacheKey,
    execute: F,
) -> MetricsResult<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = MetricsResult<T>>,
{
    if let Some(hit) = read_cached(cache, key) {
        tracing::trace!(key = %key, "cache hit");
        return Ok(hit);
    }
    let value = execute().await?;
    store_cached(cache, key, &value);
    Ok(value)
}
