//! Key/value capability the presence service is written against.
//!
//! Mirrors the handful of primitives a networked cache offers: set with TTL,
//! plain set, get, delete, batched get, and a cursor scan by key prefix.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

/// One page of a cursor scan. `cursor` is `None` once the scan is complete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: Option<String>,
    pub keys: Vec<String>,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Create or overwrite `key`, expiring after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Create or overwrite `key` with no expiry.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Returns true if the key existed.
    async fn del(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Fetch many keys in one round trip. The result is positionally aligned with `keys`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    /// Return up to `count` live keys starting with `prefix`, after `cursor`.
    /// Keys that expire mid-scan may or may not appear.
    async fn scan(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        count: usize,
    ) -> Result<ScanPage, StoreError>;
}
