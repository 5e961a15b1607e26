//! Key-value cache.
//!
//! Entries are opaque bytes with an optional TTL. The HTTP response cache is
//! the main consumer; writes there are best effort.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryKv;

#[derive(Debug, Clone, Error)]
pub enum KvError {
    #[error("key-value backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Store `value`; `None` keeps it until deleted.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Delete every key starting with `prefix`. Returns how many went.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, KvError>;
}
