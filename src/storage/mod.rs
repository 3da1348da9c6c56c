//! Key-value storage and its remote mirror

mod memory;
mod mirror;
mod sqlite_store;

pub use memory::MemoryStore;
pub use mirror::StorageMirror;
pub use sqlite_store::SqliteStore;

use async_trait::async_trait;

/// Async string key-value store inspected by the host
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// All keys, in the store's natural order
    async fn keys(&self) -> anyhow::Result<Vec<String>>;

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;

    async fn remove(&self, key: &str) -> anyhow::Result<()>;

    async fn clear(&self) -> anyhow::Result<()>;
}
