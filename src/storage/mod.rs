use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::AppResult;

mod sqlite;

pub use sqlite::SqliteStore;

/// Persistent key layout shared by every component.
pub mod keys {
    use crate::model::{Collection, OwnerId};

    pub const CACHE_PREFIX: &str = "cache::";
    pub const QUEUE_ITEMS: &str = "queue::items";
    pub const ALARM_REGISTRY: &str = "alarms::registry";
    pub const CACHED_USER: &str = "auth::cached_user";
    pub const CACHED_OWNER: &str = "auth::cached_owner";
    pub const CREDENTIALS: &str = "auth::credentials";
    pub const RECOVERY: &str = "auth::recovery";
    pub const PENDING_REGISTRATION: &str = "auth::pending_registration";

    pub fn cache(collection: Collection, owner: &OwnerId) -> String {
        format!("{CACHE_PREFIX}{}::{}", collection.as_str(), owner.as_str())
    }

    /// Splits a cache key back into its collection and owner parts.
    pub fn parse_cache(key: &str) -> Option<(Collection, OwnerId)> {
        let rest = key.strip_prefix(CACHE_PREFIX)?;
        let (collection, owner) = rest.split_once("::")?;
        let collection = Collection::parse(collection)?;
        if owner.is_empty() {
            return None;
        }
        Some((collection, OwnerId::new(owner)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Set { key: String, value: String },
    Remove { key: String },
}

impl BatchOp {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        BatchOp::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        BatchOp::Remove { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            BatchOp::Set { key, .. } | BatchOp::Remove { key } => key,
        }
    }
}

/// String-keyed durable storage. `apply_batch` must be all-or-nothing.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> AppResult<()>;
    async fn remove(&self, key: &str) -> AppResult<()>;
    async fn keys_with_prefix(&self, prefix: &str) -> AppResult<Vec<String>>;
    async fn apply_batch(&self, ops: Vec<BatchOp>) -> AppResult<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    /// Every operation leaves the map whole, so a panic elsewhere while the
    /// lock was held must not turn later writes into silent no-ops.
    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> AppResult<()> {
        self.entries().remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> AppResult<Vec<String>> {
        Ok(self
            .entries()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn apply_batch(&self, ops: Vec<BatchOp>) -> AppResult<()> {
        // One lock acquisition covers the whole batch.
        let mut guard = self.entries();
        for op in ops {
            match op {
                BatchOp::Set { key, value } => {
                    guard.insert(key, value);
                }
                BatchOp::Remove { key } => {
                    guard.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// Cheap, cloneable handle every component holds onto the same store.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<dyn KeyValueStore>,
}

impl StoreHandle {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { inner: store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::default()))
    }

    pub fn sqlite(store: SqliteStore) -> Self {
        Self::new(Arc::new(store))
    }

    pub async fn get_raw(&self, key: &str) -> AppResult<Option<String>> {
        self.inner.get(key).await
    }

    pub async fn set_raw(&self, key: &str, value: &str) -> AppResult<()> {
        self.inner.set(key, value).await
    }

    pub async fn remove(&self, key: &str) -> AppResult<()> {
        self.inner.remove(key).await
    }

    pub async fn keys_with_prefix(&self, prefix: &str) -> AppResult<Vec<String>> {
        self.inner.keys_with_prefix(prefix).await
    }

    pub async fn apply_batch(&self, ops: Vec<BatchOp>) -> AppResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.inner.apply_batch(ops).await
    }

    /// Reads and decodes a JSON value. Undecodable data reads as absent.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        let Some(raw) = self.inner.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(
                    target: "dosekeeper",
                    event = "store_value_corrupt",
                    key = %key,
                    error = %err
                );
                Ok(None)
            }
        }
    }

    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> AppResult<()> {
        let raw = serde_json::to_string(value)?;
        self.inner.set(key, &raw).await
    }
}

pub fn json_op<T: Serialize + ?Sized>(key: impl Into<String>, value: &T) -> AppResult<BatchOp> {
    Ok(BatchOp::set(key, serde_json::to_string(value)?))
}
