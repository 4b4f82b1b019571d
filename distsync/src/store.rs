//! The external durable key-value store the platform assumes underneath it.
//!
//! This is treated as an external collaborator; only its thin `put/get/delete/scan`
//! interface is in scope here. [`InMemoryStore`] is a process-local stand-in good enough to
//! drive the rest of the crate and its tests without standing up a real key-value service.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use async_trait::async_trait;

/// Keys used by the rest of the crate, matching the option table's namespacing convention.
pub mod keys {
    pub fn message(message_id: &str) -> String {
        format!("message:{}", message_id)
    }

    pub fn cache(key: &str) -> String {
        format!("cache:{}", key)
    }

    pub fn raft_log(index: u64) -> String {
        format!("raft:log:{}", index)
    }

    pub const RAFT_META: &str = "raft:meta";

    pub fn message_prefix() -> &'static str {
        "message:"
    }
}

/// The durable store contract every state machine depends on for anything that must survive a
/// restart: produced messages, cached values, and the Raft log itself.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> anyhow::Result<()>;
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
    /// List every non-expired key starting with `prefix`, in no particular order.
    async fn scan(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

/// An in-process, non-persistent [`DurableStore`]. Good for tests and for running a cluster
/// without external dependencies; a real deployment points this crate at an actual key-value
/// service instead.
#[derive(Default)]
pub struct InMemoryStore {
    data: Mutex<BTreeMap<String, Entry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> anyhow::Result<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.data.lock().unwrap().insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let mut data = self.data.lock().unwrap();
        match data.get(key) {
            Some(entry) if entry.expires_at.map(|t| t <= Instant::now()).unwrap_or(false) => {
                data.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let now = Instant::now();
        let data = self.data.lock().unwrap();
        Ok(data
            .iter()
            .filter(|(k, v)| k.starts_with(prefix) && v.expires_at.map(|t| t > now).unwrap_or(true))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let store = InMemoryStore::new();
        store.put("a", b"1".to_vec(), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));
        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_matches_prefix() {
        let store = InMemoryStore::new();
        store.put("message:1", b"x".to_vec(), None).await.unwrap();
        store.put("message:2", b"y".to_vec(), None).await.unwrap();
        store.put("cache:k", b"z".to_vec(), None).await.unwrap();
        let mut found = store.scan("message:").await.unwrap();
        found.sort();
        assert_eq!(found, vec!["message:1".to_string(), "message:2".to_string()]);
    }

    #[tokio::test]
    async fn expired_entry_is_invisible() {
        let store = InMemoryStore::new();
        store.put("a", b"1".to_vec(), Some(Duration::from_millis(1))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("a").await.unwrap(), None);
    }
}
