//! In-process [`StateStore`] for tests and single-instance deployments.

use crate::error::{Error, Result};
use crate::store::StateStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Default)]
pub struct MemoryStateStore {
    entries: Arc<Mutex<HashMap<String, (String, Instant)>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let mut entries = self.lock()?;
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(before - entries.len())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        // abandoned requests and codes are never consumed, so writes evict them
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(key.to_string(), (value, now + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.lock()?;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn consume(&self, key: &str) -> Result<Option<String>> {
        // removal happens under the lock, so only one caller can see the value
        let removed = self.lock()?.remove(key);
        Ok(removed
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_evicts_expired_entries() {
        let store = MemoryStateStore::new();
        for i in 0..100 {
            store
                .put(&format!("auth_request:{i}"), "{}".to_string(), Duration::from_millis(1))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("auth_request:0").await.unwrap(), None);
        assert_eq!(store.lock().unwrap().len(), 100);

        store
            .put("auth_request:fresh", "{}".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.lock().unwrap().len(), 1);
        assert!(store.get("auth_request:fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let store = MemoryStateStore::new();
        store
            .put("k", "v".to_string(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.consume("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let store = MemoryStateStore::new();
        store
            .put("short", "a".to_string(), Duration::from_millis(10))
            .await
            .unwrap();
        store
            .put("long", "b".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.get("long").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn concurrent_consume_has_one_winner() {
        let store = MemoryStateStore::new();
        store
            .put("code", "secret".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.consume("code").await }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
