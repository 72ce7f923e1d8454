//! In-process store shared by same-device sessions

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};

use super::{KvStore, StoreError, StoreEvent};

/// In-memory [`KvStore`] with a change feed.
///
/// Cloning the handle (via `Arc`) shares the underlying map, the way
/// browser tabs share one localStorage; every `set`/`remove` is pushed
/// to all subscribers, including the writer's own subscription (writers
/// that must not see their own traffic filter by sender id upstream).
pub struct MemoryStore {
    map: RwLock<HashMap<String, String>>,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            map: RwLock::new(HashMap::new()),
            events,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.map.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.map
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        // No subscribers is fine; the feed is best-effort.
        let _ = self.events.send(StoreEvent {
            key: key.to_string(),
            value: Some(value.to_string()),
        });
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.map.write().await.remove(key);
        let _ = self.events.send(StoreEvent {
            key: key.to_string(),
            value: None,
        });
        Ok(())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<StoreEvent>> {
        Some(self.events.subscribe())
    }
}
