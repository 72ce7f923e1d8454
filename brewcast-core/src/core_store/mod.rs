//! Persisted key-value façade
//!
//! The sync core does not own durable storage; it reads and writes
//! through this façade. [`KvStore`] is the raw keyed interface plus an
//! optional change feed (the storage-key fallback transport needs it),
//! and [`StoreHandle`] layers the typed orders/team/user accessors on
//! top. [`MemoryStore`] is the in-process implementation shared by
//! same-device sessions.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::core_wire::{DeviceId, OrderRecord, Role, RosterEntry};

mod memory;

pub use memory::MemoryStore;

/// Key holding the replicated order log.
pub const KEY_ORDERS: &str = "brewcast_orders";
/// Key holding the team roster.
pub const KEY_TEAM: &str = "brewcast_team";
/// Key holding the local user profile.
pub const KEY_USER: &str = "brewcast_user";
/// Key holding the persistent device id.
pub const KEY_DEVICE_ID: &str = "brewcast_device_id";

/// Orders kept on save; the oldest beyond this are dropped.
pub const MAX_RETAINED_ORDERS: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// A single key change, emitted to change-feed subscribers after the
/// write is visible. `value` is `None` for removals.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub key: String,
    pub value: Option<String>,
}

/// Raw keyed storage. Implementations must be safe to share across
/// sessions on the same device.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Subscribe to key changes. `None` means the backend cannot signal
    /// changes, which rules out the storage-key fallback transport.
    fn subscribe(&self) -> Option<broadcast::Receiver<StoreEvent>> {
        None
    }
}

/// Locally persisted user profile (who is signed in on this device).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub display_name: String,
    pub role: Role,
}

/// Typed accessors over a shared [`KvStore`].
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<dyn KvStore>,
}

impl StoreHandle {
    pub fn new(inner: Arc<dyn KvStore>) -> Self {
        Self { inner }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.get(key).await
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.inner.set(key, value).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key).await
    }

    pub fn subscribe(&self) -> Option<broadcast::Receiver<StoreEvent>> {
        self.inner.subscribe()
    }

    pub async fn orders(&self) -> Result<Vec<OrderRecord>, StoreError> {
        match self.inner.get(KEY_ORDERS).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Persist the order log, keeping only the newest
    /// [`MAX_RETAINED_ORDERS`] entries (the log is newest-first).
    pub async fn save_orders(&self, orders: &[OrderRecord]) -> Result<(), StoreError> {
        let capped = if orders.len() > MAX_RETAINED_ORDERS {
            &orders[..MAX_RETAINED_ORDERS]
        } else {
            orders
        };
        let raw = serde_json::to_string(capped)?;
        self.inner.set(KEY_ORDERS, &raw).await
    }

    /// Drop the persisted order log entirely (manager clear-history).
    pub async fn clear_orders(&self) -> Result<(), StoreError> {
        self.inner.remove(KEY_ORDERS).await
    }

    pub async fn team(&self) -> Result<Vec<RosterEntry>, StoreError> {
        match self.inner.get(KEY_TEAM).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn save_team(&self, roster: &[RosterEntry]) -> Result<(), StoreError> {
        let raw = serde_json::to_string(roster)?;
        self.inner.set(KEY_TEAM, &raw).await
    }

    pub async fn user(&self) -> Result<Option<UserProfile>, StoreError> {
        match self.inner.get(KEY_USER).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn save_user(&self, profile: &UserProfile) -> Result<(), StoreError> {
        let raw = serde_json::to_string(profile)?;
        self.inner.set(KEY_USER, &raw).await
    }

    /// Fetch the persistent device id, minting and storing one on first
    /// use so the id is stable across restarts.
    pub async fn device_id(&self) -> Result<DeviceId, StoreError> {
        if let Some(raw) = self.inner.get(KEY_DEVICE_ID).await? {
            return Ok(DeviceId(raw));
        }
        let id = DeviceId::generate();
        self.inner.set(KEY_DEVICE_ID, id.as_str()).await?;
        Ok(id)
    }
}
