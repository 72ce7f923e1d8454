//! Storage-key fallback transport
//!
//! Lower-fidelity path used when no broadcast bus is available: each
//! frame is written to a single shared persisted key, other sessions
//! pick it up from the store's change feed, and the key is cleared
//! shortly after. A frame superseded before its clear delay elapses is
//! lost; that is an accepted property of the fallback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::core_store::StoreHandle;
use crate::core_wire::{DeviceId, Envelope};
use crate::metrics::record_counter;

use super::{gate_inbound, LinkState, Transport, TransportError};

/// Shared key every fallback frame round-trips through.
pub const FALLBACK_KEY: &str = "brewcast_broadcast";

pub struct StorageKeyTransport {
    store: StoreHandle,
    clear_delay: Duration,
    incoming: StdMutex<Option<mpsc::Receiver<Envelope>>>,
    state: watch::Sender<LinkState>,
    closed: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl StorageKeyTransport {
    /// Attach to the store's change feed. Fails with `Unavailable` when
    /// the backend cannot signal changes.
    pub fn attach(
        store: StoreHandle,
        local_id: DeviceId,
        shared_secret: String,
        clear_delay: Duration,
        capacity: usize,
    ) -> Result<Self, TransportError> {
        let mut events = store.subscribe().ok_or(TransportError::Unavailable)?;
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (state, _) = watch::channel(LinkState::Open);

        let pump = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        // Only writes to the shared key carry frames;
                        // the clearing removal is not a message.
                        if event.key != FALLBACK_KEY {
                            continue;
                        }
                        let Some(raw) = event.value else { continue };
                        if let Some(envelope) =
                            gate_inbound(raw.as_bytes(), &local_id, &shared_secret, "storage-key")
                        {
                            if inbound_tx.send(envelope).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "storage-key pump lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Self {
            store,
            clear_delay,
            incoming: StdMutex::new(Some(inbound_rx)),
            state,
            closed: Arc::new(AtomicBool::new(false)),
            pump,
        })
    }
}

#[async_trait]
impl Transport for StorageKeyTransport {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            debug!(kind = envelope.body.kind(), "send after close ignored");
            return Ok(());
        }
        let bytes = envelope
            .to_bytes()
            .map_err(|e| TransportError::Send(e.to_string()))?;
        let raw = String::from_utf8(bytes).map_err(|e| TransportError::Send(e.to_string()))?;

        self.store.set(FALLBACK_KEY, &raw).await?;
        record_counter("sync.messages.sent", 1);

        // Clear the key so the next frame produces a fresh change event.
        let store = self.store.clone();
        let delay = self.clear_delay;
        let closed = self.closed.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !closed.load(Ordering::SeqCst) {
                let _ = store.remove(FALLBACK_KEY).await;
            }
        });

        Ok(())
    }

    fn take_incoming(&self) -> Result<mpsc::Receiver<Envelope>, TransportError> {
        self.incoming
            .lock()
            .expect("incoming slot poisoned")
            .take()
            .ok_or(TransportError::ReceiverTaken)
    }

    fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pump.abort();
        self.state.send_replace(LinkState::Closed);
    }

    fn name(&self) -> &'static str {
        "storage-key"
    }
}

impl Drop for StorageKeyTransport {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_store::MemoryStore;
    use crate::core_wire::{now_ms, MessageBody};

    fn pair(
        store: &StoreHandle,
        delay_ms: u64,
    ) -> (StorageKeyTransport, StorageKeyTransport) {
        let a = StorageKeyTransport::attach(
            store.clone(),
            DeviceId::from("d1"),
            "s".into(),
            Duration::from_millis(delay_ms),
            16,
        )
        .unwrap();
        let b = StorageKeyTransport::attach(
            store.clone(),
            DeviceId::from("d2"),
            "s".into(),
            Duration::from_millis(delay_ms),
            16,
        )
        .unwrap();
        (a, b)
    }

    fn heartbeat(id: &str) -> Envelope {
        Envelope::new(
            MessageBody::Heartbeat,
            DeviceId::from(id),
            "s".to_string(),
            now_ms(),
        )
    }

    #[tokio::test]
    async fn test_round_trip_through_shared_key() {
        let store = StoreHandle::new(Arc::new(MemoryStore::new()));
        let (a, b) = pair(&store, 10);
        let mut rx_b = b.take_incoming().unwrap();

        a.send(&heartbeat("d1")).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.sender_id, DeviceId::from("d1"));
    }

    #[tokio::test]
    async fn test_key_cleared_after_delay() {
        let store = StoreHandle::new(Arc::new(MemoryStore::new()));
        let (a, _b) = pair(&store, 10);

        a.send(&heartbeat("d1")).await.unwrap();
        assert!(store.get(FALLBACK_KEY).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.get(FALLBACK_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clearing_removal_is_not_redelivered() {
        let store = StoreHandle::new(Arc::new(MemoryStore::new()));
        let (a, b) = pair(&store, 5);
        let mut rx_b = b.take_incoming().unwrap();

        a.send(&heartbeat("d1")).await.unwrap();
        assert!(rx_b.recv().await.is_some());

        // After the clear fires, no second delivery shows up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let extra = tokio::time::timeout(Duration::from_millis(50), rx_b.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_unrelated_keys_ignored() {
        let store = StoreHandle::new(Arc::new(MemoryStore::new()));
        let (_a, b) = pair(&store, 10);
        let mut rx_b = b.take_incoming().unwrap();

        store.set("brewcast_user", "{}").await.unwrap();
        let got = tokio::time::timeout(Duration::from_millis(50), rx_b.recv()).await;
        assert!(got.is_err());
    }
}
