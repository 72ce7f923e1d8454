//! In-process broadcast bus transport
//!
//! Models same-device tab-to-tab messaging: every session attached to a
//! [`BroadcastBus`] sees every frame, in send order, with no loss. The
//! bus is an explicitly constructed object handed to each session; there
//! are no process-wide singletons.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core_wire::{DeviceId, Envelope};
use crate::metrics::record_counter;

use super::{gate_inbound, LinkState, Transport, TransportError};

const BUS_CAPACITY: usize = 256;

/// Shared in-process message bus, one per device "channel name".
#[derive(Clone)]
pub struct BroadcastBus {
    channel_name: String,
    tx: broadcast::Sender<Vec<u8>>,
}

impl BroadcastBus {
    pub fn new(channel_name: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            channel_name: channel_name.into(),
            tx,
        }
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    fn sender(&self) -> broadcast::Sender<Vec<u8>> {
        self.tx.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.tx.subscribe()
    }
}

/// Transport endpoint attached to a [`BroadcastBus`].
pub struct BroadcastTransport {
    bus_tx: broadcast::Sender<Vec<u8>>,
    incoming: StdMutex<Option<mpsc::Receiver<Envelope>>>,
    state: watch::Sender<LinkState>,
    closed: AtomicBool,
    pump: JoinHandle<()>,
}

impl BroadcastTransport {
    /// Attach a new endpoint to the bus and start its inbound pump.
    pub fn attach(
        bus: &BroadcastBus,
        local_id: DeviceId,
        shared_secret: String,
        capacity: usize,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let mut bus_rx = bus.subscribe();
        let (state, _) = watch::channel(LinkState::Open);

        let pump = tokio::spawn(async move {
            loop {
                match bus_rx.recv().await {
                    Ok(bytes) => {
                        if let Some(envelope) =
                            gate_inbound(&bytes, &local_id, &shared_secret, "broadcast")
                        {
                            if inbound_tx.send(envelope).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "broadcast pump lagged, frames lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self {
            bus_tx: bus.sender(),
            incoming: StdMutex::new(Some(inbound_rx)),
            state,
            closed: AtomicBool::new(false),
            pump,
        }
    }
}

#[async_trait]
impl Transport for BroadcastTransport {
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            debug!(kind = envelope.body.kind(), "send after close ignored");
            return Ok(());
        }
        let bytes = envelope
            .to_bytes()
            .map_err(|e| TransportError::Send(e.to_string()))?;
        // A bus with no live endpoints just means nobody is listening;
        // fire-and-forget semantics make that a success.
        let _ = self.bus_tx.send(bytes);
        record_counter("sync.messages.sent", 1);
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
        "broadcast"
    }
}

impl Drop for BroadcastTransport {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
