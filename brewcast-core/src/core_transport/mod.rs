//! Transports carrying envelopes between peers
//!
//! One contract, three implementations:
//! - [`BroadcastTransport`] — in-process bus, ordered and lossless,
//!   for same-device sessions (the primary path);
//! - [`StorageKeyTransport`] — lower-fidelity fallback that round-trips
//!   frames through a shared persisted key with an immediate clear;
//! - [`DataChannelTransport`] — point-to-point reliable-ordered TCP
//!   channel per peer pair, established out-of-band via signaling
//!   tokens.
//!
//! `send` is fire-and-forget: success means the frame was enqueued
//! locally, never that anyone received it. Each transport runs its own
//! inbound pump which applies the wire gate (auth, format, loopback)
//! before anything reaches the session, so the receiver handed out by
//! `take_incoming` only ever yields verified envelopes.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::core_store::{StoreError, StoreHandle};
use crate::core_wire::{decode_envelope, DeviceId, Envelope, WireError};
use crate::metrics::record_counter;

mod broadcast;
mod data_channel;
mod storage_key;

pub use broadcast::{BroadcastBus, BroadcastTransport};
pub use data_channel::DataChannelTransport;
pub use storage_key::{StorageKeyTransport, FALLBACK_KEY};

/// Lifecycle of a transport link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// Point-to-point channel is not in the open state; send fails fast.
    #[error("data channel is not open")]
    ChannelNotOpen,

    /// The inbound receiver was already taken; one handler per instance.
    #[error("inbound receiver already taken")]
    ReceiverTaken,

    /// No transport primitive is available on this device.
    #[error("no usable transport primitive available")]
    Unavailable,

    /// Bad signaling token handed to connection setup.
    #[error("invalid signaling exchange: {0}")]
    Signal(String),

    /// Local enqueue failed.
    #[error("send failed: {0}")]
    Send(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Best-effort message carrier between peers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Enqueue an envelope to all reachable peers. The result reflects
    /// the local enqueue only. After `close`, sends are silent no-ops.
    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Take the verified-inbound receiver. At most one per instance.
    fn take_incoming(&self) -> Result<mpsc::Receiver<Envelope>, TransportError>;

    /// Observe link lifecycle transitions.
    fn watch_state(&self) -> watch::Receiver<LinkState>;

    /// Release underlying resources.
    async fn close(&self);

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Run an inbound frame through the wire gate, counting the outcome.
/// Returns `None` for anything that must not reach a handler.
pub(crate) fn gate_inbound(
    bytes: &[u8],
    local_id: &DeviceId,
    shared_secret: &str,
    transport: &'static str,
) -> Option<Envelope> {
    match decode_envelope(bytes, local_id, shared_secret) {
        Ok(envelope) => {
            record_counter("sync.messages.received", 1);
            trace!(
                transport,
                kind = envelope.body.kind(),
                sender = %envelope.sender_id,
                "message received"
            );
            Some(envelope)
        }
        Err(WireError::Auth) => {
            record_counter("sync.messages.dropped.auth", 1);
            debug!(transport, "dropped message with bad auth token");
            None
        }
        Err(WireError::Loopback) => {
            record_counter("sync.messages.dropped.loopback", 1);
            None
        }
        Err(WireError::Format(e)) => {
            record_counter("sync.messages.dropped.format", 1);
            warn!(transport, error = %e, "dropped malformed message");
            None
        }
    }
}

/// Pick the best available same-device transport.
///
/// Prefers the broadcast bus; falls back to the storage-key round-trip
/// when the store exposes a change feed. `Unavailable` means the caller
/// must run local-only and tell the application so.
pub fn select_transport(
    bus: Option<&BroadcastBus>,
    store: &StoreHandle,
    local_id: &DeviceId,
    config: &Config,
) -> Result<Arc<dyn Transport>, TransportError> {
    if let Some(bus) = bus {
        debug!(channel = bus.channel_name(), "using broadcast transport");
        return Ok(Arc::new(BroadcastTransport::attach(
            bus,
            local_id.clone(),
            config.mesh.shared_secret.clone(),
            config.transport.channel_capacity,
        )));
    }

    match StorageKeyTransport::attach(
        store.clone(),
        local_id.clone(),
        config.mesh.shared_secret.clone(),
        config.transport.fallback_clear_delay,
        config.transport.channel_capacity,
    ) {
        Ok(transport) => {
            debug!("broadcast bus unavailable, using storage-key fallback");
            Ok(Arc::new(transport))
        }
        Err(e) => {
            warn!(error = %e, "no transport primitive available");
            Err(TransportError::Unavailable)
        }
    }
}
