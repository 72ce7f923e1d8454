//! Wire model for the sync mesh
//!
//! Every byte that crosses a transport is a JSON-encoded [`Envelope`]
//! wrapping one of the eight message kinds. The envelope carries the
//! sender's device id, an epoch-millisecond timestamp, and the shared
//! auth token; payloads are strongly typed per kind and dispatched by
//! exhaustive match.

use std::time::{SystemTime, UNIX_EPOCH};

mod errors;
mod message;
mod order;

pub use errors::{decode_envelope, WireError};
pub use message::{
    Envelope, MessageBody, PeerInfo, Role, RosterEntry, SignalPayload, TeamUpdate,
};
pub use order::{OrderRecord, OrderStatus};

use serde::{Deserialize, Serialize};

/// Stable per-device identity, generated once and persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Generate a fresh device identity.
    pub fn generate() -> Self {
        DeviceId(format!("device-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(s.to_string())
    }
}

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
