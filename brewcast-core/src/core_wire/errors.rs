//! Inbound gate shared by all transports

use thiserror::Error;

use super::{DeviceId, Envelope};

/// Reasons an inbound frame never reaches a handler. None of these are
/// surfaced to the application; the frame is dropped and at most logged.
#[derive(Debug, Error, PartialEq)]
pub enum WireError {
    /// Payload is not a well-formed envelope.
    #[error("malformed message: {0}")]
    Format(String),

    /// auth_token did not match the configured shared secret.
    #[error("auth token mismatch")]
    Auth,

    /// sender_id equals the local device id; every transport can echo
    /// our own frames back and they must never be delivered.
    #[error("self-originated message")]
    Loopback,
}

/// Decode and authenticate an inbound frame.
///
/// This is the single choke point between a transport's raw bytes and
/// the rest of the system: bad JSON, a wrong shared secret, and our own
/// echoes are all rejected here, for every message kind.
pub fn decode_envelope(
    bytes: &[u8],
    local_id: &DeviceId,
    shared_secret: &str,
) -> Result<Envelope, WireError> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|e| WireError::Format(e.to_string()))?;

    if envelope.auth_token != shared_secret {
        return Err(WireError::Auth);
    }
    if envelope.sender_id == *local_id {
        return Err(WireError::Loopback);
    }
    Ok(envelope)
}
