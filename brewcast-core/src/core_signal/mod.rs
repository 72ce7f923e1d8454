//! Signaling token codec
//!
//! Pure, side-effect-free encoding of connection offers/answers into
//! opaque scannable tokens (base64 of JSON). The data-channel transport
//! consumes these to establish a channel without a rendezvous server;
//! rendering/scanning the token is outside this crate.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core_wire::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
}

/// Decoded content of a signaling token.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalRecord {
    pub kind: SignalKind,
    /// Opaque session descriptor (for the TCP data channel: the address
    /// the offering side is listening on).
    pub sdp: String,
    pub peer_id: DeviceId,
    pub secret: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum SignalError {
    /// Token is not base64, not JSON, or missing fields.
    #[error("malformed signaling token: {0}")]
    Format(String),

    /// Embedded secret does not match local configuration.
    #[error("signaling token secret mismatch")]
    Auth,
}

/// On-disk/wire shape of the token, kept separate from [`SignalRecord`]
/// so the public type never leaks serde field naming.
#[derive(Serialize, Deserialize)]
struct TokenWire {
    #[serde(rename = "type")]
    kind: SignalKind,
    sdp: String,
    id: String,
    secret: String,
}

/// Encode a signal record into an opaque token.
pub fn encode(record: &SignalRecord) -> String {
    let wire = TokenWire {
        kind: record.kind,
        sdp: record.sdp.clone(),
        id: record.peer_id.0.clone(),
        secret: record.secret.clone(),
    };
    // Serializing a struct of plain strings cannot fail.
    let json = serde_json::to_vec(&wire).unwrap_or_default();
    BASE64.encode(json)
}

/// Decode a token, verifying its embedded secret against ours.
pub fn decode(token: &str, expected_secret: &str) -> Result<SignalRecord, SignalError> {
    let bytes = BASE64
        .decode(token.trim())
        .map_err(|e| SignalError::Format(format!("invalid base64: {}", e)))?;
    let wire: TokenWire =
        serde_json::from_slice(&bytes).map_err(|e| SignalError::Format(format!("invalid token body: {}", e)))?;

    if wire.secret != expected_secret {
        return Err(SignalError::Auth);
    }

    Ok(SignalRecord {
        kind: wire.kind,
        sdp: wire.sdp,
        peer_id: DeviceId(wire.id),
        secret: wire.secret,
    })
}
