//! Envelope and message kinds

use serde::{Deserialize, Serialize};

use super::order::OrderRecord;
use super::DeviceId;

/// Team role attached to a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Cashier,
    Barista,
    Manager,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Cashier => "cashier",
            Role::Barista => "barista",
            Role::Manager => "manager",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "cashier" => Some(Role::Cashier),
            "barista" => Some(Role::Barista),
            "manager" => Some(Role::Manager),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity a device presents in Announce/Beacon messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: DeviceId,
    pub display_name: String,
    pub role: Role,
}

/// One member of the replicated team roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub id: DeviceId,
    pub display_name: String,
    pub role: Role,
    pub joined_at: u64,
    /// Set on the device that first observed/created the team.
    pub is_origin_device: bool,
}

/// Roster mutation. The two semantics are deliberately distinct variants
/// rather than one conflated "team update": a wholesale snapshot replace
/// versus a single-member upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TeamUpdate {
    ReplaceRoster { roster: Vec<RosterEntry> },
    UpsertMember { member: RosterEntry },
}

/// Connection-setup payload carried by Offer/Answer messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalPayload {
    /// Opaque session descriptor; for the TCP data channel this is the
    /// listener address to dial.
    pub sdp: String,
    pub peer_id: DeviceId,
}

/// Closed union over the eight message kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum MessageBody {
    Announce(PeerInfo),
    Beacon(PeerInfo),
    Heartbeat,
    Goodbye,
    Order(OrderRecord),
    OrderUpdate(OrderRecord),
    TeamUpdate(TeamUpdate),
    Offer(SignalPayload),
    Answer(SignalPayload),
}

impl MessageBody {
    /// Stable name of the kind, for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Announce(_) => "announce",
            MessageBody::Beacon(_) => "beacon",
            MessageBody::Heartbeat => "heartbeat",
            MessageBody::Goodbye => "goodbye",
            MessageBody::Order(_) => "order",
            MessageBody::OrderUpdate(_) => "order_update",
            MessageBody::TeamUpdate(_) => "team_update",
            MessageBody::Offer(_) => "offer",
            MessageBody::Answer(_) => "answer",
        }
    }
}

/// Wire envelope wrapping every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub body: MessageBody,
    pub sender_id: DeviceId,
    /// Epoch milliseconds at send time on the sender.
    pub timestamp: u64,
    /// Shared-secret token compared by equality on receipt.
    pub auth_token: String,
}

impl Envelope {
    pub fn new(body: MessageBody, sender_id: DeviceId, auth_token: String, now: u64) -> Self {
        Self {
            body,
            sender_id,
            timestamp: now,
            auth_token,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, super::WireError> {
        serde_json::to_vec(self).map_err(|e| super::WireError::Format(e.to_string()))
    }
}
