//! Peer registry — pure state, no I/O

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core_wire::{DeviceId, PeerInfo, Role};

/// Liveness state of a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// First Announce/Beacon seen, not yet confirmed.
    Pending,
    /// Confirmed via a return Announce or a subsequent Heartbeat.
    Active,
    /// Missed heartbeats, not yet timed out.
    Stale,
    /// Removed — explicit Goodbye or timeout.
    Gone,
}

/// Last-known state of one remote peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: DeviceId,
    pub display_name: String,
    pub role: Role,
    /// Epoch milliseconds of the last Announce/Beacon/Heartbeat.
    pub last_seen_at: u64,
    pub state: PeerState,
}

/// Map of peer identity to liveness; owned exclusively by the presence
/// protocol. The local device id is never a key. Callers are
/// responsible for notifying listeners about anything returned here.
#[derive(Debug)]
pub struct PeerRegistry {
    local_id: DeviceId,
    peers: HashMap<DeviceId, PeerRecord>,
}

impl PeerRegistry {
    pub fn new(local_id: DeviceId) -> Self {
        Self {
            local_id,
            peers: HashMap::new(),
        }
    }

    /// Insert or refresh a peer from announced identity. Returns true
    /// when the peer was previously unknown. The local id is ignored.
    pub fn upsert(&mut self, info: &PeerInfo, now: u64) -> bool {
        if info.id == self.local_id {
            return false;
        }
        match self.peers.get_mut(&info.id) {
            Some(record) => {
                record.display_name = info.display_name.clone();
                record.role = info.role;
                record.last_seen_at = now;
                record.state = PeerState::Active;
                false
            }
            None => {
                self.peers.insert(
                    info.id.clone(),
                    PeerRecord {
                        id: info.id.clone(),
                        display_name: info.display_name.clone(),
                        role: info.role,
                        last_seen_at: now,
                        state: PeerState::Pending,
                    },
                );
                true
            }
        }
    }

    /// Refresh the liveness timestamp. Returns false for unknown peers.
    pub fn touch(&mut self, id: &DeviceId, now: u64) -> bool {
        match self.peers.get_mut(id) {
            Some(record) => {
                record.last_seen_at = now;
                record.state = PeerState::Active;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &DeviceId) -> Option<PeerRecord> {
        self.peers.remove(id).map(|mut record| {
            record.state = PeerState::Gone;
            record
        })
    }

    /// Remove every peer silent for longer than `timeout` and mark the
    /// ones approaching it as Stale. Returns the removed records.
    pub fn sweep_expired(&mut self, now: u64, timeout: Duration) -> Vec<PeerRecord> {
        let timeout_ms = timeout.as_millis() as u64;
        // Stale once two thirds of the window has passed in silence.
        let stale_ms = timeout_ms.saturating_mul(2) / 3;

        let expired: Vec<DeviceId> = self
            .peers
            .iter()
            .filter(|(_, r)| now.saturating_sub(r.last_seen_at) > timeout_ms)
            .map(|(id, _)| id.clone())
            .collect();

        for record in self.peers.values_mut() {
            if now.saturating_sub(record.last_seen_at) > stale_ms {
                record.state = PeerState::Stale;
            }
        }

        expired
            .iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    pub fn get(&self, id: &DeviceId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.peers.contains_key(id)
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
