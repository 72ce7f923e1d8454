//! Presence protocol
//!
//! Drives the registry from presence traffic. Per remote peer the
//! lifecycle is Unknown → Pending (first Announce/Beacon) → Active
//! (return Announce or any Heartbeat) → Stale → Gone on timeout, or
//! straight to Gone on an explicit Goodbye.
//!
//! This type is pure protocol logic: it mutates the registry and tells
//! the caller what to do (notify joins/leaves, reply with an Announce);
//! the session actor owns the actual sending and event delivery.

use std::time::Duration;

use tracing::{debug, info};

use crate::core_wire::{DeviceId, PeerInfo};
use crate::metrics::{record_counter, record_gauge};

use super::{PeerRecord, PeerRegistry};

/// What the caller must do after feeding a message in.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceAction {
    /// Surface a join notification (and trigger backfill).
    PeerJoined(PeerRecord),
    /// Surface a leave notification.
    PeerLeft(PeerRecord),
    /// Send a fresh Announce so the new arrival learns about us.
    ReplyAnnounce,
}

pub struct Presence {
    registry: PeerRegistry,
}

impl Presence {
    pub fn new(local_id: DeviceId) -> Self {
        Self {
            registry: PeerRegistry::new(local_id),
        }
    }

    /// An Announce registers unknown senders and answers them with our
    /// own Announce; for known senders it only refreshes liveness.
    pub fn handle_announce(&mut self, info: &PeerInfo, now: u64) -> Vec<PresenceAction> {
        if self.registry.upsert(info, now) {
            let record = self
                .registry
                .get(&info.id)
                .cloned()
                .expect("record just inserted");
            info!(peer = %info.id, name = %info.display_name, role = %info.role, "peer joined");
            record_counter("presence.peers.joined", 1);
            self.publish_gauge();
            vec![
                PresenceAction::PeerJoined(record),
                PresenceAction::ReplyAnnounce,
            ]
        } else {
            Vec::new()
        }
    }

    /// A Beacon is a low-fidelity Announce: registers, never replied to.
    pub fn handle_beacon(&mut self, info: &PeerInfo, now: u64) -> Vec<PresenceAction> {
        if self.registry.upsert(info, now) {
            let record = self
                .registry
                .get(&info.id)
                .cloned()
                .expect("record just inserted");
            record_counter("presence.peers.joined", 1);
            self.publish_gauge();
            vec![PresenceAction::PeerJoined(record)]
        } else {
            Vec::new()
        }
    }

    /// A Heartbeat only refreshes liveness; unknown senders are ignored
    /// (no record without a prior Announce/Beacon).
    pub fn handle_heartbeat(&mut self, sender: &DeviceId, now: u64) {
        if !self.registry.touch(sender, now) {
            debug!(peer = %sender, "heartbeat from unknown peer ignored");
        }
    }

    /// A Goodbye removes immediately, however recent the last beat.
    pub fn handle_goodbye(&mut self, sender: &DeviceId) -> Vec<PresenceAction> {
        match self.registry.remove(sender) {
            Some(record) => {
                info!(peer = %sender, name = %record.display_name, "peer said goodbye");
                record_counter("presence.peers.left", 1);
                self.publish_gauge();
                vec![PresenceAction::PeerLeft(record)]
            }
            None => Vec::new(),
        }
    }

    /// Periodic sweep, run on every heartbeat tick.
    pub fn sweep(&mut self, now: u64, timeout: Duration) -> Vec<PresenceAction> {
        let removed = self.registry.sweep_expired(now, timeout);
        if removed.is_empty() {
            return Vec::new();
        }
        record_counter("presence.peers.left", removed.len() as u64);
        self.publish_gauge();
        removed
            .into_iter()
            .map(|record| {
                info!(peer = %record.id, name = %record.display_name, "peer timed out");
                PresenceAction::PeerLeft(record)
            })
            .collect()
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.registry.peers()
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    /// Drop all state on disconnect.
    pub fn clear(&mut self) {
        self.registry.clear();
        self.publish_gauge();
    }

    fn publish_gauge(&self) {
        record_gauge("presence.peers.active", self.registry.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_wire::Role;

    fn info(id: &str) -> PeerInfo {
        PeerInfo {
            id: DeviceId::from(id),
            display_name: id.to_string(),
            role: Role::Barista,
        }
    }

    #[test]
    fn test_first_announce_joins_and_replies() {
        let mut presence = Presence::new(DeviceId::from("local"));
        let actions = presence.handle_announce(&info("d2"), 100);
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[0], PresenceAction::PeerJoined(_)));
        assert_eq!(actions[1], PresenceAction::ReplyAnnounce);
    }

    #[test]
    fn test_repeat_announce_is_quiet() {
        let mut presence = Presence::new(DeviceId::from("local"));
        presence.handle_announce(&info("d2"), 100);
        assert!(presence.handle_announce(&info("d2"), 200).is_empty());
        assert_eq!(presence.peer_count(), 1);
    }

    #[test]
    fn test_beacon_joins_without_reply() {
        let mut presence = Presence::new(DeviceId::from("local"));
        let actions = presence.handle_beacon(&info("d2"), 100);
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], PresenceAction::PeerJoined(_)));
    }

    #[test]
    fn test_goodbye_overrides_recent_heartbeat() {
        let mut presence = Presence::new(DeviceId::from("local"));
        presence.handle_announce(&info("d2"), 100);
        presence.handle_heartbeat(&DeviceId::from("d2"), 101);

        let actions = presence.handle_goodbye(&DeviceId::from("d2"));
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], PresenceAction::PeerLeft(_)));
        assert_eq!(presence.peer_count(), 0);
    }

    #[test]
    fn test_goodbye_from_stranger_is_quiet() {
        let mut presence = Presence::new(DeviceId::from("local"));
        assert!(presence.handle_goodbye(&DeviceId::from("ghost")).is_empty());
    }

    #[test]
    fn test_sweep_emits_leave_for_silent_peers() {
        let mut presence = Presence::new(DeviceId::from("local"));
        presence.handle_announce(&info("d2"), 0);

        // Within the window: nothing.
        assert!(presence.sweep(14_000, Duration::from_secs(15)).is_empty());
        // Past it: one leave.
        let actions = presence.sweep(15_500, Duration::from_secs(15));
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], PresenceAction::PeerLeft(_)));
        assert_eq!(presence.peer_count(), 0);
    }

    #[test]
    fn test_heartbeat_defers_sweep() {
        let mut presence = Presence::new(DeviceId::from("local"));
        presence.handle_announce(&info("d2"), 0);
        presence.handle_heartbeat(&DeviceId::from("d2"), 10_000);
        assert!(presence.sweep(20_000, Duration::from_secs(15)).is_empty());
        assert!(!presence.sweep(30_000, Duration::from_secs(15)).is_empty());
    }
}
