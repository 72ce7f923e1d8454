use tracing::{debug, warn};

use crate::core_wire::{DeviceId, OrderRecord, RosterEntry, TeamUpdate};
use crate::metrics::record_counter;

/// What became of an incoming Order.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// New id, inserted at the head of the log.
    Inserted(OrderRecord),
    /// Known id, silently absorbed.
    Duplicate,
}

/// Aggregate view of the order log for the manager dashboard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderStats {
    pub total: usize,
    pub completed: usize,
    /// Mean creation-to-completion latency over completed orders.
    pub avg_completion_ms: u64,
    /// Completed as a share of total, 0-100.
    pub efficiency_pct: u8,
}

/// Order log (newest first) and roster, with the merge rules applied to
/// everything that arrives off the wire.
///
/// Order ids come from a per-device counter, not a global allocator, so
/// two devices that have never synced can mint the same id; the merge
/// treats the late arrival as a duplicate. The engine flags the
/// cross-device case in the logs but keeps the identity semantics.
pub struct ReplicationEngine {
    local_id: DeviceId,
    orders: Vec<OrderRecord>,
    roster: Vec<RosterEntry>,
    next_order_id: u64,
}

impl ReplicationEngine {
    pub fn new(local_id: DeviceId) -> Self {
        Self {
            local_id,
            orders: Vec::new(),
            roster: Vec::new(),
            next_order_id: 1,
        }
    }

    /// Load persisted state and seed the id counter past everything in
    /// it, so a restart never re-mints an id it already handed out.
    pub fn seed(&mut self, orders: Vec<OrderRecord>, roster: Vec<RosterEntry>) {
        self.next_order_id = orders.iter().map(|o| o.id + 1).max().unwrap_or(1);
        self.orders = orders;
        self.roster = roster;
    }

    /// Mint a new local order at the head of the log.
    pub fn create_order(
        &mut self,
        text: impl Into<String>,
        items: Vec<String>,
        created_by: impl Into<String>,
        now: u64,
    ) -> OrderRecord {
        let order = OrderRecord::new(
            self.next_order_id,
            text,
            items,
            created_by,
            self.local_id.clone(),
            now,
        );
        self.next_order_id += 1;
        self.orders.insert(0, order.clone());
        record_counter("sync.orders.created", 1);
        order
    }

    /// Complete a pending order locally. Returns the updated record for
    /// broadcast; `None` when the id is unknown or already Completed.
    pub fn complete_order(
        &mut self,
        id: u64,
        completed_by: impl Into<String>,
        now: u64,
    ) -> Option<OrderRecord> {
        let order = self.orders.iter_mut().find(|o| o.id == id)?;
        if !order.complete(completed_by, now) {
            debug!(order_id = id, "order already completed");
            return None;
        }
        Some(order.clone())
    }

    /// Merge an Order that arrived off the wire.
    pub fn merge_order(&mut self, incoming: OrderRecord) -> MergeOutcome {
        if let Some(existing) = self.orders.iter().find(|o| o.id == incoming.id) {
            if existing.origin != incoming.origin {
                // Two devices minted the same id before their first
                // sync; the later one loses.
                warn!(
                    order_id = incoming.id,
                    kept_origin = %existing.origin,
                    dropped_origin = %incoming.origin,
                    "order id collision across devices, keeping first"
                );
            }
            record_counter("sync.orders.duplicates", 1);
            return MergeOutcome::Duplicate;
        }

        // Advance the counter so the next local order never reuses an
        // id we have already seen.
        if incoming.id >= self.next_order_id {
            self.next_order_id = incoming.id + 1;
        }
        self.orders.insert(0, incoming.clone());
        record_counter("sync.orders.merged", 1);
        MergeOutcome::Inserted(incoming)
    }

    /// Merge an OrderUpdate: overwrite in place by id, last writer wins,
    /// except that a Completed order never reverts to Pending. Updates
    /// for unknown ids are dropped, not errors.
    pub fn merge_update(&mut self, incoming: OrderRecord) -> Option<OrderRecord> {
        let Some(existing) = self.orders.iter_mut().find(|o| o.id == incoming.id) else {
            warn!(order_id = incoming.id, "update for unknown order dropped");
            record_counter("sync.orders.orphan_updates", 1);
            return None;
        };
        if existing.is_completed() && !incoming.is_completed() {
            debug!(order_id = incoming.id, "ignoring update reverting a completed order");
            return None;
        }
        *existing = incoming.clone();
        Some(incoming)
    }

    /// Apply a roster mutation that arrived off the wire. Replicated
    /// entries are taken verbatim, origin flag included; only the local
    /// add path ([`Self::upsert_member`]) ever computes that flag.
    pub fn merge_team_update(&mut self, update: TeamUpdate) -> Vec<RosterEntry> {
        match update {
            TeamUpdate::ReplaceRoster { roster } => self.replace_roster(roster),
            TeamUpdate::UpsertMember { member } => self.merge_member(member),
        }
    }

    pub fn replace_roster(&mut self, roster: Vec<RosterEntry>) -> Vec<RosterEntry> {
        self.roster = roster;
        self.roster.clone()
    }

    /// Add or update a member locally. The origin-device flag is set
    /// here and only here: the first member of a roster founded it.
    pub fn upsert_member(&mut self, mut member: RosterEntry) -> Vec<RosterEntry> {
        match self.roster.iter_mut().find(|m| m.id == member.id) {
            Some(existing) => {
                // Origin status is decided once, at first join.
                member.is_origin_device = existing.is_origin_device;
                *existing = member;
            }
            None => {
                member.is_origin_device = self.roster.is_empty();
                self.roster.push(member);
            }
        }
        self.roster.clone()
    }

    /// Merge a replicated member as the sender stamped it, so every
    /// peer agrees on which device founded the team.
    pub fn merge_member(&mut self, member: RosterEntry) -> Vec<RosterEntry> {
        match self.roster.iter_mut().find(|m| m.id == member.id) {
            Some(existing) => *existing = member,
            None => self.roster.push(member),
        }
        self.roster.clone()
    }

    /// Everything a newly joined peer needs, oldest first so that its
    /// head-insertion rebuilds the same newest-first log.
    pub fn backfill(&self) -> Vec<OrderRecord> {
        record_counter("sync.backfill.orders", self.orders.len() as u64);
        self.orders.iter().rev().cloned().collect()
    }

    /// Wipe the order history (manager action, local only — never
    /// replicated). The id counter keeps its position so cleared ids
    /// are not reissued.
    pub fn clear_orders(&mut self) -> usize {
        let cleared = self.orders.len();
        self.orders.clear();
        cleared
    }

    pub fn orders(&self) -> &[OrderRecord] {
        &self.orders
    }

    pub fn roster(&self) -> &[RosterEntry] {
        &self.roster
    }

    pub fn next_order_id(&self) -> u64 {
        self.next_order_id
    }

    pub fn stats(&self) -> OrderStats {
        let total = self.orders.len();
        let completed: Vec<&OrderRecord> =
            self.orders.iter().filter(|o| o.is_completed()).collect();

        let avg_completion_ms = if completed.is_empty() {
            0
        } else {
            let sum: u64 = completed
                .iter()
                .filter_map(|o| o.completed_at.map(|t| t.saturating_sub(o.created_at)))
                .sum();
            sum / completed.len() as u64
        };
        let efficiency_pct = if total == 0 {
            0
        } else {
            (completed.len() * 100 / total) as u8
        };

        OrderStats {
            total,
            completed: completed.len(),
            avg_completion_ms,
            efficiency_pct,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_wire::Role;

    fn engine() -> ReplicationEngine {
        ReplicationEngine::new(DeviceId::from("d1"))
    }

    fn remote_order(id: u64, origin: &str) -> OrderRecord {
        OrderRecord::new(id, "flat white", vec!["flat white".into()], "Cashier-2", DeviceId::from(origin), 1_000)
    }

    fn member(id: &str, role: Role) -> RosterEntry {
        RosterEntry {
            id: DeviceId::from(id),
            display_name: id.to_string(),
            role,
            joined_at: 0,
            is_origin_device: false,
        }
    }

    #[test]
    fn test_create_order_mints_sequential_ids() {
        let mut eng = engine();
        let a = eng.create_order("latte", vec!["latte".into()], "Cashier-1", 10);
        let b = eng.create_order("mocha", vec!["mocha".into()], "Cashier-1", 20);
        assert_eq!((a.id, b.id), (1, 2));
        // Newest first.
        assert_eq!(eng.orders()[0].id, 2);
    }

    #[test]
    fn test_seed_advances_counter_past_stored_ids() {
        let mut eng = engine();
        eng.seed(vec![remote_order(7, "d1"), remote_order(3, "d1")], vec![]);
        assert_eq!(eng.next_order_id(), 8);
        let fresh = eng.create_order("espresso", vec![], "Cashier-1", 0);
        assert_eq!(fresh.id, 8);
    }

    #[test]
    fn test_merge_duplicate_is_idempotent() {
        let mut eng = engine();
        assert!(matches!(
            eng.merge_order(remote_order(5, "d2")),
            MergeOutcome::Inserted(_)
        ));
        assert_eq!(eng.merge_order(remote_order(5, "d2")), MergeOutcome::Duplicate);
        assert_eq!(eng.orders().len(), 1);
    }

    #[test]
    fn test_merge_collision_keeps_first_arrival() {
        let mut eng = engine();
        eng.merge_order(remote_order(5, "d2"));
        // Same id from a different device: absorbed, first one kept.
        assert_eq!(eng.merge_order(remote_order(5, "d3")), MergeOutcome::Duplicate);
        assert_eq!(eng.orders()[0].origin, DeviceId::from("d2"));
    }

    #[test]
    fn test_merge_advances_local_counter() {
        let mut eng = engine();
        eng.merge_order(remote_order(41, "d2"));
        assert_eq!(eng.next_order_id(), 42);
        // Below the counter: no change.
        eng.merge_order(remote_order(12, "d2"));
        assert_eq!(eng.next_order_id(), 42);
    }

    #[test]
    fn test_update_for_unknown_id_is_dropped() {
        let mut eng = engine();
        assert!(eng.merge_update(remote_order(99, "d2")).is_none());
        assert!(eng.orders().is_empty());
    }

    #[test]
    fn test_update_overwrites_in_place() {
        let mut eng = engine();
        eng.merge_order(remote_order(5, "d2"));
        let mut update = remote_order(5, "d2");
        update.complete("Barista-1", 2_000);

        let applied = eng.merge_update(update).unwrap();
        assert!(applied.is_completed());
        assert!(eng.orders()[0].is_completed());
        assert_eq!(eng.orders().len(), 1);
    }

    #[test]
    fn test_completed_never_reverts() {
        let mut eng = engine();
        let mut done = remote_order(5, "d2");
        done.complete("Barista-1", 2_000);
        eng.merge_order(done);

        // A stale Pending copy arrives late.
        assert!(eng.merge_update(remote_order(5, "d2")).is_none());
        assert!(eng.orders()[0].is_completed());
    }

    #[test]
    fn test_complete_order_stamps_and_is_terminal() {
        let mut eng = engine();
        let order = eng.create_order("latte", vec![], "Cashier-1", 100);

        let done = eng.complete_order(order.id, "Barista-1", 500).unwrap();
        assert_eq!(done.completed_by.as_deref(), Some("Barista-1"));
        assert_eq!(done.completed_at, Some(500));

        assert!(eng.complete_order(order.id, "Barista-2", 600).is_none());
        assert!(eng.complete_order(999, "Barista-1", 600).is_none());
    }

    #[test]
    fn test_backfill_rebuilds_identical_log() {
        let mut eng = engine();
        eng.create_order("a", vec![], "Cashier-1", 1);
        eng.create_order("b", vec![], "Cashier-1", 2);
        eng.create_order("c", vec![], "Cashier-1", 3);

        let mut other = ReplicationEngine::new(DeviceId::from("d2"));
        for order in eng.backfill() {
            other.merge_order(order);
        }
        assert_eq!(other.orders(), eng.orders());

        // Replaying the backfill adds nothing.
        for order in eng.backfill() {
            assert_eq!(other.merge_order(order), MergeOutcome::Duplicate);
        }
        assert_eq!(other.orders().len(), 3);
    }

    #[test]
    fn test_first_member_is_origin_device() {
        let mut eng = engine();
        let roster = eng.upsert_member(member("d1", Role::Manager));
        assert!(roster[0].is_origin_device);

        let roster = eng.upsert_member(member("d2", Role::Barista));
        assert!(!roster[1].is_origin_device);

        // Re-upserting the founder keeps the flag.
        let mut renamed = member("d1", Role::Manager);
        renamed.display_name = "Boss".into();
        let roster = eng.upsert_member(renamed);
        assert!(roster[0].is_origin_device);
        assert_eq!(roster[0].display_name, "Boss");
    }

    #[test]
    fn test_merged_member_keeps_wire_origin_flag() {
        // The sender already decided who founded the team; an empty
        // local roster must not promote a replicated member.
        let mut eng = engine();
        let roster = eng.merge_team_update(TeamUpdate::UpsertMember {
            member: member("d2", Role::Barista),
        });
        assert!(!roster[0].is_origin_device);

        // And a stamped founder stays the founder, wherever it lands.
        let mut founder = member("d9", Role::Manager);
        founder.is_origin_device = true;
        let roster = eng.merge_team_update(TeamUpdate::UpsertMember { member: founder });
        assert!(roster.iter().any(|m| m.id == DeviceId::from("d9") && m.is_origin_device));
        assert!(!roster.iter().any(|m| m.id == DeviceId::from("d2") && m.is_origin_device));
    }

    #[test]
    fn test_clear_orders_keeps_counter() {
        let mut eng = engine();
        eng.create_order("a", vec![], "Cashier-1", 1);
        eng.create_order("b", vec![], "Cashier-1", 2);

        assert_eq!(eng.clear_orders(), 2);
        assert!(eng.orders().is_empty());
        // Cleared ids are never reissued.
        let next = eng.create_order("c", vec![], "Cashier-1", 3);
        assert_eq!(next.id, 3);
    }

    #[test]
    fn test_replace_roster_is_wholesale() {
        let mut eng = engine();
        eng.upsert_member(member("d1", Role::Manager));
        eng.upsert_member(member("d2", Role::Barista));

        let roster = eng.replace_roster(vec![member("d9", Role::Cashier)]);
        assert_eq!(roster.len(), 1);
        assert_eq!(eng.roster()[0].id, DeviceId::from("d9"));
    }

    #[test]
    fn test_stats() {
        let mut eng = engine();
        let a = eng.create_order("a", vec![], "Cashier-1", 1_000);
        eng.create_order("b", vec![], "Cashier-1", 2_000);
        eng.complete_order(a.id, "Barista-1", 1_400);

        let stats = eng.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.avg_completion_ms, 400);
        assert_eq!(stats.efficiency_pct, 50);

        assert_eq!(engine().stats().efficiency_pct, 0);
    }
}
