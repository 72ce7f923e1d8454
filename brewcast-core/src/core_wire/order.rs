//! Order records replicated across the mesh

use serde::{Deserialize, Serialize};

use super::DeviceId;

/// Order lifecycle. `Completed` is terminal; the transition happens at
/// most once, on whichever device accepts the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Completed,
}

/// A single order as it travels the wire and sits in the order log.
///
/// `id` comes from a per-device monotonic counter, so it is not globally
/// unique by construction; the merge path in `core_replication` absorbs
/// duplicates and flags cross-device collisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: u64,

    /// Raw transcript the order was captured from.
    pub text: String,

    /// Parsed line items, one display string per item.
    pub items: Vec<String>,

    pub status: OrderStatus,

    /// Epoch milliseconds at creation on the authoring device.
    pub created_at: u64,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_at: Option<u64>,

    /// Display name of the cashier that created the order.
    pub created_by: String,

    /// Display name of the barista that completed it, once completed.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub completed_by: Option<String>,

    /// Device that minted the id; used to tell a re-delivery of the same
    /// order apart from an id collision between two devices.
    pub origin: DeviceId,
}

impl OrderRecord {
    pub fn new(
        id: u64,
        text: impl Into<String>,
        items: Vec<String>,
        created_by: impl Into<String>,
        origin: DeviceId,
        now: u64,
    ) -> Self {
        Self {
            id,
            text: text.into(),
            items,
            status: OrderStatus::Pending,
            created_at: now,
            completed_at: None,
            created_by: created_by.into(),
            completed_by: None,
            origin,
        }
    }

    /// Mark the order completed. Returns false (and changes nothing) if
    /// it already was; Completed is terminal.
    pub fn complete(&mut self, by: impl Into<String>, now: u64) -> bool {
        if self.status == OrderStatus::Completed {
            return false;
        }
        self.status = OrderStatus::Completed;
        self.completed_by = Some(by.into());
        self.completed_at = Some(now);
        true
    }

    pub fn is_completed(&self) -> bool {
        self.status == OrderStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> OrderRecord {
        OrderRecord::new(
            7,
            "latte and two espressos",
            vec!["latte".into(), "espresso x2".into()],
            "Cashier-1",
            DeviceId::from("d1"),
            1_000,
        )
    }

    #[test]
    fn test_new_order_is_pending() {
        let order = sample();
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(order.completed_at.is_none());
        assert!(order.completed_by.is_none());
    }

    #[test]
    fn test_complete_is_terminal() {
        let mut order = sample();
        assert!(order.complete("Barista-1", 2_000));
        assert_eq!(order.status, OrderStatus::Completed);
        assert_eq!(order.completed_by.as_deref(), Some("Barista-1"));
        assert_eq!(order.completed_at, Some(2_000));

        // Second completion is a no-op.
        assert!(!order.complete("Barista-2", 3_000));
        assert_eq!(order.completed_by.as_deref(), Some("Barista-1"));
        assert_eq!(order.completed_at, Some(2_000));
    }

    #[test]
    fn test_json_round_trip_omits_empty_fields() {
        let order = sample();
        let json = serde_json::to_string(&order).unwrap();
        assert!(!json.contains("completed_at"));
        assert!(!json.contains("completed_by"));

        let back: OrderRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, order);
    }
}
