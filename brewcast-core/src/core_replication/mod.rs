//! Eventually-consistent replication of the order log and team roster
//!
//! The engine is pure state plus merge rules; the session actor feeds it
//! local commands and remote envelopes and broadcasts whatever it says
//! needs broadcasting. Replication never deletes: it only inserts or
//! overwrites by identity.

mod engine;

pub use engine::{MergeOutcome, OrderStats, ReplicationEngine};
