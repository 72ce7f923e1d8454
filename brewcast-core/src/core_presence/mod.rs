//! Peer liveness tracking
//!
//! [`PeerRegistry`] is the pure state holder ("who is online"); the
//! [`Presence`] protocol layered on top drives it from Announce,
//! Beacon, Heartbeat, and Goodbye traffic plus a periodic sweep.

mod protocol;
mod registry;

pub use protocol::{Presence, PresenceAction};
pub use registry::{PeerRecord, PeerRegistry, PeerState};
