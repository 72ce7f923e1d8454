//! Serverless peer synchronization for a coffee-shop team
//!
//! Devices on the same network (cashier, barista, manager) converge on
//! a shared order log and team roster without a central server. Each
//! device runs a [`core_session::Session`] actor that announces itself,
//! heartbeats, and replicates orders over one of three transports: an
//! in-process broadcast bus, a storage-key fallback, or a signaled
//! point-to-point data channel.

pub mod config;
pub mod core_presence;
pub mod core_replication;
pub mod core_session;
pub mod core_signal;
pub mod core_store;
pub mod core_transport;
pub mod core_wire;
pub mod logging;
pub mod metrics;

pub use config::{Config, ConfigError};
pub use core_session::{Session, SessionError, SessionEvent, SessionHandle, SyncMode};
pub use logging::{init_logging, LogLevel};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        // Ensure the main exports are accessible
        let _ = LogLevel::Info;
        let _ = Config::default();
    }
}
