//! csync: clustered gradient time synchronization for sensor networks
//!
//! Nodes discover their neighborhood, elect cluster heads and bridges
//! in a slotted two-level hierarchy, negotiate per-cluster consensus
//! slots, and run gradient clock synchronization across the cluster
//! borders, with a byzantine recovery sub-protocol guarding the
//! synchronization rounds.

pub mod core;
pub mod network;
pub mod protocol;
pub mod sync;
pub mod time;
pub mod util;

// Re-export commonly used items
pub use core::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
