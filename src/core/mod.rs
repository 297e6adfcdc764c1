//! Core types for the csync protocol
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod types;

pub use self::error::{Error, Result};
pub use self::types::{LogicalDate, NodeAddr, Phase, Role, TimerSlot};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Number of announcement channels (discovery, election, connection,
/// convergence, synchronization)
pub const NUM_CHANNELS: u8 = 5;

/// Nominal fine counts per coarse tick
pub const FINE_MAX: u32 = 62_500;

/// Maximum neighbors tracked per node
pub const MAX_NEIGHBORS: usize = 16;

/// Capacity of the ranked cluster-head candidate list
pub const NUM_CH_MAX: usize = 4;

/// Number of consensus synchronization slots
pub const NUM_CONS_SLOTS: u8 = 3;

/// Consensus control iterations per synchronization round
pub const NUM_CONS_CTRL_ITERATIONS: u8 = 3;

/// Synced-observation count required to leave discovery
pub const MAX_RX_SYNC_DISCOVERY: u16 = 12;

/// Announcements below this signal strength are ignored (dBm)
pub const RSSI_THRESHOLD: i16 = -80;

/// Nodes kept on the byzantine blacklist at most
pub const BLACKLIST_MAX: usize = 2;

/// Fixed propagation plus MAC turnaround compensation, in fine ticks
pub const TRANSMISSION_DELAY: i64 = 3;
