//! Byzantine fault detection
//!
//! During the synchronization round every node checks the offset it
//! measured to the announcing peer against fixed trust bounds. A peer
//! outside the bounds is blacklisted and the cluster falls back to a
//! flooding sub-protocol on the synchronization channel; the alarm
//! clears once a majority of the neighborhood has echoed it.

use crate::protocol::neighbors::Neighbor;

/// Trust bounds for the synchronization round
#[derive(Debug, Clone)]
pub struct ByzantineConfig {
    /// Largest believable fine offset to a peer, in fine ticks
    pub fine_diff_limit: i64,
    /// Largest believable coarse offset to a peer
    pub coarse_diff_limit: i32,
}

impl Default for ByzantineConfig {
    fn default() -> Self {
        ByzantineConfig {
            fine_diff_limit: 500,
            coarse_diff_limit: 3,
        }
    }
}

/// Tracks the echo count of a running byzantine alarm
#[derive(Debug, Clone, Default)]
pub struct ByzantineGuard {
    config: ByzantineConfig,
    msg_count: u16,
}

impl ByzantineGuard {
    pub fn new(config: ByzantineConfig) -> Self {
        ByzantineGuard {
            config,
            msg_count: 0,
        }
    }

    /// Whether the measured offset to this peer is within the trust
    /// bounds.
    pub fn within_limits(&self, n: &Neighbor) -> bool {
        n.fine_diff.abs() < self.config.fine_diff_limit
            && (n.coarse_diff.abs() as i64) < self.config.coarse_diff_limit as i64
    }

    /// Echoes needed before a running alarm may clear
    pub fn threshold(degree: u8) -> u16 {
        degree as u16 / 2 + 1
    }

    pub fn msg_count(&self) -> u16 {
        self.msg_count
    }

    /// Counts one received alarm echo
    pub fn record_echo(&mut self) -> u16 {
        self.msg_count += 1;
        self.msg_count
    }

    /// True once more than the majority threshold of echoes arrived
    pub fn quorum_reached(&self, degree: u8) -> bool {
        self.msg_count > Self::threshold(degree)
    }

    pub fn reset(&mut self) {
        self.msg_count = 0;
    }
}
