use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Link-layer address of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddr(pub u16);

impl NodeAddr {
    /// Generates a random node address (nonzero)
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        NodeAddr(rng.gen_range(1..=u16::MAX))
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point on the logical time axis: coarse ticks plus a fine count.
///
/// The fine component is kept normalized into the window
/// `[fine_max / 2, 3 * fine_max / 2)`, so lexicographic comparison on
/// `(coarse, fine)` orders dates correctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalDate {
    /// Coarse tick count
    pub coarse: u32,
    /// Fine count within the coarse tick
    pub fine: u32,
}

impl LogicalDate {
    pub fn new(coarse: u32, fine: u32) -> Self {
        LogicalDate { coarse, fine }
    }
}

impl PartialOrd for LogicalDate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogicalDate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.coarse
            .cmp(&other.coarse)
            .then(self.fine.cmp(&other.fine))
    }
}

/// Protocol phase. Wire codes advance in steps of two; the odd values in
/// between are instruction codes carried by announcements (see
/// `protocol::message`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Phase {
    Discovery = 0,
    ElectionRevelation = 2,
    ElectionDeclaration = 4,
    ConnectionRevelation = 6,
    ConnectionDeclaration = 8,
    ConsensusConvergence = 10,
    ConsensusRevelation = 12,
    ConsensusSynchronization = 14,
    Idle = 16,
    ByzantineConsensus = 18,
}

impl Phase {
    /// Wire code of this phase
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Decodes a wire phase code
    pub fn from_code(code: u8) -> Option<Phase> {
        match code {
            0 => Some(Phase::Discovery),
            2 => Some(Phase::ElectionRevelation),
            4 => Some(Phase::ElectionDeclaration),
            6 => Some(Phase::ConnectionRevelation),
            8 => Some(Phase::ConnectionDeclaration),
            10 => Some(Phase::ConsensusConvergence),
            12 => Some(Phase::ConsensusRevelation),
            14 => Some(Phase::ConsensusSynchronization),
            16 => Some(Phase::Idle),
            18 => Some(Phase::ByzantineConsensus),
            _ => None,
        }
    }
}

/// Role a node holds once the cluster topology is fixed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Role {
    /// Ordinary cluster member
    Commoner = 0,
    /// Elected head of a cluster
    ClusterHead = 1,
    /// Bridge connecting two cluster heads
    ClusterBridge = 2,
}

/// Hardware timer slot identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerSlot {
    Zero,
    One,
}

impl TimerSlot {
    pub fn index(&self) -> usize {
        match self {
            TimerSlot::Zero => 0,
            TimerSlot::One => 1,
        }
    }
}
