use serde::{Deserialize, Serialize};

use crate::core::{Error, LogicalDate, NodeAddr, Phase, Result, Role, MAX_NEIGHBORS};

/// Everything a node tracks per neighbor: identity, topology attributes,
/// and the synchronization history the gradient synchronizer maintains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neighbor {
    pub addr: NodeAddr,
    pub degree: u8,
    pub role: Role,
    /// Phase the neighbor last announced from
    pub state: Phase,
    /// Last rate sample fell outside the drift limit
    pub jumped: bool,
    /// Offset to this neighbor is within the jump limit
    pub synced: bool,
    /// Estimated rate of the neighbor's clock relative to ours
    pub relative_rate: f64,
    /// Our hardware date at the last observation
    pub last_my: LogicalDate,
    /// The neighbor's logical date at the last observation
    pub last_n: LogicalDate,
    /// Coarse part of `our date - neighbor date` at the last observation
    pub coarse_diff: i32,
    /// Fine part of `our date - neighbor date` at the last observation
    pub fine_diff: i64,
}

impl Neighbor {
    pub fn new(addr: NodeAddr) -> Self {
        Neighbor {
            addr,
            degree: 0,
            role: Role::Commoner,
            state: Phase::Discovery,
            jumped: false,
            synced: false,
            relative_rate: 0.0,
            last_my: LogicalDate::new(0, 0),
            last_n: LogicalDate::new(0, 0),
            coarse_diff: 0,
            fine_diff: 0,
        }
    }
}

/// Fixed-capacity neighbor arena. Entries are addressed by stable indices;
/// insertion is refused when the arena is full.
#[derive(Debug, Clone, Default)]
pub struct NeighborTable {
    entries: Vec<Neighbor>,
}

impl NeighborTable {
    pub fn new() -> Self {
        NeighborTable {
            entries: Vec::with_capacity(MAX_NEIGHBORS),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, addr: NodeAddr) -> Option<usize> {
        self.entries.iter().position(|n| n.addr == addr)
    }

    pub fn get(&self, idx: usize) -> &Neighbor {
        &self.entries[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Neighbor {
        &mut self.entries[idx]
    }

    /// Allocates an entry for a new neighbor. Fails when the arena is
    /// full; the caller drops the announcement in that case.
    pub fn insert(&mut self, addr: NodeAddr) -> Result<usize> {
        if let Some(idx) = self.find(addr) {
            return Ok(idx);
        }
        if self.entries.len() >= MAX_NEIGHBORS {
            return Err(Error::peer(format!(
                "neighbor table full, cannot track {}",
                addr
            )));
        }
        self.entries.push(Neighbor::new(addr));
        Ok(self.entries.len() - 1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbor> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Neighbor> {
        self.entries.iter_mut()
    }

    pub fn set_role(&mut self, addr: NodeAddr, role: Role) {
        if let Some(idx) = self.find(addr) {
            self.entries[idx].role = role;
        }
    }

    /// True when every tracked neighbor is within the jump limit
    pub fn all_synced(&self) -> bool {
        self.entries.iter().all(|n| n.synced)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
