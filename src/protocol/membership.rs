//! Cluster membership lists
//!
//! A node keeps two ranked candidate lists built during the election
//! and connection phases: the cluster heads it hears, and (for heads)
//! the bridges attached to it. Both are ordered by degree, ties broken
//! by address, and evict the lowest-ranked entry when full. The lists
//! later carry the consensus slot bookkeeping of the convergence and
//! synchronization phases.

use serde::{Deserialize, Serialize};

use crate::core::{
    Error, NodeAddr, Phase, Result, Role, BLACKLIST_MAX, NUM_CH_MAX, NUM_CONS_SLOTS,
};
use crate::protocol::message::AnnouncementValue;
use crate::protocol::neighbors::{Neighbor, NeighborTable};

/// Capacity of the bridge list kept by cluster heads
pub const MAX_BRIDGES: usize = 2 * NUM_CH_MAX;

/// One entry of a cluster list. When the owner is a cluster head the
/// `peer_a` and `degree` fields hold deltas relative to the owner, not
/// absolute values; the sums are reconstructed by the receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEntry {
    pub addr: NodeAddr,
    pub degree: u8,
    /// Synchronization slot this entry has claimed, 0 while unclaimed
    pub cons_slot: u8,
    /// Bridging peer address (or address delta, see above)
    pub peer_a: u16,
    /// Second bridging peer, filled when two bridges share this head
    pub peer_b: u16,
}

/// Slot assignment derived from the mirrored cluster lists at the start
/// of a synchronization round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSchedule {
    /// Own slot after mirroring
    pub cons_slot: u8,
    /// Node whose slot comes first in the round
    pub ref_addr: NodeAddr,
    /// That node's slot number
    pub ref_degree: u8,
    /// Whether this node opens the round
    pub sync_border: bool,
}

#[derive(Debug, Clone)]
pub struct ClusterMembership {
    pub role: Role,
    heads: Vec<ClusterEntry>,
    bridges: Vec<ClusterEntry>,
    blacklist: Vec<NodeAddr>,
}

impl Default for ClusterMembership {
    fn default() -> Self {
        ClusterMembership::new()
    }
}

impl ClusterMembership {
    pub fn new() -> Self {
        ClusterMembership {
            role: Role::ClusterHead,
            heads: Vec::with_capacity(NUM_CH_MAX),
            bridges: Vec::with_capacity(MAX_BRIDGES),
            blacklist: Vec::with_capacity(BLACKLIST_MAX),
        }
    }

    pub fn heads(&self) -> &[ClusterEntry] {
        &self.heads
    }

    pub fn heads_mut(&mut self) -> &mut [ClusterEntry] {
        &mut self.heads
    }

    pub fn bridges(&self) -> &[ClusterEntry] {
        &self.bridges
    }

    pub fn head_of(&self, addr: NodeAddr) -> Option<&ClusterEntry> {
        self.heads.iter().find(|e| e.addr == addr)
    }

    pub fn head_of_mut(&mut self, addr: NodeAddr) -> Option<&mut ClusterEntry> {
        self.heads.iter_mut().find(|e| e.addr == addr)
    }

    /// Role of a known cluster peer, resolved from the lists
    pub fn role_of(&self, addr: NodeAddr) -> Option<Role> {
        if self.heads.iter().any(|e| e.addr == addr) {
            Some(Role::ClusterHead)
        } else if self.bridges.iter().any(|e| e.addr == addr) {
            Some(Role::ClusterBridge)
        } else {
            None
        }
    }

    /// Adopts a head learned outside the declaration exchange, as a
    /// late joiner does. Duplicate addresses and a full list are
    /// refused.
    pub fn push_head(&mut self, entry: ClusterEntry) -> bool {
        if self.heads.len() >= NUM_CH_MAX || self.head_of(entry.addr).is_some() {
            return false;
        }
        self.heads.push(entry);
        true
    }

    pub fn clear_heads(&mut self) {
        self.heads.clear();
    }

    pub fn clear_bridges(&mut self) {
        self.bridges.clear();
    }

    pub fn clear(&mut self) {
        self.role = Role::ClusterHead;
        self.heads.clear();
        self.bridges.clear();
        self.blacklist.clear();
    }

    /// Records a declared cluster peer in the list the current phase
    /// selects: heads during election declaration and consensus
    /// convergence, bridges during connection declaration. The first
    /// head recorded demotes this node to commoner. Returns `false`
    /// when the phase keeps no list.
    pub fn record(
        &mut self,
        phase: Phase,
        my_addr: NodeAddr,
        my_degree: u8,
        value: &AnnouncementValue,
        n: &Neighbor,
    ) -> bool {
        let is_heads = matches!(
            phase,
            Phase::ElectionDeclaration | Phase::ConsensusConvergence
        );
        if !is_heads && phase != Phase::ConnectionDeclaration {
            return false;
        }
        let cap = if is_heads { NUM_CH_MAX } else { MAX_BRIDGES };
        let empty = if is_heads {
            self.heads.is_empty()
        } else {
            self.bridges.is_empty()
        };

        if empty && is_heads {
            self.role = Role::Commoner;
        }

        // Heads fold their own identity out of the relayed pair so the
        // receivers can reconstruct the sum.
        let entry = if self.role == Role::ClusterHead {
            ClusterEntry {
                addr: n.addr,
                degree: value.degree.wrapping_sub(my_degree),
                cons_slot: 0,
                peer_a: value.ref_addr.0.wrapping_sub(my_addr.0),
                peer_b: 0,
            }
        } else {
            ClusterEntry {
                addr: n.addr,
                degree: n.degree,
                cons_slot: 0,
                peer_a: value.ref_addr.0,
                peer_b: 0,
            }
        };

        let list = if is_heads {
            &mut self.heads
        } else {
            &mut self.bridges
        };

        if empty {
            list.push(entry);
            return true;
        }

        let mut position = list.len();
        for (i, e) in list.iter().enumerate() {
            if e.addr == n.addr {
                return true;
            }
            if n.degree > e.degree || (n.degree == e.degree && n.addr.0 > e.addr.0) {
                position = i;
                break;
            }
        }

        if list.len() >= cap {
            if position == list.len() {
                // ranks below every kept entry
                return true;
            }
            list.pop();
        }
        list.insert(position, entry);
        true
    }

    /// Rebuilds the head list from the recorded bridges at the start of
    /// consensus convergence: every bridge contributes the head it pairs
    /// this node with, bridges sharing a head fill its second peer slot.
    /// Returns the proactive slot for the resulting head count.
    pub fn rebuild_heads(&mut self) -> u8 {
        self.heads.clear();
        for b in &self.bridges {
            if let Some(h) = self.heads.iter_mut().find(|h| h.addr.0 == b.peer_a) {
                h.peer_b = b.addr.0;
                continue;
            }
            if self.heads.len() >= NUM_CH_MAX {
                break;
            }
            self.heads.insert(
                0,
                ClusterEntry {
                    addr: NodeAddr(b.peer_a),
                    degree: b.degree,
                    cons_slot: 0,
                    peer_a: b.addr.0,
                    peer_b: 0,
                },
            );
        }

        match self.heads.len() {
            0 | 1 => 0,
            2 => 1,
            _ => 3,
        }
    }

    /// Mirrors the claimed slots for the synchronization round (slot `k`
    /// becomes `N + 1 - k`, so the round runs in reverse claim order)
    /// and derives which peer opens the round.
    pub fn init_sync(&mut self, my_addr: NodeAddr, my_cons_slot: u8) -> SyncSchedule {
        let cons_slot = (NUM_CONS_SLOTS + 1).wrapping_sub(my_cons_slot);
        for h in &mut self.heads {
            h.cons_slot = (NUM_CONS_SLOTS + 1).wrapping_sub(h.cons_slot);
        }

        let mut schedule = SyncSchedule {
            cons_slot,
            ref_addr: my_addr,
            ref_degree: if self.role == Role::ClusterHead {
                cons_slot
            } else {
                NUM_CONS_SLOTS
            },
            sync_border: self.role == Role::ClusterHead,
        };

        for h in &self.heads {
            if h.cons_slot < schedule.ref_degree {
                schedule.ref_addr = h.addr;
                schedule.ref_degree = h.cons_slot;
                schedule.sync_border = false;
            } else if h.cons_slot > NUM_CONS_SLOTS {
                schedule.sync_border = false;
            }
        }

        if self.role == Role::ClusterBridge {
            for h in &self.heads {
                if h.addr != schedule.ref_addr {
                    schedule.cons_slot = h.cons_slot;
                }
            }
        }

        schedule
    }

    /// Advances a bridge's own slot to the one claimed by the head
    /// preceding the current reference in the round.
    pub fn next_sync_slot(&self, ref_addr: NodeAddr, my_cons_slot: u8) -> u8 {
        let mut slot = my_cons_slot;
        for h in &self.heads {
            if h.addr == ref_addr {
                break;
            }
            slot = h.cons_slot;
        }
        slot
    }

    /// Rank among the recorded heads, used to scale the polite
    /// announcement interval of bridges.
    pub fn chb_placing(&self, my_addr: NodeAddr, my_degree: u8) -> u8 {
        let mut placing: u8 = 0;
        for h in &self.heads {
            if h.degree > my_degree && self.role == Role::ClusterBridge {
                placing += h.degree - my_degree;
            } else if h.degree == my_degree && h.addr.0 > my_addr.0 {
                placing += 1;
            }
        }
        placing
    }

    pub fn is_blacklisted(&self, addr: NodeAddr) -> bool {
        self.blacklist.contains(&addr)
    }

    /// Adds a node to the blacklist; refused once the list is full.
    /// Listing an already blacklisted node is a no-op.
    pub fn add_to_blacklist(&mut self, addr: NodeAddr) -> Result<()> {
        if self.is_blacklisted(addr) {
            return Ok(());
        }
        if self.blacklist.len() >= BLACKLIST_MAX {
            return Err(Error::peer(format!("blacklist full, cannot list {}", addr)));
        }
        self.blacklist.push(addr);
        Ok(())
    }
}

/// Rank in the neighborhood degree order, counted as the degree surplus
/// of better-connected neighbors plus equal-degree neighbors with a
/// higher address.
pub fn neighborhood_placing(table: &NeighborTable, my_addr: NodeAddr, my_degree: u8) -> u16 {
    let mut placing: u16 = 0;
    for n in table.iter() {
        if n.degree > my_degree {
            placing += (n.degree - my_degree) as u16;
        } else if n.degree == my_degree && n.addr.0 > my_addr.0 {
            placing += 1;
        }
    }
    placing
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_from(ref_addr: u16, degree: u8) -> AnnouncementValue {
        AnnouncementValue {
            instr: Phase::ElectionDeclaration.code(),
            degree,
            date_coarse: 0,
            date_fine: 0,
            ref_addr: NodeAddr(ref_addr),
            cons_rate: 0.0,
        }
    }

    fn neighbor(addr: u16, degree: u8) -> Neighbor {
        let mut n = Neighbor::new(NodeAddr(addr));
        n.degree = degree;
        n
    }

    #[test]
    fn test_first_head_demotes_to_commoner() {
        let mut m = ClusterMembership::new();
        assert_eq!(m.role, Role::ClusterHead);
        let n = neighbor(7, 5);
        assert!(m.record(
            Phase::ElectionDeclaration,
            NodeAddr(1),
            3,
            &value_from(7, 5),
            &n
        ));
        assert_eq!(m.role, Role::Commoner);
        assert_eq!(m.heads().len(), 1);
        // recorded as commoner: absolute values
        assert_eq!(m.heads()[0].degree, 5);
        assert_eq!(m.heads()[0].peer_a, 7);
    }

    #[test]
    fn test_ranked_insert_and_eviction() {
        let mut m = ClusterMembership::new();
        for (addr, degree) in [(10u16, 4u8), (11, 6), (12, 5), (13, 3)] {
            let n = neighbor(addr, degree);
            m.record(
                Phase::ElectionDeclaration,
                NodeAddr(1),
                0,
                &value_from(addr, degree),
                &n,
            );
        }
        let degrees: Vec<u8> = m.heads().iter().map(|e| e.degree).collect();
        assert_eq!(degrees, vec![6, 5, 4, 3]);

        // full list: a better entry evicts the tail
        let n = neighbor(14, 7);
        m.record(
            Phase::ElectionDeclaration,
            NodeAddr(1),
            0,
            &value_from(14, 7),
            &n,
        );
        assert_eq!(m.heads().len(), NUM_CH_MAX);
        assert_eq!(m.heads()[0].addr, NodeAddr(14));
        assert!(m.head_of(NodeAddr(13)).is_none());

        // a worse entry is refused outright
        let n = neighbor(15, 1);
        m.record(
            Phase::ElectionDeclaration,
            NodeAddr(1),
            0,
            &value_from(15, 1),
            &n,
        );
        assert!(m.head_of(NodeAddr(15)).is_none());
    }

    #[test]
    fn test_duplicate_address_is_kept_once() {
        let mut m = ClusterMembership::new();
        let n = neighbor(7, 5);
        m.record(
            Phase::ElectionDeclaration,
            NodeAddr(1),
            0,
            &value_from(7, 5),
            &n,
        );
        m.record(
            Phase::ElectionDeclaration,
            NodeAddr(1),
            0,
            &value_from(7, 5),
            &n,
        );
        assert_eq!(m.heads().len(), 1);
    }

    #[test]
    fn test_head_records_deltas() {
        let mut m = ClusterMembership::new();
        // ConnectionDeclaration keeps the bridge list and does not
        // demote, so the head applies the delta encoding.
        let n = neighbor(7, 5);
        assert!(m.record(
            Phase::ConnectionDeclaration,
            NodeAddr(3),
            2,
            &value_from(10, 6),
            &n
        ));
        assert_eq!(m.role, Role::ClusterHead);
        assert_eq!(m.bridges()[0].peer_a, 7);
        assert_eq!(m.bridges()[0].degree, 4);
    }

    #[test]
    fn test_record_refused_outside_list_phases() {
        let mut m = ClusterMembership::new();
        let n = neighbor(7, 5);
        assert!(!m.record(Phase::Discovery, NodeAddr(1), 0, &value_from(7, 5), &n));
    }

    #[test]
    fn test_rebuild_heads_pairs_bridges() {
        let mut m = ClusterMembership::new();
        m.bridges.push(ClusterEntry {
            addr: NodeAddr(20),
            degree: 4,
            cons_slot: 0,
            peer_a: 30,
            peer_b: 0,
        });
        m.bridges.push(ClusterEntry {
            addr: NodeAddr(21),
            degree: 3,
            cons_slot: 0,
            peer_a: 30,
            peer_b: 0,
        });

        let proactive = m.rebuild_heads();
        assert_eq!(m.heads().len(), 1);
        let h = &m.heads()[0];
        assert_eq!(h.addr, NodeAddr(30));
        assert_eq!(h.peer_a, 20);
        assert_eq!(h.peer_b, 21);
        // a single peer head yields no proactive slot
        assert_eq!(proactive, 0);
    }

    #[test]
    fn test_proactive_slot_by_head_count() {
        let mut m = ClusterMembership::new();
        for (bridge, head) in [(20u16, 30u16), (21, 31)] {
            m.bridges.push(ClusterEntry {
                addr: NodeAddr(bridge),
                degree: 1,
                cons_slot: 0,
                peer_a: head,
                peer_b: 0,
            });
        }
        assert_eq!(m.rebuild_heads(), 1);
    }

    #[test]
    fn test_init_sync_mirrors_slots() {
        let mut m = ClusterMembership::new();
        m.role = Role::ClusterHead;
        m.heads.push(ClusterEntry {
            addr: NodeAddr(30),
            degree: 4,
            cons_slot: 2,
            peer_a: 0,
            peer_b: 0,
        });

        // own slot 1 mirrors to 3, the peer head's slot 2 stays 2 and
        // therefore opens the round
        let s = m.init_sync(NodeAddr(1), 1);
        assert_eq!(s.cons_slot, 3);
        assert_eq!(m.heads()[0].cons_slot, 2);
        assert_eq!(s.ref_addr, NodeAddr(30));
        assert_eq!(s.ref_degree, 2);
        assert!(!s.sync_border);
    }

    #[test]
    fn test_init_sync_border_without_peers() {
        let mut m = ClusterMembership::new();
        m.role = Role::ClusterHead;
        let s = m.init_sync(NodeAddr(1), 3);
        assert_eq!(s.cons_slot, 1);
        assert_eq!(s.ref_addr, NodeAddr(1));
        assert!(s.sync_border);
    }

    #[test]
    fn test_neighborhood_placing() {
        let mut table = NeighborTable::new();
        for (addr, degree) in [(10u16, 5u8), (20, 5), (30, 7)] {
            let idx = table.insert(NodeAddr(addr)).unwrap();
            table.get_mut(idx).degree = degree;
        }
        // addr 20 outranks by address, addr 30 by two degrees
        assert_eq!(neighborhood_placing(&table, NodeAddr(15), 5), 3);
    }

    #[test]
    fn test_chb_placing_equal_degree_by_address() {
        let mut m = ClusterMembership::new();
        for addr in [10u16, 20] {
            m.push_head(ClusterEntry {
                addr: NodeAddr(addr),
                degree: 5,
                cons_slot: 0,
                peer_a: 0,
                peer_b: 0,
            });
        }

        // ranked between the two heads: one credit for the equal-degree
        // head at the higher address, none for the lower one
        assert_eq!(m.chb_placing(NodeAddr(15), 5), 1);
        // ranked above both
        assert_eq!(m.chb_placing(NodeAddr(30), 5), 0);
        // ranked below both
        assert_eq!(m.chb_placing(NodeAddr(5), 5), 2);

        // a bridge is credited the degree surplus of better-connected heads
        m.role = Role::ClusterBridge;
        assert_eq!(m.chb_placing(NodeAddr(15), 2), 6);
    }

    #[test]
    fn test_blacklist_capacity() {
        let mut m = ClusterMembership::new();
        assert!(m.add_to_blacklist(NodeAddr(1)).is_ok());
        assert!(m.add_to_blacklist(NodeAddr(1)).is_ok());
        assert!(m.add_to_blacklist(NodeAddr(2)).is_ok());
        let err = m.add_to_blacklist(NodeAddr(3)).unwrap_err();
        assert!(matches!(err, Error::Peer(_)));
        assert!(m.is_blacklisted(NodeAddr(2)));
        assert!(!m.is_blacklisted(NodeAddr(3)));
    }
}
