//! Clustering state machine
//!
//! Drives a node through the ten protocol phases: discovery, the
//! election and connection exchanges that elect cluster heads and
//! bridges, the convergence negotiation that assigns synchronization
//! slots, the slotted synchronization rounds, and idle. The machine is
//! event-driven: the owner feeds it timer expiries, received
//! announcements and re-broadcast ticks, and collects the announcements
//! it wants on the air after every step.
//!
//! Timer handling follows the single-slot discipline of the phase
//! windows: every phase arms slot zero with a pending transition, slot
//! deadlines inside a phase are anchored at the phase entry via
//! interval-from-reference scheduling, and a date-scheduled transition
//! adopted from a peer parks the slot in single-pass state so the next
//! phase-internal schedule call keeps the adopted deadline.

use std::cmp::Ordering;

use tracing::{debug, trace, warn};

use crate::core::{
    LogicalDate, NodeAddr, Phase, Role, TimerSlot, MAX_RX_SYNC_DISCOVERY, NUM_CHANNELS,
    NUM_CONS_CTRL_ITERATIONS, NUM_CONS_SLOTS, RSSI_THRESHOLD,
};
use crate::protocol::byzantine::{ByzantineConfig, ByzantineGuard};
use crate::protocol::membership::{neighborhood_placing, ClusterEntry, ClusterMembership};
use crate::protocol::message::{
    Announcement, AnnouncementValue, Channel, TimesyncFrame, INSTR_CONVERGENCE_PROACTIVE,
    INSTR_DISC_TO_EREV,
};
use crate::protocol::neighbors::NeighborTable;
use crate::sync::gradient::{GradientConfig, GradientSynchronizer};
use crate::util::{fine_to_secs, secs_to_fine};
use crate::time::{LogicalClock, ScheduleMode, TimerState};

/// All protocol scheduling runs on slot zero; slot one is left to the
/// platform layer.
const SLOT: TimerSlot = TimerSlot::Zero;

/// Node configuration. Intervals are in fine ticks at the nominal
/// 2-second coarse tick.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub addr: NodeAddr,
    /// Announcements below this signal strength are dropped (dBm)
    pub rssi_threshold: i16,
    /// Synced discovery observations required before leaving discovery
    pub max_rx_sync_discovery: u16,
    /// Discovery-to-election transition lead time (5 s)
    pub disc_to_erev_interval: u32,
    /// Width of the election and revelation phase windows (0.3 s)
    pub regular_slot_interval: u32,
    /// Width of one convergence/synchronization slot (0.3 s)
    pub cons_ctrl_slot_interval: u32,
    /// Idle residence time after a synchronization round (3 s)
    pub idle_slot_interval: u32,
    /// Base re-broadcast interval, scaled by the node's placing
    pub polite_interval: u32,
    /// Re-announce on the discovery channel while idle, so late joiners
    /// can attach to the formed network
    pub idle_rebroadcast: bool,
    pub gradient: GradientConfig,
    pub byzantine: ByzantineConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            addr: NodeAddr::random(),
            rssi_threshold: RSSI_THRESHOLD,
            max_rx_sync_discovery: MAX_RX_SYNC_DISCOVERY,
            disc_to_erev_interval: secs_to_fine(5.0) as u32,
            regular_slot_interval: secs_to_fine(0.3) as u32,
            cons_ctrl_slot_interval: secs_to_fine(0.3) as u32,
            idle_slot_interval: secs_to_fine(3.0) as u32,
            polite_interval: 4,
            idle_rebroadcast: true,
            gradient: GradientConfig::default(),
            byzantine: ByzantineConfig::default(),
        }
    }
}

/// Input to one machine step
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A scheduler slot crossed its deadline
    TimerFired(TimerSlot),
    /// An announcement arrived from the radio medium
    MessageArrived {
        announcement: Announcement,
        rssi: i16,
        /// Hardware fine stamp taken at packet reception
        rx_timestamp: u32,
    },
    /// Periodic re-broadcast tick of the dissemination layer
    AnnounceTick,
}

/// Pending action of an armed timer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    ElectionRevelation,
    ElectionDeclaration,
    ConnectionRevelation,
    ConnectionDeclaration,
    Convergence,
    ConvergenceSlot,
    ConsensusRevelation,
    ConsensusSynchronization,
    SynchronizationSlot,
    Idle,
    Discovery,
}

/// Slot assignment saved at the first synchronization round and
/// restored for each following control iteration.
#[derive(Debug, Clone, Copy, Default)]
struct SavedSlots {
    proactive_slot: u8,
    cons_slot: u8,
    slot_ack: u8,
    sync_border: bool,
}

/// Per-node protocol state. Owns the logical clock, the neighbor table
/// and the cluster lists; everything the protocol tracks lives here.
pub struct NodeContext {
    config: NodeConfig,
    clock: LogicalClock,
    neighbors: NeighborTable,
    membership: ClusterMembership,
    gradient: GradientSynchronizer,
    guard: ByzantineGuard,

    my_addr: NodeAddr,
    my_state: Phase,
    /// Diverges from `my_state` only while a byzantine alarm is raised
    temp_state: Phase,
    my_degree: u8,
    my_placing: u16,
    synced_counter: u16,

    my_cons_slot: u8,
    my_proactive_slot: u8,
    my_slot_ack: u8,
    this_sync_slot: u8,
    my_sync_border: bool,
    cons_ctrl_counter: u8,
    /// Summed peer address of the bridged head pair, later the address
    /// of the round reference
    ref_n_chb_addr: u16,
    /// Summed degree of the bridged head pair, later the slot cursor of
    /// the synchronization round
    ref_n_chb_degree: u8,
    my_cons_rate: f64,
    /// Local synchronization center of the cluster
    sync_lc_addr: NodeAddr,
    saved: SavedSlots,
    soft_reset_count: u32,

    /// Registered announcement value per channel
    announcements: [Option<AnnouncementValue>; NUM_CHANNELS as usize],
    /// Channels whose re-broadcast was politely cancelled
    muted: [bool; NUM_CHANNELS as usize],
    announce_interval: u32,
    timer_action: [Option<Transition>; 2],
    outbox: Vec<Announcement>,
}

impl NodeContext {
    pub fn new(config: NodeConfig) -> Self {
        let my_addr = config.addr;
        let gradient = GradientSynchronizer::new(config.gradient.clone());
        let guard = ByzantineGuard::new(config.byzantine.clone());
        let announce_interval = config.polite_interval;
        let mut ctx = NodeContext {
            config,
            clock: LogicalClock::default(),
            neighbors: NeighborTable::new(),
            membership: ClusterMembership::new(),
            gradient,
            guard,
            my_addr,
            my_state: Phase::Discovery,
            temp_state: Phase::Discovery,
            my_degree: 0,
            my_placing: 0,
            synced_counter: 0,
            my_cons_slot: 1,
            my_proactive_slot: 1,
            my_slot_ack: 0,
            this_sync_slot: 1,
            my_sync_border: false,
            cons_ctrl_counter: 0,
            ref_n_chb_addr: 0,
            ref_n_chb_degree: 0,
            my_cons_rate: 1.0,
            sync_lc_addr: my_addr,
            saved: SavedSlots::default(),
            soft_reset_count: 0,
            announcements: [None; NUM_CHANNELS as usize],
            muted: [false; NUM_CHANNELS as usize],
            announce_interval,
            timer_action: [None, None],
            outbox: Vec::new(),
        };
        ctx.reset();
        ctx.soft_reset_count = 0;
        ctx
    }

    pub fn addr(&self) -> NodeAddr {
        self.my_addr
    }

    pub fn phase(&self) -> Phase {
        self.my_state
    }

    /// Phase reported to the byzantine sub-protocol; equals [`phase`]
    /// unless an alarm is raised.
    ///
    /// [`phase`]: NodeContext::phase
    pub fn effective_phase(&self) -> Phase {
        self.temp_state
    }

    pub fn role(&self) -> Role {
        self.membership.role
    }

    pub fn degree(&self) -> u8 {
        self.my_degree
    }

    pub fn cons_slot(&self) -> u8 {
        self.my_cons_slot
    }

    pub fn sync_border(&self) -> bool {
        self.my_sync_border
    }

    pub fn soft_reset_count(&self) -> u32 {
        self.soft_reset_count
    }

    /// Current re-broadcast interval for the dissemination layer, in
    /// coarse ticks
    pub fn announce_interval(&self) -> u32 {
        self.announce_interval
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut LogicalClock {
        &mut self.clock
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    pub fn membership(&self) -> &ClusterMembership {
        &self.membership
    }

    /// Value currently registered on an announcement channel
    pub fn registered(&self, channel: Channel) -> Option<&AnnouncementValue> {
        self.announcements[channel.id() as usize].as_ref()
    }

    /// Runs one machine step and returns the announcements to put on
    /// the air.
    pub fn step(&mut self, event: NodeEvent) -> Vec<Announcement> {
        match event {
            NodeEvent::TimerFired(slot) => self.handle_timer(slot),
            NodeEvent::MessageArrived {
                announcement,
                rssi,
                rx_timestamp,
            } => self.handle_message(&announcement, rssi, rx_timestamp),
            NodeEvent::AnnounceTick => self.announce_all(),
        }
        std::mem::take(&mut self.outbox)
    }

    /// Drops all protocol progress but keeps the neighbor table and the
    /// learned topology. Called between control rounds and as the error
    /// fallback.
    pub fn soft_reset(&mut self) {
        self.my_state = Phase::Discovery;
        self.temp_state = Phase::Discovery;
        self.clock.cancel(TimerSlot::Zero);
        self.clock.cancel(TimerSlot::One);
        self.timer_action = [None, None];
        self.synced_counter = 0;
        self.my_proactive_slot = 1;
        self.my_cons_slot = 1;
        self.my_cons_rate = 1.0;
        self.my_slot_ack = 0;
        self.this_sync_slot = 1;
        self.my_sync_border = false;
        self.cons_ctrl_counter = 0;
        self.guard.reset();
        self.soft_reset_count += 1;
        self.announcements = [None; NUM_CHANNELS as usize];
        self.muted = [false; NUM_CHANNELS as usize];
        self.announce_interval = self.config.polite_interval;
        self.set_value(
            Channel::Discovery,
            AnnouncementValue {
                instr: Phase::Discovery.code(),
                degree: self.my_degree,
                date_coarse: 0,
                date_fine: 0,
                ref_addr: self.my_addr,
                cons_rate: 1.0,
            },
        );
        debug!(node = %self.my_addr, count = self.soft_reset_count, "soft reset");
    }

    /// Full reset: also forgets neighbors, cluster lists and the role.
    pub fn reset(&mut self) {
        self.neighbors.clear();
        self.membership.clear();
        self.my_degree = 0;
        self.my_placing = 0;
        self.ref_n_chb_addr = 0;
        self.ref_n_chb_degree = 0;
        self.sync_lc_addr = self.my_addr;
        self.soft_reset();
    }

    // announcement registry

    fn chan(channel: Channel) -> usize {
        channel.id() as usize
    }

    fn set_value(&mut self, channel: Channel, value: AnnouncementValue) {
        self.announcements[Self::chan(channel)] = Some(value);
        self.muted[Self::chan(channel)] = false;
    }

    fn update_value<F: FnOnce(&mut AnnouncementValue)>(&mut self, channel: Channel, f: F) {
        if let Some(v) = self.announcements[Self::chan(channel)].as_mut() {
            f(v);
        }
    }

    fn remove_value(&mut self, channel: Channel) {
        self.announcements[Self::chan(channel)] = None;
        self.muted[Self::chan(channel)] = false;
    }

    /// Stops re-broadcasting the registered value without dropping it;
    /// a later bump or re-registration unmutes the channel.
    fn polite_cancel(&mut self, channel: Channel) {
        self.muted[Self::chan(channel)] = true;
    }

    /// Pushes the registered value of `channel` to the outbox
    /// immediately.
    fn bump(&mut self, channel: Channel) {
        let Some(value) = self.announcements[Self::chan(channel)] else {
            return;
        };
        self.muted[Self::chan(channel)] = false;
        let frame = self.capture_frame();
        self.outbox.push(Announcement {
            channel,
            from: self.my_addr,
            value,
            frame,
        });
    }

    fn announce_all(&mut self) {
        for id in 0..NUM_CHANNELS {
            let Some(channel) = Channel::from_id(id) else {
                continue;
            };
            if !self.muted[id as usize] && self.announcements[id as usize].is_some() {
                self.bump(channel);
            }
        }
    }

    /// Clock capture attached to every outgoing announcement. The MAC
    /// transmit stamp is overwritten by the radio layer on the way out.
    fn capture_frame(&mut self) -> TimesyncFrame {
        let hw = self.clock.hw_now();
        TimesyncFrame {
            coarse_now: hw.coarse,
            fine_offset: self.clock.fine_offset(),
            clock_rate: self.clock.rate(),
            avg_rate: self.clock.avg_rate(),
            ta: hw.fine,
            tb: hw.fine,
            hw_mac_timestamp: hw.fine,
        }
    }

    // timer plumbing

    /// Arms slot zero with a deadline and the transition to run at it.
    /// A slot parked in single-pass state keeps both its deadline and
    /// its pending transition.
    fn arm(&mut self, mode: ScheduleMode, action: Transition) -> bool {
        let flip = self.clock.timer_state(SLOT) == TimerState::SinglePass;
        match self.clock.schedule(SLOT, mode) {
            Ok(()) => {
                if !flip {
                    self.timer_action[SLOT.index()] = Some(action);
                }
                true
            }
            Err(e) => {
                trace!(node = %self.my_addr, ?action, %e, "schedule refused");
                false
            }
        }
    }

    fn handle_timer(&mut self, slot: TimerSlot) {
        if slot != SLOT {
            return;
        }
        let Some(action) = self.timer_action[slot.index()] else {
            return;
        };
        self.apply_transition(action);
    }

    fn apply_transition(&mut self, t: Transition) {
        trace!(node = %self.my_addr, ?t, state = ?self.my_state, "transition");
        match t {
            Transition::ElectionRevelation => {
                self.remove_value(Channel::Discovery);
                self.clock.set_schedule_ref(SLOT);
                self.my_state = Phase::ElectionRevelation;
                self.temp_state = self.my_state;
                self.sync_lc_addr = self.my_addr;
                self.poll_election_chain();
            }
            Transition::ElectionDeclaration => {
                self.remove_value(Channel::Revelation);
                self.my_placing =
                    neighborhood_placing(&self.neighbors, self.my_addr, self.my_degree);
                self.announce_interval = self.config.polite_interval * self.my_placing.max(1) as u32;
                self.clock.set_schedule_ref(SLOT);
                self.my_state = Phase::ElectionDeclaration;
                self.temp_state = self.my_state;
                self.poll_election_chain();
            }
            Transition::ConnectionRevelation => {
                self.remove_value(Channel::Declaration);
                self.clock.set_schedule_ref(SLOT);
                self.my_state = Phase::ConnectionRevelation;
                self.temp_state = self.my_state;
                self.poll_election_chain();
            }
            Transition::ConnectionDeclaration => {
                self.remove_value(Channel::Revelation);
                self.clock.set_schedule_ref(SLOT);
                self.my_state = Phase::ConnectionDeclaration;
                self.temp_state = self.my_state;
                self.poll_election_chain();
            }
            Transition::Convergence => {
                self.remove_value(Channel::Declaration);
                self.clock.set_schedule_ref(SLOT);
                self.my_state = Phase::ConsensusConvergence;
                self.temp_state = self.my_state;
                self.begin_convergence();
            }
            Transition::ConvergenceSlot => {
                if self.my_cons_slot < NUM_CONS_SLOTS {
                    self.after_convergence_slot();
                } else {
                    self.apply_transition(Transition::ConsensusRevelation);
                }
            }
            Transition::ConsensusRevelation => {
                self.remove_value(Channel::Convergence);
                self.announce_interval = self.config.polite_interval;
                self.clock.set_schedule_ref(SLOT);
                self.my_state = Phase::ConsensusRevelation;
                self.temp_state = self.my_state;
                self.revelation_block();
            }
            Transition::ConsensusSynchronization => {
                self.remove_value(Channel::Revelation);
                self.clock.set_schedule_ref(SLOT);
                self.my_state = Phase::ConsensusSynchronization;
                self.temp_state = self.my_state;
                self.begin_sync_round();
            }
            Transition::SynchronizationSlot => {
                if (self.ref_n_chb_degree as i32) - 1 < NUM_CONS_SLOTS as i32 {
                    self.after_sync_slot();
                } else {
                    self.apply_transition(Transition::Idle);
                }
            }
            Transition::Idle => {
                let base = self.registered(Channel::Synchronization).map(|v| v.date());
                self.remove_value(Channel::Synchronization);
                self.clock.set_schedule_ref(SLOT);
                self.my_state = Phase::Idle;
                self.temp_state = self.my_state;
                self.begin_idle(base);
            }
            Transition::Discovery => {
                self.clock.set_schedule_ref(SLOT);
                self.after_idle();
            }
        }
    }

    // election chain

    /// The election and connection phase bodies. Mirrors a
    /// fall-through switch: a phase whose window cannot be armed hands
    /// straight over to the next phase body.
    fn poll_election_chain(&mut self) {
        let mut stage = self.my_state;
        loop {
            match stage {
                Phase::ElectionRevelation => {
                    if self.arm(
                        ScheduleMode::IntervalRef(self.config.regular_slot_interval),
                        Transition::ElectionDeclaration,
                    ) {
                        let date = self.clock.lg_deadline(SLOT);
                        self.set_value(
                            Channel::Revelation,
                            AnnouncementValue {
                                instr: self.my_state.code(),
                                degree: self.my_degree,
                                date_coarse: date.coarse,
                                date_fine: date.fine,
                                ref_addr: self.my_addr,
                                cons_rate: 1.0,
                            },
                        );
                        self.bump(Channel::Revelation);
                        return;
                    }
                    stage = Phase::ElectionDeclaration;
                }
                Phase::ElectionDeclaration => {
                    if self.arm(
                        ScheduleMode::IntervalRef(self.config.regular_slot_interval),
                        Transition::ConnectionRevelation,
                    ) {
                        let date = self.clock.lg_deadline(SLOT);
                        self.set_value(
                            Channel::Declaration,
                            AnnouncementValue {
                                instr: self.my_state.code(),
                                degree: self.my_degree,
                                date_coarse: date.coarse,
                                date_fine: date.fine,
                                ref_addr: self.my_addr,
                                cons_rate: 1.0,
                            },
                        );
                        self.bump(Channel::Declaration);
                        return;
                    }
                    stage = Phase::ConnectionRevelation;
                }
                Phase::ConnectionRevelation => {
                    if self.arm(
                        ScheduleMode::IntervalRef(self.config.regular_slot_interval),
                        Transition::ConnectionDeclaration,
                    ) && self.membership.heads().len() > 1
                        && self.membership.role == Role::Commoner
                    {
                        // heard two heads: this node becomes their bridge
                        self.membership.role = Role::ClusterBridge;
                        let chb = self.membership.chb_placing(self.my_addr, self.my_degree);
                        self.my_placing = self.my_placing.saturating_sub(chb as u16);
                        let h0 = self.membership.heads()[0];
                        let h1 = self.membership.heads()[1];
                        self.ref_n_chb_addr = h0.addr.0.wrapping_add(h1.addr.0);
                        self.ref_n_chb_degree = h0.degree.wrapping_add(h1.degree);
                        let date = self.clock.lg_deadline(SLOT);
                        self.set_value(
                            Channel::Revelation,
                            AnnouncementValue {
                                instr: self.my_state.code(),
                                degree: self.my_degree,
                                date_coarse: date.coarse,
                                date_fine: date.fine,
                                ref_addr: NodeAddr(self.ref_n_chb_addr),
                                cons_rate: 1.0,
                            },
                        );
                        self.bump(Channel::Revelation);
                    }
                    // a convergence date adopted from a declaration is
                    // already pending: keep it and run the declaration
                    // body immediately
                    if self.timer_action[SLOT.index()] == Some(Transition::Convergence) {
                        self.clock.set_singlepass(SLOT);
                        stage = Phase::ConnectionDeclaration;
                        continue;
                    }
                    return;
                }
                Phase::ConnectionDeclaration => {
                    if self.arm(
                        ScheduleMode::IntervalRef(self.config.regular_slot_interval),
                        Transition::Convergence,
                    ) && self.membership.role == Role::ClusterBridge
                    {
                        let date = self.clock.lg_deadline(SLOT);
                        self.set_value(
                            Channel::Declaration,
                            AnnouncementValue {
                                instr: self.my_state.code(),
                                degree: self.ref_n_chb_degree,
                                date_coarse: date.coarse,
                                date_fine: date.fine,
                                ref_addr: NodeAddr(self.ref_n_chb_addr),
                                cons_rate: 1.0,
                            },
                        );
                        self.bump(Channel::Declaration);
                    }
                    return;
                }
                _ => return,
            }
        }
    }

    // consensus convergence

    fn begin_convergence(&mut self) {
        if self.cons_ctrl_counter > 0 {
            self.my_proactive_slot = 1;
            self.my_cons_slot = 1;
            self.my_slot_ack = 0;
            self.this_sync_slot = 1;
            self.my_sync_border = false;
            for h in self.membership.heads_mut() {
                h.cons_slot = 0;
            }
        }
        let window = self.config.cons_ctrl_slot_interval * NUM_CONS_SLOTS as u32;
        if !self.arm(ScheduleMode::IntervalRef(window), Transition::ConsensusRevelation) {
            return;
        }
        let date = self.clock.lg_deadline(SLOT);
        self.set_value(
            Channel::Convergence,
            AnnouncementValue {
                instr: self.my_state.code(),
                degree: 0,
                date_coarse: date.coarse,
                date_fine: date.fine,
                ref_addr: self.my_addr,
                cons_rate: 1.0,
            },
        );
        if self.membership.role == Role::ClusterHead {
            self.my_proactive_slot = self.membership.rebuild_heads();
            self.my_placing = self.membership.chb_placing(self.my_addr, self.my_degree) as u16;
        }
        if self.membership.role != Role::Commoner {
            self.convergence_slot_arm();
        }
    }

    /// Arms the next convergence slot. Heads claim their slot when it
    /// comes up unacknowledged; bridges open each slot with a cleared
    /// acknowledgement.
    fn convergence_slot_arm(&mut self) {
        while self.my_cons_slot <= NUM_CONS_SLOTS {
            let mut unclaimed = 0usize;
            if self.membership.role == Role::ClusterHead {
                if self.membership.heads().is_empty() {
                    return;
                }
                unclaimed = self
                    .membership
                    .heads()
                    .iter()
                    .filter(|h| h.cons_slot == 0)
                    .count();
            }
            let interval = self.config.cons_ctrl_slot_interval * self.my_cons_slot as u32;
            if self.arm(ScheduleMode::IntervalRef(interval), Transition::ConvergenceSlot) {
                match self.membership.role {
                    Role::ClusterBridge => self.my_slot_ack = 0,
                    Role::ClusterHead => {
                        if self.my_slot_ack == 0
                            && (unclaimed <= 1 || self.my_cons_slot == self.my_proactive_slot)
                        {
                            if unclaimed > 1 {
                                self.update_value(Channel::Convergence, |v| {
                                    v.instr = INSTR_CONVERGENCE_PROACTIVE;
                                });
                            }
                            let degree = self.my_cons_slot;
                            self.update_value(Channel::Convergence, |v| v.degree = degree);
                            self.bump(Channel::Convergence);
                        }
                    }
                    Role::Commoner => {}
                }
                return;
            }
            self.my_cons_slot += 1;
        }
    }

    /// Resumes after a convergence slot expired: a bridge checks
    /// whether every head claimed a slot and either closes the
    /// negotiation or moves to the next slot.
    fn after_convergence_slot(&mut self) {
        if self.membership.role == Role::ClusterBridge {
            let mut ack = self.my_slot_ack;
            for h in self.membership.heads() {
                ack = ack.wrapping_mul(h.cons_slot);
            }
            self.my_slot_ack = ack;
        }
        if self.my_slot_ack != 0 {
            let window = self.config.cons_ctrl_slot_interval * NUM_CONS_SLOTS as u32;
            if self.arm(ScheduleMode::IntervalRef(window), Transition::ConsensusRevelation) {
                return;
            }
        }
        self.my_cons_slot += 1;
        self.convergence_slot_arm();
    }

    fn revelation_block(&mut self) {
        if !self.arm(
            ScheduleMode::IntervalRef(self.config.regular_slot_interval),
            Transition::ConsensusSynchronization,
        ) {
            return;
        }
        if self.membership.role == Role::ClusterHead {
            let date = self.clock.lg_deadline(SLOT);
            self.set_value(
                Channel::Revelation,
                AnnouncementValue {
                    instr: self.my_state.code(),
                    degree: self.my_cons_slot,
                    date_coarse: date.coarse,
                    date_fine: date.fine,
                    ref_addr: self.my_addr,
                    cons_rate: 1.0,
                },
            );
            self.bump(Channel::Revelation);
        }
    }

    // synchronization round

    fn begin_sync_round(&mut self) {
        if self.cons_ctrl_counter > 0 {
            self.my_proactive_slot = self.saved.proactive_slot;
            self.my_cons_slot = self.saved.cons_slot;
            self.my_slot_ack = self.saved.slot_ack;
            self.this_sync_slot = 1;
            self.my_sync_border = self.saved.sync_border;
            for h in self.membership.heads_mut() {
                h.cons_slot = (NUM_CONS_SLOTS + 1).wrapping_sub(h.cons_slot);
            }
        } else {
            self.saved = SavedSlots {
                proactive_slot: self.my_proactive_slot,
                cons_slot: self.my_cons_slot,
                slot_ack: self.my_slot_ack,
                sync_border: self.my_sync_border,
            };
        }

        let window = self.config.cons_ctrl_slot_interval * NUM_CONS_SLOTS as u32;
        if !self.arm(ScheduleMode::IntervalRef(window), Transition::Idle) {
            return;
        }
        let schedule = self.membership.init_sync(self.my_addr, self.my_cons_slot);
        self.my_cons_slot = schedule.cons_slot;
        self.ref_n_chb_addr = schedule.ref_addr.0;
        self.ref_n_chb_degree = schedule.ref_degree;
        self.my_sync_border = schedule.sync_border;
        self.update_local_center();

        let date = self.clock.lg_deadline(SLOT);
        self.set_value(
            Channel::Synchronization,
            AnnouncementValue {
                instr: self.my_state.code(),
                degree: self.my_cons_slot,
                date_coarse: date.coarse,
                date_fine: date.fine,
                ref_addr: self.my_addr,
                cons_rate: 1.0,
            },
        );
        self.sync_slot_arm();
    }

    fn update_local_center(&mut self) {
        let mut lc = self.sync_lc_addr;
        for h in self.membership.heads() {
            if h.cons_slot >= self.my_cons_slot {
                lc = h.addr;
            }
        }
        self.sync_lc_addr = lc;
    }

    fn sync_slot_arm(&mut self) {
        loop {
            let k = self.ref_n_chb_degree as i32 - 1;
            if k > NUM_CONS_SLOTS as i32 {
                return;
            }
            if k >= 0 {
                let interval = self.config.cons_ctrl_slot_interval * k as u32;
                if self.arm(ScheduleMode::IntervalRef(interval), Transition::SynchronizationSlot) {
                    return;
                }
            }
            self.ref_n_chb_degree = self.ref_n_chb_degree.wrapping_add(1);
        }
    }

    /// Resumes after a synchronization slot: the round opener emits its
    /// consensus value when its own slot comes up, then the cursor
    /// moves to the next slot.
    fn after_sync_slot(&mut self) {
        self.this_sync_slot = self.ref_n_chb_degree;
        if self.my_sync_border && self.this_sync_slot == self.my_cons_slot {
            let degree = self.my_cons_slot;
            let rate = self.my_cons_rate;
            self.update_value(Channel::Synchronization, |v| {
                v.degree = degree;
                v.cons_rate = rate;
            });
            self.bump(Channel::Synchronization);
            self.my_sync_border = false;
        }
        self.ref_n_chb_degree = self.ref_n_chb_degree.wrapping_add(1);
        self.sync_slot_arm();
    }

    fn begin_idle(&mut self, sync_date: Option<LogicalDate>) {
        if sync_date.is_none() {
            warn!(node = %self.my_addr, "idle entered without a synchronization date");
            self.soft_reset();
            return;
        }
        // the deadline of the just-fired synchronization window is the
        // schedule reference, so the idle window anchors at the round date
        if !self.arm(
            ScheduleMode::IntervalRef(self.config.idle_slot_interval),
            Transition::Discovery,
        ) {
            self.soft_reset();
            return;
        }
        if self.config.idle_rebroadcast {
            let date = self.clock.lg_deadline(SLOT);
            self.set_value(
                Channel::Discovery,
                AnnouncementValue {
                    instr: self.my_state.code(),
                    degree: self.cons_ctrl_counter,
                    date_coarse: date.coarse,
                    date_fine: date.fine,
                    ref_addr: self.my_addr,
                    cons_rate: 1.0,
                },
            );
            self.bump(Channel::Discovery);
        }
    }

    fn after_idle(&mut self) {
        self.remove_value(Channel::Discovery);
        self.cons_ctrl_counter += 1;
        if self.cons_ctrl_counter < NUM_CONS_CTRL_ITERATIONS {
            self.my_state = Phase::ConsensusSynchronization;
            self.temp_state = self.my_state;
            self.begin_sync_round();
        } else {
            self.soft_reset();
        }
    }

    // message path

    fn handle_message(&mut self, ann: &Announcement, rssi: i16, rx_timestamp: u32) {
        if rssi < self.config.rssi_threshold {
            trace!(node = %self.my_addr, from = %ann.from, rssi, "below signal threshold");
            return;
        }
        if ann.from == self.my_addr {
            return;
        }
        let Some(idx) = self.observe(ann, rx_timestamp) else {
            return;
        };
        let synced = self.neighbors.get(idx).synced;
        let value = ann.value;
        match ann.channel {
            Channel::Discovery => {
                if synced {
                    self.synced_counter += 1;
                }
                self.on_discovery(idx, value);
            }
            Channel::Revelation if synced => self.on_revelation(idx, value),
            Channel::Declaration if synced => self.on_declaration(idx, value),
            Channel::Convergence if synced => self.on_convergence(idx, value),
            Channel::Synchronization if synced => self.on_synchronization(idx, value),
            _ => {}
        }
    }

    /// Folds a received announcement into the neighbor table: clock
    /// capture, announced phase and degree. While idle only the clock
    /// capture is taken. Returns the neighbor index, or `None` when the
    /// table is full.
    fn observe(&mut self, ann: &Announcement, rx_timestamp: u32) -> Option<usize> {
        let value = ann.value;
        if let Some(idx) = self.neighbors.find(ann.from) {
            self.gradient.record(
                self.neighbors.get_mut(idx),
                &ann.frame,
                rx_timestamp,
                &mut self.clock,
                false,
            );
            if self.my_state == Phase::Idle {
                return Some(idx);
            }
            if let Some(phase) = value.sender_phase() {
                self.neighbors.get_mut(idx).state = phase;
                if (self.my_state < Phase::ConsensusSynchronization && phase == self.my_state)
                    || self.my_state == Phase::Discovery
                {
                    self.gradient
                        .consensus_step(&mut self.neighbors, &mut self.clock, self.my_state);
                }
            }
            if self.my_state < Phase::ConnectionDeclaration {
                self.neighbors.get_mut(idx).degree = value.degree;
            }
            Some(idx)
        } else {
            let idx = match self.neighbors.insert(ann.from) {
                Ok(idx) => idx,
                Err(e) => {
                    trace!(node = %self.my_addr, neighbor = %ann.from, %e, "announcement dropped");
                    return None;
                }
            };
            {
                let n = self.neighbors.get_mut(idx);
                if self.my_state < Phase::ConnectionDeclaration {
                    n.degree = value.degree;
                }
                n.role = Role::Commoner;
                if let Some(phase) = value.sender_phase() {
                    n.state = phase;
                }
            }
            self.gradient.record(
                self.neighbors.get_mut(idx),
                &ann.frame,
                rx_timestamp,
                &mut self.clock,
                true,
            );
            self.my_degree = self.my_degree.saturating_add(1);
            let degree = self.my_degree;
            self.update_value(Channel::Discovery, |v| v.degree = degree);
            debug!(node = %self.my_addr, neighbor = %ann.from, degree, "neighbor added");
            Some(idx)
        }
    }

    fn on_discovery(&mut self, _idx: usize, value: AnnouncementValue) {
        if self.my_state != Phase::Discovery {
            return;
        }

        let all_synced =
            self.neighbors.all_synced() && self.neighbors.iter().all(|n| n.state == Phase::Discovery);
        if !all_synced {
            self.update_value(Channel::Discovery, |v| v.instr = Phase::Discovery.code());
            self.synced_counter = 0;
        }
        let own_instr = self
            .registered(Channel::Discovery)
            .map(|v| v.instr)
            .unwrap_or_else(|| Phase::Discovery.code());

        if value.instr == self.my_state.code()
            && own_instr == Phase::Discovery.code()
            && self.synced_counter >= self.config.max_rx_sync_discovery
        {
            // neighborhood is settled: announce the transition date
            if self.arm(
                ScheduleMode::IntervalNow(self.config.disc_to_erev_interval),
                Transition::ElectionRevelation,
            ) {
                let date = self.clock.lg_deadline(SLOT);
                self.update_value(Channel::Discovery, |v| {
                    v.instr = INSTR_DISC_TO_EREV;
                    v.set_date(date);
                });
                debug!(node = %self.my_addr, ?date, "leaving discovery");
            }
        } else if value.instr == INSTR_DISC_TO_EREV {
            // adopt the announced transition date when ours is earlier
            // or none is pending
            match self.clock.deadline_cmp(SLOT, value.date()) {
                Some(Ordering::Less) | None => {
                    if self.arm(ScheduleMode::Date(value.date()), Transition::ElectionRevelation) {
                        let date = value.date();
                        self.update_value(Channel::Discovery, |v| {
                            v.instr = INSTR_DISC_TO_EREV;
                            v.set_date(date);
                        });
                    } else {
                        self.clock.cancel(SLOT);
                        self.timer_action[SLOT.index()] = None;
                        self.update_value(Channel::Discovery, |v| {
                            v.instr = Phase::Discovery.code()
                        });
                        self.synced_counter = 0;
                    }
                }
                _ => {}
            }
        }
    }

    fn on_revelation(&mut self, idx: usize, value: AnnouncementValue) {
        let n_addr = self.neighbors.get(idx).addr;
        let n_degree = self.neighbors.get(idx).degree;
        match self.my_state {
            Phase::Discovery => {
                if value.instr == Phase::ElectionRevelation.code() {
                    let outranked = n_degree > self.my_degree
                        || (n_degree == self.my_degree && n_addr.0 > self.my_addr.0);
                    if outranked
                        && self.arm(
                            ScheduleMode::Date(value.date()),
                            Transition::ConnectionRevelation,
                        )
                    {
                        self.clock.set_singlepass(SLOT);
                        self.apply_transition(Transition::ElectionRevelation);
                    }
                } else if value.instr == Phase::ConnectionRevelation.code() {
                    self.membership.role = Role::Commoner;
                    if self.arm(
                        ScheduleMode::Date(value.date()),
                        Transition::ConsensusSynchronization,
                    ) {
                        self.clock.set_singlepass(SLOT);
                        self.remove_value(Channel::Discovery);
                        self.apply_transition(Transition::ConnectionRevelation);
                    }
                } else if value.instr == Phase::ConsensusRevelation.code() {
                    // late joiner attaching during a running consensus
                    self.membership.role = Role::Commoner;
                    if self.arm(
                        ScheduleMode::Date(value.date()),
                        Transition::ConsensusSynchronization,
                    ) {
                        self.clock.set_singlepass(SLOT);
                        self.remove_value(Channel::Discovery);
                        if self.membership.heads().is_empty() {
                            self.membership.push_head(ClusterEntry {
                                addr: n_addr,
                                degree: value.degree,
                                cons_slot: value.degree,
                                peer_a: value.ref_addr.0,
                                peer_b: 0,
                            });
                        } else if let Some(h) = self.membership.head_of_mut(n_addr) {
                            h.cons_slot = value.degree;
                        }
                        self.my_cons_slot = value.degree;
                        self.apply_transition(Transition::ConsensusRevelation);
                    }
                }
            }
            Phase::ElectionRevelation if value.instr == self.my_state.code() => {
                let outranked = n_degree > self.my_degree
                    || (n_degree == self.my_degree && n_addr.0 > self.my_addr.0);
                if outranked {
                    // yield the election to the better candidate
                    self.polite_cancel(Channel::Revelation);
                }
            }
            Phase::ConsensusConvergence if value.instr == Phase::ConsensusRevelation.code() => {
                if self.arm(
                    ScheduleMode::Date(value.date()),
                    Transition::ConsensusSynchronization,
                ) {
                    self.clock.set_singlepass(SLOT);
                    if self.membership.role == Role::ClusterHead
                        && self.membership.bridges().is_empty()
                    {
                        self.membership.record(
                            self.my_state,
                            self.my_addr,
                            self.my_degree,
                            &value,
                            self.neighbors.get(idx),
                        );
                        if let Some(h) = self.membership.head_of_mut(n_addr) {
                            h.cons_slot = value.degree;
                        }
                        self.my_cons_slot = value.degree;
                    }
                    self.my_cons_slot = NUM_CONS_SLOTS + 1;
                    self.my_slot_ack = 0;
                    self.apply_transition(Transition::ConsensusRevelation);
                }
            }
            Phase::ConsensusRevelation if value.instr == self.my_state.code() => {
                if self.membership.role == Role::Commoner {
                    if let Some(h) = self.membership.head_of_mut(n_addr) {
                        h.cons_slot = value.degree;
                        self.my_cons_slot = value.degree;
                    }
                }
            }
            _ => {}
        }
    }

    fn on_declaration(&mut self, idx: usize, value: AnnouncementValue) {
        let n_addr = self.neighbors.get(idx).addr;
        let n_degree = self.neighbors.get(idx).degree;
        match self.my_state {
            Phase::Discovery => {
                self.membership.role = Role::Commoner;
                self.remove_value(Channel::Discovery);
                if value.instr == Phase::ConnectionDeclaration.code() {
                    self.my_state = Phase::ConnectionDeclaration;
                    self.temp_state = self.my_state;
                    self.poll_election_chain();
                } else if value.instr == Phase::ElectionDeclaration.code()
                    && self.arm(
                        ScheduleMode::Date(value.date()),
                        Transition::ConnectionRevelation,
                    )
                {
                    self.clock.set_singlepass(SLOT);
                    self.apply_transition(Transition::ElectionDeclaration);
                }
            }
            Phase::ElectionRevelation if value.instr == Phase::ElectionDeclaration.code() => {
                if self.arm(
                    ScheduleMode::Date(value.date()),
                    Transition::ConnectionRevelation,
                ) {
                    self.clock.set_singlepass(SLOT);
                    self.apply_transition(Transition::ElectionDeclaration);
                }
            }
            Phase::ElectionDeclaration => {
                if value.instr == self.my_state.code() {
                    let outranked = n_degree > self.my_degree
                        || (n_degree == self.my_degree && n_addr.0 > self.my_addr.0);
                    if outranked {
                        self.polite_cancel(Channel::Declaration);
                        let recorded = self.membership.record(
                            self.my_state,
                            self.my_addr,
                            self.my_degree,
                            &value,
                            self.neighbors.get(idx),
                        );
                        if !recorded {
                            self.bump(Channel::Declaration);
                        }
                    }
                } else if value.instr == Phase::ConnectionDeclaration.code()
                    && self.arm(ScheduleMode::Date(value.date()), Transition::Convergence)
                {
                    self.clock.set_singlepass(SLOT);
                    self.membership.clear_heads();
                    self.apply_transition(Transition::ConnectionRevelation);
                }
            }
            Phase::ConnectionDeclaration if value.instr == self.my_state.code() => {
                if self.membership.role == Role::ClusterHead {
                    self.membership.record(
                        self.my_state,
                        self.my_addr,
                        self.my_degree,
                        &value,
                        self.neighbors.get(idx),
                    );
                }
            }
            _ => {}
        }
    }

    fn on_convergence(&mut self, idx: usize, value: AnnouncementValue) {
        let n_addr = self.neighbors.get(idx).addr;
        match self.my_state {
            Phase::ConnectionDeclaration if value.instr == Phase::ConsensusConvergence.code() => {
                if self.arm(
                    ScheduleMode::Date(value.date()),
                    Transition::ConsensusRevelation,
                ) {
                    self.clock.set_singlepass(SLOT);
                    if self.membership.role == Role::ClusterHead {
                        self.membership.role = Role::Commoner;
                        self.membership.clear_bridges();
                        self.membership.record(
                            self.my_state,
                            self.my_addr,
                            self.my_degree,
                            &value,
                            self.neighbors.get(idx),
                        );
                    }
                    self.apply_transition(Transition::Convergence);
                }
            }
            Phase::ConsensusConvergence
                if value.instr == self.my_state.code()
                    || value.instr == INSTR_CONVERGENCE_PROACTIVE =>
            {
                let sender_role = self.membership.role_of(n_addr);
                if let Some(r) = sender_role {
                    self.neighbors.set_role(n_addr, r);
                } else {
                    // unknown peer: a head without bridges records it
                    if self.membership.role == Role::ClusterHead
                        && self.membership.bridges().is_empty()
                    {
                        self.membership.record(
                            self.my_state,
                            self.my_addr,
                            self.my_degree,
                            &value,
                            self.neighbors.get(idx),
                        );
                    }
                    return;
                }
                match self.membership.role {
                    Role::ClusterBridge => {
                        let should_ack = self
                            .membership
                            .head_of(n_addr)
                            .map_or(false, |h| h.cons_slot == 0)
                            && self.my_cons_slot == value.degree
                            && self.my_slot_ack == 0;
                        if should_ack {
                            self.my_slot_ack = 1;
                            if let Some(h) = self.membership.head_of_mut(n_addr) {
                                h.cons_slot = value.degree;
                            }
                            // bounce the claim back with the head's
                            // address as the acknowledged reference
                            let (instr, degree) = (value.instr, value.degree);
                            self.update_value(Channel::Convergence, |v| {
                                v.instr = instr;
                                v.degree = degree;
                                v.ref_addr = n_addr;
                            });
                            self.bump(Channel::Convergence);
                        }
                    }
                    Role::ClusterHead => {
                        if value.ref_addr == self.my_addr {
                            // our claim came back acknowledged
                            self.my_cons_slot = value.degree;
                            self.my_slot_ack = 1;
                            return;
                        }
                        self.polite_cancel(Channel::Convergence);
                        if let Some(h) = self.membership.head_of_mut(value.ref_addr) {
                            h.cons_slot = value.degree;
                        }
                    }
                    Role::Commoner => {}
                }
            }
            Phase::ConsensusSynchronization
                if value.instr == Phase::ConsensusConvergence.code() =>
            {
                // a neighboring cluster restarted its negotiation
                self.my_sync_border = false;
                if self.arm(
                    ScheduleMode::Date(value.date()),
                    Transition::ConsensusRevelation,
                ) {
                    self.clock.set_singlepass(SLOT);
                    self.ref_n_chb_degree = NUM_CONS_SLOTS + 3;
                    if self.membership.role == Role::ClusterHead {
                        self.membership.role = Role::Commoner;
                        self.membership.clear_bridges();
                    }
                }
            }
            _ => {}
        }
    }

    fn on_synchronization(&mut self, idx: usize, value: AnnouncementValue) {
        // our own reference reflected back by a neighbor is not a
        // foreign round
        if value.ref_addr == self.my_addr {
            return;
        }
        let n_addr = self.neighbors.get(idx).addr;
        match self.my_state {
            Phase::Discovery => {
                // late joiner hearing a running synchronization round
                self.membership.role = Role::Commoner;
                self.remove_value(Channel::Discovery);
                if self.arm(ScheduleMode::Date(value.date()), Transition::Idle) {
                    self.clock.set_singlepass(SLOT);
                    if !self.membership.heads().is_empty() {
                        self.membership.push_head(ClusterEntry {
                            addr: n_addr,
                            degree: value.degree,
                            cons_slot: value.degree,
                            peer_a: value.ref_addr.0,
                            peer_b: 0,
                        });
                    }
                    self.my_cons_slot = value.degree;
                    self.trusted_synchronization(idx, value.ref_addr, value.cons_rate);
                    self.my_sync_border = false;
                    self.set_value(
                        Channel::Synchronization,
                        AnnouncementValue {
                            instr: Phase::ConsensusSynchronization.code(),
                            degree: value.degree,
                            date_coarse: value.date_coarse,
                            date_fine: value.date_fine,
                            ref_addr: value.ref_addr,
                            cons_rate: 1.0,
                        },
                    );
                }
            }
            Phase::ConsensusRevelation
                if value.instr == Phase::ConsensusSynchronization.code() =>
            {
                if self.arm(ScheduleMode::Date(value.date()), Transition::Idle) {
                    self.clock.set_singlepass(SLOT);
                    if self.membership.role == Role::ClusterHead
                        && self.membership.bridges().is_empty()
                    {
                        if let Some(h) = self.membership.head_of_mut(n_addr) {
                            h.cons_slot = value.degree;
                        }
                    }
                    self.apply_transition(Transition::ConsensusSynchronization);
                }
            }
            Phase::ConsensusSynchronization => {
                if value.instr == Phase::ConsensusSynchronization.code() {
                    self.on_sync_slot_announcement(idx, value);
                } else if value.instr == Phase::ByzantineConsensus.code() {
                    self.on_byzantine_announcement(idx, value);
                }
            }
            _ => {}
        }
    }

    /// Regular slot announcement during the synchronization round.
    fn on_sync_slot_announcement(&mut self, idx: usize, value: AnnouncementValue) {
        let n_addr = self.neighbors.get(idx).addr;
        if self.membership.is_blacklisted(n_addr) {
            debug!(node = %self.my_addr, peer = %n_addr, "blacklisted peer ignored");
            return;
        }
        match self.membership.role {
            Role::ClusterBridge => {
                let within = self.guard.within_limits(self.neighbors.get(idx));
                if self.my_cons_slot > self.this_sync_slot {
                    if within {
                        self.trusted_synchronization(idx, value.ref_addr, value.cons_rate);
                        self.my_cons_slot =
                            self.membership.next_sync_slot(value.ref_addr, self.my_cons_slot);
                        self.my_sync_border = true;
                    } else {
                        if let Err(e) = self.membership.add_to_blacklist(n_addr) {
                            warn!(node = %self.my_addr, peer = %n_addr, %e, "blacklist refused");
                        }
                        self.my_sync_border = true;
                        self.raise_alarm();
                        return;
                    }
                } else if self.my_cons_slot == self.this_sync_slot {
                    if !within {
                        if let Err(e) = self.membership.add_to_blacklist(n_addr) {
                            warn!(node = %self.my_addr, peer = %n_addr, %e, "blacklist refused");
                        }
                        self.my_sync_border = true;
                        self.raise_alarm();
                        return;
                    }
                    // a peer covered our slot
                    self.polite_cancel(Channel::Synchronization);
                    self.my_sync_border = true;
                }
                self.mirror_sync_value(value, true);
            }
            Role::ClusterHead => {
                self.mirror_sync_value(value, false);
                if self.this_sync_slot == self.my_cons_slot && !self.my_sync_border {
                    self.trusted_synchronization(idx, value.ref_addr, value.cons_rate);
                    self.bump(Channel::Synchronization);
                    self.my_sync_border = true;
                } else {
                    self.trusted_synchronization(idx, value.ref_addr, value.cons_rate);
                }
            }
            Role::Commoner => {
                if self.this_sync_slot == self.my_cons_slot {
                    self.mirror_sync_value(value, true);
                    self.trusted_synchronization(idx, value.ref_addr, value.cons_rate);
                }
            }
        }
    }

    /// Alarm announcement of the byzantine recovery sub-protocol.
    fn on_byzantine_announcement(&mut self, idx: usize, value: AnnouncementValue) {
        let n_addr = self.neighbors.get(idx).addr;
        if self.membership.is_blacklisted(n_addr) {
            return;
        }

        if self.temp_state == Phase::ByzantineConsensus {
            // alarm already raised here: count the echo, clear at quorum
            if matches!(
                self.membership.role,
                Role::Commoner | Role::ClusterBridge
            ) {
                self.guard.record_echo();
                if self.guard.quorum_reached(self.my_degree) {
                    self.polite_cancel(Channel::Synchronization);
                    self.my_sync_border = false;
                    self.clear_alarm();
                } else {
                    let (date, r) = (value.date(), value.ref_addr);
                    self.update_value(Channel::Synchronization, |v| {
                        v.instr = Phase::ByzantineConsensus.code();
                        v.set_date(date);
                        v.ref_addr = r;
                    });
                    self.bump(Channel::Synchronization);
                }
            }
            return;
        }

        let within = self.guard.within_limits(self.neighbors.get(idx));
        if !within {
            if self.my_cons_slot == self.this_sync_slot {
                self.guard.record_echo();
                self.trusted_synchronization(idx, value.ref_addr, value.cons_rate);
                self.mirror_sync_value(value, true);
                if self.guard.quorum_reached(self.my_degree) {
                    self.polite_cancel(Channel::Synchronization);
                    self.my_sync_border = false;
                } else {
                    self.my_sync_border = true;
                    self.raise_alarm();
                }
            } else {
                self.trusted_synchronization(idx, value.ref_addr, value.cons_rate);
                self.mirror_sync_value(value, true);
                self.my_sync_border = true;
            }
        } else {
            // a trusted peer floods an alarm: join it
            let sender_role = self.neighbors.get(idx).role;
            match self.membership.role {
                Role::Commoner
                    if matches!(sender_role, Role::ClusterBridge | Role::Commoner) =>
                {
                    self.raise_alarm()
                }
                Role::ClusterBridge if sender_role == Role::Commoner => {
                    self.trusted_synchronization(idx, value.ref_addr, value.cons_rate);
                    if self.my_cons_slot <= self.this_sync_slot {
                        self.raise_alarm();
                    }
                }
                _ => {}
            }
        }
    }

    fn mirror_sync_value(&mut self, value: AnnouncementValue, with_degree: bool) {
        let (degree, date, r) = (value.degree, value.date(), value.ref_addr);
        self.update_value(Channel::Synchronization, |v| {
            if with_degree {
                v.degree = degree;
            }
            v.set_date(date);
            v.ref_addr = r;
        });
    }

    fn raise_alarm(&mut self) {
        self.temp_state = if self.my_sync_border {
            Phase::ByzantineConsensus
        } else {
            self.my_state
        };
        if self.temp_state == Phase::ByzantineConsensus
            && self.membership.role == Role::ClusterBridge
        {
            warn!(node = %self.my_addr, "byzantine alarm raised");
            self.update_value(Channel::Synchronization, |v| {
                v.instr = Phase::ByzantineConsensus.code();
            });
            self.bump(Channel::Synchronization);
        }
    }

    fn clear_alarm(&mut self) {
        debug!(node = %self.my_addr, echoes = self.guard.msg_count(), "byzantine alarm cleared");
        self.temp_state = self.my_state;
        self.guard.reset();
        self.update_value(Channel::Synchronization, |v| {
            v.instr = Phase::ConsensusSynchronization.code();
        });
    }

    /// Applies the offset measured to a trusted peer: only the peer a
    /// role is allowed to follow in the current slot moves the clock,
    /// and the consensus rate is relayed across bridges. The correction
    /// is subtracted from every stored neighbor difference so the table
    /// stays centered on the new clock value.
    fn trusted_synchronization(&mut self, idx: usize, c_addr: NodeAddr, cons_rate: f64) {
        let n_addr = self.neighbors.get(idx).addr;
        let n_rate = self.neighbors.get(idx).relative_rate;
        let n_fine_diff = self.neighbors.get(idx).fine_diff;
        let curr_rate = self.clock.avg_rate();

        match self.membership.role {
            Role::Commoner => {
                let head_addr = self.membership.heads().first().map(|h| h.addr);
                if head_addr != Some(n_addr) {
                    return;
                }
                if self.my_cons_slot == self.this_sync_slot {
                    self.clock.set_avg_rate(cons_rate * n_rate);
                }
            }
            Role::ClusterBridge => {
                if self.membership.bridges().iter().any(|b| b.addr == n_addr) {
                    return;
                }
                if self.my_cons_slot > self.this_sync_slot {
                    let new_rate = if curr_rate != 0.0 {
                        n_rate / curr_rate
                    } else {
                        n_rate
                    };
                    self.my_cons_rate = new_rate * cons_rate;
                    if self.my_cons_rate == 0.0 {
                        self.my_cons_rate = 1.0;
                    }
                    self.clock.set_avg_rate(cons_rate * n_rate);
                }
            }
            Role::ClusterHead => {
                if !self.membership.bridges().iter().any(|b| b.addr == n_addr) {
                    return;
                }
                let new_rate = if curr_rate != 0.0 {
                    n_rate / curr_rate
                } else {
                    n_rate
                };
                self.my_cons_rate = new_rate * cons_rate;
                if self.my_cons_rate == 0.0 {
                    self.my_cons_rate = 1.0;
                }
                self.clock.set_avg_rate(cons_rate * n_rate);
                if self.my_cons_slot == self.this_sync_slot {
                    self.clock.set_avg_rate(cons_rate * n_rate);
                } else if self.sync_lc_addr != self.my_addr && self.sync_lc_addr == c_addr {
                    // halfway step towards the neighboring center
                    self.clock.set_avg_rate((cons_rate + curr_rate) / 2.0);
                } else {
                    return;
                }
            }
        }

        self.clock.adjust_fine_offset(n_fine_diff);
        for nn in self.neighbors.iter_mut() {
            nn.fine_diff -= n_fine_diff;
        }
        trace!(
            node = %self.my_addr,
            peer = %n_addr,
            n_fine_diff,
            secs = fine_to_secs(n_fine_diff),
            "trusted synchronization"
        );
    }
}
