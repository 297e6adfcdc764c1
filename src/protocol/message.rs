use serde::{Deserialize, Serialize};

use crate::core::{LogicalDate, NodeAddr, Phase};

/// Instruction code announcing the scheduled transition out of discovery
pub const INSTR_DISC_TO_EREV: u8 = 1;

/// Instruction code of a proactive slot claim during consensus convergence
pub const INSTR_CONVERGENCE_PROACTIVE: u8 = 11;

/// Announcement channel, one per protocol stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Channel {
    Discovery = 0,
    /// Election, connection and consensus revelations
    Revelation = 1,
    /// Election and connection declarations
    Declaration = 2,
    Convergence = 3,
    /// Also carries the byzantine recovery sub-protocol
    Synchronization = 4,
}

impl Channel {
    pub fn id(&self) -> u8 {
        *self as u8
    }

    pub fn from_id(id: u8) -> Option<Channel> {
        match id {
            0 => Some(Channel::Discovery),
            1 => Some(Channel::Revelation),
            2 => Some(Channel::Declaration),
            3 => Some(Channel::Convergence),
            4 => Some(Channel::Synchronization),
            _ => None,
        }
    }
}

/// Payload of a protocol announcement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnnouncementValue {
    /// Phase code of the sender, or one of the odd instruction codes
    pub instr: u8,
    /// Sender's neighborhood degree
    pub degree: u8,
    /// Logical date payload (transition date, sync date, ...)
    pub date_coarse: u32,
    pub date_fine: u32,
    /// Referenced node, used for bounced acknowledgements
    pub ref_addr: NodeAddr,
    /// Consensus rate relayed across cluster bridges
    pub cons_rate: f64,
}

impl AnnouncementValue {
    pub fn date(&self) -> LogicalDate {
        LogicalDate::new(self.date_coarse, self.date_fine)
    }

    pub fn set_date(&mut self, date: LogicalDate) {
        self.date_coarse = date.coarse;
        self.date_fine = date.fine;
    }

    /// Phase the sender is in, resolving instruction codes back to the
    /// phase they are announced from.
    pub fn sender_phase(&self) -> Option<Phase> {
        match self.instr {
            INSTR_DISC_TO_EREV => Some(Phase::Discovery),
            INSTR_CONVERGENCE_PROACTIVE => Some(Phase::ConsensusConvergence),
            code => Phase::from_code(code),
        }
    }
}

/// Clock capture taken when an announcement leaves the node, plus the MAC
/// transmit timestamp filled in by the radio layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimesyncFrame {
    /// Sender's coarse count at capture
    pub coarse_now: u32,
    /// Sender's logical correction at capture
    pub fine_offset: i64,
    /// Sender's oscillator rate multiplier
    pub clock_rate: f64,
    /// Sender's consensus rate
    pub avg_rate: f64,
    /// Sender's hardware fine count at capture
    pub ta: u32,
    /// MAC-layer reference stamp taken with `ta`
    pub tb: u32,
    /// Hardware fine count at actual transmission
    pub hw_mac_timestamp: u32,
}

/// A complete announcement as delivered by the radio medium
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub channel: Channel,
    pub from: NodeAddr,
    pub value: AnnouncementValue,
    pub frame: TimesyncFrame,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_ids() {
        for id in 0..5 {
            assert_eq!(Channel::from_id(id).unwrap().id(), id);
        }
        assert!(Channel::from_id(5).is_none());
    }

    #[test]
    fn test_sender_phase_resolution() {
        let mut value = AnnouncementValue {
            instr: Phase::ElectionRevelation.code(),
            degree: 3,
            date_coarse: 0,
            date_fine: 0,
            ref_addr: NodeAddr(7),
            cons_rate: 0.0,
        };
        assert_eq!(value.sender_phase(), Some(Phase::ElectionRevelation));

        value.instr = INSTR_DISC_TO_EREV;
        assert_eq!(value.sender_phase(), Some(Phase::Discovery));

        value.instr = INSTR_CONVERGENCE_PROACTIVE;
        assert_eq!(value.sender_phase(), Some(Phase::ConsensusConvergence));

        value.instr = 7;
        assert_eq!(value.sender_phase(), None);
    }

    #[test]
    fn test_value_json_round_trip() {
        let value = AnnouncementValue {
            instr: Phase::ConsensusSynchronization.code(),
            degree: 2,
            date_coarse: 41,
            date_fine: 12_345,
            ref_addr: NodeAddr(9),
            cons_rate: 1.002,
        };
        let json = serde_json::to_string(&value).unwrap();
        let back: AnnouncementValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back.instr, value.instr);
        assert_eq!(back.date(), value.date());
        assert_eq!(back.ref_addr, value.ref_addr);
    }

    #[test]
    fn test_date_round_trip() {
        let mut value = AnnouncementValue {
            instr: 0,
            degree: 0,
            date_coarse: 0,
            date_fine: 0,
            ref_addr: NodeAddr(1),
            cons_rate: 0.0,
        };
        value.set_date(LogicalDate::new(42, 31_337));
        assert_eq!(value.date(), LogicalDate::new(42, 31_337));
    }
}
