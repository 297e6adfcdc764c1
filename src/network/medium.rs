//! Simulated broadcast medium
//!
//! Fans every transmitted announcement out to all attached nodes except
//! the sender, tagging each delivery with a per-link signal strength.
//! Links default to a healthy strength and can be weakened or severed
//! per pair, which the receiving node's signal threshold then filters.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::core::{Error, NodeAddr, Result, TRANSMISSION_DELAY};
use crate::protocol::message::Announcement;
use crate::protocol::node::ReceivedAnnouncement;

/// Signal strength assigned to severed links; below any sane threshold
const SEVERED_RSSI: i16 = i16::MIN;

#[derive(Debug, Clone)]
pub struct MediumConfig {
    /// Signal strength of links without an explicit override (dBm)
    pub default_rssi: i16,
    /// Capacity of each node's delivery channel
    pub channel_capacity: usize,
}

impl Default for MediumConfig {
    fn default() -> Self {
        MediumConfig {
            default_rssi: -45,
            channel_capacity: 256,
        }
    }
}

/// Broadcast domain shared by a set of nodes.
pub struct RadioMedium {
    config: MediumConfig,
    nodes: HashMap<NodeAddr, mpsc::Sender<ReceivedAnnouncement>>,
    /// Directed link overrides, keyed (sender, receiver)
    links: HashMap<(NodeAddr, NodeAddr), i16>,
}

impl RadioMedium {
    pub fn new(config: MediumConfig) -> Self {
        RadioMedium {
            config,
            nodes: HashMap::new(),
            links: HashMap::new(),
        }
    }

    /// Attaches a node and returns the channel its deliveries arrive on.
    pub fn attach(&mut self, addr: NodeAddr) -> mpsc::Receiver<ReceivedAnnouncement> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        self.nodes.insert(addr, tx);
        debug!(node = %addr, "node attached to medium");
        rx
    }

    pub fn detach(&mut self, addr: NodeAddr) {
        self.nodes.remove(&addr);
        self.links.retain(|(a, b), _| *a != addr && *b != addr);
    }

    /// Overrides the signal strength between a pair, both directions.
    pub fn set_rssi(&mut self, a: NodeAddr, b: NodeAddr, rssi: i16) {
        self.links.insert((a, b), rssi);
        self.links.insert((b, a), rssi);
    }

    /// Cuts the link between a pair; deliveries still happen but fall
    /// below every receiver threshold.
    pub fn sever(&mut self, a: NodeAddr, b: NodeAddr) {
        self.set_rssi(a, b, SEVERED_RSSI);
    }

    fn link_rssi(&self, from: NodeAddr, to: NodeAddr) -> i16 {
        self.links
            .get(&(from, to))
            .copied()
            .unwrap_or(self.config.default_rssi)
    }

    /// Delivers one announcement to every attached node except the
    /// sender. The reception stamp models the fixed propagation delay
    /// on top of the sender's MAC stamp.
    pub async fn broadcast(&self, announcement: Announcement) -> Result<()> {
        let rx_timestamp = announcement
            .frame
            .hw_mac_timestamp
            .wrapping_add(TRANSMISSION_DELAY as u32);
        for (&addr, tx) in &self.nodes {
            if addr == announcement.from {
                continue;
            }
            let rssi = self.link_rssi(announcement.from, addr);
            let delivery = ReceivedAnnouncement {
                announcement: announcement.clone(),
                rssi,
                rx_timestamp,
            };
            tx.send(delivery)
                .await
                .map_err(|e| Error::network(format!("delivery to {} failed: {}", addr, e)))?;
            trace!(from = %announcement.from, to = %addr, rssi, "delivered");
        }
        Ok(())
    }

    /// Forwards transmissions from the shared uplink channel until all
    /// senders are dropped.
    pub async fn run(&mut self, mut uplink: mpsc::Receiver<Announcement>) -> Result<()> {
        while let Some(announcement) = uplink.recv().await {
            self.broadcast(announcement).await?;
        }
        debug!("medium uplink closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Phase;
    use crate::protocol::message::{AnnouncementValue, Channel, TimesyncFrame};

    fn announcement(from: u16) -> Announcement {
        Announcement {
            channel: Channel::Discovery,
            from: NodeAddr(from),
            value: AnnouncementValue {
                instr: Phase::Discovery.code(),
                degree: 0,
                date_coarse: 0,
                date_fine: 0,
                ref_addr: NodeAddr(from),
                cons_rate: 1.0,
            },
            frame: TimesyncFrame {
                coarse_now: 0,
                fine_offset: 0,
                clock_rate: 1.0,
                avg_rate: 0.0,
                ta: 100,
                tb: 100,
                hw_mac_timestamp: 100,
            },
        }
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let mut medium = RadioMedium::new(MediumConfig::default());
        let mut rx_a = medium.attach(NodeAddr(1));
        let mut rx_b = medium.attach(NodeAddr(2));

        medium.broadcast(announcement(1)).await.unwrap();

        let delivery = rx_b.recv().await.unwrap();
        assert_eq!(delivery.announcement.from, NodeAddr(1));
        assert_eq!(delivery.rssi, MediumConfig::default().default_rssi);
        assert_eq!(delivery.rx_timestamp, 100 + TRANSMISSION_DELAY as u32);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_severed_link_is_below_any_threshold() {
        let mut medium = RadioMedium::new(MediumConfig::default());
        let _rx_a = medium.attach(NodeAddr(1));
        let mut rx_b = medium.attach(NodeAddr(2));
        medium.sever(NodeAddr(1), NodeAddr(2));

        medium.broadcast(announcement(1)).await.unwrap();

        let delivery = rx_b.recv().await.unwrap();
        assert_eq!(delivery.rssi, SEVERED_RSSI);
    }

    #[tokio::test]
    async fn test_detach_removes_node_and_links() {
        let mut medium = RadioMedium::new(MediumConfig::default());
        let _rx_a = medium.attach(NodeAddr(1));
        let rx_b = medium.attach(NodeAddr(2));
        medium.set_rssi(NodeAddr(1), NodeAddr(2), -70);

        drop(rx_b);
        medium.detach(NodeAddr(2));

        assert!(medium.broadcast(announcement(1)).await.is_ok());
        assert_eq!(medium.link_rssi(NodeAddr(1), NodeAddr(2)), MediumConfig::default().default_rssi);
    }
}
