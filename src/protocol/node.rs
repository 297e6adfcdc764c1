//! Async node driver
//!
//! Wraps a [`NodeContext`] in a tokio task: a periodic tick advances the
//! hardware clock and fires expired scheduler slots, received
//! announcements are fed in from an mpsc channel, and everything the
//! machine wants on the air is forwarded to the outbound channel where
//! the radio layer (or the simulated medium) picks it up.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info};

use crate::core::{Error, NodeAddr, Result};
use crate::protocol::message::Announcement;
use crate::protocol::state::{NodeContext, NodeEvent};

/// An announcement as delivered by the medium, with the reception
/// metadata the protocol needs.
#[derive(Debug, Clone)]
pub struct ReceivedAnnouncement {
    pub announcement: Announcement,
    /// Received signal strength (dBm)
    pub rssi: i16,
    /// Hardware fine stamp taken at packet reception
    pub rx_timestamp: u32,
}

/// Pacing of the simulated hardware clock
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Wall time between clock ticks
    pub tick: Duration,
    /// Fine ticks the hardware clock advances per tick
    pub ticks_per_poll: u32,
    /// Clock ticks between dissemination rounds, scaled by the node's
    /// current announce interval
    pub announce_every: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            tick: Duration::from_millis(1),
            ticks_per_poll: 64,
            announce_every: 16,
        }
    }
}

/// Owns the state machine and drives it from the tokio runtime.
pub struct Node {
    ctx: NodeContext,
    driver: DriverConfig,
    inbound: mpsc::Receiver<ReceivedAnnouncement>,
    outbound: mpsc::Sender<Announcement>,
}

impl Node {
    pub fn new(
        ctx: NodeContext,
        driver: DriverConfig,
        inbound: mpsc::Receiver<ReceivedAnnouncement>,
        outbound: mpsc::Sender<Announcement>,
    ) -> Self {
        Node {
            ctx,
            driver,
            inbound,
            outbound,
        }
    }

    pub fn addr(&self) -> NodeAddr {
        self.ctx.addr()
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    /// Runs the node until the inbound channel closes.
    pub async fn run(&mut self) -> Result<()> {
        info!(node = %self.ctx.addr(), "node started");
        let mut clock_tick = interval(self.driver.tick);
        let mut announce_countdown = self.driver.announce_every;

        loop {
            tokio::select! {
                _ = clock_tick.tick() => {
                    let fired = self.ctx.clock_mut().advance(self.driver.ticks_per_poll);
                    for slot in fired {
                        let out = self.ctx.step(NodeEvent::TimerFired(slot));
                        self.flush(out).await?;
                    }
                    announce_countdown = announce_countdown.saturating_sub(1);
                    if announce_countdown == 0 {
                        announce_countdown = self
                            .driver
                            .announce_every
                            .saturating_mul(self.ctx.announce_interval().max(1));
                        let out = self.ctx.step(NodeEvent::AnnounceTick);
                        self.flush(out).await?;
                    }
                }
                received = self.inbound.recv() => {
                    let Some(r) = received else {
                        debug!(node = %self.ctx.addr(), "inbound channel closed");
                        return Ok(());
                    };
                    let out = self.ctx.step(NodeEvent::MessageArrived {
                        announcement: r.announcement,
                        rssi: r.rssi,
                        rx_timestamp: r.rx_timestamp,
                    });
                    self.flush(out).await?;
                }
            }
        }
    }

    async fn flush(&self, out: Vec<Announcement>) -> Result<()> {
        for announcement in out {
            self.outbound
                .send(announcement)
                .await
                .map_err(|e| Error::network(format!("outbound channel closed: {}", e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::Channel;
    use crate::protocol::state::NodeConfig;

    #[tokio::test]
    async fn test_node_emits_discovery_announcements() {
        let config = NodeConfig {
            addr: NodeAddr(1),
            ..NodeConfig::default()
        };
        let ctx = NodeContext::new(config);
        let (_in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(64);

        let mut node = Node::new(ctx, DriverConfig::default(), in_rx, out_tx);
        let handle = tokio::spawn(async move { node.run().await });

        // the freshly reset node re-broadcasts its discovery value
        let announcement = tokio::time::timeout(Duration::from_secs(5), out_rx.recv())
            .await
            .expect("no announcement within timeout")
            .expect("outbound channel closed");
        assert_eq!(announcement.channel, Channel::Discovery);
        assert_eq!(announcement.from, NodeAddr(1));

        handle.abort();
    }

    #[tokio::test]
    async fn test_node_stops_when_inbound_closes() {
        let ctx = NodeContext::new(NodeConfig::default());
        let (in_tx, in_rx) = mpsc::channel::<ReceivedAnnouncement>(1);
        let (out_tx, mut out_rx) = mpsc::channel(1024);

        let mut node = Node::new(ctx, DriverConfig::default(), in_rx, out_tx);
        let handle = tokio::spawn(async move { node.run().await });
        // keep the outbound channel drained so the node never blocks
        let drain = tokio::spawn(async move { while out_rx.recv().await.is_some() {} });

        drop(in_tx);
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("node did not stop")
            .expect("task panicked");
        assert!(result.is_ok());
        drain.abort();
    }
}
