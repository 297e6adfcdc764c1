//! Protocol implementation module
//!
//! Announcement wire format and codec, the neighbor table, cluster
//! membership lists, the byzantine guard, and the clustering state
//! machine with its async driver.

pub mod byzantine;
pub mod codec;
pub mod membership;
pub mod message;
pub mod neighbors;
pub mod node;
pub mod state;

pub use self::byzantine::{ByzantineConfig, ByzantineGuard};
pub use self::codec::AnnouncementCodec;
pub use self::membership::{ClusterEntry, ClusterMembership, SyncSchedule};
pub use self::message::{Announcement, AnnouncementValue, Channel, TimesyncFrame};
pub use self::neighbors::{Neighbor, NeighborTable};
pub use self::node::{DriverConfig, Node, ReceivedAnnouncement};
pub use self::state::{NodeConfig, NodeContext, NodeEvent};
