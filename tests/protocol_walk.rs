//! End-to-end protocol walks: a scripted single-node pass through all
//! phases, and two nodes exchanging announcements over the simulated
//! medium.

use std::time::Duration;

use tokio::sync::mpsc;

use csync::core::{LogicalDate, NodeAddr, Phase, Role, FINE_MAX};
use csync::network::{MediumConfig, RadioMedium};
use csync::protocol::{
    Announcement, AnnouncementValue, Channel, DriverConfig, Node, NodeConfig, NodeContext,
    NodeEvent, TimesyncFrame,
};

fn frame_like(ctx: &NodeContext) -> TimesyncFrame {
    let hw = ctx.clock().hw_now();
    TimesyncFrame {
        coarse_now: hw.coarse,
        fine_offset: ctx.clock().fine_offset(),
        clock_rate: ctx.clock().rate(),
        avg_rate: ctx.clock().avg_rate(),
        ta: hw.fine,
        tb: hw.fine,
        hw_mac_timestamp: hw.fine,
    }
}

fn deliver(ctx: &mut NodeContext, channel: Channel, from: u16, value: AnnouncementValue) {
    let announcement = Announcement {
        channel,
        from: NodeAddr(from),
        value,
        frame: frame_like(ctx),
    };
    let rx = ctx.clock().hw_now().fine;
    ctx.step(NodeEvent::MessageArrived {
        announcement,
        rssi: -40,
        rx_timestamp: rx,
    });
}

fn discovery_value(degree: u8) -> AnnouncementValue {
    AnnouncementValue {
        instr: Phase::Discovery.code(),
        degree,
        date_coarse: 0,
        date_fine: 0,
        ref_addr: NodeAddr(0),
        cons_rate: 1.0,
    }
}

/// A node that lost the election to a better-ranked neighbor walks the
/// whole phase sequence on its own timers and soft-resets back into
/// discovery after the configured number of control iterations.
#[test]
fn test_single_node_walks_all_phases() {
    let mut ctx = NodeContext::new(NodeConfig {
        addr: NodeAddr(1),
        ..NodeConfig::default()
    });
    ctx.clock_mut().advance(20_000);

    // meet neighbor 9 twice so it counts as synced
    ctx.clock_mut().advance(2_000);
    deliver(&mut ctx, Channel::Discovery, 9, discovery_value(5));
    ctx.clock_mut().advance(2_000);
    deliver(&mut ctx, Channel::Discovery, 9, discovery_value(5));
    assert_eq!(ctx.degree(), 1);

    // neighbor 9 outranks us and announces its revelation date
    let now = ctx.clock_mut().now();
    let mut v = discovery_value(5);
    v.instr = Phase::ElectionRevelation.code();
    v.set_date(LogicalDate::new(now.coarse, now.fine + 30_000));
    deliver(&mut ctx, Channel::Revelation, 9, v);
    assert_eq!(ctx.phase(), Phase::ElectionRevelation);

    let mut seen = vec![ctx.phase()];
    for _ in 0..200_000 {
        let fired = ctx.clock_mut().advance(50);
        for slot in fired {
            ctx.step(NodeEvent::TimerFired(slot));
        }
        if ctx.phase() != *seen.last().unwrap() {
            seen.push(ctx.phase());
        }
        if ctx.soft_reset_count() == 1 {
            break;
        }
    }

    assert_eq!(ctx.soft_reset_count(), 1, "walk never completed: {seen:?}");
    assert_eq!(ctx.phase(), Phase::Discovery);

    // first appearance of every phase, in protocol order
    let expected_prefix = [
        Phase::ElectionRevelation,
        Phase::ConnectionRevelation,
        Phase::ConnectionDeclaration,
        Phase::ConsensusConvergence,
        Phase::ConsensusRevelation,
        Phase::ConsensusSynchronization,
        Phase::Idle,
    ];
    assert!(
        seen.len() >= expected_prefix.len(),
        "phase walk too short: {seen:?}"
    );
    assert_eq!(&seen[..expected_prefix.len()], &expected_prefix);
    // the synchronization/idle iterations must have cycled
    let idle_visits = seen.iter().filter(|p| **p == Phase::Idle).count();
    assert_eq!(idle_visits, 3, "unexpected iteration count: {seen:?}");
}

/// The idle deadline announced at the end of a synchronization round is
/// a well-formed logical date: the fine count carries into the coarse
/// count instead of exceeding the wrap.
#[test]
fn test_idle_announcement_date_is_normalized() {
    let mut ctx = NodeContext::new(NodeConfig {
        addr: NodeAddr(1),
        ..NodeConfig::default()
    });
    ctx.clock_mut().advance(20_000);

    ctx.clock_mut().advance(2_000);
    deliver(&mut ctx, Channel::Discovery, 9, discovery_value(5));
    ctx.clock_mut().advance(2_000);
    deliver(&mut ctx, Channel::Discovery, 9, discovery_value(5));

    let now = ctx.clock_mut().now();
    let mut v = discovery_value(5);
    v.instr = Phase::ElectionRevelation.code();
    v.set_date(LogicalDate::new(now.coarse, now.fine + 30_000));
    deliver(&mut ctx, Channel::Revelation, 9, v);

    for _ in 0..200_000 {
        let fired = ctx.clock_mut().advance(50);
        for slot in fired {
            ctx.step(NodeEvent::TimerFired(slot));
        }
        if ctx.phase() == Phase::Idle {
            break;
        }
    }
    assert_eq!(ctx.phase(), Phase::Idle);

    let idle = ctx.registered(Channel::Discovery).expect("idle rebroadcast");
    assert!(
        idle.date_fine < FINE_MAX,
        "idle date not normalized: fine {}",
        idle.date_fine
    );
    let idle_date = idle.date();
    // the window lies ahead of the current logical date, one idle slot long
    let now = ctx.clock_mut().now();
    let ahead = ctx.clock().interval(idle_date, now);
    assert!(ahead > 0, "idle deadline not in the future: {ahead}");
    assert!(ahead <= 94_000, "idle window too long: {ahead}");
}

/// A node hearing a running synchronization round attaches directly:
/// commoner role, the announced slot, and the idle deadline.
#[test]
fn test_late_joiner_attaches_to_running_round() {
    let mut ctx = NodeContext::new(NodeConfig {
        addr: NodeAddr(1),
        ..NodeConfig::default()
    });
    ctx.clock_mut().advance(20_000);

    ctx.clock_mut().advance(2_000);
    deliver(&mut ctx, Channel::Discovery, 9, discovery_value(5));
    ctx.clock_mut().advance(2_000);
    deliver(&mut ctx, Channel::Discovery, 9, discovery_value(5));

    let now = ctx.clock_mut().now();
    let mut v = discovery_value(2);
    v.instr = Phase::ConsensusSynchronization.code();
    v.ref_addr = NodeAddr(9);
    v.set_date(LogicalDate::new(now.coarse, now.fine + 20_000));
    deliver(&mut ctx, Channel::Synchronization, 9, v);

    assert_eq!(ctx.role(), Role::Commoner);
    assert_eq!(ctx.cons_slot(), 2);
    // the idle transition waits on the adopted date
    assert_eq!(ctx.phase(), Phase::Discovery);
    let sync = ctx.registered(Channel::Synchronization).unwrap();
    assert_eq!(sync.instr, Phase::ConsensusSynchronization.code());
    assert_eq!(sync.ref_addr, NodeAddr(9));
}

/// Two nodes on the medium hear each other's discovery announcements.
#[tokio::test]
async fn test_two_nodes_exchange_discovery_over_medium() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let mut medium = RadioMedium::new(MediumConfig::default());
    let (uplink_tx, uplink_rx) = mpsc::channel::<Announcement>(256);

    let mut handles = Vec::new();
    for addr in [1u16, 2] {
        let inbound = medium.attach(NodeAddr(addr));
        let ctx = NodeContext::new(NodeConfig {
            addr: NodeAddr(addr),
            ..NodeConfig::default()
        });
        let mut node = Node::new(ctx, DriverConfig::default(), inbound, uplink_tx.clone());
        handles.push(tokio::spawn(async move { node.run().await }));
    }
    drop(uplink_tx);

    // listen in on the broadcast domain
    let mut tap = medium.attach(NodeAddr(99));
    let medium_handle = tokio::spawn(async move { medium.run(uplink_rx).await });

    let mut heard = std::collections::HashSet::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while heard.len() < 2 {
        let delivery = tokio::time::timeout_at(deadline, tap.recv())
            .await
            .expect("nodes never announced")
            .expect("medium stopped");
        assert_eq!(delivery.announcement.channel, Channel::Discovery);
        heard.insert(delivery.announcement.from);
    }
    assert!(heard.contains(&NodeAddr(1)));
    assert!(heard.contains(&NodeAddr(2)));

    for h in &handles {
        h.abort();
    }
    medium_handle.abort();
}
