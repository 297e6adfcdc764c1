//! Gradient consensus synchronizer
//!
//! Every received announcement carries a clock capture of the sender.
//! `record` turns that capture into a per-neighbor rate estimate and a
//! signed offset to the sender's logical clock. `consensus_step`
//! averages those offsets over the neighborhood and moves the logical
//! clock towards the average, so offsets diffuse through the network
//! instead of following a single reference.

use tracing::{debug, trace};

use crate::core::{LogicalDate, Phase, TRANSMISSION_DELAY};
use crate::protocol::message::TimesyncFrame;
use crate::protocol::neighbors::{Neighbor, NeighborTable};
use crate::sync::util::delta_wrapped;
use crate::time::LogicalClock;

/// Tuning parameters of the gradient synchronizer
#[derive(Debug, Clone)]
pub struct GradientConfig {
    /// Rate samples beyond this magnitude mark the neighbor as jumped
    pub drift_limit: f64,
    /// Offsets within this many fine ticks count as synced
    pub jump_limit: i64,
    /// Fine-tick window around the coarse boundary treated as wrap skew
    pub overflow_window: i64,
    /// Weight of the previous estimate in the rate moving average
    pub alpha: f64,
    /// Fixed radio propagation delay in fine ticks
    pub transmission_delay: i64,
}

impl Default for GradientConfig {
    fn default() -> Self {
        GradientConfig {
            drift_limit: 0.001,
            jump_limit: 100,
            overflow_window: 1000,
            alpha: 0.9,
            transmission_delay: TRANSMISSION_DELAY,
        }
    }
}

/// Stateless except for its configuration; all per-neighbor history
/// lives in the [`Neighbor`] entries.
#[derive(Debug, Clone, Default)]
pub struct GradientSynchronizer {
    config: GradientConfig,
}

impl GradientSynchronizer {
    pub fn new(config: GradientConfig) -> Self {
        GradientSynchronizer { config }
    }

    /// Processes the clock capture of a received announcement: updates
    /// the neighbor's relative rate estimate and stores the signed
    /// coarse/fine difference between our logical clock and the
    /// sender's.
    ///
    /// `rx_timestamp` is the hardware fine stamp taken by the radio
    /// layer at packet reception.
    pub fn record(
        &self,
        n: &mut Neighbor,
        frame: &TimesyncFrame,
        rx_timestamp: u32,
        clock: &mut LogicalClock,
        new_neighbor: bool,
    ) {
        let fine_max = clock.fine_max();
        let my_hw = clock.hw_now();

        if new_neighbor {
            n.relative_rate = 0.0;
            n.jumped = false;
            n.synced = false;
        }

        // Project the sender's capture onto its logical axis, adding the
        // capture-to-MAC delays on both sides and the propagation delay.
        let send_delta = delta_wrapped(frame.tb, frame.hw_mac_timestamp, fine_max) as f64
            * frame.clock_rate
            * (frame.avg_rate + 1.0);
        let recv_delta = delta_wrapped(rx_timestamp, my_hw.fine, fine_max) as f64
            * clock.rate()
            * (n.relative_rate + 1.0);
        let delta_tx = self.config.transmission_delay as f64 * (1.0 + n.relative_rate)
            / (1.0 + clock.avg_rate());
        let total_offset =
            frame.fine_offset + (send_delta + recv_delta + delta_tx) as i64;

        let n_lg = clock.apply_offset(LogicalDate::new(frame.coarse_now, frame.ta), total_offset);

        if !new_neighbor {
            let n_elapsed = clock.interval(n_lg, n.last_n);
            let my_elapsed = clock.interval(my_hw, n.last_my);
            if my_elapsed > 0 {
                let sample = n_elapsed as f64 / my_elapsed as f64 - 1.0;
                if sample.abs() < self.config.drift_limit {
                    n.relative_rate =
                        self.config.alpha * n.relative_rate + (1.0 - self.config.alpha) * sample;
                    n.jumped = false;
                } else {
                    n.jumped = true;
                }
            }
        }

        n.last_my = my_hw;
        n.last_n = n_lg;

        let my_lg = clock.now();
        let mut coarse_diff = my_lg.coarse as i32 - n_lg.coarse as i32;
        let fine_max = fine_max as i64;
        let window = self.config.overflow_window;
        let my_fine = my_lg.fine as i64;
        let n_fine = n_lg.fine as i64;

        // Offsets straddling a coarse boundary collapse to a small fine
        // difference with the matching sign.
        let fine_diff = if coarse_diff == -1 && my_fine > fine_max - window && n_fine < window {
            coarse_diff = 0;
            -((fine_max - my_fine) + n_fine)
        } else if coarse_diff == 1 && my_fine < window && n_fine > fine_max - window {
            coarse_diff = 0;
            (fine_max - n_fine) + my_fine
        } else {
            my_fine - n_fine
        };

        n.coarse_diff = coarse_diff;
        n.fine_diff = fine_diff;

        trace!(
            neighbor = %n.addr,
            coarse_diff,
            fine_diff,
            rate = n.relative_rate,
            "recorded capture"
        );
    }

    /// One consensus round: averages the stored offsets of all neighbors
    /// announcing from `phase`, applies the averages to the clock, and
    /// re-centers every neighbor's stored difference around the new
    /// clock value.
    pub fn consensus_step(&self, table: &mut NeighborTable, clock: &mut LogicalClock, phase: Phase) {
        let jump = self.config.jump_limit;
        let mut avg_rate = clock.avg_rate();

        let mut coarse_offset: i64 = 0;
        let mut coarse_diff_count: u32 = 0;
        let mut fine_offset: i64 = 0;
        let mut fine_synced_count: u32 = 0;
        let mut fine_diff_count: u32 = 0;

        for n in table.iter_mut() {
            if n.state != phase {
                continue;
            }

            if n.coarse_diff != 0 {
                coarse_diff_count += 1;
                coarse_offset += n.coarse_diff as i64;
            }

            if -jump < n.fine_diff && n.fine_diff < jump {
                fine_offset += n.fine_diff;
                avg_rate += n.relative_rate;
                fine_synced_count += 1;
                n.synced = true;
            } else {
                n.synced = false;
                fine_diff_count += 1;
            }
        }

        coarse_offset /= coarse_diff_count as i64 + 1;
        clock.adjust_coarse_count(coarse_offset as i32);

        fine_offset /= fine_synced_count as i64 + 1;

        avg_rate /= (fine_synced_count + fine_diff_count + 1) as f64;
        clock.set_avg_rate(avg_rate);

        if phase == Phase::Discovery {
            // No established gradient yet. Look for the largest group of
            // unsynced neighbors whose offsets agree within the jump
            // limit, and jump onto that group's mean.
            let mut best_count: u32 = 0;
            let mut best_offset: i64 = fine_offset;

            for (i, seed) in table.iter().enumerate() {
                if seed.synced {
                    continue;
                }
                let mut count: u32 = 1;
                let mut sum = seed.fine_diff;
                for nn in table.iter().skip(i + 1) {
                    let gap = seed.fine_diff - nn.fine_diff;
                    if -jump < gap && gap < jump {
                        count += 1;
                        sum += nn.fine_diff;
                    }
                }
                if count > best_count {
                    best_count = count;
                    best_offset = sum / count as i64;
                }
            }

            if best_count > 0 {
                fine_offset = best_offset;
            }
        }

        clock.adjust_fine_offset(fine_offset);

        for n in table.iter_mut() {
            n.coarse_diff -= coarse_offset as i32;
            n.fine_diff -= fine_offset;
            n.synced = -jump < n.fine_diff && n.fine_diff < jump;
        }

        debug!(
            ?phase,
            coarse_offset,
            fine_offset,
            avg_rate,
            "consensus step applied"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeAddr;
    use crate::time::ClockConfig;

    fn clock() -> LogicalClock {
        let mut clock = LogicalClock::new(ClockConfig::default());
        clock.advance(10_000);
        clock
    }

    fn frame_for(clock: &LogicalClock) -> TimesyncFrame {
        let hw = clock.hw_now();
        TimesyncFrame {
            coarse_now: hw.coarse,
            fine_offset: clock.fine_offset(),
            clock_rate: clock.rate(),
            avg_rate: clock.avg_rate(),
            ta: hw.fine,
            tb: hw.fine,
            hw_mac_timestamp: hw.fine,
        }
    }

    #[test]
    fn test_record_identical_clocks_small_diff() {
        let sync = GradientSynchronizer::default();
        let mut clock = clock();
        let mut n = Neighbor::new(NodeAddr(2));

        // A frame captured from a clock identical to ours should leave
        // only the modeled transmission delay as difference.
        let frame = frame_for(&clock);
        let rx = clock.hw_now().fine;
        sync.record(&mut n, &frame, rx, &mut clock, true);

        assert_eq!(n.coarse_diff, 0);
        assert!(n.fine_diff.abs() <= TRANSMISSION_DELAY + 1);
    }

    #[test]
    fn test_record_rate_sample_within_drift_limit() {
        let sync = GradientSynchronizer::default();
        let mut clock = clock();
        let mut n = Neighbor::new(NodeAddr(2));

        let frame = frame_for(&clock);
        let rx = clock.hw_now().fine;
        sync.record(&mut n, &frame, rx, &mut clock, true);

        // Second observation after both clocks ran the same interval:
        // the rate sample is ~0 and must be accepted.
        clock.advance(5_000);
        let mut frame = frame_for(&clock);
        frame.fine_offset = clock.fine_offset();
        let rx = clock.hw_now().fine;
        sync.record(&mut n, &frame, rx, &mut clock, false);

        assert!(!n.jumped);
        assert!(n.relative_rate.abs() < 0.001);
    }

    #[test]
    fn test_record_drifted_sample_marks_jumped() {
        let sync = GradientSynchronizer::default();
        let mut clock = clock();
        let mut n = Neighbor::new(NodeAddr(2));

        let frame = frame_for(&clock);
        let rx = clock.hw_now().fine;
        sync.record(&mut n, &frame, rx, &mut clock, true);

        clock.advance(5_000);
        // The neighbor claims far more elapsed time than we measured.
        let mut frame = frame_for(&clock);
        frame.coarse_now += 1;
        let rx = clock.hw_now().fine;
        sync.record(&mut n, &frame, rx, &mut clock, false);

        assert!(n.jumped);
        assert_eq!(n.relative_rate, 0.0);
    }

    #[test]
    fn test_consensus_halves_single_neighbor_offset() {
        let sync = GradientSynchronizer::default();
        let mut clock = clock();
        let mut table = NeighborTable::new();

        let idx = table.insert(NodeAddr(2)).unwrap();
        {
            let n = table.get_mut(idx);
            n.state = Phase::Idle;
            n.fine_diff = 80;
        }

        let before = clock.fine_offset();
        sync.consensus_step(&mut table, &mut clock, Phase::Idle);

        // one synced neighbor: applied offset is 80 / 2
        assert_eq!(clock.fine_offset(), before - 40);
        assert_eq!(table.get(idx).fine_diff, 40);
        assert!(table.get(idx).synced);
    }

    #[test]
    fn test_consensus_skips_other_phases() {
        let sync = GradientSynchronizer::default();
        let mut clock = clock();
        let mut table = NeighborTable::new();

        let idx = table.insert(NodeAddr(2)).unwrap();
        table.get_mut(idx).state = Phase::Discovery;
        table.get_mut(idx).fine_diff = 80;

        let before = clock.fine_offset();
        sync.consensus_step(&mut table, &mut clock, Phase::Idle);
        assert_eq!(clock.fine_offset(), before);
    }

    #[test]
    fn test_discovery_jumps_to_best_supported_cluster() {
        let sync = GradientSynchronizer::default();
        let mut clock = clock();
        let mut table = NeighborTable::new();

        // Two neighbors agree around +5000, one outlier at -9000.
        for (addr, diff) in [(2u16, 5_000i64), (3, 5_020), (4, -9_000)] {
            let idx = table.insert(NodeAddr(addr)).unwrap();
            table.get_mut(idx).state = Phase::Discovery;
            table.get_mut(idx).fine_diff = diff;
        }

        let before = clock.fine_offset();
        sync.consensus_step(&mut table, &mut clock, Phase::Discovery);

        // mean of the agreeing pair
        assert_eq!(clock.fine_offset(), before - 5_010);
        let a = table.find(NodeAddr(2)).unwrap();
        let b = table.find(NodeAddr(3)).unwrap();
        assert!(table.get(a).synced);
        assert!(table.get(b).synced);
        assert!(!table.get(table.find(NodeAddr(4)).unwrap()).synced);
    }

    #[test]
    fn test_network_divergence_shrinks_over_cycles() {
        let sync = GradientSynchronizer::default();
        let addrs = [NodeAddr(1), NodeAddr(2), NodeAddr(3)];

        // three nodes on a shared hardware timebase with spread logical
        // offsets, all within the jump limit of each other
        let mut clocks: Vec<LogicalClock> = addrs.iter().map(|_| clock()).collect();
        clocks[1].adjust_fine_offset(-40);
        clocks[2].adjust_fine_offset(30);

        let mut tables: Vec<NeighborTable> = addrs
            .iter()
            .enumerate()
            .map(|(i, _)| {
                let mut table = NeighborTable::new();
                for (j, addr) in addrs.iter().enumerate() {
                    if j != i {
                        let idx = table.insert(*addr).unwrap();
                        table.get_mut(idx).state = Phase::Idle;
                    }
                }
                table
            })
            .collect();

        let divergence = |clocks: &[LogicalClock]| -> i64 {
            let mut max = 0i64;
            for a in clocks {
                for b in clocks {
                    max = max.max((a.fine_offset() - b.fine_offset()).abs());
                }
            }
            max
        };

        let mut spread = divergence(&clocks);
        for cycle in 0..3 {
            // every node hears every other node's capture, then runs one
            // consensus round
            let frames: Vec<TimesyncFrame> = clocks.iter().map(frame_for).collect();
            for i in 0..addrs.len() {
                for j in 0..addrs.len() {
                    if j == i {
                        continue;
                    }
                    let idx = tables[i].find(addrs[j]).unwrap();
                    let rx = clocks[i].hw_now().fine;
                    sync.record(tables[i].get_mut(idx), &frames[j], rx, &mut clocks[i], cycle == 0);
                    tables[i].get_mut(idx).state = Phase::Idle;
                }
            }
            for i in 0..addrs.len() {
                sync.consensus_step(&mut tables[i], &mut clocks[i], Phase::Idle);
            }
            for c in clocks.iter_mut() {
                c.advance(5_000);
            }

            // strictly shrinking until within the modeled radio delay
            let next = divergence(&clocks);
            assert!(
                next < spread || next <= TRANSMISSION_DELAY,
                "divergence did not shrink in cycle {cycle}: {spread} -> {next}"
            );
            spread = next;
        }
        assert!(
            spread <= TRANSMISSION_DELAY,
            "network did not converge: spread {spread}"
        );
    }

    #[test]
    fn test_consensus_averages_coarse_offset() {
        let sync = GradientSynchronizer::default();
        let mut clock = clock();
        clock.advance(130_000);
        let mut table = NeighborTable::new();

        let idx = table.insert(NodeAddr(2)).unwrap();
        table.get_mut(idx).state = Phase::Idle;
        table.get_mut(idx).coarse_diff = 2;

        let before = clock.hw_now().coarse;
        sync.consensus_step(&mut table, &mut clock, Phase::Idle);

        // 2 / (1 + 1) = 1 coarse tick backwards
        assert_eq!(clock.hw_now().coarse, before - 1);
        assert_eq!(table.get(idx).coarse_diff, 1);
    }
}
