//! Regression synchronizer
//!
//! Alternative to the gradient scheme for single-reference setups: a
//! round-robin table of (local time, offset) samples against one
//! reference neighbor, fitted by least squares. The slope of the fit is
//! the clock skew, the intercept the remaining offset.

use tracing::debug;

use crate::protocol::neighbors::Neighbor;
use crate::time::LogicalClock;

/// Tuning parameters of the regression synchronizer
#[derive(Debug, Clone)]
pub struct RegressionConfig {
    /// Samples kept in the round-robin table
    pub max_entries: usize,
    /// Samples needed before the fit is trusted
    pub valid_limit: usize,
    /// Offsets beyond this magnitude are rejected once synced
    pub throwout_limit: i64,
    /// Consecutive rejections tolerated before the table is cleared
    pub max_errors: u32,
}

impl Default for RegressionConfig {
    fn default() -> Self {
        RegressionConfig {
            max_entries: 8,
            valid_limit: 4,
            throwout_limit: 1000,
            max_errors: 5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RegressionEntry {
    local: i64,
    offset: i64,
}

#[derive(Debug, Clone)]
pub struct RegressionSynchronizer {
    config: RegressionConfig,
    table: Vec<Option<RegressionEntry>>,
    free_item: usize,
    num_errors: u32,
}

impl Default for RegressionSynchronizer {
    fn default() -> Self {
        RegressionSynchronizer::new(RegressionConfig::default())
    }
}

impl RegressionSynchronizer {
    pub fn new(config: RegressionConfig) -> Self {
        let table = vec![None; config.max_entries];
        RegressionSynchronizer {
            config,
            table,
            free_item: 0,
            num_errors: 0,
        }
    }

    fn entries(&self) -> usize {
        self.table.iter().filter(|e| e.is_some()).count()
    }

    /// True once enough samples are collected for a trustworthy fit
    pub fn is_synced(&self) -> bool {
        self.entries() >= self.config.valid_limit
    }

    pub fn clear(&mut self) {
        for entry in self.table.iter_mut() {
            *entry = None;
        }
        self.free_item = 0;
        self.num_errors = 0;
    }

    /// Adds the neighbor's current offset at `local_time` to the table.
    /// Once synced, offsets beyond the throwout limit are rejected; too
    /// many consecutive rejections clear the table and force a fresh
    /// start. Returns whether the sample was incorporated.
    pub fn record(&mut self, n: &Neighbor, local_time: i64) -> bool {
        if self.is_synced() && n.fine_diff.abs() > self.config.throwout_limit {
            self.num_errors += 1;
            debug!(neighbor = %n.addr, fine_diff = n.fine_diff, errors = self.num_errors,
                "sample beyond throwout limit");
            if self.num_errors > self.config.max_errors {
                self.clear();
            }
            return false;
        }

        self.num_errors = 0;

        let slot = self
            .table
            .iter()
            .position(|e| e.is_none())
            .unwrap_or(self.free_item);
        self.table[slot] = Some(RegressionEntry {
            local: local_time,
            offset: n.fine_diff,
        });
        self.free_item = (slot + 1) % self.config.max_entries;
        true
    }

    /// Fits skew and offset over the table and publishes both to the
    /// clock: the slope becomes the consensus rate, the mean offset is
    /// applied as a fine correction. No-op while the table is empty.
    pub fn fit(&self, clock: &mut LogicalClock) -> Option<(f64, i64)> {
        let samples: Vec<RegressionEntry> = self.table.iter().flatten().copied().collect();
        if samples.is_empty() {
            return None;
        }

        let count = samples.len() as f64;
        let local_avg = samples.iter().map(|e| e.local as f64).sum::<f64>() / count;
        let offset_avg = samples.iter().map(|e| e.offset as f64).sum::<f64>() / count;

        let mut local_sum = 0.0;
        let mut offset_sum = 0.0;
        for e in &samples {
            let a = e.local as f64 - local_avg;
            let b = e.offset as f64 - offset_avg;
            local_sum += a * a;
            offset_sum += a * b;
        }

        let skew = if local_sum != 0.0 {
            offset_sum / local_sum
        } else {
            clock.avg_rate()
        };
        let offset = offset_avg as i64;

        clock.set_avg_rate(skew);
        clock.adjust_fine_offset(offset);

        debug!(skew, offset, samples = samples.len(), "regression fit applied");
        Some((skew, offset))
    }
}
