use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use tracing::{trace, warn};

use crate::core::{Error, LogicalDate, Result, TimerSlot, FINE_MAX};

/// Timer slot lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Slot is free
    Inactive,
    /// Slot is armed at a hardware deadline
    Scheduled,
    /// Slot holds a deadline but the next schedule call only flips it to
    /// `Scheduled` without re-arming
    SinglePass,
    /// Deadline was reached; the owner has not consumed the expiry yet
    JustExpired,
}

/// How a deadline is specified
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScheduleMode {
    /// Absolute logical date
    Date(LogicalDate),
    /// Fine-tick interval from the current logical time
    IntervalNow(u32),
    /// Fine-tick interval from the stored schedule reference
    IntervalRef(u32),
}

/// One of the two hardware timer slots
#[derive(Debug, Clone, Copy)]
struct SlotTimer {
    state: TimerState,
    /// Deadline on the logical time axis
    lg: LogicalDate,
    /// Deadline on the hardware time axis
    hw: LogicalDate,
}

impl SlotTimer {
    fn idle() -> Self {
        SlotTimer {
            state: TimerState::Inactive,
            lg: LogicalDate::new(0, 0),
            hw: LogicalDate::new(0, 0),
        }
    }
}

/// Configuration for the logical clock
#[derive(Debug, Clone)]
pub struct ClockConfig {
    /// Fine counts per coarse tick
    pub fine_max: u32,
    /// Minimum fine-tick distance of a new deadline from now
    pub safety_margin: u32,
    /// Offset movement beyond which armed timers are re-scheduled at their
    /// original logical dates
    pub rearm_threshold: i64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        ClockConfig {
            fine_max: FINE_MAX,
            safety_margin: 2000,
            rearm_threshold: 200,
        }
    }
}

/// Dual coarse/fine logical clock with a two-slot deadline scheduler.
///
/// The hardware counter is modelled as a coarse tick count plus a fine count
/// in `[0, fine_max)`; the test harness (or a platform driver) advances it
/// with [`LogicalClock::advance`]. The logical time axis is the hardware
/// axis shifted by `fine_offset`, which is kept inside the window
/// `[fine_max / 2, 3 * fine_max / 2]` by carrying into the coarse count.
pub struct LogicalClock {
    config: ClockConfig,

    /// Coarse tick count, shared between the hardware and logical axes
    coarse_count: u32,
    /// Hardware fine count within the current coarse tick
    hw_fine: u32,

    /// Logical correction applied to the hardware fine count, nominal
    /// `fine_max`
    fine_offset: i64,
    /// Local oscillator rate multiplier
    clock_rate: f64,
    /// Slow consensus rate, relative (0.0 means nominal)
    avg_rate: f64,

    /// Hardware date at which `fine_offset` was last rate-compensated
    offset_ref: LogicalDate,
    /// `fine_offset` value the armed timers were computed against
    scheduler_offset_ref: i64,
    /// Hardware date interval-from-reference schedules are based on
    schedule_ref: LogicalDate,

    timers: [SlotTimer; 2],

    /// Interrupt lockout stand-in; held while the offset/coarse pair is
    /// inconsistent
    occupied: AtomicBool,
}

impl LogicalClock {
    pub fn new(config: ClockConfig) -> Self {
        let fine_offset = config.fine_max as i64;
        LogicalClock {
            config,
            coarse_count: 0,
            hw_fine: 0,
            fine_offset,
            clock_rate: 1.0,
            avg_rate: 0.0,
            offset_ref: LogicalDate::new(0, 0),
            scheduler_offset_ref: fine_offset,
            schedule_ref: LogicalDate::new(0, 0),
            timers: [SlotTimer::idle(); 2],
            occupied: AtomicBool::new(false),
        }
    }

    fn lock(&self) {
        while self.occupied.swap(true, AtomicOrdering::Acquire) {
            std::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.occupied.store(false, AtomicOrdering::Release);
    }

    /// Current hardware date
    pub fn hw_now(&self) -> LogicalDate {
        LogicalDate::new(self.coarse_count, self.hw_fine)
    }

    /// Current logical correction
    pub fn fine_offset(&self) -> i64 {
        self.fine_offset
    }

    pub fn rate(&self) -> f64 {
        self.clock_rate
    }

    pub fn avg_rate(&self) -> f64 {
        self.avg_rate
    }

    /// Sets the oscillator rate multiplier. Samples outside `[0.7, 1.3]`
    /// are rejected and the previous rate is retained.
    pub fn set_rate(&mut self, rate: f64) {
        if (0.7..=1.3).contains(&rate) {
            self.clock_rate = rate;
        } else {
            trace!(rate, "rate sample out of band, rejected");
        }
    }

    /// Sets the slow consensus rate. Samples outside `[-0.3, 0.3]` are
    /// rejected and the previous rate is retained.
    pub fn set_avg_rate(&mut self, rate: f64) {
        if (-0.3..=0.3).contains(&rate) {
            self.avg_rate = rate;
        } else {
            trace!(rate, "consensus rate sample out of band, rejected");
        }
    }

    /// Fine-tick interval between two dates on the same axis,
    /// `later - earlier`
    pub fn interval(&self, later: LogicalDate, earlier: LogicalDate) -> i64 {
        let coarse = later.coarse as i64 - earlier.coarse as i64;
        coarse * self.config.fine_max as i64 + later.fine as i64 - earlier.fine as i64
    }

    fn hw_interval(&self, later: LogicalDate, earlier: LogicalDate) -> i64 {
        self.interval(later, earlier)
    }

    /// Shifts a hardware date onto the logical axis by an explicit offset
    pub fn apply_offset(&self, hw: LogicalDate, offset: i64) -> LogicalDate {
        self.hw_to_lg(hw, offset)
    }

    /// Applies a signed coarse correction (the clock moves backwards by
    /// `diff` coarse ticks)
    pub fn adjust_coarse_count(&mut self, diff: i32) {
        self.lock();
        self.coarse_count = (self.coarse_count as i64 - diff as i64) as u32;
        self.unlock();
    }

    pub fn fine_max(&self) -> u32 {
        self.config.fine_max
    }

    /// Rate-compensates `fine_offset` over the interval since the last
    /// reference point.
    fn update_offset(&mut self, at: LogicalDate) {
        let interval = self.hw_interval(at, self.offset_ref);
        if interval > 0 {
            self.fine_offset += (interval as f64 * self.avg_rate) as i64;
        }
        self.offset_ref = at;
    }

    /// Shifts a hardware date onto the logical axis by `offset`
    fn hw_to_lg(&self, hw: LogicalDate, offset: i64) -> LogicalDate {
        let fine_max = self.config.fine_max as i64;
        let mut coarse = hw.coarse as i64;
        let mut offset = offset;
        if offset > fine_max {
            coarse += 1;
            offset -= fine_max;
        }
        let mut fine = hw.fine as i64 + offset;
        if fine > fine_max {
            coarse += 1;
            fine -= fine_max;
        }
        LogicalDate::new(coarse as u32, fine as u32)
    }

    /// Current logical date
    pub fn now(&mut self) -> LogicalDate {
        self.lock();
        let hw = self.hw_now();
        self.update_offset(hw);
        let lg = self.hw_to_lg(hw, self.fine_offset);
        self.unlock();
        lg
    }

    /// Projects a hardware date onto the logical axis with the offset the
    /// clock is expected to hold by then.
    pub fn hwdate_to_lgdate(&self, hw: LogicalDate) -> LogicalDate {
        let interval = self.hw_interval(hw, self.offset_ref);
        let offset = self.fine_offset + (interval as f64 * self.avg_rate) as i64;
        self.hw_to_lg(hw, offset)
    }

    /// Applies a signed fine correction (the clock moves backwards by
    /// `diff`), carrying into the coarse count when the offset leaves its
    /// window. Armed timers are re-scheduled at their original logical
    /// dates when the cumulative movement exceeds the re-arm threshold.
    pub fn adjust_fine_offset(&mut self, diff: i64) {
        let fine_max = self.config.fine_max as i64;
        self.lock();
        self.fine_offset -= diff;
        if self.fine_offset < fine_max / 2 {
            self.coarse_count = self.coarse_count.wrapping_sub(1);
            self.fine_offset += fine_max;
        } else if self.fine_offset > fine_max + fine_max / 2 {
            self.coarse_count = self.coarse_count.wrapping_add(1);
            self.fine_offset -= fine_max;
        }
        self.unlock();

        let moved = self.scheduler_offset_ref - self.fine_offset;
        if moved.abs() > self.config.rearm_threshold {
            trace!(moved, "offset moved past re-arm threshold");
            for slot in [TimerSlot::Zero, TimerSlot::One] {
                let timer = self.timers[slot.index()];
                if timer.state == TimerState::Scheduled {
                    if let Err(e) = self.schedule(slot, ScheduleMode::Date(timer.lg)) {
                        warn!(slot = slot.index(), %e, "re-arm failed, keeping stale deadline");
                    }
                }
            }
        }
        self.scheduler_offset_ref = self.fine_offset;
    }

    /// Records the fired hardware date of `slot` as the reference for
    /// interval-from-reference scheduling.
    pub fn set_schedule_ref(&mut self, slot: TimerSlot) {
        self.schedule_ref = self.timers[slot.index()].hw;
    }

    /// Hardware date the given slot is armed at
    pub fn hw_deadline(&self, slot: TimerSlot) -> LogicalDate {
        self.timers[slot.index()].hw
    }

    /// Logical date the given slot is armed at
    pub fn lg_deadline(&self, slot: TimerSlot) -> LogicalDate {
        self.timers[slot.index()].lg
    }

    pub fn timer_state(&self, slot: TimerSlot) -> TimerState {
        self.timers[slot.index()].state
    }

    /// Compares the pending logical deadline of `slot` against `date`.
    /// `None` when the slot holds no deadline.
    pub fn deadline_cmp(&self, slot: TimerSlot, date: LogicalDate) -> Option<Ordering> {
        let timer = &self.timers[slot.index()];
        match timer.state {
            TimerState::Scheduled | TimerState::SinglePass => Some(timer.lg.cmp(&date)),
            _ => None,
        }
    }

    pub fn cancel(&mut self, slot: TimerSlot) {
        self.timers[slot.index()].state = TimerState::Inactive;
    }

    /// Parks the slot so that the next schedule call fires it at its
    /// current deadline instead of re-arming.
    pub fn set_singlepass(&mut self, slot: TimerSlot) {
        self.timers[slot.index()].state = TimerState::SinglePass;
    }

    /// Arms a timer slot. Deadlines in the past or closer than the safety
    /// margin are rejected. A slot in `SinglePass` state flips back to
    /// `Scheduled` at its retained deadline and reports success.
    pub fn schedule(&mut self, slot: TimerSlot, mode: ScheduleMode) -> Result<()> {
        if self.timers[slot.index()].state == TimerState::SinglePass {
            self.timers[slot.index()].state = TimerState::Scheduled;
            return Ok(());
        }

        let (hw_target, lg_target) = match mode {
            ScheduleMode::Date(date) => {
                if date.coarse == 0 && date.fine == 0 {
                    return Err(Error::timing("zero deadline"));
                }
                self.lock();
                let hw_now = self.hw_now();
                self.schedule_ref = hw_now;
                self.update_offset(hw_now);
                let lg_now = self.hw_to_lg(hw_now, self.fine_offset);
                self.unlock();

                let lg_interval = self.hw_interval(date, lg_now);
                if lg_interval < 0 {
                    return Err(Error::timing("deadline already passed"));
                }
                let hw_interval = (lg_interval as f64 * (1.0 + self.avg_rate)) as i64;
                (self.offset_hw(hw_now, hw_interval), date)
            }
            ScheduleMode::IntervalNow(fine) | ScheduleMode::IntervalRef(fine) => {
                let base = if matches!(mode, ScheduleMode::IntervalRef(_)) {
                    self.schedule_ref
                } else {
                    self.hw_now()
                };
                let hw_interval = (fine as f64 * (1.0 + self.avg_rate)) as i64;
                let hw_target = self.offset_hw(base, hw_interval);
                let lg_target = self.hwdate_to_lgdate(hw_target);
                (hw_target, lg_target)
            }
        };

        let hw_now = self.hw_now();
        let near = self.hw_interval(hw_target, hw_now);
        if near < self.config.safety_margin as i64 {
            trace!(slot = slot.index(), near, "deadline rejected");
            return Err(Error::timing(format!(
                "deadline within safety margin ({} < {} fine ticks)",
                near, self.config.safety_margin
            )));
        }

        let timer = &mut self.timers[slot.index()];
        timer.hw = hw_target;
        timer.lg = lg_target;
        timer.state = TimerState::Scheduled;
        Ok(())
    }

    /// Adds a fine-tick interval to a hardware date
    fn offset_hw(&self, base: LogicalDate, interval: i64) -> LogicalDate {
        let fine_max = self.config.fine_max as i64;
        let total = base.fine as i64 + interval;
        let carry = total.div_euclid(fine_max);
        let fine = total.rem_euclid(fine_max);
        LogicalDate::new((base.coarse as i64 + carry) as u32, fine as u32)
    }

    /// Advances the hardware counter by `ticks` fine counts, firing armed
    /// timers whose hardware deadlines are crossed. Fired slots are
    /// returned in deadline order and left in `JustExpired` state.
    pub fn advance(&mut self, ticks: u32) -> Vec<TimerSlot> {
        let mut fired = Vec::new();
        let mut remaining = ticks as i64;
        let fine_max = self.config.fine_max as i64;

        while remaining > 0 {
            let now = self.hw_now();
            // step to the nearest of: requested end, coarse wrap, armed deadline
            let mut step = remaining.min(fine_max - self.hw_fine as i64);
            for t in &self.timers {
                if t.state == TimerState::Scheduled {
                    let dist = self.hw_interval(t.hw, now);
                    if dist > 0 {
                        step = step.min(dist);
                    }
                }
            }
            self.hw_fine += step as u32;
            remaining -= step;
            if self.hw_fine as i64 == fine_max {
                // coarse overflow
                self.hw_fine = 0;
                self.coarse_count = self.coarse_count.wrapping_add(1);
            }
            let now = self.hw_now();
            let mut due: Vec<TimerSlot> = [TimerSlot::Zero, TimerSlot::One]
                .into_iter()
                .filter(|s| {
                    let t = &self.timers[s.index()];
                    t.state == TimerState::Scheduled && t.hw <= now
                })
                .collect();
            due.sort_by_key(|s| self.timers[s.index()].hw);
            for slot in due {
                self.timers[slot.index()].state = TimerState::JustExpired;
                fired.push(slot);
            }
        }
        fired
    }
}

impl Default for LogicalClock {
    fn default() -> Self {
        LogicalClock::new(ClockConfig::default())
    }
}
