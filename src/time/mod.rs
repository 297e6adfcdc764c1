//! Logical time management
//!
//! The clock a node steers is not the hardware oscillator itself but a
//! logical projection of it: a coarse tick count plus a fine count, shifted
//! by a correction offset the synchronizers adjust. The module provides:
//!
//! - the dual coarse/fine [`LogicalClock`] with conversion between the
//!   hardware and logical time axes
//! - a two-slot deadline scheduler with a safety margin against arming
//!   deadlines the dispatcher could no longer meet
//! - re-arming of pending deadlines when the correction offset moves far
//!   enough to invalidate their hardware dates
//!
//! # Examples
//!
//! ```
//! use csync::core::TimerSlot;
//! use csync::time::{LogicalClock, ScheduleMode};
//!
//! let mut clock = LogicalClock::default();
//! clock.advance(1_000);
//! clock
//!     .schedule(TimerSlot::Zero, ScheduleMode::IntervalNow(10_000))
//!     .unwrap();
//! let fired = clock.advance(20_000);
//! assert_eq!(fired, vec![TimerSlot::Zero]);
//! ```

mod clock;

pub use self::clock::{ClockConfig, LogicalClock, ScheduleMode, TimerState};
