//! Utility module
//!
//! This module provides common utilities and helper functions used
//! throughout the library.

use crate::core::FINE_MAX;

/// Converts a floating-point number of seconds to fine clock ticks,
/// assuming the nominal two-second coarse tick.
pub fn secs_to_fine(secs: f64) -> i64 {
    (secs * (FINE_MAX as f64 / 2.0)) as i64
}

/// Converts fine clock ticks to a floating-point number of seconds
pub fn fine_to_secs(ticks: i64) -> f64 {
    ticks as f64 / (FINE_MAX as f64 / 2.0)
}
