//! Clock synchronization module
//!
//! Two synchronizers share the neighbor history kept by the protocol
//! layer: a gradient consensus synchronizer that nudges the logical
//! clock towards the neighborhood average, and a regression
//! synchronizer that fits skew and offset against a single reference.

pub mod gradient;
pub mod regression;

pub use self::gradient::{GradientConfig, GradientSynchronizer};
pub use self::regression::{RegressionConfig, RegressionSynchronizer};

/// Utility functions for synchronization
pub mod util {
    /// Elapsed fine ticks from stamp `a` to stamp `b` on a counter that
    /// wraps at `modulus`. Stamps are assumed less than one wrap apart.
    pub fn delta_wrapped(a: u32, b: u32, modulus: u32) -> i64 {
        if a <= b {
            (b - a) as i64
        } else {
            b as i64 + (modulus - a) as i64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::util::delta_wrapped;

    #[test]
    fn test_delta_wrapped_forward() {
        assert_eq!(delta_wrapped(100, 150, 62_500), 50);
        assert_eq!(delta_wrapped(0, 0, 62_500), 0);
    }

    #[test]
    fn test_delta_wrapped_across_boundary() {
        // stamp taken just before the wrap, observed just after
        assert_eq!(delta_wrapped(62_490, 30, 62_500), 40);
    }
}
