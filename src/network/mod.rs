//! Radio medium simulation
//!
//! Nodes exchange announcements over a shared broadcast domain; this
//! module provides the in-process medium that carries them in tests and
//! simulations.

pub mod medium;

pub use self::medium::{MediumConfig, RadioMedium};
