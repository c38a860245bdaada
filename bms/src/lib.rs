//! # Solar Battery Management Engine
//!
//! Allocation and state-tracking core for a multi-battery solar power
//! installation: one charging source, two load circuits, and a bank of
//! batteries whose state of charge is tracked by Coulomb counting and
//! periodically re-referenced from open-circuit voltage readings.
//!
//! Each monitor tick the engine:
//! - folds the measured charge deltas into per-battery SoC estimates,
//! - derives fill and health states from voltages and SoC,
//! - ranks the bank and assigns the charger and the loads under the
//!   configured policies (load/charge separation, isolation preservation),
//! - applies the assignment to the switch matrix when auto-track is on.
//!
//! An offset-calibration sequence steps the switch matrix through every
//! interface to derive per-interface current offsets and the system
//! quiescent current.
//!
//! All quantities are Q8 scaled integers (value times 256); there is no
//! floating point and no allocation on the tick path.
//!
//! ## Quick Start
//!
//! ```ignore
//! use bms::prelude::*;
//!
//! let mut hal = BoardHal::init();
//! let mut monitor = Monitor::new(Config::default(), &mut hal);
//!
//! loop {
//!     monitor.tick(&mut hal);
//!     hal.delay_ticks(monitor.config().monitor_delay);
//! }
//! ```
//!
//! The engine is deterministic against a scripted HAL; see `SimHal` and
//! the property-test suite.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(any(test, feature = "std"))]
extern crate std;

// Core modules
pub mod calibration;
pub mod config;
pub mod hal;
pub mod monitor;
pub mod soc;
pub mod types;

// Re-exports for convenience
pub use config::{Config, PRESERVE_ISOLATION, SEPARATE_LOAD};
pub use hal::Hal;
#[cfg(any(test, feature = "std"))]
pub use hal::{SimEvent, SimHal};
pub use monitor::Monitor;
pub use soc::compute_soc;
pub use types::*;

/// Prelude - commonly used items
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::hal::Hal;
    pub use crate::monitor::Monitor;
    pub use crate::soc::compute_soc;
    pub use crate::types::*;
}

// ============================================================================
// Version
// ============================================================================

/// Major version
pub const VERSION_MAJOR: u32 = 1;
/// Minor version
pub const VERSION_MINOR: u32 = 0;
/// Patch version
pub const VERSION_PATCH: u32 = 0;
/// Version string
pub const VERSION_STRING: &str = "1.0.0";

/// Get version as packed integer (major << 16 | minor << 8 | patch)
pub const fn version() -> u32 {
    (VERSION_MAJOR << 16) | (VERSION_MINOR << 8) | VERSION_PATCH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(version(), 0x010000);
        assert_eq!(VERSION_STRING, "1.0.0");
    }
}
