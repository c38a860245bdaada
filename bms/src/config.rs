//! Persisted engine configuration.
//!
//! The live configuration is owned by the monitor and persisted as a block
//! through the HAL. A failed write is non-fatal: the in-RAM copy stays
//! authoritative until the next boot.

use crate::types::{BatteryType, InterfaceOffsets, NUM_BATTERIES};

// ============================================================================
// Monitor Strategy Flags
// ============================================================================

/// Keep the loads off the battery that is being charged
pub const SEPARATE_LOAD: u8 = 1 << 0;

/// Keep the longest-isolated battery out of allocation so its terminal
/// voltage can be trusted as an open-circuit reading
pub const PRESERVE_ISOLATION: u8 = 1 << 1;

// ============================================================================
// Configuration Record
// ============================================================================

/// Engine configuration, persisted to NVM as one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Apply allocator output to the switch matrix
    pub auto_track: bool,
    /// Strategy bitfield: [`SEPARATE_LOAD`], [`PRESERVE_ISOLATION`]
    pub monitor_strategy: u8,
    /// Terminal voltage for the low fill state, volts times 256
    pub low_voltage: i16,
    /// Terminal voltage for the critical fill state, volts times 256
    pub critical_voltage: i16,
    /// SoC for the low fill state, percent times 256
    pub low_soc: u16,
    /// SoC for the critical fill state, percent times 256
    pub critical_soc: u16,
    /// SoC below which a floating battery is pushed back to bulk charge
    pub float_bulk_soc: u16,
    /// Battery chemistry per slot
    pub battery_type: [BatteryType; NUM_BATTERIES],
    /// Battery capacity per slot, ampere-hours
    pub battery_capacity: [i16; NUM_BATTERIES],
    /// Monitor tick period, milliseconds
    pub monitor_delay: u32,
    /// Settle time between calibration switch configurations, milliseconds
    pub calibration_delay: u32,
    /// Watchdog check period, milliseconds
    pub watchdog_delay: u32,
    /// Calibrated per-interface current offsets
    pub current_offsets: InterfaceOffsets,
}

impl Config {
    /// Pack the software control bits reported in the snapshot
    pub fn controls(&self) -> u16 {
        let mut controls = 0;
        if self.auto_track {
            controls |= 1 << 0;
        }
        controls
    }

    /// Loads must not share the charging battery
    pub fn separate_load(&self) -> bool {
        self.monitor_strategy & SEPARATE_LOAD != 0
    }

    /// The longest-isolated battery is held out of allocation
    pub fn preserve_isolation(&self) -> bool {
        self.monitor_strategy & PRESERVE_ISOLATION != 0
    }

    /// Monitor ticks in one hour at the configured tick period
    pub fn ticks_per_hour(&self) -> u32 {
        3_600_000 / self.monitor_delay
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_track: false,
            monitor_strategy: SEPARATE_LOAD | PRESERVE_ISOLATION,
            low_voltage: 3072,      // 12.00 V
            critical_voltage: 2969, // 11.60 V
            low_soc: 50 * 256,
            critical_soc: 10 * 256,
            float_bulk_soc: 95 * 256,
            battery_type: [BatteryType::Wet; NUM_BATTERIES],
            battery_capacity: [100; NUM_BATTERIES],
            monitor_delay: 1000,
            calibration_delay: 2000,
            watchdog_delay: 500,
            current_offsets: InterfaceOffsets::zeroed(),
        }
    }
}
