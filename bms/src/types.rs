//! Base types and configuration constants for the battery management engine.
//!
//! All analogue quantities (currents, voltages, temperature, state of
//! charge) are Q8 scaled integers: the stored value is the physical value
//! times 256. This keeps the arithmetic in fast integer operations on
//! processors without a hardware FPU.

// ============================================================================
// Geometry Constants
// ============================================================================

/// Number of battery slots in the reference geometry
pub const NUM_BATTERIES: usize = 3;

/// Number of load circuits
pub const NUM_LOADS: usize = 2;

/// Number of solar panel (charger) inputs
pub const NUM_PANELS: usize = 1;

/// Total measured interfaces: batteries, then loads, then panels
pub const NUM_INTERFACES: usize = NUM_BATTERIES + NUM_LOADS + NUM_PANELS;

/// Switch configurations driven during a calibration run
pub const NUM_CALIBRATION_TESTS: usize = NUM_INTERFACES + 1;

// ============================================================================
// Engine Constants
// ============================================================================

/// Full scale state of charge (100% in Q8)
pub const SOC_MAX: u16 = 100 * 256;

/// Terminal voltage below which a battery is treated as weak (11.5 V in Q8)
pub const WEAK_VOLTAGE: i16 = 2944;

/// Charging is inhibited above this ambient temperature (degrees C, unscaled)
pub const TEMPERATURE_LIMIT: i32 = 45;

/// SoC margin required before the charger is moved to a lower battery
pub const SOC_HYSTERESIS: u16 = 5 * 256;

/// Battery current magnitude regarded as idle (about 80 mA in ADC units)
pub const IDLE_CURRENT_THRESHOLD: i16 = 30;

/// Isolation timer value used when a battery cannot accumulate isolation.
/// Non-zero so that a later reassignment preserves the ranking order.
pub const ISOLATION_SENTINEL: u32 = 10;

/// Panel must exceed the battery terminal by this margin to source current
/// (0.5 V in Q8)
pub const PANEL_VOLTAGE_MARGIN: i16 = 128;

/// Calibration samples at or below this level are invalid (an unpowered
/// interface reads hard negative, around -4000)
pub const CALIBRATION_THRESHOLD: i16 = -50;

/// Sentinel starting the minimum-offset search during calibration
pub const OFFSET_START_VALUE: i16 = 100;

/// One-shot delay before the first monitor pass, letting the measurement
/// task produce its first results (milliseconds)
pub const MONITOR_STARTUP_DELAY: u32 = 1000;

// ============================================================================
// Basic Types
// ============================================================================

/// Battery identifier: 1-based slot number, 0 = unallocated
pub type BatteryId = u8;

/// No battery allocated
pub const NO_BATTERY: BatteryId = 0;

// ============================================================================
// Error Types
// ============================================================================

/// Result type for engine operations
pub type Result<T> = core::result::Result<T, Error>;

/// Error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Battery index out of range
    InvalidBattery,
    /// Interface index out of range
    InvalidInterface,
}

// ============================================================================
// Battery States
// ============================================================================

/// Battery chemistry, selecting the open-circuit-voltage model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum BatteryType {
    /// Flooded lead-acid
    #[default]
    Wet = 0,
    /// Gel cell
    Gel = 1,
    /// Absorbed glass mat
    Agm = 2,
}

/// Charge fill state, derived from terminal voltage and SoC each tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FillState {
    /// Normal working charge
    #[default]
    Normal = 0,
    /// Low charge, loads shed progressively
    Low = 1,
    /// Critically low charge
    Critical = 2,
    /// Charge tracking disagreed with a full-charge reset
    Faulty = 3,
}

/// Operational state: what the battery is currently connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum OpState {
    /// Neither loaded nor charging
    #[default]
    Isolated = 0,
    /// Connected to the loads
    Loaded = 1,
    /// Connected to the charger
    Charging = 2,
}

/// Battery health state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum HealthState {
    /// In service
    #[default]
    Good = 0,
    /// Suspect charge tracking
    Faulty = 1,
    /// Not physically present; excluded from allocation
    Missing = 2,
    /// Terminal voltage below dropout; charger-first, never loaded
    Weak = 3,
}

/// Charging phase maintained by the external charger task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ChargingPhase {
    /// Constant-current charge
    #[default]
    Bulk = 0,
    /// Constant-voltage absorption
    Absorption = 1,
    /// Resting, charge withheld
    Rest = 2,
    /// Maintenance float
    Float = 3,
}

// ============================================================================
// Battery Record
// ============================================================================

/// Per-battery mutable state.
///
/// `soc` and `charge` are coupled: after every update
/// `soc = charge / (capacity * 36)` with capacity in ampere-hours.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BatteryState {
    /// State of charge, percent times 256, 0..=25600
    pub soc: u16,
    /// Accumulated charge, coulombs times 256
    pub charge: i32,
    /// Charge fill state
    pub fill_state: FillState,
    /// Operational state
    pub op_state: OpState,
    /// Health state
    pub health_state: HealthState,
    /// Consecutive ticks with battery current below the idle threshold
    pub current_steady: u16,
    /// Ticks since the battery last left the isolated state
    pub isolation_time: u32,
}

impl BatteryState {
    /// Create a battery record in the initial (isolated, good) state
    pub const fn new() -> Self {
        Self {
            soc: 0,
            charge: 0,
            fill_state: FillState::Normal,
            op_state: OpState::Isolated,
            health_state: HealthState::Good,
            current_steady: 0,
            isolation_time: 0,
        }
    }

    /// Check whether the battery is excluded from allocation
    pub fn is_missing(&self) -> bool {
        self.health_state == HealthState::Missing
    }
}

impl Default for BatteryState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Interface Offsets
// ============================================================================

/// Flat interface index of battery `i`
pub const fn battery_interface(i: usize) -> usize {
    i
}

/// Flat interface index of load `j`
pub const fn load_interface(j: usize) -> usize {
    NUM_BATTERIES + j
}

/// Flat interface index of panel `k`
pub const fn panel_interface(k: usize) -> usize {
    NUM_BATTERIES + NUM_LOADS + k
}

/// Per-interface current offsets in ADC units, derived by calibration.
///
/// Storage is flat (batteries, then loads, then panels) with typed views
/// for each interface class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterfaceOffsets {
    data: [i16; NUM_INTERFACES],
}

impl InterfaceOffsets {
    /// All offsets zero (uncalibrated)
    pub const fn zeroed() -> Self {
        Self {
            data: [0; NUM_INTERFACES],
        }
    }

    /// Offset by flat interface index
    pub fn get(&self, iface: usize) -> i16 {
        self.data[iface]
    }

    /// Set offset by flat interface index
    pub fn set(&mut self, iface: usize, offset: i16) {
        self.data[iface] = offset;
    }

    /// Offset of battery interface `i`
    pub fn battery(&self, i: usize) -> i16 {
        self.data[battery_interface(i)]
    }

    /// Offset of load interface `j`
    pub fn load(&self, j: usize) -> i16 {
        self.data[load_interface(j)]
    }

    /// Offset of panel interface `k`
    pub fn panel(&self, k: usize) -> i16 {
        self.data[panel_interface(k)]
    }
}

// ============================================================================
// Decision Status
// ============================================================================

/// Diagnostic bits recording why the allocator chose as it did.
///
/// The tick's accumulated word is emitted as the `dd` debug event.
pub mod decision {
    /// Charger on lowest battery, isolation respected
    pub const CHARGER_LOWEST: u16 = 0x01;
    /// Charger on lowest battery, isolation ignored
    pub const CHARGER_LOWEST_ANY: u16 = 0x02;
    /// Charger moved to a battery lower by the hysteresis margin
    pub const CHARGER_MOVED_LOWER: u16 = 0x03;
    /// Charger forced onto a weak battery
    pub const CHARGER_WEAK: u16 = 0x04;
    /// Charger forced onto a critical battery
    pub const CHARGER_CRITICAL: u16 = 0x08;
    /// Load on highest battery, isolation and charge separation respected
    pub const LOAD_HIGHEST: u16 = 0x10;
    /// Load allocated with isolation ignored
    pub const LOAD_NO_ISOLATION: u16 = 0x20;
    /// Load moved off a low battery toward the charge hysteresis margin
    pub const LOAD_MOVED_LOWER: u16 = 0x30;
    /// Load allocated with only the weak-battery constraint
    pub const LOAD_ANY_NOT_WEAK: u16 = 0x40;
    /// Load collapsed onto the charging battery to preserve continuity
    pub const LOAD_ON_CHARGER: u16 = 0x80;
    /// Charger disabled: panel below every battery terminal
    pub const CHARGER_OFF_PANEL_LOW: u16 = 0x100;
    /// Charger disabled: every battery in float phase
    pub const CHARGER_OFF_ALL_FLOAT: u16 = 0x200;
    /// Single-battery allocation branch taken
    pub const SINGLE_BATTERY: u16 = 0x1000;
    /// Multi-battery allocation branch taken
    pub const MULTI_BATTERY: u16 = 0x2000;
}

// ============================================================================
// Switch Destinations
// ============================================================================

/// Switch matrix destinations a battery can be routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum SwitchDest {
    /// Low-priority load circuit
    Load1 = 0,
    /// High-priority load circuit
    Load2 = 1,
    /// Solar panel (charger) input
    Panel = 2,
}

impl SwitchDest {
    /// All destinations, in switch-matrix order
    pub const ALL: [SwitchDest; NUM_LOADS + NUM_PANELS] =
        [SwitchDest::Load1, SwitchDest::Load2, SwitchDest::Panel];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_layout() {
        assert_eq!(battery_interface(0), 0);
        assert_eq!(load_interface(0), NUM_BATTERIES);
        assert_eq!(panel_interface(0), NUM_BATTERIES + NUM_LOADS);
        assert_eq!(panel_interface(NUM_PANELS - 1), NUM_INTERFACES - 1);
    }

    #[test]
    fn offsets_views_agree() {
        let mut offsets = InterfaceOffsets::zeroed();
        offsets.set(load_interface(1), -7);
        assert_eq!(offsets.load(1), -7);
        assert_eq!(offsets.get(NUM_BATTERIES + 1), -7);
    }

    #[test]
    fn battery_record_defaults() {
        let battery = BatteryState::new();
        assert_eq!(battery.op_state, OpState::Isolated);
        assert_eq!(battery.health_state, HealthState::Good);
        assert!(!battery.is_missing());
    }
}
