//! Hardware abstraction for the engine's external collaborators.
//!
//! The monitor reaches every peripheral concern through one trait covering
//! the capability set {measure, switch, charger phase, persist, emit}:
//!
//! - measurement accessors backed by the analogue acquisition task,
//! - the switch matrix driver,
//! - the charging phase signal shared with the charger task,
//! - non-volatile persistence of the configuration block,
//! - the outbound event channel (serial and recording sinks).
//!
//! # Implementing a HAL
//!
//! ```ignore
//! struct BoardHal { /* peripherals */ }
//!
//! impl Hal for BoardHal {
//!     fn battery_voltage(&self, battery: usize) -> i16 {
//!         // Read filtered ADC result
//!     }
//!
//!     fn delay_ticks(&mut self, ticks: u32) {
//!         // Cooperative sleep; other tasks run here
//!     }
//!
//!     // ... implement other methods
//! }
//! ```

use crate::config::Config;
use crate::types::{BatteryId, ChargingPhase, SwitchDest};

// ============================================================================
// HAL Trait
// ============================================================================

/// Collaborator interface used by the monitor and calibration routines.
///
/// Event emission may block briefly when the outbound queue is full; the
/// implementation drops the message after its per-message timeout rather
/// than stalling the monitor. Engine decisions never depend on delivery.
pub trait Hal {
    // ------------------------------------------------------------------------
    // Measurement
    // ------------------------------------------------------------------------

    /// Battery terminal current, ADC units (Q8 amperes)
    fn battery_current(&self, battery: usize) -> i16;

    /// Battery terminal voltage, Q8 volts
    fn battery_voltage(&self, battery: usize) -> i16;

    /// Load circuit current, ADC units
    fn load_current(&self, load: usize) -> i16;

    /// Load circuit voltage, Q8 volts
    fn load_voltage(&self, load: usize) -> i16;

    /// Panel current, ADC units
    fn panel_current(&self, panel: usize) -> i16;

    /// Panel voltage, Q8 volts
    fn panel_voltage(&self, panel: usize) -> i16;

    /// Ambient temperature, Q8 degrees C
    fn temperature(&self) -> i32;

    /// Interface indicator bits; bit `2i+1` set means battery `i` present
    fn indicators(&self) -> u16;

    /// Current of a flat-indexed interface (batteries, loads, panels)
    fn interface_current(&self, iface: usize) -> i16;

    /// Charge accumulated on a battery since the last call, coulombs times
    /// 256. The read is destructive: each call returns the new delta.
    fn accumulated_charge(&mut self, battery: usize) -> i16;

    // ------------------------------------------------------------------------
    // Switch Matrix
    // ------------------------------------------------------------------------

    /// Route a battery (1-based, 0 disconnects) to a destination
    fn set_switch(&mut self, battery: BatteryId, dest: SwitchDest);

    /// Raw switch matrix control bits, two per destination
    fn switch_control_bits(&self) -> u8;

    /// Restore a previously saved switch matrix configuration
    fn set_switch_control_bits(&mut self, bits: u8);

    /// Latch an interface's over-current breaker open.
    /// Driven by the external command surface, not by the engine.
    fn over_current_reset(&mut self, iface: usize);

    /// Release an interface's over-current breaker
    fn over_current_release(&mut self, iface: usize);

    // ------------------------------------------------------------------------
    // Charger Link
    // ------------------------------------------------------------------------

    /// Charging phase of a battery, maintained by the charger task
    fn charging_phase(&self, battery: usize) -> ChargingPhase;

    /// Override a battery's charging phase
    fn set_charging_phase(&mut self, battery: usize, phase: ChargingPhase);

    /// Tell the charger which battery the allocator prefers, so the
    /// selection survives auto-track being switched off
    fn set_preferred_charge_target(&mut self, battery: BatteryId);

    // ------------------------------------------------------------------------
    // Timing
    // ------------------------------------------------------------------------

    /// Cooperative sleep in milliseconds; the only suspension point the
    /// engine uses
    fn delay_ticks(&mut self, ticks: u32);

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Persist the configuration block to NVM. Returns false on failure;
    /// the caller keeps the in-RAM configuration authoritative either way.
    fn write_config_block(&mut self, config: &Config) -> bool;

    // ------------------------------------------------------------------------
    // Event Channel
    // ------------------------------------------------------------------------

    /// Emit a labelled record carrying two integers
    fn send_data(&mut self, label: &str, first: i32, second: i32);

    /// Emit a labelled record carrying one integer
    fn send_response(&mut self, label: &str, value: i32);

    /// Emit a labelled free-text record
    fn send_string(&mut self, label: &str, text: &str);
}

// ============================================================================
// Simulation HAL (for testing)
// ============================================================================

#[cfg(any(test, feature = "std"))]
pub use sim::{SimEvent, SimHal};

#[cfg(any(test, feature = "std"))]
mod sim {
    use super::*;
    use crate::types::{
        battery_interface, load_interface, panel_interface, NO_BATTERY, NUM_BATTERIES,
        NUM_INTERFACES,
    };
    use heapless::String;
    use std::vec::Vec;

    /// Record captured from the engine's event channel
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum SimEvent {
        /// Two-integer data record
        Data {
            label: String<8>,
            first: i32,
            second: i32,
        },
        /// Single-integer response record
        Response { label: String<8>, value: i32 },
        /// Free-text record
        Text { label: String<8>, text: String<32> },
    }

    impl SimEvent {
        /// The record's label
        pub fn label(&self) -> &str {
            match self {
                SimEvent::Data { label, .. } => label,
                SimEvent::Response { label, .. } => label,
                SimEvent::Text { label, .. } => label,
            }
        }
    }

    fn copy_label(label: &str) -> String<8> {
        let mut out = String::new();
        out.push_str(label).ok();
        out
    }

    /// Deterministic in-memory HAL driving the engine in tests and in the
    /// simulation harness.
    ///
    /// Measurements are plain settable fields. The switch matrix is modeled
    /// as the real two-bits-per-destination control byte, and an optional
    /// hook recomputes the interface currents whenever the matrix changes,
    /// which is enough to script every calibration scenario.
    pub struct SimHal {
        /// Interface currents, flat indexing
        pub currents: [i16; NUM_INTERFACES],
        /// Interface voltages, flat indexing
        pub voltages: [i16; NUM_INTERFACES],
        /// Ambient temperature, Q8 degrees C
        pub temperature: i32,
        /// Indicator bits
        pub indicators: u16,
        /// Pending Coulomb-count deltas, drained by `accumulated_charge`
        pub accumulated: [i32; NUM_BATTERIES],
        /// Charging phases as the charger task would hold them
        pub phases: [ChargingPhase; NUM_BATTERIES],
        /// Switch matrix control byte
        switch_bits: u8,
        /// Recomputes currents after any switch matrix change
        pub switch_hook: Option<fn(&mut SimHal)>,
        /// Battery the allocator nominated for charge
        pub preferred_charge_target: BatteryId,
        /// Result returned by `write_config_block`
        pub persist_ok: bool,
        /// Number of configuration block writes
        pub config_writes: u32,
        /// Last persisted configuration
        pub persisted: Option<Config>,
        /// Every event emitted by the engine
        pub events: Vec<SimEvent>,
        /// Every cooperative delay requested, milliseconds
        pub delays: Vec<u32>,
        /// Every switch routing command, in order
        pub switch_ops: Vec<(BatteryId, SwitchDest)>,
        /// Over-current latch commands: (interface, reset)
        pub over_current_ops: Vec<(usize, bool)>,
    }

    impl SimHal {
        /// A healthy three-battery bank: 12.8 V terminals, 14 V panel,
        /// 25 C, everything present, all phases bulk
        pub fn new() -> Self {
            let mut voltages = [3277; NUM_INTERFACES];
            voltages[panel_interface(0)] = 3584;
            let mut indicators = 0;
            for battery in 0..NUM_BATTERIES {
                indicators |= 1 << (2 * battery + 1);
            }
            Self {
                currents: [0; NUM_INTERFACES],
                voltages,
                temperature: 25 * 256,
                indicators,
                accumulated: [0; NUM_BATTERIES],
                phases: [ChargingPhase::Bulk; NUM_BATTERIES],
                switch_bits: 0,
                switch_hook: None,
                preferred_charge_target: NO_BATTERY,
                persist_ok: true,
                config_writes: 0,
                persisted: None,
                events: Vec::new(),
                delays: Vec::new(),
                switch_ops: Vec::new(),
                over_current_ops: Vec::new(),
            }
        }

        /// Set a battery's terminal voltage
        pub fn set_battery_voltage(&mut self, battery: usize, voltage: i16) {
            self.voltages[battery_interface(battery)] = voltage;
        }

        /// Set a battery's terminal current
        pub fn set_battery_current(&mut self, battery: usize, current: i16) {
            self.currents[battery_interface(battery)] = current;
        }

        /// Set a panel's voltage
        pub fn set_panel_voltage(&mut self, panel: usize, voltage: i16) {
            self.voltages[panel_interface(panel)] = voltage;
        }

        /// Mark a battery's presence indicator
        pub fn set_battery_present(&mut self, battery: usize, present: bool) {
            let bit = 1 << (2 * battery + 1);
            if present {
                self.indicators |= bit;
            } else {
                self.indicators &= !bit;
            }
        }

        /// Battery currently routed to a destination (0 = disconnected)
        pub fn switch_setting(&self, dest: SwitchDest) -> BatteryId {
            (self.switch_bits >> (2 * dest as u8)) & 0x03
        }

        /// Events carrying the given label, in emission order
        pub fn events_labelled(&self, label: &str) -> Vec<&SimEvent> {
            self.events.iter().filter(|e| e.label() == label).collect()
        }

        /// Value of the most recent single-integer record with this label
        pub fn last_response(&self, label: &str) -> Option<i32> {
            self.events.iter().rev().find_map(|event| match event {
                SimEvent::Response { label: l, value } if l.as_str() == label => Some(*value),
                _ => None,
            })
        }

        fn apply_switch_hook(&mut self) {
            if let Some(hook) = self.switch_hook {
                hook(self);
            }
        }
    }

    impl Default for SimHal {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Hal for SimHal {
        fn battery_current(&self, battery: usize) -> i16 {
            self.currents[battery_interface(battery)]
        }

        fn battery_voltage(&self, battery: usize) -> i16 {
            self.voltages[battery_interface(battery)]
        }

        fn load_current(&self, load: usize) -> i16 {
            self.currents[load_interface(load)]
        }

        fn load_voltage(&self, load: usize) -> i16 {
            self.voltages[load_interface(load)]
        }

        fn panel_current(&self, panel: usize) -> i16 {
            self.currents[panel_interface(panel)]
        }

        fn panel_voltage(&self, panel: usize) -> i16 {
            self.voltages[panel_interface(panel)]
        }

        fn temperature(&self) -> i32 {
            self.temperature
        }

        fn indicators(&self) -> u16 {
            self.indicators
        }

        fn interface_current(&self, iface: usize) -> i16 {
            self.currents[iface]
        }

        fn accumulated_charge(&mut self, battery: usize) -> i16 {
            let delta = self.accumulated[battery].clamp(i16::MIN as i32, i16::MAX as i32);
            self.accumulated[battery] -= delta;
            delta as i16
        }

        fn set_switch(&mut self, battery: BatteryId, dest: SwitchDest) {
            let shift = 2 * dest as u8;
            self.switch_bits = (self.switch_bits & !(0x03 << shift)) | ((battery & 0x03) << shift);
            self.switch_ops.push((battery, dest));
            self.apply_switch_hook();
        }

        fn switch_control_bits(&self) -> u8 {
            self.switch_bits
        }

        fn set_switch_control_bits(&mut self, bits: u8) {
            self.switch_bits = bits;
            self.apply_switch_hook();
        }

        fn over_current_reset(&mut self, iface: usize) {
            self.over_current_ops.push((iface, true));
        }

        fn over_current_release(&mut self, iface: usize) {
            self.over_current_ops.push((iface, false));
        }

        fn charging_phase(&self, battery: usize) -> ChargingPhase {
            self.phases[battery]
        }

        fn set_charging_phase(&mut self, battery: usize, phase: ChargingPhase) {
            self.phases[battery] = phase;
        }

        fn set_preferred_charge_target(&mut self, battery: BatteryId) {
            self.preferred_charge_target = battery;
        }

        fn delay_ticks(&mut self, ticks: u32) {
            self.delays.push(ticks);
        }

        fn write_config_block(&mut self, config: &Config) -> bool {
            self.config_writes += 1;
            if self.persist_ok {
                self.persisted = Some(*config);
            }
            self.persist_ok
        }

        fn send_data(&mut self, label: &str, first: i32, second: i32) {
            self.events.push(SimEvent::Data {
                label: copy_label(label),
                first,
                second,
            });
        }

        fn send_response(&mut self, label: &str, value: i32) {
            self.events.push(SimEvent::Response {
                label: copy_label(label),
                value,
            });
        }

        fn send_string(&mut self, label: &str, text: &str) {
            let mut copy = String::new();
            // Truncate on a character boundary; a fixed byte cut can land
            // inside a multi-byte codepoint
            let mut cut = text.len().min(32);
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            copy.push_str(&text[..cut]).ok();
            self.events.push(SimEvent::Text {
                label: copy_label(label),
                text: copy,
            });
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn switch_bits_track_routing() {
            let mut hal = SimHal::new();
            hal.set_switch(2, SwitchDest::Load2);
            hal.set_switch(3, SwitchDest::Panel);
            assert_eq!(hal.switch_setting(SwitchDest::Load2), 2);
            assert_eq!(hal.switch_setting(SwitchDest::Panel), 3);
            assert_eq!(hal.switch_setting(SwitchDest::Load1), 0);

            let saved = hal.switch_control_bits();
            hal.set_switch(0, SwitchDest::Load2);
            assert_eq!(hal.switch_setting(SwitchDest::Load2), 0);
            hal.set_switch_control_bits(saved);
            assert_eq!(hal.switch_setting(SwitchDest::Load2), 2);
        }

        #[test]
        fn accumulated_charge_reads_are_destructive() {
            let mut hal = SimHal::new();
            hal.accumulated[1] = 500;
            assert_eq!(hal.accumulated_charge(1), 500);
            assert_eq!(hal.accumulated_charge(1), 0);
        }

        #[test]
        fn indicator_helper_clears_presence_bit() {
            let mut hal = SimHal::new();
            assert_ne!(hal.indicators() & (1 << 3), 0);
            hal.set_battery_present(1, false);
            assert_eq!(hal.indicators() & (1 << 3), 0);
        }
    }
}
