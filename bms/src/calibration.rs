//! Interface current offset calibration.
//!
//! The routine steps the switch matrix through one configuration per
//! interface plus a final all-off configuration, recording every interface
//! current each time. The minimum valid sample per interface is its ADC
//! offset; the maximum offset-corrected battery sample is the quiescent
//! current drawn by the system electronics. The system should have been
//! left quiescent for some hours beforehand so the terminal voltages can
//! re-seed the state of charge at the end of the run.

use crate::hal::Hal;
use crate::monitor::Monitor;
use crate::soc::compute_soc;
use crate::types::{
    battery_interface, BatteryId, HealthState, InterfaceOffsets, OpState, SwitchDest,
    CALIBRATION_THRESHOLD, NO_BATTERY, NUM_BATTERIES, NUM_CALIBRATION_TESTS, NUM_INTERFACES,
    OFFSET_START_VALUE,
};

/// Interface currents recorded per switch configuration
pub type SampleMatrix = [[i16; NUM_INTERFACES]; NUM_CALIBRATION_TESTS];

/// Starting point for the quiescent-current maximum search
const QUIESCENT_START_VALUE: i16 = -100;

// ============================================================================
// Offset Estimation
// ============================================================================

/// Derive per-interface offsets and subtract them from the samples.
///
/// The offset is the minimum sample above [`CALIBRATION_THRESHOLD`]; an
/// interface with no valid sample keeps a zero offset and is treated as
/// uncalibrated rather than as an error.
pub fn derive_offsets(results: &mut SampleMatrix) -> InterfaceOffsets {
    let mut offsets = InterfaceOffsets::zeroed();
    for iface in 0..NUM_INTERFACES {
        let mut offset = OFFSET_START_VALUE;
        for test in 0..NUM_CALIBRATION_TESTS {
            let current = results[test][iface];
            if current > CALIBRATION_THRESHOLD && current < offset {
                offset = current;
            }
        }
        // Untouched sentinel: every sample was invalid
        if offset == OFFSET_START_VALUE {
            offset = 0;
        }
        for test in 0..NUM_CALIBRATION_TESTS {
            results[test][iface] -= offset;
        }
        offsets.set(iface, offset);
    }
    offsets
}

/// Largest offset-corrected current seen on any present battery interface
pub fn quiescent_current(
    results: &SampleMatrix,
    present: &[bool; NUM_BATTERIES],
) -> i16 {
    let mut quiescent = QUIESCENT_START_VALUE;
    for battery in 0..NUM_BATTERIES {
        if !present[battery] {
            continue;
        }
        for test in 0..NUM_CALIBRATION_TESTS {
            let current = results[test][battery_interface(battery)];
            if current > CALIBRATION_THRESHOLD && current > quiescent {
                quiescent = current;
            }
        }
    }
    quiescent
}

// ============================================================================
// Calibration Sequence
// ============================================================================

impl Monitor {
    /// Run the full calibration sequence to completion.
    ///
    /// Blocks only through the per-configuration settle delay on the HAL.
    /// There is no cancellation path; the saved switch configuration is
    /// always restored.
    pub(crate) fn run_calibration<H: Hal>(&mut self, hal: &mut H) {
        // Kept aside to restore after calibration
        let saved_switches = hal.switch_control_bits();
        let mut results: SampleMatrix = [[0; NUM_INTERFACES]; NUM_CALIBRATION_TESTS];
        self.offsets = InterfaceOffsets::zeroed();

        for test in 0..NUM_CALIBRATION_TESTS {
            for dest in SwitchDest::ALL {
                hal.set_switch(NO_BATTERY, dest);
            }
            if test < NUM_BATTERIES {
                // Load 2 across each battery in turn
                hal.set_switch((test + 1) as BatteryId, SwitchDest::Load2);
            } else if test < NUM_CALIBRATION_TESTS - 1 {
                // Then load 1; the last configuration leaves every switch
                // open so the panel interface is measured unloaded
                hal.set_switch((test - NUM_BATTERIES + 1) as BatteryId, SwitchDest::Load1);
            }
            // Currents settle quickly but terminal voltages take a few
            // seconds, which can slightly affect some currents
            hal.delay_ticks(self.config.calibration_delay);

            // An absent battery only shows on its indicator while a load is
            // applied, so absence latches for the rest of the run and is
            // never cleared here
            let indicators = hal.indicators();
            for battery in 0..NUM_BATTERIES {
                if indicators & (1 << (2 * battery + 1)) == 0 {
                    self.batteries[battery].health_state = HealthState::Missing;
                    self.batteries[battery].set_soc(0, self.config.battery_capacity[battery]);
                }
            }
            self.watchdog_count = 0;
            for iface in 0..NUM_INTERFACES {
                results[test][iface] = hal.interface_current(iface);
            }
            hal.send_data("pQ", 0, test as i32);
        }

        self.offsets = derive_offsets(&mut results);

        let mut present = [false; NUM_BATTERIES];
        for battery in 0..NUM_BATTERIES {
            present[battery] = !self.batteries[battery].is_missing();
        }
        let quiescent = quiescent_current(&results, &present);
        hal.send_data("pQ", quiescent as i32, NUM_CALIBRATION_TESTS as i32);

        hal.set_switch_control_bits(saved_switches);
        hal.send_data("dS", saved_switches as i32, 0);

        // The bank was quiescent through the run, so terminal voltages are
        // usable open-circuit readings
        for battery in 0..NUM_BATTERIES {
            if self.batteries[battery].is_missing() {
                continue;
            }
            let soc = compute_soc(
                hal.battery_voltage(battery) as i32,
                hal.temperature(),
                self.config.battery_type[battery],
            );
            self.batteries[battery].set_soc(soc, self.config.battery_capacity[battery]);
            self.batteries[battery].current_steady = 0;
            self.batteries[battery].isolation_time = 0;
            self.batteries[battery].op_state = OpState::Isolated;
        }
        self.battery_under_load = NO_BATTERY;
        self.battery_under_charge = NO_BATTERY;

        self.config.current_offsets = self.offsets;
        // A failed write is non-fatal; the in-RAM offsets stay authoritative
        let _ = hal.write_config_block(&self.config);
        self.calibrate_requested = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hal::SimHal;

    fn flat(results: &mut SampleMatrix, value: i16) {
        for row in results.iter_mut() {
            for sample in row.iter_mut() {
                *sample = value;
            }
        }
    }

    #[test]
    fn offset_is_minimum_valid_sample() {
        let mut results: SampleMatrix = [[0; NUM_INTERFACES]; NUM_CALIBRATION_TESTS];
        flat(&mut results, 20);
        results[2][1] = 7;
        results[4][1] = -4000; // unpowered, below threshold, ignored
        let offsets = derive_offsets(&mut results);
        assert_eq!(offsets.get(1), 7);
        assert_eq!(offsets.get(0), 20);
        // Samples come back offset-corrected
        assert_eq!(results[2][1], 0);
        assert_eq!(results[0][1], 13);
    }

    #[test]
    fn interface_without_valid_samples_stays_uncalibrated() {
        let mut results: SampleMatrix = [[0; NUM_INTERFACES]; NUM_CALIBRATION_TESTS];
        flat(&mut results, 15);
        for test in 0..NUM_CALIBRATION_TESTS {
            results[test][3] = -4000;
        }
        let offsets = derive_offsets(&mut results);
        assert_eq!(offsets.get(3), 0);
    }

    #[test]
    fn quiescent_skips_missing_batteries_and_invalid_samples() {
        let mut results: SampleMatrix = [[0; NUM_INTERFACES]; NUM_CALIBRATION_TESTS];
        results[1][0] = 9;
        results[3][1] = 42; // missing battery, must not win
        results[2][2] = -4000;
        let present = [true, false, true];
        assert_eq!(quiescent_current(&results, &present), 9);
    }

    #[test]
    fn full_run_resets_battery_state_and_persists_offsets() {
        let mut hal = SimHal::new();
        hal.currents = [12; NUM_INTERFACES];
        let mut monitor = Monitor::new(Config::default(), &mut hal);

        monitor.run_calibration(&mut hal);

        // One progress event per configuration plus the quiescent report
        let progress = hal.events_labelled("pQ");
        assert_eq!(progress.len(), NUM_CALIBRATION_TESTS + 1);
        // Every configuration waited for the settle delay
        assert_eq!(
            hal.delays.len(),
            NUM_CALIBRATION_TESTS,
        );
        for battery in 0..NUM_BATTERIES {
            let record = monitor.battery(battery).unwrap();
            assert_eq!(record.op_state, OpState::Isolated);
            assert_eq!(record.isolation_time, 0);
            assert_eq!(record.current_steady, 0);
        }
        assert_eq!(monitor.battery_under_load(), NO_BATTERY);
        assert_eq!(monitor.battery_under_charge(), NO_BATTERY);
        // Constant 12 on every interface is the offset everywhere
        for iface in 0..NUM_INTERFACES {
            assert_eq!(monitor.current_offsets().get(iface), 12);
        }
        assert_eq!(hal.config_writes, 1);
        assert!(hal.persisted.is_some());
    }

    #[test]
    fn absent_indicator_marks_battery_missing() {
        let mut hal = SimHal::new();
        let mut monitor = Monitor::new(Config::default(), &mut hal);
        hal.set_battery_present(1, false);

        monitor.run_calibration(&mut hal);

        let record = monitor.battery(1).unwrap();
        assert_eq!(record.health_state, HealthState::Missing);
        assert_eq!(record.soc, 0);
        // The others re-seed from their open-circuit voltage
        assert!(monitor.battery(0).unwrap().soc > 0);
    }

    #[test]
    fn switch_configuration_is_restored() {
        let mut hal = SimHal::new();
        let mut monitor = Monitor::new(Config::default(), &mut hal);
        hal.set_switch(2, SwitchDest::Load2);
        hal.set_switch(1, SwitchDest::Panel);
        let saved = hal.switch_control_bits();

        monitor.run_calibration(&mut hal);

        assert_eq!(hal.switch_control_bits(), saved);
    }
}
