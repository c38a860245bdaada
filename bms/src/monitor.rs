//! Battery monitoring and allocation engine.
//!
//! One tick accesses the measured and estimated parameters of the
//! batteries, loads and panel, and decides which battery is connected to
//! the charger and which carries the loads. Decisions involve the bank as
//! a whole rather than individual batteries: batteries go to the charger
//! at low state of charge, to the loads at high state of charge, and are
//! isolated for periods so their open-circuit voltage can re-reference the
//! Coulomb-count SoC estimate. Loads shed progressively as batteries pass
//! into the low and critical fill states.
//!
//! Tracking always runs; the switch matrix is only driven while auto-track
//! is enabled. All anomalies become state transitions on the battery
//! records or the allocation variables, never errors out of the tick.

use crate::config::Config;
use crate::hal::Hal;
use crate::soc::compute_soc;
use crate::types::{
    decision, BatteryId, BatteryState, ChargingPhase, Error, FillState, HealthState,
    InterfaceOffsets, OpState, Result, SwitchDest, IDLE_CURRENT_THRESHOLD, ISOLATION_SENTINEL,
    MONITOR_STARTUP_DELAY, NO_BATTERY, NUM_BATTERIES, NUM_LOADS, NUM_PANELS,
    PANEL_VOLTAGE_MARGIN, SOC_HYSTERESIS, TEMPERATURE_LIMIT, WEAK_VOLTAGE,
};
use core::fmt::Write;
use heapless::String;

// ============================================================================
// Ranking
// ============================================================================

/// Rank battery ids by descending state of charge, stable, with missing
/// batteries moved to the tail where the allocator never reaches them.
pub(crate) fn rank_batteries(batteries: &[BatteryState; NUM_BATTERIES]) -> [BatteryId; NUM_BATTERIES] {
    let mut order = [NO_BATTERY; NUM_BATTERIES];
    for (slot, id) in order.iter_mut().enumerate() {
        *id = (slot + 1) as BatteryId;
    }
    for pass in 0..NUM_BATTERIES - 1 {
        for k in 0..NUM_BATTERIES - pass - 1 {
            if batteries[(order[k] - 1) as usize].soc < batteries[(order[k + 1] - 1) as usize].soc
            {
                order.swap(k, k + 1);
            }
        }
    }
    for pass in 0..NUM_BATTERIES - 1 {
        for k in 0..NUM_BATTERIES - pass - 1 {
            if batteries[(order[k] - 1) as usize].is_missing() {
                order.swap(k, k + 1);
            }
        }
    }
    order
}

// ============================================================================
// Monitor Engine
// ============================================================================

/// The allocation and state-tracking engine.
///
/// Owns the battery records, the interface offsets and the live
/// configuration. Mutated only from the monitor task; external observers
/// read through the accessor methods.
pub struct Monitor {
    pub(crate) config: Config,
    pub(crate) batteries: [BatteryState; NUM_BATTERIES],
    pub(crate) offsets: InterfaceOffsets,
    /// 1-based battery on the charger, 0 when unallocated
    pub(crate) battery_under_charge: BatteryId,
    /// 1-based battery carrying the loads, 0 when unallocated
    pub(crate) battery_under_load: BatteryId,
    /// Charging disabled bank-wide (night, or everything floating)
    pub(crate) charger_off: bool,
    pub(crate) calibrate_requested: bool,
    pub(crate) decision_status: u16,
    pub(crate) watchdog_count: u16,
    pub(crate) ticks: u32,
}

impl Monitor {
    /// Create the engine with every battery isolated, healthy, and its
    /// state of charge seeded from the first open-circuit reading.
    pub fn new<H: Hal>(config: Config, hal: &mut H) -> Self {
        let mut monitor = Self {
            offsets: config.current_offsets,
            config,
            batteries: [BatteryState::new(); NUM_BATTERIES],
            battery_under_charge: NO_BATTERY,
            battery_under_load: NO_BATTERY,
            charger_off: false,
            calibrate_requested: false,
            decision_status: 0,
            watchdog_count: 0,
            ticks: 0,
        };
        for battery in 0..NUM_BATTERIES {
            let soc = compute_soc(
                hal.battery_voltage(battery) as i32,
                hal.temperature(),
                monitor.config.battery_type[battery],
            );
            monitor.batteries[battery].set_soc(soc, monitor.config.battery_capacity[battery]);
        }
        monitor
    }

    // ------------------------------------------------------------------------
    // Task Loop
    // ------------------------------------------------------------------------

    /// Run the monitor for a number of cycles, sleeping the configured
    /// tick period between passes.
    pub fn run<H: Hal>(&mut self, hal: &mut H, cycles: u32) {
        // Let the measurement task produce its first results
        hal.delay_ticks(MONITOR_STARTUP_DELAY);
        for _ in 0..cycles {
            self.tick(hal);
            hal.delay_ticks(self.config.monitor_delay);
        }
    }

    /// One monitor pass: calibration latch, snapshot, battery state
    /// update, allocation, idle SoC reset, watchdog heartbeat.
    pub fn tick<H: Hal>(&mut self, hal: &mut H) {
        if self.calibrate_requested {
            self.run_calibration(hal);
        }
        self.report_snapshot(hal);
        self.update_battery_state(hal);
        self.allocate(hal);
        self.idle_soc_reset(hal);
        self.ticks = self.ticks.wrapping_add(1);
        self.watchdog_count = 0;
    }

    // ------------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------------

    /// Emit the tick's measurement and state snapshot
    fn report_snapshot<H: Hal>(&mut self, hal: &mut H) {
        let mut label: String<8> = String::new();
        hal.send_response("pH", self.ticks as i32);
        for battery in 0..NUM_BATTERIES {
            let current = hal.battery_current(battery) as i32;
            let voltage = hal.battery_voltage(battery) as i32;
            label.clear();
            let _ = write!(label, "dB{}", battery + 1);
            hal.send_data(&label, current, voltage);

            label.clear();
            let _ = write!(label, "dC{}", battery + 1);
            hal.send_response(&label, self.batteries[battery].soc as i32);

            let states = self.state_word(battery, hal.charging_phase(battery));
            label.clear();
            let _ = write!(label, "dO{}", battery + 1);
            hal.send_response(&label, states as i32);
        }
        for load in 0..NUM_LOADS {
            let current = hal.load_current(load) as i32 - self.offsets.load(load) as i32;
            let voltage = hal.load_voltage(load) as i32;
            label.clear();
            let _ = write!(label, "dL{}", load + 1);
            hal.send_data(&label, current, voltage);
        }
        for panel in 0..NUM_PANELS {
            let current = hal.panel_current(panel) as i32 - self.offsets.panel(panel) as i32;
            let voltage = hal.panel_voltage(panel) as i32;
            label.clear();
            let _ = write!(label, "dM{}", panel + 1);
            hal.send_data(&label, current, voltage);
        }
        let temperature = hal.temperature();
        hal.send_response("dT", temperature);
        hal.send_response("dD", self.config.controls() as i32);
        let switches = hal.switch_control_bits();
        hal.send_response("ds", switches as i32);
        let indicators = hal.indicators();
        hal.send_response("dI", indicators as i32);
    }

    /// Operational, fill, charging and health states packed two bits each
    fn state_word(&self, battery: usize, phase: ChargingPhase) -> u16 {
        let record = &self.batteries[battery];
        (record.op_state as u16 & 0x03)
            | ((record.fill_state as u16 & 0x03) << 2)
            | ((phase as u16 & 0x03) << 4)
            | ((record.health_state as u16 & 0x03) << 6)
    }

    // ------------------------------------------------------------------------
    // Battery State Update
    // ------------------------------------------------------------------------

    /// Fold in the Coulomb-count deltas and rederive the fill and health
    /// states from the tick's measurements.
    fn update_battery_state<H: Hal>(&mut self, hal: &mut H) {
        // Missing batteries hold zero SoC, fall back to isolated, and lose
        // any allocation
        for battery in 0..NUM_BATTERIES {
            if self.batteries[battery].is_missing() {
                self.batteries[battery].set_soc(0, self.config.battery_capacity[battery]);
                self.batteries[battery].op_state = OpState::Isolated;
                if self.battery_under_load == (battery + 1) as BatteryId {
                    self.battery_under_load = NO_BATTERY;
                }
                if self.battery_under_charge == (battery + 1) as BatteryId {
                    self.battery_under_charge = NO_BATTERY;
                }
            }
        }
        for battery in 0..NUM_BATTERIES {
            if self.batteries[battery].is_missing() {
                continue;
            }
            let capacity = self.config.battery_capacity[battery];
            let delta = hal.accumulated_charge(battery);
            let abs_voltage = (hal.battery_voltage(battery) as i32).abs();
            let phase = hal.charging_phase(battery);

            let record = &mut self.batteries[battery];
            record.integrate_charge(delta, capacity);

            record.fill_state = if abs_voltage < self.config.critical_voltage as i32
                || record.soc < self.config.critical_soc
            {
                FillState::Critical
            } else if abs_voltage < self.config.low_voltage as i32
                || record.soc < self.config.low_soc
            {
                FillState::Low
            } else {
                FillState::Normal
            };
            // Below the dropout voltage the battery takes the charger with
            // priority and must not carry loads
            if abs_voltage < WEAK_VOLTAGE as i32 {
                record.health_state = HealthState::Weak;
                record.fill_state = FillState::Critical;
                record.set_soc(0, capacity);
            }
            // Reaching rest phase restores good health, avoiding thrash
            // while a battery is ailing
            if phase == ChargingPhase::Rest {
                record.health_state = HealthState::Good;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------------

    /// Allocate the charger and the loads for this tick.
    ///
    /// The loads go to the highest state of charge and the charger to the
    /// lowest, weak and critical batteries preempting, with batteries held
    /// in isolation respected while the strategy flags allow.
    fn allocate<H: Hal>(&mut self, hal: &mut H) {
        self.decision_status = 0;
        let order = rank_batteries(&self.batteries);
        let num_bats = self.batteries.iter().filter(|b| !b.is_missing()).count();
        let longest = self.longest_isolated();

        if num_bats == 0 {
            self.battery_under_load = NO_BATTERY;
            self.battery_under_charge = NO_BATTERY;
            self.charger_off = true;
            hal.send_response("dd", 0);
            return;
        }
        let ranked = &order[..num_bats];

        // Restart charging on any floating battery that has drooped below
        // the restart threshold
        for &id in ranked {
            let battery = (id - 1) as usize;
            if hal.charging_phase(battery) == ChargingPhase::Float
                && self.batteries[battery].soc < self.config.float_bulk_soc
            {
                hal.set_charging_phase(battery, ChargingPhase::Bulk);
            }
        }
        // A charging battery entering float or rest frees the charger for
        // the searches below
        if self.battery_under_charge != NO_BATTERY {
            let phase = hal.charging_phase((self.battery_under_charge - 1) as usize);
            if matches!(phase, ChargingPhase::Float | ChargingPhase::Rest) {
                self.battery_under_charge = NO_BATTERY;
            }
        }
        // With the panel below every terminal the charger cannot source
        // current. Turning it off frees load and isolation management
        // overnight.
        let panel_voltage = hal.panel_voltage(0) as i32;
        self.charger_off = true;
        for &id in ranked {
            let voltage = hal.battery_voltage((id - 1) as usize) as i32;
            if voltage < panel_voltage + PANEL_VOLTAGE_MARGIN as i32 {
                self.charger_off = false;
                break;
            }
        }
        if self.charger_off {
            self.decision_status |= decision::CHARGER_OFF_PANEL_LOW;
            self.battery_under_charge = NO_BATTERY;
        }
        // Nothing left to charge once the whole bank floats
        let all_float = ranked
            .iter()
            .all(|&id| hal.charging_phase((id - 1) as usize) == ChargingPhase::Float);
        if all_float {
            self.decision_status |= decision::CHARGER_OFF_ALL_FLOAT;
            self.charger_off = true;
            self.battery_under_charge = NO_BATTERY;
        }

        if num_bats == 1 {
            let id = ranked[0];
            self.decision_status |= decision::SINGLE_BATTERY;
            if !self.charger_off {
                self.battery_under_charge = id;
            }
            self.battery_under_load = id;
            // A weak single battery still receives charge but no load
            if self.record(id).health_state == HealthState::Weak {
                self.decision_status |= decision::LOAD_ANY_NOT_WEAK;
                self.battery_under_load = NO_BATTERY;
            }
        } else {
            self.decision_status |= decision::MULTI_BATTERY;
            self.allocate_charger(hal, ranked, longest);
            self.allocate_load(ranked, longest);
        }

        self.apply_op_states(hal);
        if self.config.auto_track {
            self.apply_switches(hal);
        }
        hal.send_response("dd", self.decision_status as i32);
    }

    /// Charger assignment over the ranked non-missing batteries
    fn allocate_charger<H: Hal>(&mut self, hal: &mut H, ranked: &[BatteryId], longest: BatteryId) {
        if self.charger_off {
            return;
        }
        let isolatable = ranked.len() > 2;
        let lowest = ranked[ranked.len() - 1];

        // A lowest battery out of normal state frees the charger so it can
        // be moved where it is needed
        if self.record(lowest).fill_state != FillState::Normal {
            self.battery_under_charge = NO_BATTERY;
        }
        if self.record(lowest).fill_state == FillState::Critical {
            self.battery_under_charge = lowest;
            self.decision_status |= decision::CHARGER_CRITICAL;
        }
        // The lowest weak battery takes the charger with priority
        for &id in ranked.iter().rev() {
            if self.record(id).health_state == HealthState::Weak {
                self.battery_under_charge = id;
                self.decision_status |= decision::CHARGER_WEAK;
                break;
            }
        }
        // Lowest SoC battery not floating, not resting, not held isolated
        if self.battery_under_charge == NO_BATTERY && isolatable {
            for &id in ranked.iter().rev() {
                let phase = hal.charging_phase((id - 1) as usize);
                let isolated = id == longest && self.config.preserve_isolation();
                if !matches!(phase, ChargingPhase::Float | ChargingPhase::Rest) && !isolated {
                    self.decision_status |= decision::CHARGER_LOWEST;
                    self.battery_under_charge = id;
                    break;
                }
            }
        }
        // Still unallocated: give up on isolation. Nothing is allocated
        // when every battery rests or floats.
        if self.battery_under_charge == NO_BATTERY {
            for &id in ranked.iter().rev() {
                let phase = hal.charging_phase((id - 1) as usize);
                if !matches!(phase, ChargingPhase::Float | ChargingPhase::Rest) {
                    self.decision_status |= decision::CHARGER_LOWEST_ANY;
                    self.battery_under_charge = id;
                    break;
                }
            }
        }
        // Landed on a good battery: move down if another is lower by more
        // than the hysteresis margin, isolation notwithstanding
        if self.battery_under_charge != NO_BATTERY
            && self.record(self.battery_under_charge).fill_state == FillState::Normal
        {
            for &id in ranked.iter().rev() {
                let phase = hal.charging_phase((id - 1) as usize);
                let better = self.record(self.battery_under_charge).soc
                    > self.record(id).soc + SOC_HYSTERESIS;
                if !matches!(phase, ChargingPhase::Float | ChargingPhase::Rest) && better {
                    self.battery_under_charge = id;
                    self.decision_status |= decision::CHARGER_MOVED_LOWER;
                    break;
                }
            }
        }
    }

    /// Load assignment over the ranked non-missing batteries
    fn allocate_load(&mut self, ranked: &[BatteryId], longest: BatteryId) {
        let isolatable = ranked.len() > 2;

        // Charger landed on the loaded battery: give the load up so the
        // two can swap back and forth as charge completes
        if self.battery_under_load == self.battery_under_charge && self.config.separate_load() {
            self.battery_under_load = NO_BATTERY;
        }
        // A weak battery never carries load
        if self.battery_under_load != NO_BATTERY
            && self.record(self.battery_under_load).health_state == HealthState::Weak
        {
            self.battery_under_load = NO_BATTERY;
        }
        // A drooping loaded battery frees the load for a better one
        if self.battery_under_load != NO_BATTERY
            && self.record(self.battery_under_load).fill_state != FillState::Normal
        {
            self.battery_under_load = NO_BATTERY;
        }
        // Highest SoC battery that is not weak, not held isolated, and not
        // the charging battery while the strategies require separation
        if self.battery_under_load == NO_BATTERY && isolatable {
            for &id in ranked {
                let isolated = id == longest && self.config.preserve_isolation();
                let charging =
                    id == self.battery_under_charge && self.config.separate_load();
                if self.record(id).health_state != HealthState::Weak && !isolated && !charging {
                    self.battery_under_load = id;
                    self.decision_status |= decision::LOAD_HIGHEST;
                    break;
                }
            }
        }
        // Drop the isolation constraint
        if self.battery_under_load == NO_BATTERY {
            for &id in ranked {
                let charging =
                    id == self.battery_under_charge && self.config.separate_load();
                if self.record(id).health_state != HealthState::Weak && !charging {
                    self.battery_under_load = id;
                    self.decision_status |= decision::LOAD_NO_ISOLATION;
                    break;
                }
            }
        }
        // Only the weak constraint remains; the loads stay unallocated
        // when every battery is weak
        if self.battery_under_load == NO_BATTERY {
            for &id in ranked {
                if self.record(id).health_state != HealthState::Weak {
                    self.battery_under_load = id;
                    self.decision_status |= decision::LOAD_ANY_NOT_WEAK;
                    break;
                }
            }
        }
        // Landed on a low battery: look once more for one below the
        // charging battery by the hysteresis margin. Meaningless without a
        // charger allocated.
        if self.battery_under_load != NO_BATTERY
            && self.record(self.battery_under_load).fill_state != FillState::Normal
            && self.battery_under_charge != NO_BATTERY
        {
            for &id in ranked {
                let charging =
                    id == self.battery_under_charge && self.config.separate_load();
                let better = self.record(self.battery_under_charge).soc
                    > self.record(id).soc + SOC_HYSTERESIS;
                if self.record(id).health_state != HealthState::Weak && !charging && better {
                    self.battery_under_load = id;
                    self.decision_status |= decision::LOAD_MOVED_LOWER;
                    break;
                }
            }
        }
        // Load continuity beats separation and longevity: a critical load
        // collapses onto the charging battery
        if self.battery_under_charge != NO_BATTERY
            && self.battery_under_load != NO_BATTERY
            && self.record(self.battery_under_charge).health_state != HealthState::Weak
            && self.record(self.battery_under_load).fill_state == FillState::Critical
        {
            self.battery_under_load = self.battery_under_charge;
            self.decision_status |= decision::LOAD_ON_CHARGER;
        }
    }

    /// Recompute operational states and isolation timers from the tick's
    /// allocation
    fn apply_op_states<H: Hal>(&mut self, hal: &mut H) {
        let ticks_4h = 4 * self.config.ticks_per_hour();
        for battery in 0..NUM_BATTERIES {
            if self.batteries[battery].is_missing() {
                continue;
            }
            let id = (battery + 1) as BatteryId;
            let last_op_state = self.batteries[battery].op_state;
            let mut op_state = OpState::Isolated;
            if self.battery_under_load == id {
                op_state = OpState::Loaded;
            }
            if self.battery_under_charge == id {
                op_state = OpState::Charging;
            }
            self.batteries[battery].op_state = op_state;

            // Coming out of a long isolation the terminal voltage was a
            // trustworthy open-circuit reading
            if last_op_state == OpState::Isolated
                && op_state != OpState::Isolated
                && self.batteries[battery].isolation_time > ticks_4h
            {
                let soc = compute_soc(
                    hal.battery_voltage(battery) as i32,
                    hal.temperature(),
                    self.config.battery_type[battery],
                );
                self.batteries[battery].set_soc(soc, self.config.battery_capacity[battery]);
                self.batteries[battery].isolation_time = 0;
            }
            // Isolation cannot accumulate in use, nor anywhere while the
            // charger and loads share a battery and charging current leaks
            // to the rest of the bank. A low sentinel rather than zero
            // keeps the handover order.
            let shared = self.battery_under_load == self.battery_under_charge
                && self.battery_under_charge != NO_BATTERY;
            if op_state != OpState::Isolated || shared {
                self.batteries[battery].isolation_time = ISOLATION_SENTINEL;
            }
        }
    }

    /// Drive the switch matrix from the allocation (auto-track only)
    fn apply_switches<H: Hal>(&mut self, hal: &mut H) {
        let loaded = self.battery_under_load;
        hal.set_switch(loaded, SwitchDest::Load2);
        // The low priority load sheds first on a critical battery; with no
        // load allocated both circuits disconnect
        let critical =
            loaded != NO_BATTERY && self.record(loaded).fill_state == FillState::Critical;
        if critical {
            hal.set_switch(NO_BATTERY, SwitchDest::Load1);
        } else {
            hal.set_switch(loaded, SwitchDest::Load1);
        }
        // Charging above the temperature limit is unsafe; the panel switch
        // is left untouched
        if hal.temperature() < TEMPERATURE_LIMIT * 256 {
            hal.set_switch(self.battery_under_charge, SwitchDest::Panel);
        }
        // The charger keeps following this battery if auto-track is later
        // switched off
        hal.set_preferred_charge_target(self.battery_under_charge);
    }

    // ------------------------------------------------------------------------
    // Idle SoC Reset
    // ------------------------------------------------------------------------

    /// Re-reference the SoC estimate from the open-circuit voltage after
    /// long idle or isolation periods
    fn idle_soc_reset<H: Hal>(&mut self, hal: &mut H) {
        let ticks_hour = self.config.ticks_per_hour();
        for battery in 0..NUM_BATTERIES {
            if self.batteries[battery].is_missing() {
                continue;
            }
            let capacity = self.config.battery_capacity[battery];
            let battery_type = self.config.battery_type[battery];
            let current = hal.battery_current(battery) as i32;
            let voltage = hal.battery_voltage(battery) as i32;
            let temperature = hal.temperature();

            let record = &mut self.batteries[battery];
            if current.abs() < IDLE_CURRENT_THRESHOLD as i32 {
                record.current_steady = record.current_steady.saturating_add(1);
            } else {
                record.current_steady = 0;
            }
            if record.current_steady as u32 > ticks_hour {
                record.set_soc(compute_soc(voltage, temperature, battery_type), capacity);
                record.current_steady = 0;
            }
            // Past eight hours the timer drops back so another battery can
            // take the longest-isolated role
            record.isolation_time += 1;
            if record.isolation_time > 8 * ticks_hour {
                record.set_soc(compute_soc(voltage, temperature, battery_type), capacity);
                record.isolation_time = 0;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Watchdog
    // ------------------------------------------------------------------------

    /// Called by the watchdog task each of its periods. Counts heartbeat
    /// misses; true means the monitor task must be restarted.
    pub fn check_watchdog(&mut self) -> bool {
        let limit = (10 * self.config.monitor_delay / self.config.watchdog_delay) as u16;
        let expired = self.watchdog_count > limit;
        self.watchdog_count = self.watchdog_count.saturating_add(1);
        expired
    }

    /// Rebuild task-local state after a watchdog restart. The battery
    /// records, tracked SoC and calibration offsets all survive.
    pub fn restart<H: Hal>(&mut self, hal: &mut H) {
        self.calibrate_requested = false;
        self.battery_under_load = NO_BATTERY;
        self.battery_under_charge = NO_BATTERY;
        self.watchdog_count = 0;
        hal.send_string("D", "monitor restarted");
        // The measurement task needs a fresh pass before the next tick,
        // just as at first start
        hal.delay_ticks(MONITOR_STARTUP_DELAY);
    }

    // ------------------------------------------------------------------------
    // Control Surface
    // ------------------------------------------------------------------------

    /// Request a calibration sequence on the next tick
    pub fn start_calibration(&mut self) {
        self.calibrate_requested = true;
    }

    /// Force a battery's missing status
    pub fn set_battery_missing(&mut self, battery: usize, missing: bool) -> Result<()> {
        let record = self
            .batteries
            .get_mut(battery)
            .ok_or(Error::InvalidBattery)?;
        record.health_state = if missing {
            HealthState::Missing
        } else {
            HealthState::Good
        };
        Ok(())
    }

    /// Override a battery's tracked state of charge
    pub fn set_battery_soc(&mut self, battery: usize, soc: u16) -> Result<()> {
        let capacity = *self
            .config
            .battery_capacity
            .get(battery)
            .ok_or(Error::InvalidBattery)?;
        self.batteries[battery].set_soc(soc, capacity);
        Ok(())
    }

    /// Reset a battery's state of charge to 100%, marking the record
    /// faulty if the tracker had not reached full charge
    pub fn reset_battery_soc(&mut self, battery: usize) -> Result<()> {
        let capacity = *self
            .config
            .battery_capacity
            .get(battery)
            .ok_or(Error::InvalidBattery)?;
        self.batteries[battery].reset_soc(capacity);
        Ok(())
    }

    /// Manually route the loads to a battery (or 0 to deallocate)
    pub fn set_battery_under_load(&mut self, battery: BatteryId) {
        self.battery_under_load = battery;
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Battery record by 0-based slot
    pub fn battery(&self, battery: usize) -> Option<&BatteryState> {
        self.batteries.get(battery)
    }

    /// Tracked state of charge by 0-based slot
    pub fn battery_soc(&self, battery: usize) -> Option<u16> {
        self.batteries.get(battery).map(|b| b.soc)
    }

    /// Battery currently carrying the loads (0 = none)
    pub fn battery_under_load(&self) -> BatteryId {
        self.battery_under_load
    }

    /// Battery currently on the charger (0 = none)
    pub fn battery_under_charge(&self) -> BatteryId {
        self.battery_under_charge
    }

    /// Charging disabled bank-wide
    pub fn charger_off(&self) -> bool {
        self.charger_off
    }

    /// Diagnostic bits from the last allocation pass
    pub fn decision_status(&self) -> u16 {
        self.decision_status
    }

    /// Calibrated interface current offsets
    pub fn current_offsets(&self) -> &InterfaceOffsets {
        &self.offsets
    }

    /// Live configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Mutable configuration for the external command surface
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Completed monitor passes
    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    fn record(&self, id: BatteryId) -> &BatteryState {
        &self.batteries[(id - 1) as usize]
    }

    fn longest_isolated(&self) -> BatteryId {
        let mut longest = NO_BATTERY;
        let mut longest_time = 0;
        for battery in 0..NUM_BATTERIES {
            let record = &self.batteries[battery];
            if !record.is_missing() && record.isolation_time > longest_time {
                longest_time = record.isolation_time;
                longest = (battery + 1) as BatteryId;
            }
        }
        longest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::SimHal;

    fn bank() -> (Monitor, SimHal) {
        let mut hal = SimHal::new();
        let monitor = Monitor::new(Config::default(), &mut hal);
        (monitor, hal)
    }

    fn set_socs(monitor: &mut Monitor, socs: [u16; NUM_BATTERIES]) {
        for (battery, soc) in socs.into_iter().enumerate() {
            monitor.set_battery_soc(battery, soc).unwrap();
        }
    }

    #[test]
    fn ranking_is_descending_and_stable() {
        let (mut monitor, _hal) = bank();
        set_socs(&mut monitor, [80 * 256, 90 * 256, 80 * 256]);
        assert_eq!(rank_batteries(&monitor.batteries), [2, 1, 3]);
    }

    #[test]
    fn ranking_moves_missing_to_tail() {
        let (mut monitor, _hal) = bank();
        set_socs(&mut monitor, [90 * 256, 80 * 256, 70 * 256]);
        monitor.set_battery_missing(0, true).unwrap();
        assert_eq!(rank_batteries(&monitor.batteries), [2, 3, 1]);
    }

    #[test]
    fn strong_panel_charges_lowest_and_loads_highest() {
        let (mut monitor, mut hal) = bank();
        set_socs(&mut monitor, [90 * 256, 80 * 256, 70 * 256]);
        // Battery 2 has been idle longest and is owed its isolation
        monitor.batteries[0].isolation_time = 100;
        monitor.batteries[1].isolation_time = 500;
        monitor.batteries[2].isolation_time = 100;

        monitor.tick(&mut hal);

        assert_eq!(monitor.battery_under_charge(), 3);
        assert_eq!(monitor.battery_under_load(), 1);
        assert!(!monitor.charger_off());
        assert_eq!(monitor.battery(1).unwrap().op_state, OpState::Isolated);
        assert_eq!(monitor.battery(0).unwrap().op_state, OpState::Loaded);
        assert_eq!(monitor.battery(2).unwrap().op_state, OpState::Charging);
        let status = monitor.decision_status();
        assert_ne!(status & decision::CHARGER_LOWEST, 0);
        assert_ne!(status & decision::LOAD_HIGHEST, 0);
        assert_eq!(hal.last_response("dd"), Some(status as i32));
    }

    #[test]
    fn weak_battery_takes_charger_and_never_load() {
        let (mut monitor, mut hal) = bank();
        set_socs(&mut monitor, [90 * 256, 80 * 256, 70 * 256]);
        hal.set_battery_voltage(1, 2816); // 11.0 V, below dropout

        monitor.tick(&mut hal);

        let weak = monitor.battery(1).unwrap();
        assert_eq!(weak.health_state, HealthState::Weak);
        assert_eq!(weak.fill_state, FillState::Critical);
        assert_eq!(weak.soc, 0);
        assert_eq!(monitor.battery_under_charge(), 2);
        assert_ne!(monitor.battery_under_load(), 2);
        assert_ne!(monitor.battery_under_load(), NO_BATTERY);
        assert_ne!(monitor.decision_status() & decision::CHARGER_WEAK, 0);
    }

    #[test]
    fn all_batteries_floating_turns_charger_off() {
        let (mut monitor, mut hal) = bank();
        set_socs(&mut monitor, [96 * 256, 96 * 256, 96 * 256]);
        hal.phases = [ChargingPhase::Float; NUM_BATTERIES];

        monitor.tick(&mut hal);

        assert!(monitor.charger_off());
        assert_eq!(monitor.battery_under_charge(), NO_BATTERY);
        assert_ne!(monitor.battery_under_load(), NO_BATTERY);
        assert_ne!(
            monitor.decision_status() & decision::CHARGER_OFF_ALL_FLOAT,
            0
        );
        // Above the restart threshold nothing is pushed back to bulk
        assert_eq!(hal.phases, [ChargingPhase::Float; NUM_BATTERIES]);
    }

    #[test]
    fn night_panel_turns_charger_off() {
        let (mut monitor, mut hal) = bank();
        set_socs(&mut monitor, [90 * 256, 80 * 256, 70 * 256]);
        hal.set_panel_voltage(0, 3072); // 12.0 V
        for battery in 0..NUM_BATTERIES {
            hal.set_battery_voltage(battery, 3226); // 12.6 V
        }

        monitor.tick(&mut hal);

        assert!(monitor.charger_off());
        assert_eq!(monitor.battery_under_charge(), NO_BATTERY);
        assert_ne!(
            monitor.decision_status() & decision::CHARGER_OFF_PANEL_LOW,
            0
        );
        assert_ne!(monitor.battery_under_load(), NO_BATTERY);
    }

    #[test]
    fn drooped_float_battery_pushed_back_to_bulk() {
        let (mut monitor, mut hal) = bank();
        set_socs(&mut monitor, [90 * 256, 96 * 256, 96 * 256]);
        hal.phases = [ChargingPhase::Float; NUM_BATTERIES];

        monitor.tick(&mut hal);

        assert_eq!(hal.phases[0], ChargingPhase::Bulk);
        assert_eq!(hal.phases[1], ChargingPhase::Float);
        assert_eq!(hal.phases[2], ChargingPhase::Float);
    }

    #[test]
    fn idle_steady_current_resets_soc_from_ocv() {
        let (mut monitor, mut hal) = bank();
        set_socs(&mut monitor, [50 * 256, 50 * 256, 50 * 256]);
        // One tick short of an hour of sub-threshold current
        monitor.batteries[0].current_steady = 3600;

        monitor.tick(&mut hal);

        // 12.8 V at 25 C reads as full charge
        assert_eq!(monitor.battery_soc(0), Some(25600));
        assert_eq!(monitor.battery(0).unwrap().current_steady, 0);
        // The others only accumulate
        assert_eq!(monitor.battery(1).unwrap().current_steady, 1);
        assert_eq!(monitor.battery_soc(1), Some(50 * 256));
    }

    #[test]
    fn flowing_current_clears_steady_counter() {
        let (mut monitor, mut hal) = bank();
        monitor.batteries[2].current_steady = 3000;
        hal.set_battery_current(2, 400);

        monitor.tick(&mut hal);

        assert_eq!(monitor.battery(2).unwrap().current_steady, 0);
    }

    #[test]
    fn eight_hour_isolation_hands_the_role_onward() {
        let (mut monitor, mut hal) = bank();
        // Middle state of charge: neither load nor charger wants battery 1,
        // so its isolation timer is free to run out
        set_socs(&mut monitor, [70 * 256, 90 * 256, 50 * 256]);
        monitor.batteries[0].isolation_time = 8 * 3600;
        monitor.batteries[1].isolation_time = 20;
        monitor.batteries[2].isolation_time = 30;
        monitor.config.monitor_strategy = 0;

        monitor.tick(&mut hal);

        // Loads and charger went elsewhere, so only the timer and reset ran
        assert_eq!(monitor.battery(0).unwrap().isolation_time, 0);
        assert_eq!(monitor.battery_soc(0), Some(25600));
    }

    #[test]
    fn leaving_long_isolation_reseeds_soc() {
        let (mut monitor, mut hal) = bank();
        // No isolation preservation so the longest-isolated battery can be
        // pulled straight into service
        monitor.config.monitor_strategy = 0;
        set_socs(&mut monitor, [50 * 256, 80 * 256, 60 * 256]);
        monitor.batteries[1].isolation_time = 20000;

        monitor.tick(&mut hal);

        assert_eq!(monitor.battery_under_load(), 2);
        // Re-seeded from OCV on the way out of isolation, then pinned
        assert_eq!(monitor.battery_soc(1), Some(25600));
        assert_eq!(
            monitor.battery(1).unwrap().isolation_time,
            ISOLATION_SENTINEL + 1
        );
    }

    #[test]
    fn critical_load_collapses_onto_charging_battery() {
        let (mut monitor, mut hal) = bank();
        set_socs(&mut monitor, [9 * 256, 8 * 256, 7 * 256]);

        monitor.tick(&mut hal);

        assert_eq!(monitor.battery_under_charge(), 3);
        assert_eq!(monitor.battery_under_load(), 3);
        assert_ne!(monitor.decision_status() & decision::LOAD_ON_CHARGER, 0);
        // Shared charge and load pins every isolation timer at the
        // sentinel (plus the tick's increment)
        for battery in 0..NUM_BATTERIES {
            assert_eq!(
                monitor.battery(battery).unwrap().isolation_time,
                ISOLATION_SENTINEL + 1
            );
        }
    }

    #[test]
    fn missing_battery_is_never_allocated() {
        let (mut monitor, mut hal) = bank();
        set_socs(&mut monitor, [90 * 256, 80 * 256, 70 * 256]);
        monitor.set_battery_missing(0, true).unwrap();

        monitor.tick(&mut hal);

        assert_ne!(monitor.battery_under_load(), 1);
        assert_ne!(monitor.battery_under_charge(), 1);
        assert_eq!(monitor.battery_soc(0), Some(0));
        // Two remaining batteries: no isolation is possible
        assert_ne!(monitor.battery_under_load(), NO_BATTERY);
        assert_ne!(monitor.battery_under_charge(), NO_BATTERY);
    }

    #[test]
    fn weak_single_battery_keeps_charger_but_sheds_load() {
        let (mut monitor, mut hal) = bank();
        monitor.set_battery_missing(1, true).unwrap();
        monitor.set_battery_missing(2, true).unwrap();
        hal.set_battery_voltage(0, 2816);

        monitor.tick(&mut hal);

        assert_eq!(monitor.battery_under_charge(), 1);
        assert_eq!(monitor.battery_under_load(), NO_BATTERY);
        let status = monitor.decision_status();
        assert_ne!(status & decision::SINGLE_BATTERY, 0);
        assert_ne!(status & decision::LOAD_ANY_NOT_WEAK, 0);
    }

    #[test]
    fn below_critical_voltage_is_critical_not_low() {
        let (mut monitor, mut hal) = bank();
        hal.set_battery_voltage(2, 2950); // below critical, above dropout

        monitor.tick(&mut hal);

        assert_eq!(monitor.battery(2).unwrap().fill_state, FillState::Critical);
        assert_eq!(monitor.battery(2).unwrap().health_state, HealthState::Good);
    }

    #[test]
    fn rest_phase_restores_good_health() {
        let (mut monitor, mut hal) = bank();
        hal.set_battery_voltage(0, 2816);
        monitor.tick(&mut hal);
        assert_eq!(monitor.battery(0).unwrap().health_state, HealthState::Weak);

        hal.set_battery_voltage(0, 3277);
        hal.phases[0] = ChargingPhase::Rest;
        monitor.tick(&mut hal);
        assert_eq!(monitor.battery(0).unwrap().health_state, HealthState::Good);
    }

    #[test]
    fn auto_track_drives_switches() {
        let (mut monitor, mut hal) = bank();
        monitor.config_mut().auto_track = true;
        set_socs(&mut monitor, [90 * 256, 80 * 256, 70 * 256]);
        monitor.batteries[1].isolation_time = 500;

        monitor.tick(&mut hal);

        assert_eq!(hal.switch_setting(SwitchDest::Load2), 1);
        assert_eq!(hal.switch_setting(SwitchDest::Load1), 1);
        assert_eq!(hal.switch_setting(SwitchDest::Panel), 3);
        assert_eq!(hal.preferred_charge_target, 3);
    }

    #[test]
    fn over_temperature_suppresses_panel_switch() {
        let (mut monitor, mut hal) = bank();
        monitor.config_mut().auto_track = true;
        set_socs(&mut monitor, [90 * 256, 80 * 256, 70 * 256]);
        hal.temperature = 50 * 256;

        monitor.tick(&mut hal);

        // Loads still follow the allocation; the panel stays disconnected
        assert_eq!(hal.switch_setting(SwitchDest::Load2), 1);
        assert_eq!(hal.switch_setting(SwitchDest::Panel), 0);
        // The allocator still computed a charge assignment
        assert_ne!(monitor.battery_under_charge(), NO_BATTERY);
    }

    #[test]
    fn snapshot_reports_full_taxonomy() {
        let (mut monitor, mut hal) = bank();
        monitor.tick(&mut hal);

        for label in [
            "pH", "dB1", "dB2", "dB3", "dC1", "dC2", "dC3", "dO1", "dO2", "dO3", "dL1", "dL2",
            "dM1", "dT", "dD", "ds", "dI", "dd",
        ] {
            assert!(
                !hal.events_labelled(label).is_empty(),
                "missing snapshot record {}",
                label
            );
        }
    }

    #[test]
    fn watchdog_expires_and_restart_preserves_state() {
        let (mut monitor, mut hal) = bank();
        set_socs(&mut monitor, [90 * 256, 80 * 256, 70 * 256]);
        monitor.tick(&mut hal);
        let soc_before = monitor.battery_soc(0).unwrap();

        // The monitor stops ticking; the watchdog counts it out
        let mut expired = false;
        for _ in 0..25 {
            expired = monitor.check_watchdog();
            if expired {
                break;
            }
        }
        assert!(expired);

        monitor.restart(&mut hal);
        assert_eq!(monitor.battery_under_load(), NO_BATTERY);
        assert_eq!(monitor.battery_under_charge(), NO_BATTERY);
        assert_eq!(monitor.battery_soc(0), Some(soc_before));
        assert!(!hal.events_labelled("D").is_empty());
        // The startup delay is re-armed on the way back in
        assert_eq!(hal.delays.last(), Some(&MONITOR_STARTUP_DELAY));

        // A ticking monitor never trips the watchdog
        monitor.tick(&mut hal);
        assert!(!monitor.check_watchdog());
    }

    #[test]
    fn calibration_latch_runs_within_tick() {
        let (mut monitor, mut hal) = bank();
        monitor.start_calibration();

        monitor.tick(&mut hal);

        assert!(!monitor.calibrate_requested);
        assert!(!hal.events_labelled("pQ").is_empty());
        // The tick continues into allocation after calibrating
        assert_ne!(monitor.battery_under_load(), NO_BATTERY);
    }

    #[test]
    fn run_sleeps_between_ticks() {
        let (mut monitor, mut hal) = bank();
        monitor.run(&mut hal, 3);
        assert_eq!(monitor.ticks(), 3);
        assert_eq!(hal.delays[0], MONITOR_STARTUP_DELAY);
        assert_eq!(hal.delays.len(), 4);
        assert!(hal.delays[1..]
            .iter()
            .all(|&d| d == monitor.config().monitor_delay));
    }
}
