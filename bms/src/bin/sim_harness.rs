//! Simulation harness driving the engine through a scripted day.
//!
//! A crude charger and insolation model runs against the simulation HAL;
//! one JSON record per monitor tick goes to stdout for cross-checking
//! allocation behaviour over long horizons.
//!
//! Usage: `sim_harness [ticks]` (default 600, one tick per simulated
//! second; calibration is requested on the first tick)

use bms::{ChargingPhase, Config, Monitor, SimEvent, SimHal, NO_BATTERY, NUM_BATTERIES};
use serde::Serialize;
use serde_json::json;
use std::env;

/// One monitor tick as reported on stdout
#[derive(Serialize)]
struct TickRecord {
    tick: u32,
    charge_target: u8,
    load_target: u8,
    charger_off: bool,
    decision_status: u16,
    soc: Vec<u16>,
    events: Vec<serde_json::Value>,
}

/// Panel terminal voltage over the scripted day, Q8 volts
fn panel_voltage(tick: u32, ticks_total: u32) -> i16 {
    // Night at both ends, full sun in the middle
    let day = ticks_total / 10;
    match tick {
        t if t < day => 3072,                     // 12.0 V, pre-dawn
        t if t < ticks_total - day => 3584,       // 14.0 V, sun up
        _ => 2816,                                // 11.0 V, night
    }
}

/// One pass of a rough charger model: bulk charge feeds coulombs into the
/// preferred battery; a full battery floats until it droops.
fn charger_model(monitor: &Monitor, hal: &mut SimHal) {
    let target = monitor.battery_under_charge();
    for battery in 0..NUM_BATTERIES {
        let id = (battery + 1) as u8;
        let soc = monitor.battery_soc(battery).unwrap_or(0);
        if soc >= 25600 {
            hal.phases[battery] = ChargingPhase::Float;
        }
        if id == target && target != NO_BATTERY && hal.phases[battery] == ChargingPhase::Bulk {
            // Roughly 2 A of charge current for one second
            hal.accumulated[battery] += 512;
            hal.set_battery_current(battery, 512);
        } else {
            hal.set_battery_current(battery, 0);
        }
    }
    // The loaded battery drains
    let loaded = monitor.battery_under_load();
    if loaded != NO_BATTERY {
        let battery = (loaded - 1) as usize;
        hal.accumulated[battery] -= 256;
        hal.set_battery_current(battery, -256);
    }
}

fn event_json(event: &SimEvent) -> serde_json::Value {
    match event {
        SimEvent::Data {
            label,
            first,
            second,
        } => json!({"label": label.as_str(), "values": [first, second]}),
        SimEvent::Response { label, value } => {
            json!({"label": label.as_str(), "values": [value]})
        }
        SimEvent::Text { label, text } => {
            json!({"label": label.as_str(), "text": text.as_str()})
        }
    }
}

fn main() {
    let ticks_total: u32 = env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(600);

    let mut hal = SimHal::new();
    let mut config = Config::default();
    config.auto_track = true;
    let mut monitor = Monitor::new(config, &mut hal);
    monitor.start_calibration();

    let mut drained = 0;
    for tick in 0..ticks_total {
        hal.set_panel_voltage(0, panel_voltage(tick, ticks_total));
        charger_model(&monitor, &mut hal);

        monitor.tick(&mut hal);

        let events: Vec<serde_json::Value> =
            hal.events[drained..].iter().map(event_json).collect();
        drained = hal.events.len();

        let record = TickRecord {
            tick,
            charge_target: monitor.battery_under_charge(),
            load_target: monitor.battery_under_load(),
            charger_off: monitor.charger_off(),
            decision_status: monitor.decision_status(),
            soc: (0..NUM_BATTERIES)
                .map(|b| monitor.battery_soc(b).unwrap_or(0))
                .collect(),
            events,
        };
        println!("{}", serde_json::to_string(&record).unwrap());
    }
}
