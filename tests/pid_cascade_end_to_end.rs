//! ---
//! cbx_section: "15-testing"
//! cbx_subsection: "integration-tests"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Cool-down from 8 °C to a 5 °C setpoint under the PID cascade."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use coldbox_common::{ActuatorId, AppConfig, StrategyKind};
use coldbox_control::cascade_split;
use coldbox_core::{ControlLoop, CoreEvent};
use coldbox_sim::{MockPlc, MockPlcOptions};

const TIMEOUT: Duration = Duration::from_millis(500);
const TICKS: u64 = 40;
const DWELL_SECS: u64 = 10;

/// Holds 8.0 °C for ten seconds, then falls 0.2 °C per second to the setpoint.
fn scripted_temperature(tick: u64) -> f64 {
    let tenths = 80i64 - 2 * tick.saturating_sub(9) as i64;
    tenths.max(50) as f64 / 10.0
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    tick: u64,
    temperature: f64,
    primary_duty: f64,
    primary_on: bool,
    secondary_on: bool,
}

#[tokio::test]
async fn cool_down_sheds_the_second_cooler_first() {
    let plc = MockPlc::start(MockPlcOptions::default()).await.unwrap();
    let mut config = AppConfig::default();
    config.plc.host = plc.host();
    config.plc.port = plc.port();
    config.plc.request_timeout = TIMEOUT;
    config.control.strategy = StrategyKind::PidCascade;
    config.control.setpoint = 5.0;
    let tuning = config.tuning.pid_cascade.clone();

    let start = Instant::now();
    let mut control = ControlLoop::new(config, None).unwrap();
    let mut events = control.subscribe();
    assert!(control.connect(&plc.host(), plc.port(), 1, TIMEOUT, start).await);

    let mut samples = Vec::new();
    for tick in 0..TICKS {
        plc.set_temperature(scripted_temperature(tick));
        let report = control.step(start + Duration::from_secs(tick)).await;
        let reading = report.reading.expect("device reading every tick");
        assert!(!reading.is_synthetic());
        if tick == 0 {
            assert_eq!(reading.value(), 8.0);
        }

        let mut demand = None;
        while let Ok(event) = events.try_recv() {
            if let CoreEvent::ControlDecision(diagnostics) = event {
                demand = Some(diagnostics.demand);
            }
        }
        let demand = demand.expect("one decision per tick");
        let (primary_duty, _) = cascade_split(demand, tuning.cascade_threshold, tuning.balance_ratio);
        samples.push(Sample {
            tick,
            temperature: reading.value(),
            primary_duty,
            primary_on: plc.output(0),
            secondary_on: plc.output(1),
        });
    }

    assert!(samples[0].primary_on && samples[0].secondary_on);

    let secondary_off = samples.iter().find(|s| !s.secondary_on).unwrap();
    let primary_reduced = samples.iter().find(|s| s.primary_duty < 100.0).unwrap();
    let primary_off = samples.iter().find(|s| !s.primary_on).unwrap();
    assert!(secondary_off.tick < primary_reduced.tick);
    assert!(secondary_off.tick < primary_off.tick);
    assert!((primary_off.temperature - 5.0).abs() <= 0.5);

    let outputs: [(&str, fn(&Sample) -> bool); 2] = [
        ("primary", |s| s.primary_on),
        ("secondary", |s| s.secondary_on),
    ];
    for (name, output) in outputs {
        let transitions: Vec<u64> = samples
            .windows(2)
            .filter(|pair| output(&pair[0]) != output(&pair[1]))
            .map(|pair| pair[1].tick)
            .collect();
        // The switch-on at tick 0 counts as the first transition.
        let mut previous = 0;
        for tick in transitions {
            assert!(
                tick - previous >= DWELL_SECS,
                "{name} toggled at {tick}s, only {}s after {previous}s",
                tick - previous
            );
            previous = tick;
        }
    }

    let status = control.status();
    assert_eq!(
        status.actuators,
        vec![
            (ActuatorId::PRIMARY, samples.last().unwrap().primary_on),
            (ActuatorId::SECONDARY, samples.last().unwrap().secondary_on),
        ]
    );
}
