//! ---
//! cbx_section: "15-testing"
//! cbx_subsection: "integration-tests"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Closed-loop runs against the synthetic feed and the emulated plant."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use coldbox_common::{AppConfig, StrategyKind};
use coldbox_core::ControlLoop;
use coldbox_metrics::{new_registry, render, ControlMetrics};
use coldbox_sim::{MockPlc, MockPlcOptions, ThermalModel};

#[tokio::test]
async fn synthetic_feed_keeps_regulating_without_a_plc() {
    let mut config = AppConfig::default();
    config.control.strategy = StrategyKind::Hysteresis;
    let registry = new_registry();
    let metrics = ControlMetrics::new(registry.clone()).unwrap();
    let mut control = ControlLoop::new(config, Some(metrics)).unwrap();

    let start = Instant::now();
    let mut readings = Vec::new();
    for tick in 0..900u64 {
        let report = control.step(start + Duration::from_secs(tick)).await;
        readings.push(report.reading);
    }

    assert!(readings[0].is_none() && readings[1].is_none());
    assert!(readings[2..].iter().all(|r| r.as_ref().is_some_and(|r| r.is_synthetic())));
    // Starts at ambient and must be pulled into the band around the setpoint.
    assert!(readings[2].as_ref().unwrap().value() > 20.0);
    for reading in readings[400..].iter().flatten() {
        assert!(
            (3.0..9.0).contains(&reading.value()),
            "synthetic temperature {} escaped regulation",
            reading.value()
        );
    }

    let text = render(&registry).unwrap();
    assert!(text.contains("coldbox_synthetic_source 1"));
    assert!(text.contains("coldbox_plc_connected 0"));
}

#[tokio::test]
async fn emulated_plant_is_cooled_by_the_running_loop() {
    let mut config = AppConfig::default();
    config.control.strategy = StrategyKind::Hysteresis;
    config.control.poll_interval = Duration::from_millis(500);
    let plant = ThermalModel::from_config(&config.synthetic);
    let plc = MockPlc::start(MockPlcOptions::from_config(&config).with_plant(plant, 600.0))
        .await
        .unwrap();
    config.plc.host = plc.host();
    config.plc.port = plc.port();
    config.plc.request_timeout = Duration::from_millis(500);

    let (handle, task) = ControlLoop::new(config, None).unwrap().spawn();
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    let status = handle.status().await.unwrap();
    assert!(status.connected);
    assert!(!status.using_synthetic);
    let reading = status.last_reading.expect("loop has read the plant");
    assert!(reading.value() < 7.0, "plant still at {}", reading.value());
    assert!(plc.output(0) && plc.output(1));

    handle.shutdown().await.unwrap();
    task.await.unwrap().unwrap();
    assert!(!plc.output(0) && !plc.output(1));
}
