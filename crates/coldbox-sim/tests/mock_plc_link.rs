//! ---
//! cbx_section: "15-testing"
//! cbx_subsection: "integration-tests"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Driver and transport against the mock PLC over real sockets."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use std::time::Duration;

use coldbox_common::{ActuatorConfig, ActuatorId, ThermocoupleConfig};
use coldbox_device::{ActuatorObservation, DeviceError, PlcDevice, WritePath};
use coldbox_protocol::{ExceptionCode, LinkError, Request, TcpTransport, TransportError};
use coldbox_sim::{MockFaults, MockPlc, MockPlcOptions, ThermalModel};

const TIMEOUT: Duration = Duration::from_millis(400);

async fn connected(plc: &MockPlc) -> PlcDevice<TcpTransport> {
    let transport = TcpTransport::new(TIMEOUT);
    transport
        .connect(&plc.host(), plc.port(), TIMEOUT)
        .await
        .expect("connect to mock plc");
    PlcDevice::new(
        transport,
        1,
        ThermocoupleConfig::default(),
        ActuatorConfig::default_pair(),
    )
}

#[tokio::test]
async fn reads_positive_and_negative_temperatures() {
    let plc = MockPlc::start(MockPlcOptions::default()).await.unwrap();
    let device = connected(&plc).await;

    plc.set_temperature(22.4);
    assert_eq!(device.read_temperature().await.unwrap().value(), 22.4);
    plc.set_temperature(-3.0);
    assert_eq!(device.read_temperature().await.unwrap().value(), -3.0);

    let first = plc.requests()[0];
    assert_eq!(
        first,
        Request::ReadHoldingRegisters {
            address: 100,
            quantity: 10
        }
    );
}

#[tokio::test]
async fn both_blocks_agree_on_the_thermocouple() {
    let plc = MockPlc::start(MockPlcOptions::default()).await.unwrap();
    let device = connected(&plc).await;
    plc.set_temperature(6.3);

    let primary = device
        .read_thermocouple_block(coldbox_device::ThermocoupleBlock::Primary)
        .await
        .unwrap();
    let secondary = device
        .read_thermocouple_block(coldbox_device::ThermocoupleBlock::Secondary)
        .await
        .unwrap();
    assert_eq!(primary, secondary);
    assert_eq!(primary, 6.3);
}

#[tokio::test]
async fn single_register_read_hits_the_quirk() {
    let plc = MockPlc::start(MockPlcOptions::default()).await.unwrap();
    let device = connected(&plc).await;
    let err = device
        .client()
        .call(
            1,
            &Request::ReadHoldingRegisters {
                address: 100,
                quantity: 1,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.device_exception().map(|e| e.code),
        Some(ExceptionCode::IllegalDataAddress)
    );
}

#[tokio::test]
async fn corrupted_echo_falls_back_to_register_write() {
    let plc = MockPlc::start(MockPlcOptions::default()).await.unwrap();
    plc.set_faults(MockFaults {
        corrupt_coil_echo: true,
        ..MockFaults::default()
    });
    let device = connected(&plc).await;

    let path = device.set_actuator(ActuatorId::SECONDARY, true).await.unwrap();
    assert_eq!(path, WritePath::Register);
    assert!(plc.output(1));
    assert_eq!(
        device.read_actuator(ActuatorId::SECONDARY).await.unwrap(),
        ActuatorObservation::On
    );
}

#[tokio::test]
async fn fragmented_responses_are_reassembled() {
    let plc = MockPlc::start(MockPlcOptions::default()).await.unwrap();
    plc.set_faults(MockFaults {
        fragment_responses: true,
        ..MockFaults::default()
    });
    let device = connected(&plc).await;
    assert_eq!(device.read_temperature().await.unwrap().value(), 8.0);
    assert_eq!(device.set_actuator(ActuatorId::PRIMARY, true).await.unwrap(), WritePath::Coil);
}

#[tokio::test]
async fn silent_device_times_out_both_blocks() {
    let plc = MockPlc::start(MockPlcOptions::default()).await.unwrap();
    let device = connected(&plc).await;
    plc.set_faults(MockFaults {
        silent: true,
        ..MockFaults::default()
    });

    match device.read_temperature().await.unwrap_err() {
        DeviceError::ReadFailed { primary, secondary } => {
            assert!(primary.is_timeout());
            assert!(secondary.is_timeout());
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(device.client().pending_len(), 0);
}

#[tokio::test]
async fn dropped_connection_is_reported_to_callers() {
    let plc = MockPlc::start(MockPlcOptions::default()).await.unwrap();
    let device = connected(&plc).await;
    plc.drop_connections();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = device.read_thermocouple_block(coldbox_device::ThermocoupleBlock::Primary).await.unwrap_err();
    assert!(matches!(
        err,
        LinkError::Transport(TransportError::NotConnected | TransportError::ConnectionReset(_))
    ));
    assert!(!device.client().is_connected());
}

#[tokio::test]
async fn plant_responds_to_running_coolers() {
    let plant = ThermalModel {
        ambient: 22.0,
        cooling_per_actuator: 12.0,
        time_constant_secs: 300.0,
    };
    let plc = MockPlc::start(MockPlcOptions::default().with_plant(plant, 3_000.0))
        .await
        .unwrap();
    let device = connected(&plc).await;
    let before = device.read_temperature().await.unwrap().value();

    device.set_actuator(ActuatorId::PRIMARY, true).await.unwrap();
    device.set_actuator(ActuatorId::SECONDARY, true).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let after = device.read_temperature().await.unwrap().value();
    assert!(after < before, "{after} should be below {before}");
}
