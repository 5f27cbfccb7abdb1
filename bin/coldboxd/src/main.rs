//! ---
//! cbx_section: "07-binaries"
//! cbx_subsection: "binary"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Binary entrypoint for the ColdBox daemon."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coldbox_common::config::AppConfig;
use coldbox_common::logging::init_tracing;
use coldbox_common::StrategyKind;
use coldbox_core::{ControlHandle, ControlLoop, CoreEvent};
use coldbox_device::PlcDevice;
use coldbox_metrics::{new_registry, spawn_http_server, ControlMetrics, MetricsServer};
use coldbox_protocol::TcpTransport;
use coldbox_rt::TaskGroup;
use coldbox_sim::{MockPlc, MockPlcOptions, ThermalModel};
use serde::Serialize;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("ColdBox ", env!("CARGO_PKG_VERSION")),
    about = "ColdBox thermoelectric cooling daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, help = "Override the configured control strategy")]
    strategy: Option<StrategyKind>,

    #[arg(long, value_name = "CELSIUS", help = "Override the configured setpoint")]
    setpoint: Option<f64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the control loop against the configured PLC")]
    Run,
    #[command(about = "Run the control loop against an emulated PLC and thermal plant")]
    Simulate {
        #[arg(long, value_name = "ADDR", help = "Address for the emulated PLC", default_value = "127.0.0.1:0")]
        listen: SocketAddr,
        #[arg(long, help = "Simulated seconds per wall-clock second", default_value_t = 1.0)]
        time_scale: f64,
    },
    #[command(about = "Read the thermocouple and outputs once and print them as JSON")]
    Probe,
}

#[derive(Debug, Serialize)]
struct ProbeReport {
    host: String,
    port: u16,
    temperature: Option<f64>,
    temperature_error: Option<String>,
    actuators: Vec<ProbeActuator>,
}

#[derive(Debug, Serialize)]
struct ProbeActuator {
    id: u8,
    name: String,
    on: Option<bool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run);

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/coldbox.toml"));

    let (mut config, source) = match AppConfig::load_with_source(&candidates) {
        Ok(loaded) => (loaded.config, Some(loaded.source)),
        Err(err) if matches!(command, Commands::Simulate { .. }) && cli.config.is_none() => {
            eprintln!("{err:#}; simulating with built-in defaults");
            (AppConfig::default(), None)
        }
        Err(err) => return Err(err),
    };
    if let Some(strategy) = cli.strategy {
        config.control.strategy = strategy;
    }
    if let Some(setpoint) = cli.setpoint {
        config.control.setpoint = setpoint;
    }
    config.validate()?;
    init_tracing("coldboxd", &config.logging)?;
    if let Some(path) = &source {
        info!(config_path = %path.display(), "configuration loaded");
    }

    match command {
        Commands::Run => run_daemon(config).await,
        Commands::Simulate { listen, time_scale } => {
            let plant = ThermalModel::from_config(&config.synthetic);
            let options = MockPlcOptions::from_config(&config).with_plant(plant, time_scale);
            let plc = MockPlc::bind(listen, options).await?;
            info!(address = %plc.addr(), time_scale, "emulated plc listening");
            config.plc.host = plc.host();
            config.plc.port = plc.port();
            config.plc.auto_connect = true;
            let outcome = run_daemon(config).await;
            plc.shutdown().await;
            outcome
        }
        Commands::Probe => probe(&config).await,
    }
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let registry = new_registry();
    let metrics = ControlMetrics::new(registry.clone())?;
    let metrics_server: Option<MetricsServer> = if config.metrics.enabled {
        let server = spawn_http_server(registry, config.metrics.listen)?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let control = ControlLoop::new(config, Some(metrics))?;
    let (handle, loop_task) = control.spawn();
    let events = handle.subscribe().await?;

    let mut tasks = TaskGroup::default();
    tasks.spawn("control-loop", async move { loop_task.await? });
    tasks.spawn("event-log", log_events(events));

    info!("daemon running; waiting for termination signal");
    wait_for_shutdown(&handle).await;
    tasks.join().await?;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

async fn wait_for_shutdown(handle: &ControlHandle) {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for ctrl-c; shutting down");
    } else {
        info!("ctrl-c received; switching coolers off");
    }
    if let Err(err) = handle.shutdown().await {
        warn!(error = %err, "control loop already stopped");
    }
}

async fn log_events(mut events: mpsc::UnboundedReceiver<CoreEvent>) -> Result<()> {
    while let Some(event) = events.recv().await {
        match event {
            CoreEvent::TemperatureUpdate(reading) => {
                debug!(value = reading.value(), synthetic = reading.is_synthetic(), "temperature");
            }
            CoreEvent::ConnectionStatusChanged {
                connected,
                using_synthetic,
            } => info!(connected, using_synthetic, "connection status"),
            CoreEvent::ActuatorStateChanged { actuator, is_on } => {
                info!(%actuator, is_on, "actuator state")
            }
            CoreEvent::ControlDecision(diagnostics) => debug!(
                strategy = %diagnostics.strategy,
                error = diagnostics.error,
                demand = diagnostics.demand,
                "control decision"
            ),
        }
    }
    Ok(())
}

async fn probe(config: &AppConfig) -> Result<()> {
    let plc = &config.plc;
    let transport = TcpTransport::new(plc.request_timeout);
    transport
        .connect(&plc.host, plc.port, plc.connect_timeout)
        .await
        .with_context(|| format!("cannot reach plc at {}:{}", plc.host, plc.port))?;
    let device = PlcDevice::new(
        transport.clone(),
        plc.unit_id,
        config.thermocouple.clone(),
        config.actuators.clone(),
    );

    let (temperature, temperature_error) = match device.read_temperature().await {
        Ok(reading) => (Some(reading.value()), None),
        Err(err) => (None, Some(err.to_string())),
    };
    let mut actuators = Vec::with_capacity(config.actuators.len());
    for actuator in &config.actuators {
        let on = match device.read_actuator(actuator.id).await {
            Ok(observation) => observation.as_bool(),
            Err(err) => {
                warn!(actuator = %actuator.id, error = %err, "actuator readback failed");
                None
            }
        };
        actuators.push(ProbeActuator {
            id: actuator.id.0,
            name: actuator.name.clone(),
            on,
        });
    }
    transport.disconnect().await;

    let report = ProbeReport {
        host: plc.host.clone(),
        port: plc.port,
        temperature,
        temperature_error,
        actuators,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
