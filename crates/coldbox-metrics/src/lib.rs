//! ---
//! cbx_section: "03-logging-metrics"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Metrics collection and export utilities."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{
    Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the daemon.
pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let addr = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Render the registry in the Prometheus text format.
pub fn render(registry: &Registry) -> Result<String> {
    TextEncoder::new()
        .encode_to_string(&registry.gather())
        .context("failed to encode metrics")
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    match render(&registry) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; charset=utf-8"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Bound address, useful when listening on port 0.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Instruments updated by the control loop.
#[derive(Clone, Debug)]
pub struct ControlMetrics {
    registry: SharedRegistry,
    ticks_total: IntCounter,
    tick_seconds: Histogram,
    read_failures_total: IntCounter,
    write_failures_total: IntCounterVec,
    reconnects_total: IntCounter,
    synthetic_source: IntGauge,
    connected: IntGauge,
    temperature: Gauge,
    setpoint: Gauge,
    actuator_on: IntGaugeVec,
    transitions_total: IntCounterVec,
    held_transitions_total: IntCounterVec,
}

impl ControlMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let ticks_total = IntCounter::with_opts(Opts::new(
            "coldbox_ticks_total",
            "Control loop ticks executed",
        ))?;
        registry.register(Box::new(ticks_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.001, 2.0, 14)
            .context("failed to construct histogram buckets")?;
        let tick_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "coldbox_tick_duration_seconds",
                "Time spent reading, deciding and writing within one tick",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(tick_seconds.clone()))?;

        let read_failures_total = IntCounter::with_opts(Opts::new(
            "coldbox_read_failures_total",
            "Temperature reads that failed on both thermocouple blocks",
        ))?;
        registry.register(Box::new(read_failures_total.clone()))?;

        let write_failures_total = IntCounterVec::new(
            Opts::new(
                "coldbox_write_failures_total",
                "Actuator writes that failed on both the coil and register path",
            ),
            &["actuator"],
        )?;
        registry.register(Box::new(write_failures_total.clone()))?;

        let reconnects_total = IntCounter::with_opts(Opts::new(
            "coldbox_reconnects_total",
            "Reconnect attempts after an unexpected disconnect",
        ))?;
        registry.register(Box::new(reconnects_total.clone()))?;

        let synthetic_source = IntGauge::with_opts(Opts::new(
            "coldbox_synthetic_source",
            "Indicator (0/1) whether temperatures come from the synthetic feed",
        ))?;
        registry.register(Box::new(synthetic_source.clone()))?;

        let connected = IntGauge::with_opts(Opts::new(
            "coldbox_plc_connected",
            "Indicator (0/1) whether the PLC connection is up",
        ))?;
        registry.register(Box::new(connected.clone()))?;

        let temperature = Gauge::with_opts(Opts::new(
            "coldbox_temperature_celsius",
            "Most recent temperature used for control",
        ))?;
        registry.register(Box::new(temperature.clone()))?;

        let setpoint = Gauge::with_opts(Opts::new(
            "coldbox_setpoint_celsius",
            "Current target temperature",
        ))?;
        registry.register(Box::new(setpoint.clone()))?;

        let actuator_on = IntGaugeVec::new(
            Opts::new(
                "coldbox_actuator_on",
                "Indicator (0/1) of the last state written to each actuator",
            ),
            &["actuator"],
        )?;
        registry.register(Box::new(actuator_on.clone()))?;

        let transitions_total = IntCounterVec::new(
            Opts::new(
                "coldbox_actuator_transitions_total",
                "Actuator transitions allowed by the governor",
            ),
            &["actuator"],
        )?;
        registry.register(Box::new(transitions_total.clone()))?;

        let held_transitions_total = IntCounterVec::new(
            Opts::new(
                "coldbox_actuator_held_transitions_total",
                "Desired transitions held back by the minimum dwell time",
            ),
            &["actuator"],
        )?;
        registry.register(Box::new(held_transitions_total.clone()))?;

        Ok(Self {
            registry,
            ticks_total,
            tick_seconds,
            read_failures_total,
            write_failures_total,
            reconnects_total,
            synthetic_source,
            connected,
            temperature,
            setpoint,
            actuator_on,
            transitions_total,
            held_transitions_total,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn observe_tick(&self, seconds: f64) {
        self.ticks_total.inc();
        self.tick_seconds.observe(seconds);
    }

    pub fn inc_read_failure(&self) {
        self.read_failures_total.inc();
    }

    pub fn inc_write_failure(&self, actuator: &str) {
        self.write_failures_total.with_label_values(&[actuator]).inc();
    }

    pub fn inc_reconnect(&self) {
        self.reconnects_total.inc();
    }

    pub fn set_synthetic(&self, synthetic: bool) {
        self.synthetic_source.set(i64::from(synthetic));
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.set(i64::from(connected));
    }

    pub fn set_temperature(&self, celsius: f64) {
        self.temperature.set(celsius);
    }

    pub fn set_setpoint(&self, celsius: f64) {
        self.setpoint.set(celsius);
    }

    pub fn set_actuator(&self, actuator: &str, on: bool) {
        self.actuator_on
            .with_label_values(&[actuator])
            .set(i64::from(on));
    }

    pub fn record_transition(&self, actuator: &str) {
        self.transitions_total.with_label_values(&[actuator]).inc();
    }

    pub fn record_held(&self, actuator: &str) {
        self.held_transitions_total
            .with_label_values(&[actuator])
            .inc();
    }
}

pub use prometheus;
