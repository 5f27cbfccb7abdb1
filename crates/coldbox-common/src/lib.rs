//! ---
//! cbx_section: "01-core-runtime"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "ColdBox common crate: configuration, logging, loop timing, shared types."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
//! Core shared primitives for the ColdBox workspace.
//! This crate exposes configuration loading, logging initialisation, loop
//! timing helpers, and the domain types passed between the protocol, device,
//! control, and runtime crates.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod time;
pub mod types;

pub use config::{
    ActuatorConfig, AppConfig, ControlConfig, HysteresisTuning, LoggingConfig, MetricsConfig,
    MpcTuning, PidCascadeTuning, PlcConfig, RbfTuning, SyntheticConfig, ThermocoupleConfig,
    TuningConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use metrics::{JitterHistogram, JitterSummary, LoopTimingReporter};
pub use types::{ActuatorId, ReadingSource, StrategyKind, TemperatureReading};

/// Crate version string reported by binaries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
