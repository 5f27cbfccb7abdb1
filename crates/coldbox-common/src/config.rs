//! ---
//! cbx_section: "01-core-runtime"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "ColdBox configuration: PLC link, thermocouple, actuators, control tuning."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;
use crate::types::{ActuatorId, StrategyKind};

fn default_plc_host() -> String {
    "192.168.1.10".to_owned()
}

fn default_plc_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_request_timeout() -> Duration {
    Duration::from_millis(3000)
}

fn default_connect_timeout() -> Duration {
    Duration::from_millis(3000)
}

fn default_primary_base() -> u16 {
    100
}

fn default_secondary_base() -> u16 {
    95
}

fn default_secondary_offset() -> u16 {
    5
}

fn default_block_len() -> u16 {
    10
}

fn default_scale() -> f64 {
    10.0
}

fn default_dwell() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_min_sample_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_setpoint() -> f64 {
    5.0
}

fn default_true() -> bool {
    true
}

fn default_synthetic_after_failures() -> u32 {
    3
}

fn default_valid_min() -> f64 {
    -50.0
}

fn default_valid_max() -> f64 {
    150.0
}

fn default_reconnect_initial() -> Duration {
    Duration::from_secs(1)
}

fn default_reconnect_max() -> Duration {
    Duration::from_secs(30)
}

fn default_pwm_period() -> Duration {
    Duration::from_secs(15)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9899))
}

fn default_simulation_seed() -> u64 {
    0xC01D_B0
}

/// Primary configuration object for the ColdBox runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub plc: PlcConfig,
    #[serde(default)]
    pub thermocouple: ThermocoupleConfig,
    #[serde(default = "ActuatorConfig::default_pair")]
    pub actuators: Vec<ActuatorConfig>,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub tuning: TuningConfig,
    #[serde(default)]
    pub synthetic: SyntheticConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "COLDBOX_CONFIG";

    /// Load configuration from disk, respecting the `COLDBOX_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Look up an actuator by id.
    pub fn actuator(&self, id: ActuatorId) -> Option<&ActuatorConfig> {
        self.actuators.iter().find(|actuator| actuator.id == id)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.plc.validate()?;
        self.thermocouple.validate()?;
        if self.actuators.len() != 2 {
            return Err(anyhow!(
                "exactly two actuators must be configured, found {}",
                self.actuators.len()
            ));
        }
        let mut addresses = HashSet::new();
        for id in [ActuatorId::PRIMARY, ActuatorId::SECONDARY] {
            let actuator = self
                .actuator(id)
                .ok_or_else(|| anyhow!("missing configuration for {}", id))?;
            actuator.validate()?;
            if !addresses.insert(actuator.coil_address) {
                return Err(anyhow!(
                    "coil address {} is assigned to more than one actuator",
                    actuator.coil_address
                ));
            }
        }
        self.control.validate()?;
        self.tuning.validate()?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            plc: PlcConfig::default(),
            thermocouple: ThermocoupleConfig::default(),
            actuators: ActuatorConfig::default_pair(),
            control: ControlConfig::default(),
            tuning: TuningConfig::default(),
            synthetic: SyntheticConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// PLC endpoint and request timing.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlcConfig {
    #[serde(default = "default_plc_host")]
    pub host: String,
    #[serde(default = "default_plc_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    #[serde(default = "default_request_timeout", rename = "request_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    #[serde(default = "default_connect_timeout", rename = "connect_timeout_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,
    /// Connect on startup instead of waiting for an explicit command.
    #[serde(default = "default_true")]
    pub auto_connect: bool,
}

impl PlcConfig {
    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("plc.host must not be empty"));
        }
        if self.request_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(anyhow!("plc timeouts must be positive"));
        }
        Ok(())
    }
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            host: default_plc_host(),
            port: default_plc_port(),
            unit_id: default_unit_id(),
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            auto_connect: true,
        }
    }
}

/// Location of the thermocouple register inside the two overlapping blocks
/// the controller is willing to serve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThermocoupleConfig {
    #[serde(default = "default_primary_base")]
    pub primary_base: u16,
    #[serde(default)]
    pub primary_offset: u16,
    #[serde(default = "default_secondary_base")]
    pub secondary_base: u16,
    #[serde(default = "default_secondary_offset")]
    pub secondary_offset: u16,
    #[serde(default = "default_block_len")]
    pub block_len: u16,
    #[serde(default = "default_scale")]
    pub scale: f64,
}

impl ThermocoupleConfig {
    /// Absolute register address of the thermocouple as seen from the primary block.
    pub fn register_address(&self) -> u16 {
        self.primary_base.wrapping_add(self.primary_offset)
    }

    fn validate(&self) -> Result<()> {
        if self.block_len == 0 || self.block_len > 125 {
            return Err(anyhow!("thermocouple.block_len must be within 1..=125"));
        }
        if self.primary_offset >= self.block_len || self.secondary_offset >= self.block_len {
            return Err(anyhow!("thermocouple offsets must fall inside the block"));
        }
        let secondary_address = self.secondary_base.wrapping_add(self.secondary_offset);
        if secondary_address != self.register_address() {
            return Err(anyhow!(
                "secondary block must address the same register ({} != {})",
                secondary_address,
                self.register_address()
            ));
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(anyhow!("thermocouple.scale must be positive"));
        }
        Ok(())
    }
}

impl Default for ThermocoupleConfig {
    fn default() -> Self {
        Self {
            primary_base: default_primary_base(),
            primary_offset: 0,
            secondary_base: default_secondary_base(),
            secondary_offset: default_secondary_offset(),
            block_len: default_block_len(),
            scale: default_scale(),
        }
    }
}

/// Static description of one thermoelectric cooler output.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActuatorConfig {
    pub id: ActuatorId,
    pub name: String,
    pub coil_address: u16,
    #[serde(default = "default_dwell", rename = "min_on_time_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_on_time: Duration,
    #[serde(default = "default_dwell", rename = "min_off_time_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_off_time: Duration,
}

impl ActuatorConfig {
    pub fn new(id: ActuatorId, name: impl Into<String>, coil_address: u16) -> Self {
        Self {
            id,
            name: name.into(),
            coil_address,
            min_on_time: default_dwell(),
            min_off_time: default_dwell(),
        }
    }

    pub fn default_pair() -> Vec<ActuatorConfig> {
        vec![
            ActuatorConfig::new(ActuatorId::PRIMARY, "peltier-1", 0),
            ActuatorConfig::new(ActuatorId::SECONDARY, "peltier-2", 1),
        ]
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("{} must have a name", self.id));
        }
        Ok(())
    }
}

/// Loop scheduling and supervisory policy.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_poll_interval", rename = "poll_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
    #[serde(default = "default_min_sample_interval", rename = "min_sample_interval_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub min_sample_interval: Duration,
    #[serde(default = "default_setpoint")]
    pub setpoint: f64,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default = "default_true")]
    pub automatic: bool,
    #[serde(default = "default_synthetic_after_failures")]
    pub synthetic_after_failures: u32,
    #[serde(default = "default_valid_min")]
    pub valid_min: f64,
    #[serde(default = "default_valid_max")]
    pub valid_max: f64,
    #[serde(default = "default_reconnect_initial", rename = "reconnect_initial_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reconnect_initial: Duration,
    #[serde(default = "default_reconnect_max", rename = "reconnect_max_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reconnect_max: Duration,
}

impl ControlConfig {
    fn validate(&self) -> Result<()> {
        if self.min_sample_interval < Duration::from_millis(500) {
            return Err(anyhow!("control.min_sample_interval must be at least 500 ms"));
        }
        if self.poll_interval < self.min_sample_interval {
            return Err(anyhow!(
                "control.poll_interval must not be shorter than min_sample_interval"
            ));
        }
        if !(self.valid_min < self.valid_max) {
            return Err(anyhow!("control.valid_min must be below valid_max"));
        }
        if !(self.valid_min..=self.valid_max).contains(&self.setpoint) {
            return Err(anyhow!(
                "control.setpoint {} is outside the valid range",
                self.setpoint
            ));
        }
        if self.synthetic_after_failures == 0 {
            return Err(anyhow!("control.synthetic_after_failures must be at least 1"));
        }
        if self.reconnect_initial.is_zero() || self.reconnect_max < self.reconnect_initial {
            return Err(anyhow!("control reconnect backoff bounds are inconsistent"));
        }
        Ok(())
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            min_sample_interval: default_min_sample_interval(),
            setpoint: default_setpoint(),
            strategy: StrategyKind::default(),
            automatic: true,
            synthetic_after_failures: default_synthetic_after_failures(),
            valid_min: default_valid_min(),
            valid_max: default_valid_max(),
            reconnect_initial: default_reconnect_initial(),
            reconnect_max: default_reconnect_max(),
        }
    }
}

/// Per-strategy tuning sections.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TuningConfig {
    #[serde(default)]
    pub hysteresis: HysteresisTuning,
    #[serde(default)]
    pub pid_cascade: PidCascadeTuning,
    #[serde(default)]
    pub rbf: RbfTuning,
    #[serde(default)]
    pub mpc: MpcTuning,
}

impl TuningConfig {
    fn validate(&self) -> Result<()> {
        if self.hysteresis.pwm_period.is_zero() || self.pid_cascade.pwm_period.is_zero() {
            return Err(anyhow!("pwm periods must be positive"));
        }
        if !(0.0..=100.0).contains(&self.hysteresis.maintain_duty) {
            return Err(anyhow!("tuning.hysteresis.maintain_duty must be within 0..=100"));
        }
        if !(0.0..100.0).contains(&self.pid_cascade.cascade_threshold)
            || self.pid_cascade.cascade_threshold <= 0.0
        {
            return Err(anyhow!("tuning.pid_cascade.cascade_threshold must be within (0, 100)"));
        }
        if self.pid_cascade.integral_limit <= 0.0 {
            return Err(anyhow!("tuning.pid_cascade.integral_limit must be positive"));
        }
        if !(self.rbf.min_gain < self.rbf.max_gain) || self.rbf.min_gain < 0.0 {
            return Err(anyhow!("tuning.rbf gain bounds must satisfy 0 <= min < max"));
        }
        if !(0.0..=1.0).contains(&self.rbf.forgetting_factor) {
            return Err(anyhow!("tuning.rbf.forgetting_factor must be within 0..=1"));
        }
        if self.mpc.hidden_units == 0 || self.mpc.horizon == 0 || self.mpc.candidates == 0 {
            return Err(anyhow!("tuning.mpc sizes must be non-zero"));
        }
        if !(self.mpc.min_learning_rate <= self.mpc.learning_rate
            && self.mpc.learning_rate <= self.mpc.max_learning_rate)
        {
            return Err(anyhow!("tuning.mpc.learning_rate must lie within its bounds"));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HysteresisTuning {
    pub maintain_duty: f64,
    #[serde(rename = "pwm_period_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub pwm_period: Duration,
}

impl Default for HysteresisTuning {
    fn default() -> Self {
        Self {
            maintain_duty: 20.0,
            pwm_period: default_pwm_period(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PidCascadeTuning {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub integral_limit: f64,
    pub cascade_threshold: f64,
    pub balance_ratio: f64,
    #[serde(rename = "pwm_period_ms")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub pwm_period: Duration,
}

impl Default for PidCascadeTuning {
    fn default() -> Self {
        Self {
            kp: 20.0,
            ki: 0.5,
            kd: 5.0,
            integral_limit: 100.0,
            cascade_threshold: 50.0,
            balance_ratio: 1.0,
            pwm_period: default_pwm_period(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RbfTuning {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub min_gain: f64,
    pub max_gain: f64,
    pub learning_rate: f64,
    pub forgetting_factor: f64,
    pub width: f64,
    pub integral_limit: f64,
    pub integral_sign_reset: f64,
    pub deadband: f64,
    pub boost_gain: f64,
    pub boost_exponent: f64,
}

impl Default for RbfTuning {
    fn default() -> Self {
        Self {
            kp: 20.0,
            ki: 0.5,
            kd: 5.0,
            min_gain: 0.01,
            max_gain: 60.0,
            learning_rate: 0.05,
            forgetting_factor: 0.995,
            width: 1.0,
            integral_limit: 100.0,
            integral_sign_reset: 0.7,
            deadband: 5.0,
            boost_gain: 4.0,
            boost_exponent: 1.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MpcTuning {
    pub hidden_units: usize,
    pub horizon: usize,
    pub candidates: usize,
    pub learning_rate: f64,
    pub min_learning_rate: f64,
    pub max_learning_rate: f64,
    pub momentum: f64,
    pub effort_penalty: f64,
    pub cooling_bias: f64,
    pub idle_bias: f64,
    pub accuracy_band: f64,
    pub confidence_window: usize,
    pub error_scale: f64,
    pub seed: u64,
}

impl Default for MpcTuning {
    fn default() -> Self {
        Self {
            hidden_units: 8,
            horizon: 5,
            candidates: 20,
            learning_rate: 0.01,
            min_learning_rate: 0.0005,
            max_learning_rate: 0.05,
            momentum: 0.9,
            effort_penalty: 0.05,
            cooling_bias: -0.05,
            idle_bias: 0.02,
            accuracy_band: 0.1,
            confidence_window: 20,
            error_scale: 10.0,
            seed: default_simulation_seed(),
        }
    }
}

/// Parameters of the simulated container used when the PLC cannot be read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub ambient: f64,
    pub cooling_per_actuator: f64,
    pub time_constant_secs: f64,
    pub noise_sigma: f64,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            ambient: 22.0,
            cooling_per_actuator: 12.0,
            time_constant_secs: 300.0,
            noise_sigma: 0.05,
            seed: default_simulation_seed(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
