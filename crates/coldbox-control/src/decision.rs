//! ---
//! cbx_section: "05-control-strategies"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Intents and diagnostics emitted by every strategy."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use coldbox_common::{ActuatorId, StrategyKind};
use serde::Serialize;

/// What a strategy would like an actuator to do this tick. Not applied directly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ActuatorIntent {
    pub actuator: ActuatorId,
    pub desired_on: bool,
    /// Duty cycle behind `desired_on` for PWM driven strategies.
    pub duty_percent: Option<f64>,
}

impl ActuatorIntent {
    pub fn switch(actuator: ActuatorId, desired_on: bool) -> Self {
        Self {
            actuator,
            desired_on,
            duty_percent: None,
        }
    }

    pub fn pwm(actuator: ActuatorId, desired_on: bool, duty_percent: f64) -> Self {
        Self {
            actuator,
            desired_on,
            duty_percent: Some(duty_percent),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PidTerms {
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Gains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

/// Per-tick explanation of a decision, published to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Diagnostics {
    pub strategy: StrategyKind,
    pub setpoint: f64,
    pub temperature: f64,
    pub error: f64,
    /// Total cooling demand in percent, before the cascade split.
    pub demand: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub band: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms: Option<PidTerms>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gains: Option<Gains>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicted_delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_cost: Option<f64>,
}

impl Diagnostics {
    pub fn new(strategy: StrategyKind, setpoint: f64, temperature: f64, error: f64) -> Self {
        Self {
            strategy,
            setpoint,
            temperature,
            error,
            ..Self::default()
        }
    }
}

/// Output of one accepted sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlUpdate {
    pub intents: Vec<ActuatorIntent>,
    pub diagnostics: Diagnostics,
}

impl ControlUpdate {
    pub fn intent(&self, actuator: ActuatorId) -> Option<&ActuatorIntent> {
        self.intents.iter().find(|intent| intent.actuator == actuator)
    }
}
