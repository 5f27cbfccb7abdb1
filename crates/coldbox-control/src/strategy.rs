//! ---
//! cbx_section: "05-control-strategies"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Strategy contract and the tagged strategy held by the loop."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use std::time::Instant;

use coldbox_common::config::TuningConfig;
use coldbox_common::StrategyKind;

use crate::decision::ControlUpdate;
use crate::error::{ControlError, Result};
use crate::hysteresis::HysteresisController;
use crate::mpc::{Action, NeuralMpc};
use crate::pid::PidCascadeController;
use crate::rbf::RbfAdaptivePid;
use crate::sampling::SampleLimits;

/// Contract shared by all strategies.
///
/// `update` returns `Ok(None)` when called again inside the minimum sample interval so
/// accumulated terms are never counted twice. Bad samples are errors and leave the
/// strategy state untouched.
pub trait Controller {
    fn kind(&self) -> StrategyKind;

    fn setpoint(&self) -> f64;

    /// Apply a new setpoint and tuning. A changed setpoint resets learned state.
    fn configure(&mut self, setpoint: f64, tuning: &TuningConfig) -> Result<()>;

    fn update(&mut self, temperature: f64, now: Instant) -> Result<Option<ControlUpdate>>;

    fn reset(&mut self);

    /// States the governor actually let through for the last update. Strategies that
    /// model the plant use these instead of what they asked for.
    fn observe_applied(&mut self, _applied: Action) {}
}

/// The strategy currently driving the coolers. Switching builds a fresh variant.
#[derive(Debug, Clone)]
pub enum ControlStrategy {
    Hysteresis(HysteresisController),
    PidCascade(PidCascadeController),
    RbfAdaptive(RbfAdaptivePid),
    NeuralMpc(Box<NeuralMpc>),
}

impl ControlStrategy {
    pub fn build(
        kind: StrategyKind,
        setpoint: f64,
        tuning: &TuningConfig,
        limits: SampleLimits,
    ) -> Result<Self> {
        if !setpoint.is_finite() {
            return Err(ControlError::InvalidSetpoint(setpoint));
        }
        let strategy = match kind {
            StrategyKind::Hysteresis => ControlStrategy::Hysteresis(HysteresisController::new(
                setpoint,
                tuning.hysteresis.clone(),
                limits,
            )),
            StrategyKind::PidCascade => ControlStrategy::PidCascade(PidCascadeController::new(
                setpoint,
                tuning.pid_cascade.clone(),
                limits,
            )),
            StrategyKind::RbfAdaptive => ControlStrategy::RbfAdaptive(RbfAdaptivePid::new(
                setpoint,
                tuning.rbf.clone(),
                tuning.pid_cascade.clone(),
                limits,
            )),
            StrategyKind::NeuralMpc => ControlStrategy::NeuralMpc(Box::new(NeuralMpc::new(
                setpoint,
                tuning.mpc.clone(),
                limits,
            ))),
        };
        Ok(strategy)
    }

    fn inner(&self) -> &dyn Controller {
        match self {
            ControlStrategy::Hysteresis(controller) => controller,
            ControlStrategy::PidCascade(controller) => controller,
            ControlStrategy::RbfAdaptive(controller) => controller,
            ControlStrategy::NeuralMpc(controller) => controller.as_ref(),
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Controller {
        match self {
            ControlStrategy::Hysteresis(controller) => controller,
            ControlStrategy::PidCascade(controller) => controller,
            ControlStrategy::RbfAdaptive(controller) => controller,
            ControlStrategy::NeuralMpc(controller) => controller.as_mut(),
        }
    }
}

impl Controller for ControlStrategy {
    fn kind(&self) -> StrategyKind {
        self.inner().kind()
    }

    fn setpoint(&self) -> f64 {
        self.inner().setpoint()
    }

    fn configure(&mut self, setpoint: f64, tuning: &TuningConfig) -> Result<()> {
        if !setpoint.is_finite() {
            return Err(ControlError::InvalidSetpoint(setpoint));
        }
        self.inner_mut().configure(setpoint, tuning)
    }

    fn update(&mut self, temperature: f64, now: Instant) -> Result<Option<ControlUpdate>> {
        self.inner_mut().update(temperature, now)
    }

    fn reset(&mut self) {
        self.inner_mut().reset()
    }

    fn observe_applied(&mut self, applied: Action) {
        self.inner_mut().observe_applied(applied)
    }
}
