//! ---
//! cbx_section: "05-control-strategies"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Discrete PID with anti-windup feeding a PWM cascade."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use std::time::Instant;

use coldbox_common::config::{PidCascadeTuning, TuningConfig};
use coldbox_common::{ActuatorId, StrategyKind};

use crate::decision::{ActuatorIntent, ControlUpdate, Diagnostics, Gains, PidTerms};
use crate::error::Result;
use crate::sampling::{cascade_split, Admitted, Pwm, SampleGate, SampleLimits};
use crate::strategy::Controller;

/// PID state shared by the fixed-gain and adaptive-gain strategies.
///
/// Error is `setpoint - temperature`, so a warm container yields a negative output and
/// the cooling demand is the negated output. The derivative acts on the measurement to
/// avoid a kick when the setpoint moves.
#[derive(Debug, Clone, Default)]
pub struct PidCore {
    integral: f64,
    previous_error: Option<f64>,
    previous_temperature: Option<f64>,
}

/// Result of one PID evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidStep {
    pub error: f64,
    pub previous_error: Option<f64>,
    pub terms: PidTerms,
    pub output: f64,
}

impl PidCore {
    pub fn integral(&self) -> f64 {
        self.integral
    }

    /// Scale the accumulated integral, e.g. after the error changes sign.
    pub fn scale_integral(&mut self, factor: f64) {
        self.integral *= factor;
    }

    pub fn step(
        &mut self,
        setpoint: f64,
        temperature: f64,
        sample: Admitted,
        gains: Gains,
        integral_limit: f64,
    ) -> PidStep {
        let error = setpoint - temperature;
        let previous_error = self.previous_error;
        if sample.dt > 0.0 {
            self.integral = (self.integral + error * sample.dt).clamp(-integral_limit, integral_limit);
        }
        let rate = match (self.previous_temperature, sample.dt > 0.0) {
            (Some(previous), true) => (temperature - previous) / sample.dt,
            _ => 0.0,
        };
        let terms = PidTerms {
            proportional: gains.kp * error,
            integral: gains.ki * self.integral,
            derivative: -gains.kd * rate,
        };
        self.previous_error = Some(error);
        self.previous_temperature = Some(temperature);
        PidStep {
            error,
            previous_error,
            terms,
            output: terms.proportional + terms.integral + terms.derivative,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Cooling demand in percent for a PID output.
pub fn cooling_demand(output: f64) -> f64 {
    (-output).clamp(0.0, 100.0)
}

/// Turns two duty cycles into on/off intents through a shared PWM.
pub(crate) fn cascade_intents(
    pwm: &mut Pwm,
    demand: f64,
    tuning: &PidCascadeTuning,
    now: Instant,
) -> Vec<ActuatorIntent> {
    let (primary, secondary) = cascade_split(demand, tuning.cascade_threshold, tuning.balance_ratio);
    vec![
        ActuatorIntent::pwm(ActuatorId::PRIMARY, pwm.is_on(primary, now), primary),
        ActuatorIntent::pwm(ActuatorId::SECONDARY, pwm.is_on(secondary, now), secondary),
    ]
}

#[derive(Debug, Clone)]
pub struct PidCascadeController {
    setpoint: f64,
    tuning: PidCascadeTuning,
    gate: SampleGate,
    pwm: Pwm,
    core: PidCore,
}

impl PidCascadeController {
    pub fn new(setpoint: f64, tuning: PidCascadeTuning, limits: SampleLimits) -> Self {
        let pwm = Pwm::new(tuning.pwm_period);
        Self {
            setpoint,
            tuning,
            gate: SampleGate::new(limits),
            pwm,
            core: PidCore::default(),
        }
    }

    pub fn integral(&self) -> f64 {
        self.core.integral()
    }

    fn gains(&self) -> Gains {
        Gains {
            kp: self.tuning.kp,
            ki: self.tuning.ki,
            kd: self.tuning.kd,
        }
    }
}

impl Controller for PidCascadeController {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PidCascade
    }

    fn setpoint(&self) -> f64 {
        self.setpoint
    }

    fn configure(&mut self, setpoint: f64, tuning: &TuningConfig) -> Result<()> {
        let changed = self.setpoint != setpoint;
        self.setpoint = setpoint;
        self.tuning = tuning.pid_cascade.clone();
        self.pwm.set_period(self.tuning.pwm_period);
        if changed {
            self.reset();
        }
        Ok(())
    }

    fn update(&mut self, temperature: f64, now: Instant) -> Result<Option<ControlUpdate>> {
        let Some(sample) = self.gate.admit(temperature, now)? else {
            return Ok(None);
        };
        let gains = self.gains();
        let step = self
            .core
            .step(self.setpoint, temperature, sample, gains, self.tuning.integral_limit);
        let demand = cooling_demand(step.output);
        let intents = cascade_intents(&mut self.pwm, demand, &self.tuning, now);

        let mut diagnostics = Diagnostics::new(self.kind(), self.setpoint, temperature, step.error);
        diagnostics.demand = demand;
        diagnostics.terms = Some(step.terms);
        diagnostics.gains = Some(gains);
        Ok(Some(ControlUpdate {
            intents,
            diagnostics,
        }))
    }

    fn reset(&mut self) {
        self.gate.reset();
        self.pwm.reset();
        self.core.reset();
    }
}
