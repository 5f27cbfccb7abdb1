//! ---
//! cbx_section: "05-control-strategies"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "PID whose gains are adapted online by a Gaussian RBF network."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
//! The network maps `(error, error rate)` through fixed Gaussian centers to additive
//! adjustments of the base gains. Each accepted sample runs one gradient step that
//! lowers the squared error, scaled by `1 - exp(-|error|)` so adaptation fades as the
//! loop converges. Weights decay by the forgetting factor every step and the effective
//! gains are always clamped to `[min_gain, max_gain]`.
use std::collections::VecDeque;
use std::time::Instant;

use coldbox_common::config::{PidCascadeTuning, RbfTuning, TuningConfig};
use coldbox_common::StrategyKind;

use crate::decision::{ControlUpdate, Diagnostics, Gains};
use crate::error::Result;
use crate::pid::{cascade_intents, cooling_demand, PidCore};
use crate::sampling::{Pwm, SampleGate, SampleLimits};
use crate::strategy::Controller;

const ERROR_CENTERS: [f64; 5] = [-3.0, -1.5, 0.0, 1.5, 3.0];
const RATE_CENTERS: [f64; 3] = [-0.2, 0.0, 0.2];
/// Width of the rate dimension relative to the error dimension.
const RATE_WIDTH_RATIO: f64 = 0.2;
const HIDDEN: usize = ERROR_CENTERS.len() * RATE_CENTERS.len();

/// Gaussian RBF layer with one output per PID gain.
#[derive(Debug, Clone)]
pub struct RbfNetwork {
    centers: Vec<(f64, f64)>,
    width: f64,
    weights: [[f64; HIDDEN]; 3],
}

impl RbfNetwork {
    pub fn new(width: f64) -> Self {
        let centers = ERROR_CENTERS
            .iter()
            .flat_map(|e| RATE_CENTERS.iter().map(move |r| (*e, *r)))
            .collect();
        Self {
            centers,
            width: if width > 0.0 { width } else { 1.0 },
            weights: [[0.0; HIDDEN]; 3],
        }
    }

    pub fn activations(&self, error: f64, rate: f64) -> [f64; HIDDEN] {
        let error_width = self.width;
        let rate_width = self.width * RATE_WIDTH_RATIO;
        let mut phi = [0.0; HIDDEN];
        for (slot, (ce, cr)) in phi.iter_mut().zip(&self.centers) {
            let de = (error - ce) / error_width;
            let dr = (rate - cr) / rate_width;
            *slot = (-(de * de + dr * dr) / 2.0).exp();
        }
        phi
    }

    /// Gain adjustments `[dKp, dKi, dKd]` for the given activations.
    pub fn output(&self, phi: &[f64; HIDDEN]) -> [f64; 3] {
        let mut out = [0.0; 3];
        for (value, row) in out.iter_mut().zip(&self.weights) {
            *value = row.iter().zip(phi).map(|(w, p)| w * p).sum();
        }
        out
    }

    /// Decay all weights, then add `step[k] * phi` to the row of gain `k`.
    /// Weights stay within `±bound` so adversarial input cannot overflow them.
    pub fn adapt(&mut self, phi: &[f64; HIDDEN], step: [f64; 3], forgetting: f64, bound: f64) {
        for (row, delta) in self.weights.iter_mut().zip(step) {
            for (weight, p) in row.iter_mut().zip(phi) {
                let next = forgetting * *weight + delta * p;
                *weight = if next.is_finite() {
                    next.clamp(-bound, bound)
                } else {
                    0.0
                };
            }
        }
    }

    pub fn reset(&mut self) {
        self.weights = [[0.0; HIDDEN]; 3];
    }
}

#[derive(Debug, Clone)]
pub struct RbfAdaptivePid {
    setpoint: f64,
    tuning: RbfTuning,
    cascade: PidCascadeTuning,
    gate: SampleGate,
    pwm: Pwm,
    core: PidCore,
    network: RbfNetwork,
    gains: Gains,
    gain_history: VecDeque<Gains>,
}

const GAIN_HISTORY_LEN: usize = 64;

impl RbfAdaptivePid {
    pub fn new(
        setpoint: f64,
        tuning: RbfTuning,
        cascade: PidCascadeTuning,
        limits: SampleLimits,
    ) -> Self {
        let network = RbfNetwork::new(tuning.width);
        let pwm = Pwm::new(cascade.pwm_period);
        let gains = base_gains(&tuning);
        Self {
            setpoint,
            tuning,
            cascade,
            gate: SampleGate::new(limits),
            pwm,
            core: PidCore::default(),
            network,
            gains,
            gain_history: VecDeque::with_capacity(GAIN_HISTORY_LEN),
        }
    }

    pub fn gains(&self) -> Gains {
        self.gains
    }

    pub fn gain_history(&self) -> &VecDeque<Gains> {
        &self.gain_history
    }

    pub fn integral(&self) -> f64 {
        self.core.integral()
    }

    fn clamp_gains(&self, adjustments: [f64; 3]) -> Gains {
        let (lo, hi) = (self.tuning.min_gain, self.tuning.max_gain);
        let clamp = |base: f64, delta: f64| {
            let gain = base + delta;
            if gain.is_finite() {
                gain.clamp(lo, hi)
            } else {
                base.clamp(lo, hi)
            }
        };
        Gains {
            kp: clamp(self.tuning.kp, adjustments[0]),
            ki: clamp(self.tuning.ki, adjustments[1]),
            kd: clamp(self.tuning.kd, adjustments[2]),
        }
    }

    fn boost(&self, demand: f64, error: f64) -> f64 {
        if demand > self.tuning.deadband {
            let extra = self.tuning.boost_gain * error.abs().powf(self.tuning.boost_exponent);
            (demand + extra).clamp(0.0, 100.0)
        } else {
            demand
        }
    }
}

fn base_gains(tuning: &RbfTuning) -> Gains {
    Gains {
        kp: tuning.kp.clamp(tuning.min_gain, tuning.max_gain),
        ki: tuning.ki.clamp(tuning.min_gain, tuning.max_gain),
        kd: tuning.kd.clamp(tuning.min_gain, tuning.max_gain),
    }
}

impl Controller for RbfAdaptivePid {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RbfAdaptive
    }

    fn setpoint(&self) -> f64 {
        self.setpoint
    }

    fn configure(&mut self, setpoint: f64, tuning: &TuningConfig) -> Result<()> {
        let changed = self.setpoint != setpoint;
        self.setpoint = setpoint;
        self.tuning = tuning.rbf.clone();
        self.cascade = tuning.pid_cascade.clone();
        self.pwm.set_period(self.cascade.pwm_period);
        self.network.width = if self.tuning.width > 0.0 { self.tuning.width } else { 1.0 };
        if changed {
            self.reset();
        }
        Ok(())
    }

    fn update(&mut self, temperature: f64, now: Instant) -> Result<Option<ControlUpdate>> {
        let Some(sample) = self.gate.admit(temperature, now)? else {
            return Ok(None);
        };
        let step = self.core.step(
            self.setpoint,
            temperature,
            sample,
            self.gains,
            self.tuning.integral_limit,
        );
        let error = step.error;

        if let Some(previous) = step.previous_error {
            if error * previous < 0.0 {
                self.core.scale_integral(self.tuning.integral_sign_reset);
            }
            if sample.dt > 0.0 {
                let rate = (error - previous) / sample.dt;
                let phi = self.network.activations(error, rate);
                let stability = 1.0 - (-error.abs()).exp();
                let scale = self.tuning.learning_rate * stability * error;
                // Incremental PID sensitivities of the output to each gain.
                let sensitivity = [error - previous, error * sample.dt, rate];
                let delta = [
                    scale * sensitivity[0],
                    scale * sensitivity[1],
                    scale * sensitivity[2],
                ];
                self.network
                    .adapt(&phi, delta, self.tuning.forgetting_factor, self.tuning.max_gain);
                self.gains = self.clamp_gains(self.network.output(&phi));
                if self.gain_history.len() == GAIN_HISTORY_LEN {
                    self.gain_history.pop_front();
                }
                self.gain_history.push_back(self.gains);
            }
        }

        let demand = self.boost(cooling_demand(step.output), error);
        let intents = cascade_intents(&mut self.pwm, demand, &self.cascade, now);

        let mut diagnostics = Diagnostics::new(self.kind(), self.setpoint, temperature, error);
        diagnostics.demand = demand;
        diagnostics.terms = Some(step.terms);
        diagnostics.gains = Some(self.gains);
        Ok(Some(ControlUpdate {
            intents,
            diagnostics,
        }))
    }

    fn reset(&mut self) {
        self.gate.reset();
        self.pwm.reset();
        self.core.reset();
        self.network.reset();
        self.gains = base_gains(&self.tuning);
        self.gain_history.clear();
    }
}
