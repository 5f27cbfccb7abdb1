//! ---
//! cbx_section: "05-control-strategies"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Sample admission, PWM and the two-stage cascade split."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use coldbox_common::config::ControlConfig;
use coldbox_common::time::phase_in_period;

use crate::error::{ControlError, Result};

/// Bounds every strategy applies to incoming samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleLimits {
    pub min_interval: Duration,
    pub valid_min: f64,
    pub valid_max: f64,
}

impl SampleLimits {
    pub fn from_config(config: &ControlConfig) -> Self {
        Self {
            min_interval: config.min_sample_interval,
            valid_min: config.valid_min,
            valid_max: config.valid_max,
        }
    }

    pub fn check(&self, temperature: f64) -> Result<f64> {
        if !temperature.is_finite() {
            return Err(ControlError::NonFinite(temperature));
        }
        if temperature < self.valid_min || temperature > self.valid_max {
            return Err(ControlError::OutOfRange {
                value: temperature,
                min: self.valid_min,
                max: self.valid_max,
            });
        }
        Ok(temperature)
    }
}

impl Default for SampleLimits {
    fn default() -> Self {
        Self::from_config(&ControlConfig::default())
    }
}

/// Elapsed time since the previously accepted sample, zero for the first one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admitted {
    pub dt: f64,
    pub first: bool,
}

/// Drops samples arriving faster than the minimum interval so integral and derivative
/// terms are never counted twice.
#[derive(Debug, Clone)]
pub struct SampleGate {
    limits: SampleLimits,
    last_accepted: Option<Instant>,
}

impl SampleGate {
    pub fn new(limits: SampleLimits) -> Self {
        Self {
            limits,
            last_accepted: None,
        }
    }

    pub fn limits(&self) -> SampleLimits {
        self.limits
    }

    /// Validate `temperature` and decide whether it counts as a new sample.
    pub fn admit(&mut self, temperature: f64, now: Instant) -> Result<Option<Admitted>> {
        self.limits.check(temperature)?;
        let admitted = match self.last_accepted {
            None => Admitted {
                dt: 0.0,
                first: true,
            },
            Some(previous) => {
                let elapsed = now.saturating_duration_since(previous);
                if elapsed < self.limits.min_interval {
                    return Ok(None);
                }
                Admitted {
                    dt: elapsed.as_secs_f64(),
                    first: false,
                }
            }
        };
        self.last_accepted = Some(now);
        Ok(Some(admitted))
    }

    pub fn reset(&mut self) {
        self.last_accepted = None;
    }
}

/// Fixed-period PWM comparing time-in-cycle against the duty fraction.
#[derive(Debug, Clone)]
pub struct Pwm {
    period: Duration,
    cycle_start: Option<Instant>,
}

impl Pwm {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            cycle_start: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    pub fn is_on(&mut self, duty_percent: f64, now: Instant) -> bool {
        let start = *self.cycle_start.get_or_insert(now);
        let phase = phase_in_period(now.saturating_duration_since(start), self.period);
        let duty = if duty_percent.is_finite() {
            duty_percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let on_window = self.period.mul_f64(duty / 100.0);
        phase < on_window
    }

    pub fn reset(&mut self) {
        self.cycle_start = None;
    }
}

/// Split a 0..=100 demand across the two coolers.
///
/// Up to `threshold` only the first cooler runs, at twice the demand. Above it the first
/// cooler saturates and the second absorbs the remainder scaled by `balance_ratio`.
pub fn cascade_split(demand: f64, threshold: f64, balance_ratio: f64) -> (f64, f64) {
    let demand = demand.clamp(0.0, 100.0);
    if demand <= threshold || threshold >= 100.0 {
        ((demand * 2.0).min(100.0), 0.0)
    } else {
        let excess = (demand - threshold) / (100.0 - threshold) * 100.0 * balance_ratio;
        (100.0, excess.clamp(0.0, 100.0))
    }
}
