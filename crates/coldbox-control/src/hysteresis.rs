//! ---
//! cbx_section: "05-control-strategies"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Band based on/off strategy."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use std::time::Instant;

use coldbox_common::config::{HysteresisTuning, TuningConfig};
use coldbox_common::{ActuatorId, StrategyKind};

use crate::decision::{ActuatorIntent, ControlUpdate, Diagnostics};
use crate::error::Result;
use crate::sampling::{Pwm, SampleGate, SampleLimits};
use crate::strategy::Controller;

const BOTH_ON_ABOVE: f64 = 2.0;
const CONDITIONAL_ABOVE: f64 = 1.0;
const PRIMARY_ONLY_ABOVE: f64 = 0.5;
const MAINTAIN_BAND: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct HysteresisController {
    setpoint: f64,
    tuning: HysteresisTuning,
    gate: SampleGate,
    pwm: Pwm,
    previous_temperature: Option<f64>,
}

impl HysteresisController {
    pub fn new(setpoint: f64, tuning: HysteresisTuning, limits: SampleLimits) -> Self {
        let pwm = Pwm::new(tuning.pwm_period);
        Self {
            setpoint,
            tuning,
            gate: SampleGate::new(limits),
            pwm,
            previous_temperature: None,
        }
    }
}

impl Controller for HysteresisController {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Hysteresis
    }

    fn setpoint(&self) -> f64 {
        self.setpoint
    }

    fn configure(&mut self, setpoint: f64, tuning: &TuningConfig) -> Result<()> {
        let changed = self.setpoint != setpoint;
        self.setpoint = setpoint;
        self.tuning = tuning.hysteresis.clone();
        self.pwm.set_period(self.tuning.pwm_period);
        if changed {
            self.reset();
        }
        Ok(())
    }

    fn update(&mut self, temperature: f64, now: Instant) -> Result<Option<ControlUpdate>> {
        if self.gate.admit(temperature, now)?.is_none() {
            return Ok(None);
        }
        // Positive error means the container is warmer than wanted.
        let error = temperature - self.setpoint;
        let not_falling = self
            .previous_temperature
            .map_or(true, |previous| temperature >= previous);
        self.previous_temperature = Some(temperature);

        let (band, primary, secondary, duty) = if error > BOTH_ON_ABOVE {
            ("both-on", true, true, 100.0)
        } else if error > CONDITIONAL_ABOVE {
            ("primary-plus-conditional", true, not_falling, 100.0)
        } else if error > PRIMARY_ONLY_ABOVE {
            ("primary-only", true, false, 100.0)
        } else if error >= -MAINTAIN_BAND {
            let duty = self.tuning.maintain_duty;
            ("maintain", self.pwm.is_on(duty, now), false, duty)
        } else {
            ("both-off", false, false, 0.0)
        };

        let mut diagnostics = Diagnostics::new(self.kind(), self.setpoint, temperature, error);
        diagnostics.band = Some(band);
        diagnostics.demand = duty;

        Ok(Some(ControlUpdate {
            intents: vec![
                ActuatorIntent::pwm(ActuatorId::PRIMARY, primary, duty),
                ActuatorIntent::switch(ActuatorId::SECONDARY, secondary),
            ],
            diagnostics,
        }))
    }

    fn reset(&mut self) {
        self.gate.reset();
        self.pwm.reset();
        self.previous_temperature = None;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn controller() -> HysteresisController {
        HysteresisController::new(5.0, HysteresisTuning::default(), SampleLimits::default())
    }

    fn decide(controller: &mut HysteresisController, temperature: f64, at: Instant) -> (bool, bool, &'static str) {
        let update = controller.update(temperature, at).unwrap().unwrap();
        (
            update.intent(ActuatorId::PRIMARY).unwrap().desired_on,
            update.intent(ActuatorId::SECONDARY).unwrap().desired_on,
            update.diagnostics.band.unwrap(),
        )
    }

    #[test]
    fn bands_map_to_actuators() {
        let start = Instant::now();
        let tick = |n: u64| start + Duration::from_secs(n);
        let mut c = controller();
        assert_eq!(decide(&mut c, 8.0, tick(0)), (true, true, "both-on"));
        assert_eq!(decide(&mut c, 5.8, tick(1)), (true, false, "primary-only"));
        assert_eq!(decide(&mut c, 3.0, tick(2)), (false, false, "both-off"));
        assert_eq!(decide(&mut c, 5.2, tick(3)).2, "maintain");
    }

    #[test]
    fn conditional_band_follows_trend() {
        let start = Instant::now();
        let mut c = controller();
        assert_eq!(decide(&mut c, 6.5, start), (true, true, "primary-plus-conditional"));
        let falling = decide(&mut c, 6.4, start + Duration::from_secs(1));
        assert_eq!(falling, (true, false, "primary-plus-conditional"));
        let rising = decide(&mut c, 6.6, start + Duration::from_secs(2));
        assert_eq!(rising, (true, true, "primary-plus-conditional"));
    }

    #[test]
    fn maintain_band_pulses_primary() {
        let start = Instant::now();
        let mut c = controller();
        // 20 % of the 15 s period keeps the primary on for the first 3 s of each cycle.
        assert!(decide(&mut c, 5.0, start).0);
        assert!(decide(&mut c, 5.0, start + Duration::from_secs(2)).0);
        assert!(!decide(&mut c, 5.0, start + Duration::from_secs(4)).0);
        assert!(decide(&mut c, 5.0, start + Duration::from_secs(16)).0);
    }

    #[test]
    fn fast_calls_return_nothing() {
        let start = Instant::now();
        let mut c = controller();
        assert!(c.update(8.0, start).unwrap().is_some());
        assert!(c.update(8.0, start + Duration::from_millis(100)).unwrap().is_none());
    }
}
