//! ---
//! cbx_section: "06-simulation"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "First-order container model and the synthetic temperature feed."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::{Context, Result};
use coldbox_common::{SyntheticConfig, TemperatureReading};
use rand::prelude::*;
use rand_distr::Normal;

/// The container relaxes exponentially towards ambient minus the pull of every
/// running cooler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThermalModel {
    pub ambient: f64,
    pub cooling_per_actuator: f64,
    pub time_constant_secs: f64,
}

impl ThermalModel {
    pub fn from_config(config: &SyntheticConfig) -> Self {
        Self {
            ambient: config.ambient,
            cooling_per_actuator: config.cooling_per_actuator,
            time_constant_secs: config.time_constant_secs,
        }
    }

    pub fn equilibrium(&self, active: usize) -> f64 {
        self.ambient - self.cooling_per_actuator * active as f64
    }

    pub fn step(&self, temperature: f64, active: usize, dt: Duration) -> f64 {
        let target = self.equilibrium(active);
        if self.time_constant_secs <= 0.0 {
            return target;
        }
        let decay = (-dt.as_secs_f64() / self.time_constant_secs).exp();
        target + (temperature - target) * decay
    }
}

/// Stand-in temperature source used while the PLC cannot be read.
#[derive(Debug)]
pub struct SyntheticFeed {
    model: ThermalModel,
    rng: StdRng,
    noise: Normal<f64>,
    temperature: f64,
}

impl SyntheticFeed {
    pub fn new(config: &SyntheticConfig) -> Result<Self> {
        let noise = Normal::new(0.0, config.noise_sigma.max(0.0))
            .with_context(|| format!("invalid synthetic noise sigma {}", config.noise_sigma))?;
        Ok(Self {
            model: ThermalModel::from_config(config),
            rng: StdRng::seed_from_u64(config.seed),
            noise,
            temperature: config.ambient,
        })
    }

    pub fn model(&self) -> &ThermalModel {
        &self.model
    }

    /// Noise-free state of the simulated container.
    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    /// Continue from the last real reading so the switchover has no jump.
    pub fn seed_from(&mut self, celsius: f64) {
        if celsius.is_finite() {
            self.temperature = celsius;
        }
    }

    /// Advance the model by `dt` with `active` coolers running.
    pub fn next_reading(&mut self, active: usize, dt: Duration) -> TemperatureReading {
        self.temperature = self.model.step(self.temperature, active, dt);
        let noisy = self.temperature + self.noise.sample(&mut self.rng);
        TemperatureReading::synthetic(noisy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> SyntheticConfig {
        SyntheticConfig {
            noise_sigma: 0.0,
            ..SyntheticConfig::default()
        }
    }

    #[test]
    fn model_relaxes_towards_equilibrium() {
        let model = ThermalModel::from_config(&SyntheticConfig::default());
        assert_eq!(model.equilibrium(2), 22.0 - 24.0);
        let warmed = model.step(5.0, 0, Duration::from_secs(300));
        let expected = 22.0 + (5.0 - 22.0) * (-1.0f64).exp();
        assert!((warmed - expected).abs() < 1e-9);
        let cooled = model.step(8.0, 2, Duration::from_secs(30));
        assert!(cooled < 8.0 && cooled > -2.0);
    }

    #[test]
    fn feed_continues_from_seed_and_is_marked_synthetic() {
        let mut feed = SyntheticFeed::new(&quiet()).unwrap();
        feed.seed_from(8.0);
        let reading = feed.next_reading(2, Duration::from_secs(1));
        assert!(reading.is_synthetic());
        assert!(reading.value() <= 8.0 && reading.value() > 7.5);
    }

    #[test]
    fn idle_feed_drifts_up() {
        let mut feed = SyntheticFeed::new(&quiet()).unwrap();
        feed.seed_from(5.0);
        let first = feed.next_reading(0, Duration::from_secs(10)).value();
        let second = feed.next_reading(0, Duration::from_secs(10)).value();
        assert!(first >= 5.0 && second >= first);
    }

    #[test]
    fn same_seed_same_noise() {
        let config = SyntheticConfig::default();
        let run = || {
            let mut feed = SyntheticFeed::new(&config).unwrap();
            (0..5)
                .map(|_| feed.next_reading(1, Duration::from_secs(1)).value())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
