//! ---
//! cbx_section: "05-control-strategies"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Minimum on/off dwell enforcement for every actuator."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
//! Every intent, automatic or manual, passes through [`ActuationGovernor::propose`]
//! before it reaches the PLC. The governor only records a transition it allowed;
//! when the write behind it fails the loop calls [`ActuationGovernor::rollback`].
use std::time::{Duration, Instant};

use coldbox_common::config::ActuatorConfig;
use coldbox_common::ActuatorId;
use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

use crate::error::{ControlError, Result};

/// Dwell bookkeeping for one actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuatorDwellState {
    pub actuator: ActuatorId,
    pub is_on: bool,
    /// `None` until the first transition, which is then allowed immediately.
    pub last_transition_at: Option<Instant>,
    pub min_on_time: Duration,
    pub min_off_time: Duration,
}

impl ActuatorDwellState {
    fn new(config: &ActuatorConfig) -> Self {
        Self {
            actuator: config.id,
            is_on: false,
            last_transition_at: None,
            min_on_time: config.min_on_time,
            min_off_time: config.min_off_time,
        }
    }

    /// Dwell required before leaving the current state.
    pub fn required_dwell(&self) -> Duration {
        if self.is_on {
            self.min_on_time
        } else {
            self.min_off_time
        }
    }

    /// Time left before a transition is allowed, zero when it already is.
    pub fn remaining(&self, now: Instant) -> Duration {
        match self.last_transition_at {
            Some(at) => self
                .required_dwell()
                .saturating_sub(now.saturating_duration_since(at)),
            None => Duration::ZERO,
        }
    }
}

/// Outcome of one proposal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GovernorDecision {
    pub actuator: ActuatorId,
    pub desired_on: bool,
    pub allowed_on: bool,
    /// A transition was recorded and must be written to the device.
    pub transitioned: bool,
    /// Time the desired transition still has to wait, if it was held.
    pub held_for: Option<Duration>,
    #[serde(skip)]
    previous: Option<(bool, Option<Instant>)>,
}

impl GovernorDecision {
    pub fn held(&self) -> bool {
        self.held_for.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActuationGovernor {
    states: IndexMap<ActuatorId, ActuatorDwellState>,
}

impl ActuationGovernor {
    pub fn new(actuators: &[ActuatorConfig]) -> Self {
        let states = actuators
            .iter()
            .map(|config| (config.id, ActuatorDwellState::new(config)))
            .collect();
        Self { states }
    }

    pub fn state(&self, actuator: ActuatorId) -> Option<&ActuatorDwellState> {
        self.states.get(&actuator)
    }

    pub fn states(&self) -> impl Iterator<Item = &ActuatorDwellState> {
        self.states.values()
    }

    fn state_mut(&mut self, actuator: ActuatorId) -> Result<&mut ActuatorDwellState> {
        self.states
            .get_mut(&actuator)
            .ok_or(ControlError::UnknownActuator(actuator))
    }

    pub fn propose(&mut self, actuator: ActuatorId, desired_on: bool, now: Instant) -> Result<GovernorDecision> {
        let state = self.state_mut(actuator)?;
        if state.is_on == desired_on {
            return Ok(GovernorDecision {
                actuator,
                desired_on,
                allowed_on: desired_on,
                transitioned: false,
                held_for: None,
                previous: None,
            });
        }

        let remaining = state.remaining(now);
        if !remaining.is_zero() {
            debug!(
                %actuator,
                desired_on,
                remaining_ms = remaining.as_millis() as u64,
                "transition held by dwell time"
            );
            return Ok(GovernorDecision {
                actuator,
                desired_on,
                allowed_on: state.is_on,
                transitioned: false,
                held_for: Some(remaining),
                previous: None,
            });
        }

        let previous = (state.is_on, state.last_transition_at);
        state.is_on = desired_on;
        state.last_transition_at = Some(now);
        Ok(GovernorDecision {
            actuator,
            desired_on,
            allowed_on: desired_on,
            transitioned: true,
            held_for: None,
            previous: Some(previous),
        })
    }

    /// Undo a recorded transition whose write never reached the device.
    pub fn rollback(&mut self, decision: &GovernorDecision) {
        let Some((was_on, last_transition_at)) = decision.previous else {
            return;
        };
        if let Some(state) = self.states.get_mut(&decision.actuator) {
            if state.is_on == decision.allowed_on {
                state.is_on = was_on;
                state.last_transition_at = last_transition_at;
            }
        }
    }

    /// Align with a state read back from the device. A state that differs from the
    /// recorded one counts as a fresh transition at `now`.
    pub fn seed(&mut self, actuator: ActuatorId, is_on: bool, now: Instant) -> Result<()> {
        let state = self.state_mut(actuator)?;
        if state.is_on != is_on {
            state.is_on = is_on;
            state.last_transition_at = Some(now);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn governor(dwell: Duration) -> ActuationGovernor {
        let actuators: Vec<ActuatorConfig> = ActuatorConfig::default_pair()
            .into_iter()
            .map(|mut config| {
                config.min_on_time = dwell;
                config.min_off_time = dwell;
                config
            })
            .collect();
        ActuationGovernor::new(&actuators)
    }

    #[test]
    fn first_transition_is_immediate() {
        let mut g = governor(Duration::from_secs(10));
        let decision = g.propose(ActuatorId::PRIMARY, true, Instant::now()).unwrap();
        assert!(decision.transitioned && decision.allowed_on);
    }

    #[test]
    fn holds_until_dwell_elapsed() {
        let start = Instant::now();
        let mut g = governor(Duration::from_secs(10));
        g.propose(ActuatorId::PRIMARY, true, start).unwrap();

        let held = g.propose(ActuatorId::PRIMARY, false, start + Duration::from_secs(4)).unwrap();
        assert!(held.allowed_on);
        assert_eq!(held.held_for, Some(Duration::from_secs(6)));

        let allowed = g.propose(ActuatorId::PRIMARY, false, start + Duration::from_secs(10)).unwrap();
        assert!(!allowed.allowed_on && allowed.transitioned);
    }

    #[test]
    fn unchanged_desire_passes_through() {
        let start = Instant::now();
        let mut g = governor(Duration::from_secs(10));
        g.propose(ActuatorId::SECONDARY, true, start).unwrap();
        let decision = g.propose(ActuatorId::SECONDARY, true, start + Duration::from_secs(1)).unwrap();
        assert!(decision.allowed_on && !decision.transitioned && !decision.held());
        assert_eq!(g.state(ActuatorId::SECONDARY).unwrap().last_transition_at, Some(start));
    }

    #[test]
    fn rollback_restores_previous_state() {
        let start = Instant::now();
        let mut g = governor(Duration::from_secs(10));
        let decision = g.propose(ActuatorId::PRIMARY, true, start).unwrap();
        g.rollback(&decision);
        let state = g.state(ActuatorId::PRIMARY).unwrap();
        assert!(!state.is_on);
        assert_eq!(state.last_transition_at, None);
        // The failed write must not start a dwell window.
        assert!(g.propose(ActuatorId::PRIMARY, true, start + Duration::from_secs(1)).unwrap().transitioned);
    }

    #[test]
    fn seeding_a_different_state_starts_a_dwell() {
        let start = Instant::now();
        let mut g = governor(Duration::from_secs(10));
        g.seed(ActuatorId::PRIMARY, true, start).unwrap();
        let decision = g.propose(ActuatorId::PRIMARY, false, start + Duration::from_secs(2)).unwrap();
        assert!(decision.held());
        g.seed(ActuatorId::SECONDARY, false, start).unwrap();
        assert_eq!(g.state(ActuatorId::SECONDARY).unwrap().last_transition_at, None);
    }

    #[test]
    fn unknown_actuator_is_an_error() {
        let mut g = governor(Duration::from_secs(1));
        let err = g.propose(ActuatorId(9), true, Instant::now()).unwrap_err();
        assert_eq!(err, ControlError::UnknownActuator(ActuatorId(9)));
    }

    proptest! {
        #[test]
        fn transitions_respect_dwell(
            steps in prop::collection::vec((any::<bool>(), any::<bool>(), 0u64..4_000), 1..300),
            on_ms in 0u64..15_000,
            off_ms in 0u64..15_000,
        ) {
            let actuators: Vec<ActuatorConfig> = ActuatorConfig::default_pair()
                .into_iter()
                .map(|mut config| {
                    config.min_on_time = Duration::from_millis(on_ms);
                    config.min_off_time = Duration::from_millis(off_ms);
                    config
                })
                .collect();
            let mut g = ActuationGovernor::new(&actuators);
            let start = Instant::now();
            let mut now = start;
            let mut last: [Option<(Instant, bool)>; 2] = [None, None];
            for (primary, secondary, advance) in steps {
                now += Duration::from_millis(advance);
                for (slot, (id, desired)) in [(ActuatorId::PRIMARY, primary), (ActuatorId::SECONDARY, secondary)]
                    .into_iter()
                    .enumerate()
                {
                    let decision = g.propose(id, desired, now).unwrap();
                    if decision.transitioned {
                        if let Some((at, was_on)) = last[slot] {
                            let dwell = if was_on { on_ms } else { off_ms };
                            prop_assert!(now.duration_since(at) >= Duration::from_millis(dwell));
                        }
                        last[slot] = Some((now, decision.allowed_on));
                    }
                    prop_assert_eq!(g.state(id).unwrap().is_on, decision.allowed_on);
                }
            }
        }
    }
}
