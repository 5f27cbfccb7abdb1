//! ---
//! cbx_section: "05-control-strategies"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Receding-horizon control over a small online-trained delta model."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
//! A one-hidden-layer network predicts the next temperature change from the current and
//! previous error and the two most recent actuator pairs. The network learns the residual
//! on top of a fixed physical bias (running coolers pull the temperature down, idling lets
//! it drift up). Every tick a set of random action sequences is rolled forward through the
//! model and the first action of the cheapest one is applied.
use std::collections::VecDeque;
use std::time::Instant;

use coldbox_common::config::{MpcTuning, TuningConfig};
use coldbox_common::{ActuatorId, StrategyKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::decision::{ActuatorIntent, ControlUpdate, Diagnostics};
use crate::error::Result;
use crate::sampling::{SampleGate, SampleLimits};
use crate::strategy::Controller;

/// On/off state of the primary and secondary cooler.
pub type Action = [bool; 2];

const INPUTS: usize = 6;
const GRADIENT_CLIP: f64 = 10.0;
const LR_DECAY: f64 = 0.95;
const LR_GROWTH: f64 = 1.05;

fn active(action: Action) -> usize {
    action.iter().filter(|on| **on).count()
}

fn as_unit(on: bool) -> f64 {
    if on {
        1.0
    } else {
        0.0
    }
}

/// One model query: errors are `setpoint - temperature`, `action` is the pair applied
/// over the predicted step and `previous_action` the pair before it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelInput {
    pub error: f64,
    pub previous_error: f64,
    pub action: Action,
    pub previous_action: Action,
}

/// Anything that predicts the residual temperature change for one step.
pub trait DeltaModel {
    fn predict(&self, input: &ModelInput) -> f64;
}

/// Fixed prior added to every model prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicalBias {
    /// Change per running cooler, negative.
    pub cooling: f64,
    /// Drift when both coolers are off.
    pub idle: f64,
}

impl PhysicalBias {
    pub fn apply(&self, action: Action) -> f64 {
        match active(action) {
            0 => self.idle,
            running => self.cooling * running as f64,
        }
    }
}

/// Where a rollout starts from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RolloutState {
    pub temperature: f64,
    pub error: f64,
    pub previous_error: f64,
    pub previous_action: Action,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannerSettings {
    pub setpoint: f64,
    pub horizon: usize,
    pub candidates: usize,
    pub effort_penalty: f64,
    pub bias: PhysicalBias,
}

/// Every sampled sequence with its cost, and the index of the cheapest.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub sequences: Vec<Vec<Action>>,
    pub costs: Vec<f64>,
    pub best: usize,
}

impl Plan {
    pub fn best_sequence(&self) -> &[Action] {
        &self.sequences[self.best]
    }

    pub fn best_cost(&self) -> f64 {
        self.costs[self.best]
    }

    pub fn first_action(&self) -> Action {
        self.best_sequence().first().copied().unwrap_or([false, false])
    }
}

/// Squared tracking error plus effort, summed over the sequence.
pub fn rollout_cost<M: DeltaModel + ?Sized>(
    model: &M,
    state: &RolloutState,
    sequence: &[Action],
    settings: &PlannerSettings,
) -> f64 {
    let mut temperature = state.temperature;
    let mut error = state.error;
    let mut previous_error = state.previous_error;
    let mut previous_action = state.previous_action;
    let mut cost = 0.0;
    for action in sequence {
        let input = ModelInput {
            error,
            previous_error,
            action: *action,
            previous_action,
        };
        temperature += model.predict(&input) + settings.bias.apply(*action);
        previous_error = error;
        error = settings.setpoint - temperature;
        previous_action = *action;
        cost += error * error + settings.effort_penalty * active(*action) as f64;
    }
    cost
}

/// Sample `candidates` random sequences of `horizon` actions and score each one.
pub fn optimize_control<M, R>(
    model: &M,
    state: &RolloutState,
    settings: &PlannerSettings,
    rng: &mut R,
) -> Plan
where
    M: DeltaModel + ?Sized,
    R: Rng + ?Sized,
{
    let candidates = settings.candidates.max(1);
    let horizon = settings.horizon.max(1);
    let mut sequences = Vec::with_capacity(candidates);
    let mut costs = Vec::with_capacity(candidates);
    let mut best = 0;
    for index in 0..candidates {
        let sequence: Vec<Action> = (0..horizon).map(|_| [rng.gen(), rng.gen()]).collect();
        let cost = rollout_cost(model, state, &sequence, settings);
        if cost < costs.get(best).copied().unwrap_or(f64::INFINITY) {
            best = index;
        }
        sequences.push(sequence);
        costs.push(cost);
    }
    Plan {
        sequences,
        costs,
        best,
    }
}

/// One hidden ReLU layer, linear output, trained with momentum SGD.
#[derive(Debug, Clone)]
pub struct DeltaNetwork {
    error_scale: f64,
    w1: Vec<[f64; INPUTS]>,
    b1: Vec<f64>,
    w2: Vec<f64>,
    b2: f64,
    v_w1: Vec<[f64; INPUTS]>,
    v_b1: Vec<f64>,
    v_w2: Vec<f64>,
    v_b2: f64,
}

impl DeltaNetwork {
    pub fn new<R: Rng + ?Sized>(hidden: usize, error_scale: f64, rng: &mut R) -> Self {
        let hidden = hidden.max(1);
        let input_std = (2.0 / INPUTS as f64).sqrt();
        let output_std = (1.0 / hidden as f64).sqrt() * 0.1;
        let mut sample = |std: f64| rng.sample::<f64, _>(StandardNormal) * std;
        let w1: Vec<[f64; INPUTS]> = (0..hidden)
            .map(|_| std::array::from_fn(|_| sample(input_std)))
            .collect();
        let w2: Vec<f64> = (0..hidden).map(|_| sample(output_std)).collect();
        Self {
            error_scale: if error_scale > 0.0 { error_scale } else { 1.0 },
            w1,
            b1: vec![0.0; hidden],
            w2,
            b2: 0.0,
            v_w1: vec![[0.0; INPUTS]; hidden],
            v_b1: vec![0.0; hidden],
            v_w2: vec![0.0; hidden],
            v_b2: 0.0,
        }
    }

    pub fn hidden_units(&self) -> usize {
        self.w2.len()
    }

    fn features(&self, input: &ModelInput) -> [f64; INPUTS] {
        [
            input.error / self.error_scale,
            input.previous_error / self.error_scale,
            as_unit(input.action[0]),
            as_unit(input.action[1]),
            as_unit(input.previous_action[0]),
            as_unit(input.previous_action[1]),
        ]
    }

    fn forward(&self, x: &[f64; INPUTS]) -> (Vec<f64>, f64) {
        let hidden: Vec<f64> = self
            .w1
            .iter()
            .zip(&self.b1)
            .map(|(row, bias)| {
                let z: f64 = row.iter().zip(x).map(|(w, v)| w * v).sum::<f64>() + bias;
                z.max(0.0)
            })
            .collect();
        let out = hidden.iter().zip(&self.w2).map(|(h, w)| h * w).sum::<f64>() + self.b2;
        (hidden, out)
    }

    /// One backpropagation step towards `target`. Returns the prediction made before
    /// the update.
    pub fn train(&mut self, input: &ModelInput, target: f64, learning_rate: f64, momentum: f64) -> f64 {
        let x = self.features(input);
        let (hidden, prediction) = self.forward(&x);
        let delta = (prediction - target).clamp(-GRADIENT_CLIP, GRADIENT_CLIP);
        if !delta.is_finite() {
            return prediction;
        }

        for j in 0..hidden.len() {
            // ReLU passes the gradient only where the unit fired.
            let upstream = if hidden[j] > 0.0 { delta * self.w2[j] } else { 0.0 };

            self.v_w2[j] = momentum * self.v_w2[j] - learning_rate * delta * hidden[j];
            self.w2[j] += self.v_w2[j];

            self.v_b1[j] = momentum * self.v_b1[j] - learning_rate * upstream;
            self.b1[j] += self.v_b1[j];
            for (k, xk) in x.iter().enumerate() {
                self.v_w1[j][k] = momentum * self.v_w1[j][k] - learning_rate * upstream * xk;
                self.w1[j][k] += self.v_w1[j][k];
            }
        }
        self.v_b2 = momentum * self.v_b2 - learning_rate * delta;
        self.b2 += self.v_b2;
        prediction
    }
}

impl DeltaModel for DeltaNetwork {
    fn predict(&self, input: &ModelInput) -> f64 {
        self.forward(&self.features(input)).1
    }
}

/// Shrink the rate after an accurate prediction and grow it after a miss.
pub fn adapt_learning_rate(rate: f64, accurate: bool, tuning: &MpcTuning) -> f64 {
    let next = if accurate {
        rate * LR_DECAY
    } else {
        rate * LR_GROWTH
    };
    next.clamp(tuning.min_learning_rate, tuning.max_learning_rate)
}

/// Fraction of recent predictions that landed inside the accuracy band.
#[derive(Debug, Clone)]
pub struct ConfidenceWindow {
    capacity: usize,
    hits: VecDeque<bool>,
}

impl ConfidenceWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            hits: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn record(&mut self, hit: bool) {
        if self.hits.len() == self.capacity {
            self.hits.pop_front();
        }
        self.hits.push_back(hit);
    }

    pub fn value(&self) -> f64 {
        if self.hits.is_empty() {
            return 0.0;
        }
        self.hits.iter().filter(|hit| **hit).count() as f64 / self.hits.len() as f64
    }

    pub fn clear(&mut self) {
        self.hits.clear();
    }
}

/// Prediction made last tick, checked against the next sample.
#[derive(Debug, Clone, Copy)]
struct PendingPrediction {
    input: ModelInput,
    temperature: f64,
    predicted_total: f64,
    bias: f64,
}

#[derive(Debug, Clone)]
pub struct NeuralMpc {
    setpoint: f64,
    tuning: MpcTuning,
    gate: SampleGate,
    network: DeltaNetwork,
    rng: StdRng,
    learning_rate: f64,
    confidence: ConfidenceWindow,
    pending: Option<PendingPrediction>,
    previous_error: Option<f64>,
    last_action: Action,
}

impl NeuralMpc {
    pub fn new(setpoint: f64, tuning: MpcTuning, limits: SampleLimits) -> Self {
        let mut rng = StdRng::seed_from_u64(tuning.seed);
        let network = DeltaNetwork::new(tuning.hidden_units, tuning.error_scale, &mut rng);
        Self {
            setpoint,
            learning_rate: tuning.learning_rate,
            confidence: ConfidenceWindow::new(tuning.confidence_window),
            gate: SampleGate::new(limits),
            network,
            rng,
            tuning,
            pending: None,
            previous_error: None,
            last_action: [false, false],
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn confidence(&self) -> f64 {
        self.confidence.value()
    }

    fn bias(&self) -> PhysicalBias {
        PhysicalBias {
            cooling: self.tuning.cooling_bias,
            idle: self.tuning.idle_bias,
        }
    }

    fn settings(&self) -> PlannerSettings {
        PlannerSettings {
            setpoint: self.setpoint,
            horizon: self.tuning.horizon,
            candidates: self.tuning.candidates,
            effort_penalty: self.tuning.effort_penalty,
            bias: self.bias(),
        }
    }

    /// Train on the outcome of last tick's prediction.
    fn learn(&mut self, temperature: f64) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let observed = temperature - pending.temperature;
        let accurate = (pending.predicted_total - observed).abs() <= self.tuning.accuracy_band;
        self.confidence.record(accurate);
        self.network.train(
            &pending.input,
            observed - pending.bias,
            self.learning_rate,
            self.tuning.momentum,
        );
        self.learning_rate = adapt_learning_rate(self.learning_rate, accurate, &self.tuning);
    }
}

impl Controller for NeuralMpc {
    fn kind(&self) -> StrategyKind {
        StrategyKind::NeuralMpc
    }

    fn setpoint(&self) -> f64 {
        self.setpoint
    }

    fn configure(&mut self, setpoint: f64, tuning: &TuningConfig) -> Result<()> {
        let changed = self.setpoint != setpoint;
        let reshaped = self.tuning.hidden_units != tuning.mpc.hidden_units
            || self.tuning.seed != tuning.mpc.seed
            || self.tuning.error_scale != tuning.mpc.error_scale;
        self.setpoint = setpoint;
        self.tuning = tuning.mpc.clone();
        if changed || reshaped {
            self.reset();
        }
        Ok(())
    }

    fn update(&mut self, temperature: f64, now: Instant) -> Result<Option<ControlUpdate>> {
        if self.gate.admit(temperature, now)?.is_none() {
            return Ok(None);
        }
        self.learn(temperature);

        let error = self.setpoint - temperature;
        let previous_error = self.previous_error.unwrap_or(error);
        let state = RolloutState {
            temperature,
            error,
            previous_error,
            previous_action: self.last_action,
        };
        let settings = self.settings();
        let plan = optimize_control(&self.network, &state, &settings, &mut self.rng);
        let action = plan.first_action();

        let input = ModelInput {
            error,
            previous_error,
            action,
            previous_action: self.last_action,
        };
        let bias = settings.bias.apply(action);
        let predicted_total = self.network.predict(&input) + bias;
        self.pending = Some(PendingPrediction {
            input,
            temperature,
            predicted_total,
            bias,
        });
        self.previous_error = Some(error);
        self.last_action = action;

        let mut diagnostics = Diagnostics::new(self.kind(), self.setpoint, temperature, error);
        diagnostics.demand = 50.0 * active(action) as f64;
        diagnostics.predicted_delta = Some(predicted_total);
        diagnostics.confidence = Some(self.confidence.value());
        diagnostics.learning_rate = Some(self.learning_rate);
        diagnostics.best_cost = Some(plan.best_cost());

        let duty = |on: bool| if on { 100.0 } else { 0.0 };
        Ok(Some(ControlUpdate {
            intents: vec![
                ActuatorIntent::pwm(ActuatorId::PRIMARY, action[0], duty(action[0])),
                ActuatorIntent::pwm(ActuatorId::SECONDARY, action[1], duty(action[1])),
            ],
            diagnostics,
        }))
    }

    fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.tuning.seed);
        self.network = DeltaNetwork::new(self.tuning.hidden_units, self.tuning.error_scale, &mut self.rng);
        self.learning_rate = self.tuning.learning_rate;
        self.confidence = ConfidenceWindow::new(self.tuning.confidence_window);
        self.gate.reset();
        self.pending = None;
        self.previous_error = None;
        self.last_action = [false, false];
    }

    fn observe_applied(&mut self, applied: Action) {
        self.last_action = applied;
        let bias = self.bias();
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if pending.input.action == applied {
            return;
        }
        pending.input.action = applied;
        pending.bias = bias.apply(applied);
        pending.predicted_total = self.network.predict(&pending.input) + pending.bias;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    /// Each running cooler removes a fixed amount on top of the bias.
    struct LinearStub;

    impl DeltaModel for LinearStub {
        fn predict(&self, input: &ModelInput) -> f64 {
            -0.2 * active(input.action) as f64 + 0.05 * as_unit(input.previous_action[0])
        }
    }

    fn settings() -> PlannerSettings {
        PlannerSettings {
            setpoint: 5.0,
            horizon: 5,
            candidates: 20,
            effort_penalty: 0.05,
            bias: PhysicalBias {
                cooling: -0.05,
                idle: 0.02,
            },
        }
    }

    fn warm_state() -> RolloutState {
        RolloutState {
            temperature: 8.0,
            error: -3.0,
            previous_error: -3.0,
            previous_action: [false, false],
        }
    }

    #[test]
    fn plan_picks_lowest_cost_candidate() {
        for seed in [1u64, 7, 0xC01DB0, 12_345] {
            let mut rng = StdRng::seed_from_u64(seed);
            let plan = optimize_control(&LinearStub, &warm_state(), &settings(), &mut rng);
            assert_eq!(plan.sequences.len(), 20);
            let minimum = plan.costs.iter().copied().fold(f64::INFINITY, f64::min);
            assert_eq!(plan.best_cost(), minimum);
            for (sequence, cost) in plan.sequences.iter().zip(&plan.costs) {
                assert_eq!(rollout_cost(&LinearStub, &warm_state(), sequence, &settings()), *cost);
            }
        }
    }

    #[test]
    fn same_seed_same_plan() {
        let plan = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            optimize_control(&LinearStub, &warm_state(), &settings(), &mut rng)
        };
        assert_eq!(plan(42), plan(42));
    }

    #[test]
    fn rollout_accumulates_tracking_and_effort() {
        let sequence = [[true, true]];
        let cost = rollout_cost(&LinearStub, &warm_state(), &sequence, &settings());
        // 8.0 - 0.4 - 0.1 = 7.5, error -2.5, effort 2 * 0.05.
        assert!((cost - (6.25 + 0.1)).abs() < 1e-9);
    }

    #[test]
    fn bias_cools_per_actuator_and_drifts_when_idle() {
        let bias = settings().bias;
        assert_eq!(bias.apply([false, false]), 0.02);
        assert_eq!(bias.apply([true, false]), -0.05);
        assert_eq!(bias.apply([true, true]), -0.1);
    }

    #[test]
    fn network_learns_a_constant_delta() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut network = DeltaNetwork::new(8, 10.0, &mut rng);
        let input = ModelInput {
            error: -2.0,
            previous_error: -2.2,
            action: [true, false],
            previous_action: [true, true],
        };
        for _ in 0..500 {
            network.train(&input, 0.3, 0.01, 0.9);
        }
        assert!((network.predict(&input) - 0.3).abs() < 0.05);
    }

    #[test]
    fn learning_rate_follows_accuracy_within_bounds() {
        let tuning = MpcTuning::default();
        let mut rate = tuning.learning_rate;
        for _ in 0..200 {
            rate = adapt_learning_rate(rate, true, &tuning);
        }
        assert_eq!(rate, tuning.min_learning_rate);
        for _ in 0..200 {
            rate = adapt_learning_rate(rate, false, &tuning);
        }
        assert_eq!(rate, tuning.max_learning_rate);
    }

    #[test]
    fn confidence_is_windowed() {
        let mut window = ConfidenceWindow::new(4);
        assert_eq!(window.value(), 0.0);
        for hit in [false, false, true, true, true, true] {
            window.record(hit);
        }
        assert_eq!(window.value(), 1.0);
        window.record(false);
        assert_eq!(window.value(), 0.75);
    }

    #[test]
    fn controller_emits_binary_intents_and_tracks_confidence() {
        let mut mpc = NeuralMpc::new(5.0, MpcTuning::default(), SampleLimits::default());
        let start = Instant::now();
        let mut temperature = 8.0;
        for tick in 0..30u64 {
            let update = mpc
                .update(temperature, start + Duration::from_secs(tick))
                .unwrap()
                .unwrap();
            let running = update.intents.iter().filter(|i| i.desired_on).count();
            for intent in &update.intents {
                assert_eq!(intent.duty_percent, Some(if intent.desired_on { 100.0 } else { 0.0 }));
            }
            temperature += -0.1 * running as f64 + 0.02;
            let confidence = update.diagnostics.confidence.unwrap();
            assert!((0.0..=1.0).contains(&confidence));
        }
        let rate = mpc.learning_rate();
        assert!(rate >= 0.0005 && rate <= 0.05);
    }

    #[test]
    fn held_transition_is_learned_as_the_applied_state() {
        let mut mpc = NeuralMpc::new(5.0, MpcTuning::default(), SampleLimits::default());
        let start = Instant::now();
        mpc.update(9.0, start).unwrap().unwrap();

        // Dwell kept both coolers off.
        mpc.observe_applied([false, false]);
        let pending = mpc.pending.unwrap();
        assert_eq!(pending.input.action, [false, false]);
        assert_eq!(pending.bias, MpcTuning::default().idle_bias);
        assert_eq!(
            pending.predicted_total,
            mpc.network.predict(&pending.input) + pending.bias
        );
        assert_eq!(mpc.last_action, [false, false]);

        mpc.update(9.02, start + Duration::from_secs(1)).unwrap().unwrap();
        let next = mpc.pending.unwrap();
        assert_eq!(next.input.previous_action, [false, false]);
    }

    #[test]
    fn deterministic_given_seed() {
        let run = || {
            let mut mpc = NeuralMpc::new(5.0, MpcTuning::default(), SampleLimits::default());
            let start = Instant::now();
            (0..10u64)
                .map(|tick| {
                    let update = mpc
                        .update(8.0 - tick as f64 * 0.1, start + Duration::from_secs(tick))
                        .unwrap()
                        .unwrap();
                    [update.intents[0].desired_on, update.intents[1].desired_on]
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
