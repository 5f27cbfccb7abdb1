//! ---
//! cbx_section: "05-control-strategies"
//! cbx_subsection: "crate-root"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Control strategies and the actuation governor."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
//! Strategies turn admitted temperature samples into actuator intents. Nothing in this
//! crate performs I/O; the control loop owns every instance and is the only caller.

pub mod decision;
pub mod error;
pub mod governor;
pub mod hysteresis;
pub mod mpc;
pub mod pid;
pub mod rbf;
pub mod sampling;
pub mod strategy;

pub use decision::{ActuatorIntent, ControlUpdate, Diagnostics, Gains, PidTerms};
pub use error::{ControlError, Result};
pub use governor::{ActuationGovernor, ActuatorDwellState, GovernorDecision};
pub use hysteresis::HysteresisController;
pub use mpc::{optimize_control, DeltaModel, NeuralMpc, Plan};
pub use pid::{PidCascadeController, PidCore};
pub use rbf::{RbfAdaptivePid, RbfNetwork};
pub use sampling::{cascade_split, Pwm, SampleGate, SampleLimits};
pub use strategy::{ControlStrategy, Controller};
