//! ---
//! cbx_section: "05-control-strategies"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Control level failures."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use coldbox_common::ActuatorId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    #[error("temperature sample {0} is not a finite number")]
    NonFinite(f64),
    #[error("temperature sample {value} is outside {min}..={max}")]
    OutOfRange { value: f64, min: f64, max: f64 },
    #[error("setpoint {0} is not usable")]
    InvalidSetpoint(f64),
    #[error("{0} is not governed")]
    UnknownActuator(ActuatorId),
}

pub type Result<T> = std::result::Result<T, ControlError>;
