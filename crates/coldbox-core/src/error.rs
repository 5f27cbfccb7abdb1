//! ---
//! cbx_section: "01-core-runtime"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Failures surfaced through the control handle."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use coldbox_common::ActuatorId;
use coldbox_control::ControlError;
use coldbox_device::DeviceError;
use coldbox_protocol::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("manual control of {0} is rejected while automatic mode is on")]
    ManualWhileAutomatic(ActuatorId),
    #[error("target temperature {value} is outside {min}..={max}")]
    TargetOutOfRange { value: f64, min: f64, max: f64 },
    #[error("plc did not answer within the {0:?} tick budget")]
    TickBudgetExceeded(std::time::Duration),
    #[error("the control loop has stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, CoreError>;
