//! ---
//! cbx_section: "04-device-driver"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Driver level failures."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use coldbox_common::ActuatorId;
use coldbox_protocol::LinkError;
use thiserror::Error;

/// Why a coil write was not accepted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoilFault {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("coil echo mismatch: wrote {address}={value}, device echoed {echoed_address}={echoed_value}")]
    EchoMismatch {
        address: u16,
        value: bool,
        echoed_address: u16,
        echoed_value: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Both overlapping blocks failed to produce the thermocouple register.
    #[error("temperature read failed (primary block: {primary}; secondary block: {secondary})")]
    ReadFailed {
        primary: LinkError,
        secondary: LinkError,
    },
    #[error("{actuator} write failed (coil: {coil}; register fallback: {register})")]
    WriteFailed {
        actuator: ActuatorId,
        coil: CoilFault,
        register: LinkError,
    },
    #[error("{0} is not configured")]
    UnknownActuator(ActuatorId),
}

impl DeviceError {
    /// True when every underlying failure was a transport failure.
    pub fn is_unreachable(&self) -> bool {
        match self {
            DeviceError::ReadFailed { primary, secondary } => {
                primary.is_transport() && secondary.is_transport()
            }
            DeviceError::WriteFailed { register, .. } => register.is_transport(),
            DeviceError::UnknownActuator(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
