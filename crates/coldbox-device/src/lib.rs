//! ---
//! cbx_section: "04-device-driver"
//! cbx_subsection: "crate-root"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Device driver for the thermocouple PLC."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
pub mod driver;
pub mod error;

pub use driver::{ActuatorObservation, PlcDevice, ThermocoupleBlock, WritePath};
pub use error::{CoilFault, DeviceError, Result};
