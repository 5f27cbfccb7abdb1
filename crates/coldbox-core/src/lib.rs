//! ---
//! cbx_section: "01-core-runtime"
//! cbx_subsection: "crate-root"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Control loop, command handle and event feed."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
//! The ColdBox control loop: reads the thermocouple, runs the selected strategy and
//! drives both coolers through the actuation governor.

pub mod control_loop;
pub mod error;
pub mod events;
pub mod handle;

pub use control_loop::{ControlLoop, TickReport};
pub use error::{CoreError, Result};
pub use events::{CoreEvent, EventBus};
pub use handle::{ControlCommand, ControlHandle, LoopStatus};
