//! ---
//! cbx_section: "06-simulation"
//! cbx_subsection: "crate-root"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Simulation module exports."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
//! Simulated container and PLC used when no hardware is available.

pub mod mock_plc;
pub mod thermal;

pub use mock_plc::{MockFaults, MockPlc, MockPlcOptions};
pub use thermal::{SyntheticFeed, ThermalModel};
