//! ---
//! cbx_section: "01-core-runtime"
//! cbx_subsection: "crate-root"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Scheduling helpers for the control loop."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
//! Soft real-time scheduling helpers for the ColdBox runtime.

pub mod scheduling;

pub use scheduling::{RateLimiter, TaskGroup};
