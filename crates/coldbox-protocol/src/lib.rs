//! ---
//! cbx_section: "02-field-protocol"
//! cbx_subsection: "crate-root"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Modbus/TCP codec and transport for the PLC link."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
pub mod client;
pub mod codec;
pub mod error;
pub mod pending;
pub mod transport;

pub use client::ModbusClient;
pub use codec::{
    decode_frame, scaled_register, signed_register, ExceptionCode, Frame, FunctionCode, Request,
    Response,
};
pub use error::{DeviceException, LinkError, ProtocolError, TransportError};
pub use pending::PendingTable;
pub use transport::{ConnectionState, TcpTransport};
