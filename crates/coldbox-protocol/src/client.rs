//! ---
//! cbx_section: "02-field-protocol"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Client abstraction consumed by the device driver."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use async_trait::async_trait;

use crate::codec::{Request, Response};
use crate::error::LinkError;
use crate::transport::{ConnectionState, TcpTransport};

/// Issues typed requests to a PLC.
#[async_trait]
pub trait ModbusClient: Send + Sync {
    async fn call(&self, unit_id: u8, request: Request) -> Result<Response, LinkError>;

    fn connection_state(&self) -> ConnectionState;
}

#[async_trait]
impl ModbusClient for TcpTransport {
    async fn call(&self, unit_id: u8, request: Request) -> Result<Response, LinkError> {
        TcpTransport::call(self, unit_id, &request).await
    }

    fn connection_state(&self) -> ConnectionState {
        self.state()
    }
}

#[async_trait]
impl<T: ModbusClient + ?Sized> ModbusClient for std::sync::Arc<T> {
    async fn call(&self, unit_id: u8, request: Request) -> Result<Response, LinkError> {
        (**self).call(unit_id, request).await
    }

    fn connection_state(&self) -> ConnectionState {
        (**self).connection_state()
    }
}
