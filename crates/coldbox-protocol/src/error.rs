//! ---
//! cbx_section: "02-field-protocol"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Error taxonomy of the PLC link."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use std::time::Duration;

use thiserror::Error;

use crate::codec::ExceptionCode;

/// Failures of the socket itself. All of them are recoverable by reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No response arrived within the per-request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The TCP handshake did not finish in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    /// The peer refused the TCP handshake.
    #[error("connection refused: {0}")]
    ConnectRefused(String),
    /// The peer closed the socket or the read side failed.
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    /// The request was cancelled by an explicit disconnect.
    #[error("disconnected")]
    Disconnected,
    /// No connection is established.
    #[error("not connected")]
    NotConnected,
    /// A connect call arrived while another one was in progress.
    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,
    /// Every transaction id is taken by an in-flight request.
    #[error("no free transaction id")]
    Saturated,
    /// Any other socket level failure.
    #[error("socket error: {0}")]
    Io(String),
}

/// A frame or PDU that does not follow the wire format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame {transaction_id} carries protocol id {protocol_id}, expected 0")]
    BadProtocolId { transaction_id: u16, protocol_id: u16 },
    #[error("declared length {0} is outside 2..=254")]
    InvalidLength(u16),
    #[error("length mismatch: expected {expected} bytes, found {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("response for unknown transaction {0}")]
    UnmatchedTransaction(u16),
    #[error("expected function {expected:#04x}, got {actual:#04x}")]
    UnexpectedFunction { expected: u8, actual: u8 },
    #[error("unsupported function code {0:#04x}")]
    UnsupportedFunction(u8),
    #[error("malformed pdu: {0}")]
    MalformedPdu(&'static str),
}

/// The PLC understood the request and rejected it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("device rejected function {function:#04x}: {code}")]
pub struct DeviceException {
    pub function: u8,
    pub code: ExceptionCode,
}

/// Any failure of a request on the PLC link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Device(#[from] DeviceException),
}

impl LinkError {
    /// True when the device could not be reached, as opposed to rejecting the request.
    pub fn is_transport(&self) -> bool {
        matches!(self, LinkError::Transport(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, LinkError::Transport(TransportError::Timeout(_)))
    }

    pub fn device_exception(&self) -> Option<&DeviceException> {
        match self {
            LinkError::Device(exception) => Some(exception),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;
