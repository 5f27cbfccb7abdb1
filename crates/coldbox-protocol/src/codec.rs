//! ---
//! cbx_section: "02-field-protocol"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Modbus/TCP frame and PDU encoding."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
//! Wire layout of a frame:
//!
//! ```text
//! | transaction id (2) | protocol id (2) | length (2) | unit id (1) | pdu (length - 1) |
//! ```
//!
//! All multi-byte fields are big-endian. `length` counts the unit id plus the PDU.
use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DeviceException, LinkError, ProtocolError};

/// Size of the MBAP header including the unit id.
pub const HEADER_LEN: usize = 7;
/// Bytes needed before the declared length of a frame is known.
pub const LENGTH_PREFIX_LEN: usize = 6;
pub const MAX_PDU_LEN: usize = 253;
pub const MIN_LENGTH_FIELD: u16 = 2;
pub const MAX_LENGTH_FIELD: u16 = 254;
pub const MODBUS_PROTOCOL_ID: u16 = 0;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_READ_COILS: u16 = 2000;
pub const COIL_ON: u16 = 0xFF00;
pub const COIL_OFF: u16 = 0x0000;

const EXCEPTION_FLAG: u8 = 0x80;

/// Function codes understood by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
}

impl FunctionCode {
    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::ReadCoils),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            _ => None,
        }
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_u8(value).ok_or(ProtocolError::UnsupportedFunction(value))
    }
}

/// Exception codes a device may answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Other(u8),
}

impl ExceptionCode {
    pub fn value(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
            Self::Other(code) => code,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalFunction => write!(f, "illegal function (0x01)"),
            Self::IllegalDataAddress => write!(f, "illegal data address (0x02)"),
            Self::IllegalDataValue => write!(f, "illegal data value (0x03)"),
            Self::ServerDeviceFailure => write!(f, "server device failure (0x04)"),
            Self::Other(code) => write!(f, "exception {:#04x}", code),
        }
    }
}

/// One application frame as it travels on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: u8,
    pub pdu: Bytes,
}

impl Frame {
    pub fn new(transaction_id: u16, unit_id: u8, pdu: Bytes) -> Self {
        Self {
            transaction_id,
            protocol_id: MODBUS_PROTOCOL_ID,
            unit_id,
            pdu,
        }
    }

    /// Value of the header length field.
    pub fn length_field(&self) -> u16 {
        (self.pdu.len() + 1) as u16
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.pdu.len()
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u16(self.transaction_id);
        dst.put_u16(self.protocol_id);
        dst.put_u16(self.length_field());
        dst.put_u8(self.unit_id);
        dst.put_slice(&self.pdu);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode exactly one complete frame. Trailing or missing bytes are an error.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_LEN + 1 {
            return Err(ProtocolError::LengthMismatch {
                expected: HEADER_LEN + 1,
                actual: bytes.len(),
            });
        }
        let mut header = &bytes[..LENGTH_PREFIX_LEN];
        let transaction_id = header.get_u16();
        let protocol_id = header.get_u16();
        let length = header.get_u16();
        if protocol_id != MODBUS_PROTOCOL_ID {
            return Err(ProtocolError::BadProtocolId {
                transaction_id,
                protocol_id,
            });
        }
        if !(MIN_LENGTH_FIELD..=MAX_LENGTH_FIELD).contains(&length) {
            return Err(ProtocolError::InvalidLength(length));
        }
        let expected = LENGTH_PREFIX_LEN + length as usize;
        if bytes.len() != expected {
            return Err(ProtocolError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            transaction_id,
            protocol_id,
            unit_id: bytes[LENGTH_PREFIX_LEN],
            pdu: Bytes::copy_from_slice(&bytes[HEADER_LEN..]),
        })
    }
}

/// A framing failure found while draining a stream buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error}")]
pub struct DecodeError {
    /// Transaction the bad frame claimed to belong to, when the header was readable.
    pub transaction_id: Option<u16>,
    pub error: ProtocolError,
}

/// Pull the next complete frame off a stream buffer.
///
/// Returns `Ok(None)` while fewer bytes than the declared frame length are buffered.
/// A frame with a foreign protocol id is consumed and reported. A length field outside
/// `2..=254` means the stream lost alignment, so the whole buffer is discarded.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, DecodeError> {
    if buf.len() < LENGTH_PREFIX_LEN {
        return Ok(None);
    }
    let transaction_id = u16::from_be_bytes([buf[0], buf[1]]);
    let protocol_id = u16::from_be_bytes([buf[2], buf[3]]);
    let length = u16::from_be_bytes([buf[4], buf[5]]);

    if !(MIN_LENGTH_FIELD..=MAX_LENGTH_FIELD).contains(&length) {
        buf.clear();
        return Err(DecodeError {
            transaction_id: Some(transaction_id),
            error: ProtocolError::InvalidLength(length),
        });
    }

    let total = LENGTH_PREFIX_LEN + length as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let mut frame = buf.split_to(total).freeze();
    if protocol_id != MODBUS_PROTOCOL_ID {
        return Err(DecodeError {
            transaction_id: Some(transaction_id),
            error: ProtocolError::BadProtocolId {
                transaction_id,
                protocol_id,
            },
        });
    }
    frame.advance(LENGTH_PREFIX_LEN);
    let unit_id = frame.get_u8();
    Ok(Some(Frame {
        transaction_id,
        protocol_id,
        unit_id,
        pdu: frame,
    }))
}

/// Request PDUs the driver issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
}

impl Request {
    pub fn function_code(&self) -> FunctionCode {
        match self {
            Self::ReadCoils { .. } => FunctionCode::ReadCoils,
            Self::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Self::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Self::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Self::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
        }
    }

    /// Reject quantities a device would answer with an illegal-data-value exception.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match *self {
            Self::ReadCoils { quantity, .. } if quantity == 0 || quantity > MAX_READ_COILS => {
                Err(ProtocolError::MalformedPdu("coil quantity out of range"))
            }
            Self::ReadHoldingRegisters { quantity, .. } | Self::ReadInputRegisters { quantity, .. }
                if quantity == 0 || quantity > MAX_READ_REGISTERS =>
            {
                Err(ProtocolError::MalformedPdu("register quantity out of range"))
            }
            _ => Ok(()),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(self.function_code().value());
        match *self {
            Self::ReadCoils { address, quantity }
            | Self::ReadHoldingRegisters { address, quantity }
            | Self::ReadInputRegisters { address, quantity } => {
                buf.put_u16(address);
                buf.put_u16(quantity);
            }
            Self::WriteSingleCoil { address, value } => {
                buf.put_u16(address);
                buf.put_u16(coil_word(value));
            }
            Self::WriteSingleRegister { address, value } => {
                buf.put_u16(address);
                buf.put_u16(value);
            }
        }
        buf.freeze()
    }

    pub fn decode(pdu: &[u8]) -> Result<Self, ProtocolError> {
        let (&function, mut body) = pdu
            .split_first()
            .ok_or(ProtocolError::MalformedPdu("empty pdu"))?;
        let function = FunctionCode::try_from(function)?;
        if body.len() != 4 {
            return Err(ProtocolError::LengthMismatch {
                expected: 5,
                actual: pdu.len(),
            });
        }
        let address = body.get_u16();
        let word = body.get_u16();
        let request = match function {
            FunctionCode::ReadCoils => Self::ReadCoils {
                address,
                quantity: word,
            },
            FunctionCode::ReadHoldingRegisters => Self::ReadHoldingRegisters {
                address,
                quantity: word,
            },
            FunctionCode::ReadInputRegisters => Self::ReadInputRegisters {
                address,
                quantity: word,
            },
            FunctionCode::WriteSingleCoil => Self::WriteSingleCoil {
                address,
                value: coil_value(word)?,
            },
            FunctionCode::WriteSingleRegister => Self::WriteSingleRegister {
                address,
                value: word,
            },
        };
        Ok(request)
    }
}

/// Response PDUs, including the exception form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Coil states as transmitted, padded to whole bytes.
    ReadCoils(Vec<bool>),
    ReadHoldingRegisters(Vec<u16>),
    ReadInputRegisters(Vec<u16>),
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    Exception(DeviceException),
}

impl Response {
    /// Function code on the wire, with the exception flag set for exception responses.
    pub fn function_byte(&self) -> u8 {
        match self {
            Self::ReadCoils(_) => FunctionCode::ReadCoils.value(),
            Self::ReadHoldingRegisters(_) => FunctionCode::ReadHoldingRegisters.value(),
            Self::ReadInputRegisters(_) => FunctionCode::ReadInputRegisters.value(),
            Self::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil.value(),
            Self::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister.value(),
            Self::Exception(exception) => exception.function | EXCEPTION_FLAG,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MAX_PDU_LEN);
        buf.put_u8(self.function_byte());
        match self {
            Self::ReadCoils(bits) => {
                let packed = pack_bits(bits);
                buf.put_u8(packed.len() as u8);
                buf.put_slice(&packed);
            }
            Self::ReadHoldingRegisters(words) | Self::ReadInputRegisters(words) => {
                buf.put_u8((words.len() * 2) as u8);
                for word in words {
                    buf.put_u16(*word);
                }
            }
            Self::WriteSingleCoil { address, value } => {
                buf.put_u16(*address);
                buf.put_u16(coil_word(*value));
            }
            Self::WriteSingleRegister { address, value } => {
                buf.put_u16(*address);
                buf.put_u16(*value);
            }
            Self::Exception(exception) => buf.put_u8(exception.code.value()),
        }
        buf.freeze()
    }

    pub fn decode(pdu: &[u8]) -> Result<Self, ProtocolError> {
        let (&function, body) = pdu
            .split_first()
            .ok_or(ProtocolError::MalformedPdu("empty pdu"))?;

        if function & EXCEPTION_FLAG != 0 {
            let code = body
                .first()
                .copied()
                .ok_or(ProtocolError::MalformedPdu("exception without code"))?;
            return Ok(Self::Exception(DeviceException {
                function: function & !EXCEPTION_FLAG,
                code: ExceptionCode::from_u8(code),
            }));
        }

        match FunctionCode::try_from(function)? {
            FunctionCode::ReadCoils => {
                let bytes = counted_payload(body)?;
                Ok(Self::ReadCoils(unpack_bits(bytes)))
            }
            FunctionCode::ReadHoldingRegisters => {
                Ok(Self::ReadHoldingRegisters(register_payload(body)?))
            }
            FunctionCode::ReadInputRegisters => {
                Ok(Self::ReadInputRegisters(register_payload(body)?))
            }
            FunctionCode::WriteSingleCoil => {
                let (address, word) = echo_payload(body)?;
                Ok(Self::WriteSingleCoil {
                    address,
                    value: coil_value(word)?,
                })
            }
            FunctionCode::WriteSingleRegister => {
                let (address, value) = echo_payload(body)?;
                Ok(Self::WriteSingleRegister { address, value })
            }
        }
    }

    /// Interpret a raw response PDU as the answer to `request`.
    ///
    /// Exceptions become [`LinkError::Device`]. Coil bitmaps are trimmed to the requested
    /// quantity and register payloads must carry exactly the requested count.
    pub fn for_request(request: &Request, pdu: &[u8]) -> Result<Self, LinkError> {
        let response = Self::decode(pdu)?;
        let expected = request.function_code().value();
        if let Self::Exception(exception) = response {
            if exception.function != expected {
                return Err(ProtocolError::UnexpectedFunction {
                    expected,
                    actual: exception.function,
                }
                .into());
            }
            return Err(exception.into());
        }
        let actual = response.function_byte();
        if actual != expected {
            return Err(ProtocolError::UnexpectedFunction { expected, actual }.into());
        }
        match (request, response) {
            (Request::ReadCoils { quantity, .. }, Self::ReadCoils(mut bits)) => {
                let wanted = *quantity as usize;
                if bits.len() < wanted {
                    return Err(ProtocolError::LengthMismatch {
                        expected: wanted,
                        actual: bits.len(),
                    }
                    .into());
                }
                bits.truncate(wanted);
                Ok(Self::ReadCoils(bits))
            }
            (
                Request::ReadHoldingRegisters { quantity, .. }
                | Request::ReadInputRegisters { quantity, .. },
                response @ (Self::ReadHoldingRegisters(_) | Self::ReadInputRegisters(_)),
            ) => {
                let words = match &response {
                    Self::ReadHoldingRegisters(words) | Self::ReadInputRegisters(words) => {
                        words.len()
                    }
                    _ => 0,
                };
                if words != *quantity as usize {
                    return Err(ProtocolError::LengthMismatch {
                        expected: *quantity as usize,
                        actual: words,
                    }
                    .into());
                }
                Ok(response)
            }
            (_, response) => Ok(response),
        }
    }

    /// Register words of a read response.
    pub fn registers(&self) -> Option<&[u16]> {
        match self {
            Self::ReadHoldingRegisters(words) | Self::ReadInputRegisters(words) => Some(words),
            _ => None,
        }
    }

    pub fn coils(&self) -> Option<&[bool]> {
        match self {
            Self::ReadCoils(bits) => Some(bits),
            _ => None,
        }
    }
}

/// Interpret a register word as a 16-bit two's-complement value.
pub fn signed_register(raw: u16) -> i32 {
    if raw > i16::MAX as u16 {
        raw as i32 - 65_536
    } else {
        raw as i32
    }
}

/// Scale a signed register into engineering units, e.g. tenths of a degree.
pub fn scaled_register(raw: u16, scale: f64) -> f64 {
    signed_register(raw) as f64 / scale
}

pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut packed = vec![0u8; bits.len().div_ceil(8)];
    for (index, bit) in bits.iter().enumerate() {
        if *bit {
            packed[index / 8] |= 1 << (index % 8);
        }
    }
    packed
}

pub fn unpack_bits(bytes: &[u8]) -> Vec<bool> {
    bytes
        .iter()
        .flat_map(|byte| (0..8).map(move |shift| byte & (1 << shift) != 0))
        .collect()
}

fn coil_word(value: bool) -> u16 {
    if value {
        COIL_ON
    } else {
        COIL_OFF
    }
}

fn coil_value(word: u16) -> Result<bool, ProtocolError> {
    match word {
        COIL_ON => Ok(true),
        COIL_OFF => Ok(false),
        _ => Err(ProtocolError::MalformedPdu("coil value must be 0xFF00 or 0x0000")),
    }
}

fn counted_payload(body: &[u8]) -> Result<&[u8], ProtocolError> {
    let (&count, rest) = body
        .split_first()
        .ok_or(ProtocolError::MalformedPdu("missing byte count"))?;
    if rest.len() != count as usize {
        return Err(ProtocolError::LengthMismatch {
            expected: count as usize,
            actual: rest.len(),
        });
    }
    Ok(rest)
}

fn register_payload(body: &[u8]) -> Result<Vec<u16>, ProtocolError> {
    let bytes = counted_payload(body)?;
    if bytes.len() % 2 != 0 {
        return Err(ProtocolError::MalformedPdu("odd register byte count"));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

fn echo_payload(mut body: &[u8]) -> Result<(u16, u16), ProtocolError> {
    if body.len() != 4 {
        return Err(ProtocolError::LengthMismatch {
            expected: 4,
            actual: body.len(),
        });
    }
    Ok((body.get_u16(), body.get_u16()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn read_holding_request_matches_wire_bytes() {
        let frame = Frame::new(
            0x0001,
            1,
            Request::ReadHoldingRegisters {
                address: 105,
                quantity: 1,
            }
            .encode(),
        );
        assert_eq!(
            frame.to_bytes().as_ref(),
            &[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x69, 0x00, 0x01]
        );
    }

    #[test]
    fn signed_conversion_handles_negative_temperatures() {
        assert_eq!(scaled_register(224, 10.0), 22.4);
        assert_eq!(scaled_register(65_506, 10.0), -3.0);
        assert_eq!(signed_register(32_767), 32_767);
        assert_eq!(signed_register(32_768), -32_768);
        assert_eq!(signed_register(0xFFFF), -1);
    }

    #[test]
    fn exception_response_sets_high_bit() {
        let response = Response::Exception(DeviceException {
            function: FunctionCode::ReadHoldingRegisters.value(),
            code: ExceptionCode::IllegalDataAddress,
        });
        assert_eq!(response.encode().as_ref(), &[0x83, 0x02]);
        assert_eq!(Response::decode(&[0x83, 0x02]).unwrap(), response);
    }

    #[test]
    fn for_request_maps_exception_to_device_error() {
        let request = Request::ReadHoldingRegisters {
            address: 100,
            quantity: 1,
        };
        let err = Response::for_request(&request, &[0x83, 0x02]).unwrap_err();
        let exception = err.device_exception().expect("device exception");
        assert_eq!(exception.code, ExceptionCode::IllegalDataAddress);
    }

    #[test]
    fn for_request_trims_coil_padding() {
        let request = Request::ReadCoils {
            address: 0,
            quantity: 2,
        };
        let response = Response::for_request(&request, &[0x01, 0x01, 0b0000_0010]).unwrap();
        assert_eq!(response.coils().unwrap(), &[false, true]);
    }

    #[test]
    fn for_request_rejects_wrong_function_and_count() {
        let request = Request::ReadHoldingRegisters {
            address: 100,
            quantity: 2,
        };
        let err = Response::for_request(&request, &[0x04, 0x02, 0x00, 0x01]).unwrap_err();
        assert!(matches!(
            err,
            LinkError::Protocol(ProtocolError::UnexpectedFunction { expected: 3, actual: 4 })
        ));
        let err = Response::for_request(&request, &[0x03, 0x02, 0x00, 0x01]).unwrap_err();
        assert!(matches!(
            err,
            LinkError::Protocol(ProtocolError::LengthMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn stream_decode_waits_for_complete_frame() {
        let bytes = Frame::new(7, 1, Response::ReadHoldingRegisters(vec![224]).encode()).to_bytes();
        let mut buf = BytesMut::new();
        for (index, byte) in bytes.iter().enumerate() {
            buf.put_u8(*byte);
            let decoded = decode_frame(&mut buf).unwrap();
            if index + 1 < bytes.len() {
                assert!(decoded.is_none(), "frame surfaced after {} bytes", index + 1);
            } else {
                let frame = decoded.expect("complete frame");
                assert_eq!(frame.transaction_id, 7);
                assert_eq!(
                    Response::decode(&frame.pdu).unwrap(),
                    Response::ReadHoldingRegisters(vec![224])
                );
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn stream_decode_splits_coalesced_frames() {
        let mut buf = BytesMut::new();
        Frame::new(1, 1, Response::ReadHoldingRegisters(vec![10]).encode()).encode(&mut buf);
        Frame::new(2, 1, Response::ReadHoldingRegisters(vec![20]).encode()).encode(&mut buf);
        buf.put_slice(&[0x00, 0x03, 0x00]);

        assert_eq!(decode_frame(&mut buf).unwrap().unwrap().transaction_id, 1);
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap().transaction_id, 2);
        assert!(decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn bad_protocol_id_consumes_only_that_frame() {
        let mut bad = Frame::new(9, 1, Response::ReadHoldingRegisters(vec![1]).encode());
        bad.protocol_id = 1;
        let mut buf = BytesMut::new();
        bad.encode(&mut buf);
        Frame::new(10, 1, Response::ReadHoldingRegisters(vec![2]).encode()).encode(&mut buf);

        let err = decode_frame(&mut buf).unwrap_err();
        assert_eq!(err.transaction_id, Some(9));
        assert!(matches!(err.error, ProtocolError::BadProtocolId { .. }));
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap().transaction_id, 10);
    }

    #[test]
    fn invalid_length_discards_buffer() {
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01, 0x03][..]);
        let err = decode_frame(&mut buf).unwrap_err();
        assert_eq!(err.error, ProtocolError::InvalidLength(256));
        assert!(buf.is_empty());
    }

    #[test]
    fn exact_decode_rejects_trailing_bytes() {
        let mut bytes = Frame::new(3, 1, Request::WriteSingleCoil { address: 0, value: true }.encode())
            .to_bytes()
            .to_vec();
        bytes.push(0);
        assert!(matches!(
            Frame::decode(&bytes),
            Err(ProtocolError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn request_validation_bounds_quantities() {
        assert!(Request::ReadHoldingRegisters { address: 0, quantity: 0 }.validate().is_err());
        assert!(Request::ReadInputRegisters { address: 0, quantity: 126 }.validate().is_err());
        assert!(Request::ReadCoils { address: 0, quantity: 2000 }.validate().is_ok());
    }

    fn request_strategy() -> impl Strategy<Value = Request> {
        prop_oneof![
            (any::<u16>(), 1..=MAX_READ_COILS)
                .prop_map(|(address, quantity)| Request::ReadCoils { address, quantity }),
            (any::<u16>(), 1..=MAX_READ_REGISTERS).prop_map(|(address, quantity)| {
                Request::ReadHoldingRegisters { address, quantity }
            }),
            (any::<u16>(), 1..=MAX_READ_REGISTERS).prop_map(|(address, quantity)| {
                Request::ReadInputRegisters { address, quantity }
            }),
            (any::<u16>(), any::<bool>())
                .prop_map(|(address, value)| Request::WriteSingleCoil { address, value }),
            (any::<u16>(), any::<u16>())
                .prop_map(|(address, value)| Request::WriteSingleRegister { address, value }),
        ]
    }

    fn response_strategy() -> impl Strategy<Value = Response> {
        prop_oneof![
            prop::collection::vec(any::<u8>(), 1..=250)
                .prop_map(|bytes| Response::ReadCoils(unpack_bits(&bytes))),
            prop::collection::vec(any::<u16>(), 1..=125).prop_map(Response::ReadHoldingRegisters),
            prop::collection::vec(any::<u16>(), 1..=125).prop_map(Response::ReadInputRegisters),
            (any::<u16>(), any::<bool>())
                .prop_map(|(address, value)| Response::WriteSingleCoil { address, value }),
            (any::<u16>(), any::<u16>())
                .prop_map(|(address, value)| Response::WriteSingleRegister { address, value }),
            (prop::sample::select(vec![1u8, 3, 4, 5, 6]), 1u8..=0x0B).prop_map(|(function, code)| {
                Response::Exception(DeviceException {
                    function,
                    code: ExceptionCode::from_u8(code),
                })
            }),
        ]
    }

    proptest! {
        #[test]
        fn requests_survive_the_wire(request in request_strategy(), tid in any::<u16>(), unit in any::<u8>()) {
            let frame = Frame::new(tid, unit, request.encode());
            let decoded = Frame::decode(&frame.to_bytes()).unwrap();
            prop_assert_eq!(&decoded, &frame);
            prop_assert_eq!(Request::decode(&decoded.pdu).unwrap(), request);
        }

        #[test]
        fn responses_survive_the_wire(response in response_strategy(), tid in any::<u16>()) {
            let frame = Frame::new(tid, 1, response.encode());
            let mut buf = BytesMut::from(frame.to_bytes().as_ref());
            let decoded = decode_frame(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded.transaction_id, tid);
            prop_assert_eq!(Response::decode(&decoded.pdu).unwrap(), response);
        }
    }
}
