//! ---
//! cbx_section: "04-device-driver"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Thermocouple batch reads and actuator writes with fallbacks."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
//! The controller refuses single-register reads of the thermocouple address but serves
//! it inside any contiguous block of `block_len` registers that covers it. Two
//! overlapping blocks are configured; the secondary one is only read when the primary
//! one fails.
use coldbox_common::config::{ActuatorConfig, ThermocoupleConfig};
use coldbox_common::{ActuatorId, TemperatureReading};
use coldbox_protocol::{scaled_register, LinkError, ModbusClient, ProtocolError, Request, Response};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{CoilFault, DeviceError, Result};

/// Which configured block a thermocouple read goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermocoupleBlock {
    Primary,
    Secondary,
}

/// How an actuator write finally reached the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WritePath {
    Coil,
    Register,
}

/// Observed actuator output. `Unknown` is never to be treated as off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorObservation {
    On,
    Off,
    Unknown,
}

impl ActuatorObservation {
    pub fn as_bool(self) -> Option<bool> {
        match self {
            ActuatorObservation::On => Some(true),
            ActuatorObservation::Off => Some(false),
            ActuatorObservation::Unknown => None,
        }
    }
}

/// Driver for one PLC exposing a thermocouple and a set of cooler outputs.
#[derive(Debug, Clone)]
pub struct PlcDevice<C> {
    client: C,
    unit_id: u8,
    thermocouple: ThermocoupleConfig,
    actuators: Vec<ActuatorConfig>,
}

impl<C: ModbusClient> PlcDevice<C> {
    pub fn new(
        client: C,
        unit_id: u8,
        thermocouple: ThermocoupleConfig,
        actuators: Vec<ActuatorConfig>,
    ) -> Self {
        Self {
            client,
            unit_id,
            thermocouple,
            actuators,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn set_unit_id(&mut self, unit_id: u8) {
        self.unit_id = unit_id;
    }

    pub fn actuators(&self) -> &[ActuatorConfig] {
        &self.actuators
    }

    /// Read the thermocouple, falling back to the secondary block once.
    pub async fn read_temperature(&self) -> Result<TemperatureReading> {
        let primary = match self.read_thermocouple_block(ThermocoupleBlock::Primary).await {
            Ok(value) => return Ok(TemperatureReading::device(value)),
            Err(err) => err,
        };
        debug!(error = %primary, "primary thermocouple block failed; trying secondary");

        match self.read_thermocouple_block(ThermocoupleBlock::Secondary).await {
            Ok(value) => {
                info!(value, "thermocouple served by secondary block");
                Ok(TemperatureReading::device(value))
            }
            Err(secondary) => Err(DeviceError::ReadFailed { primary, secondary }),
        }
    }

    /// Read one block and extract the thermocouple value in degrees Celsius.
    pub async fn read_thermocouple_block(
        &self,
        block: ThermocoupleBlock,
    ) -> std::result::Result<f64, LinkError> {
        let (base, offset) = match block {
            ThermocoupleBlock::Primary => {
                (self.thermocouple.primary_base, self.thermocouple.primary_offset)
            }
            ThermocoupleBlock::Secondary => (
                self.thermocouple.secondary_base,
                self.thermocouple.secondary_offset,
            ),
        };
        let request = Request::ReadHoldingRegisters {
            address: base,
            quantity: self.thermocouple.block_len,
        };
        let response = self.client.call(self.unit_id, request).await?;
        let raw = response
            .registers()
            .and_then(|words| words.get(offset as usize).copied())
            .ok_or(ProtocolError::LengthMismatch {
                expected: self.thermocouple.block_len as usize,
                actual: response.registers().map_or(0, <[u16]>::len),
            })?;
        Ok(scaled_register(raw, self.thermocouple.scale))
    }

    /// Drive an actuator output. Falls back to a register write when the coil write
    /// fails or its echo does not match.
    pub async fn set_actuator(&self, id: ActuatorId, on: bool) -> Result<WritePath> {
        let actuator = self.actuator(id)?;
        let address = actuator.coil_address;

        let coil = match self
            .client
            .call(self.unit_id, Request::WriteSingleCoil { address, value: on })
            .await
        {
            Ok(Response::WriteSingleCoil {
                address: echoed_address,
                value: echoed_value,
            }) if echoed_address == address && echoed_value == on => {
                debug!(actuator = %id, on, "coil write acknowledged");
                return Ok(WritePath::Coil);
            }
            Ok(Response::WriteSingleCoil {
                address: echoed_address,
                value: echoed_value,
            }) => CoilFault::EchoMismatch {
                address,
                value: on,
                echoed_address,
                echoed_value,
            },
            Ok(other) => CoilFault::Link(
                ProtocolError::UnexpectedFunction {
                    expected: 0x05,
                    actual: other.function_byte(),
                }
                .into(),
            ),
            Err(err) => CoilFault::Link(err),
        };
        warn!(actuator = %id, on, error = %coil, "coil write rejected; retrying as register");

        let value = u16::from(on);
        match self
            .client
            .call(
                self.unit_id,
                Request::WriteSingleRegister { address, value },
            )
            .await
        {
            Ok(_) => Ok(WritePath::Register),
            Err(register) => Err(DeviceError::WriteFailed {
                actuator: id,
                coil,
                register,
            }),
        }
    }

    /// Observe an actuator through its coil, then its register, else `Unknown`.
    pub async fn read_actuator(&self, id: ActuatorId) -> Result<ActuatorObservation> {
        let address = self.actuator(id)?.coil_address;

        let coil_error = match self
            .client
            .call(
                self.unit_id,
                Request::ReadCoils {
                    address,
                    quantity: 1,
                },
            )
            .await
        {
            Ok(response) => match response.coils().and_then(|bits| bits.first().copied()) {
                Some(bit) => return Ok(observation(bit)),
                None => LinkError::from(ProtocolError::MalformedPdu("empty coil payload")),
            },
            Err(err) => err,
        };

        let register = self
            .client
            .call(
                self.unit_id,
                Request::ReadHoldingRegisters {
                    address,
                    quantity: 1,
                },
            )
            .await;
        let word = register
            .as_ref()
            .ok()
            .and_then(|response| response.registers())
            .and_then(|words| words.first().copied());
        match word {
            Some(word) => Ok(observation(word != 0)),
            None => {
                warn!(
                    actuator = %id,
                    coil_error = %coil_error,
                    register_error = ?register.err(),
                    "actuator state unobservable"
                );
                Ok(ActuatorObservation::Unknown)
            }
        }
    }

    fn actuator(&self, id: ActuatorId) -> Result<&ActuatorConfig> {
        self.actuators
            .iter()
            .find(|actuator| actuator.id == id)
            .ok_or(DeviceError::UnknownActuator(id))
    }
}

fn observation(on: bool) -> ActuatorObservation {
    if on {
        ActuatorObservation::On
    } else {
        ActuatorObservation::Off
    }
}
