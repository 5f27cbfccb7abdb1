//! ---
//! cbx_section: "06-simulation"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Modbus/TCP server emulating the thermocouple PLC."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
//! The mock speaks the same framing as the real controller, including its quirks:
//! the thermocouple register only answers when read as part of a full block, and
//! the firmware can be told to echo the inverse of a written coil. Each actuator
//! output is visible both as a coil and as a holding register at the same address.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::BytesMut;
use coldbox_common::{AppConfig, ThermocoupleConfig};
use coldbox_protocol::codec::{MAX_READ_COILS, MAX_READ_REGISTERS};
use coldbox_protocol::{
    decode_frame, DeviceException, ExceptionCode, Frame, ProtocolError, Request, Response,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::thermal::ThermalModel;

const FRAGMENT_PAUSE: Duration = Duration::from_millis(5);

/// Misbehaviour switches, adjustable while the server runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockFaults {
    /// Acknowledge coil writes with the inverse value.
    pub corrupt_coil_echo: bool,
    /// Answer coil writes with an illegal-function exception.
    pub reject_coil_writes: bool,
    /// Answer register writes with a device failure.
    pub reject_register_writes: bool,
    /// Split every response across two TCP writes.
    pub fragment_responses: bool,
    /// Swallow requests without answering.
    pub silent: bool,
    /// Answer any read covering the thermocouple with a device failure.
    pub fail_temperature_reads: bool,
}

#[derive(Debug, Clone)]
pub struct MockPlcOptions {
    pub thermocouple: ThermocoupleConfig,
    pub actuator_addresses: Vec<u16>,
    pub initial_temperature: f64,
    /// When set, the thermocouple follows the model and the running outputs.
    pub plant: Option<ThermalModel>,
    /// Simulated seconds per wall-clock second.
    pub time_scale: f64,
    pub faults: MockFaults,
}

impl Default for MockPlcOptions {
    fn default() -> Self {
        Self {
            thermocouple: ThermocoupleConfig::default(),
            actuator_addresses: vec![0, 1],
            initial_temperature: 8.0,
            plant: None,
            time_scale: 1.0,
            faults: MockFaults::default(),
        }
    }
}

impl MockPlcOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            thermocouple: config.thermocouple.clone(),
            actuator_addresses: config.actuators.iter().map(|a| a.coil_address).collect(),
            ..Self::default()
        }
    }

    pub fn with_plant(mut self, plant: ThermalModel, time_scale: f64) -> Self {
        self.plant = Some(plant);
        self.time_scale = time_scale;
        self
    }
}

/// Register image and behaviour of the emulated controller.
#[derive(Debug)]
struct Device {
    thermocouple: ThermocoupleConfig,
    actuator_addresses: Vec<u16>,
    plant: Option<ThermalModel>,
    time_scale: f64,
    faults: MockFaults,
    registers: HashMap<u16, u16>,
    coils: HashMap<u16, bool>,
    temperature: f64,
    last_update: Instant,
    requests: Vec<Request>,
}

impl Device {
    fn new(options: MockPlcOptions) -> Self {
        let mut device = Self {
            thermocouple: options.thermocouple,
            actuator_addresses: options.actuator_addresses,
            plant: options.plant,
            time_scale: options.time_scale,
            faults: options.faults,
            registers: HashMap::new(),
            coils: HashMap::new(),
            temperature: options.initial_temperature,
            last_update: Instant::now(),
            requests: Vec::new(),
        };
        device.store_temperature();
        device
    }

    fn thermocouple_address(&self) -> u16 {
        self.thermocouple.register_address()
    }

    fn store_temperature(&mut self) {
        let raw = (self.temperature * self.thermocouple.scale).round() as i32;
        let word = raw.clamp(i16::MIN as i32, i16::MAX as i32) as i16 as u16;
        let address = self.thermocouple_address();
        self.registers.insert(address, word);
    }

    fn set_temperature(&mut self, celsius: f64) {
        self.temperature = celsius;
        self.last_update = Instant::now();
        self.store_temperature();
    }

    fn active_outputs(&self) -> usize {
        self.actuator_addresses
            .iter()
            .filter(|address| self.coils.get(address).copied().unwrap_or(false))
            .count()
    }

    fn advance(&mut self, now: Instant) {
        if let Some(plant) = self.plant {
            let elapsed = now.saturating_duration_since(self.last_update);
            let simulated = elapsed.mul_f64(self.time_scale.max(0.0));
            self.temperature = plant.step(self.temperature, self.active_outputs(), simulated);
            self.store_temperature();
        }
        self.last_update = now;
    }

    fn set_output(&mut self, address: u16, on: bool) {
        self.coils.insert(address, on);
        if self.actuator_addresses.contains(&address) {
            self.registers.insert(address, u16::from(on));
        }
    }

    fn exception(request: &Request, code: ExceptionCode) -> Response {
        Response::Exception(DeviceException {
            function: request.function_code().value(),
            code,
        })
    }

    fn handle(&mut self, request: Request) -> Response {
        self.requests.push(request);
        match request {
            Request::ReadHoldingRegisters { address, quantity } => {
                if quantity == 0 || quantity > MAX_READ_REGISTERS {
                    return Self::exception(&request, ExceptionCode::IllegalDataValue);
                }
                let start = u32::from(address);
                let end = start + u32::from(quantity);
                if end > 0x1_0000 {
                    return Self::exception(&request, ExceptionCode::IllegalDataAddress);
                }
                let thermocouple = u32::from(self.thermocouple_address());
                if (start..end).contains(&thermocouple) {
                    if quantity < self.thermocouple.block_len {
                        return Self::exception(&request, ExceptionCode::IllegalDataAddress);
                    }
                    if self.faults.fail_temperature_reads {
                        return Self::exception(&request, ExceptionCode::ServerDeviceFailure);
                    }
                }
                let words = (start..end)
                    .map(|a| self.registers.get(&(a as u16)).copied().unwrap_or(0))
                    .collect();
                Response::ReadHoldingRegisters(words)
            }
            Request::ReadCoils { address, quantity } => {
                if quantity == 0 || quantity > MAX_READ_COILS {
                    return Self::exception(&request, ExceptionCode::IllegalDataValue);
                }
                let bits = (0..quantity)
                    .map(|i| {
                        let a = address.wrapping_add(i);
                        self.coils.get(&a).copied().unwrap_or(false)
                    })
                    .collect();
                Response::ReadCoils(bits)
            }
            Request::WriteSingleCoil { address, value } => {
                if self.faults.reject_coil_writes {
                    return Self::exception(&request, ExceptionCode::IllegalFunction);
                }
                self.set_output(address, value);
                let echoed = if self.faults.corrupt_coil_echo { !value } else { value };
                Response::WriteSingleCoil {
                    address,
                    value: echoed,
                }
            }
            Request::WriteSingleRegister { address, value } => {
                if address == self.thermocouple_address() {
                    return Self::exception(&request, ExceptionCode::IllegalDataAddress);
                }
                if self.faults.reject_register_writes {
                    return Self::exception(&request, ExceptionCode::ServerDeviceFailure);
                }
                if self.actuator_addresses.contains(&address) {
                    self.set_output(address, value != 0);
                } else {
                    self.registers.insert(address, value);
                }
                Response::WriteSingleRegister { address, value }
            }
            Request::ReadInputRegisters { .. } => {
                Self::exception(&request, ExceptionCode::IllegalFunction)
            }
        }
    }

    /// Build the reply frame for one request frame, `None` while silent.
    fn respond(&mut self, frame: &Frame) -> Option<(Frame, bool)> {
        if self.faults.silent {
            return None;
        }
        self.advance(Instant::now());
        let response = match Request::decode(&frame.pdu) {
            Ok(request) => self.handle(request),
            Err(err) => {
                let function = frame.pdu.first().copied().unwrap_or(0) & 0x7F;
                let code = match err {
                    ProtocolError::UnsupportedFunction(_) => ExceptionCode::IllegalFunction,
                    _ => ExceptionCode::IllegalDataValue,
                };
                debug!(error = %err, function, "rejecting malformed request");
                Response::Exception(DeviceException { function, code })
            }
        };
        let reply = Frame::new(frame.transaction_id, frame.unit_id, response.encode());
        Some((reply, self.faults.fragment_responses))
    }
}

/// Running mock controller bound to a local TCP port.
#[derive(Debug)]
pub struct MockPlc {
    addr: SocketAddr,
    device: Arc<Mutex<Device>>,
    accepted: Arc<AtomicUsize>,
    kick: watch::Sender<u64>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MockPlc {
    /// Listen on an ephemeral loopback port.
    pub async fn start(options: MockPlcOptions) -> Result<Self> {
        Self::bind("127.0.0.1:0".parse()?, options).await
    }

    pub async fn bind(addr: SocketAddr, options: MockPlcOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind mock plc on {addr}"))?;
        let addr = listener
            .local_addr()
            .context("failed to read mock plc address")?;
        let device = Arc::new(Mutex::new(Device::new(options)));
        let accepted = Arc::new(AtomicUsize::new(0));
        let (kick, _) = watch::channel(0u64);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        info!(address = %addr, "mock plc listening");
        let task = tokio::spawn(accept_loop(
            listener,
            device.clone(),
            accepted.clone(),
            kick.clone(),
            shutdown_rx,
        ));
        Ok(Self {
            addr,
            device,
            accepted,
            kick,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Current container temperature, advanced to now when a plant is attached.
    pub fn temperature(&self) -> f64 {
        let mut device = self.device.lock();
        device.advance(Instant::now());
        device.temperature
    }

    pub fn set_temperature(&self, celsius: f64) {
        self.device.lock().set_temperature(celsius);
    }

    pub fn output(&self, address: u16) -> bool {
        self.device.lock().coils.get(&address).copied().unwrap_or(false)
    }

    pub fn set_output(&self, address: u16, on: bool) {
        self.device.lock().set_output(address, on);
    }

    pub fn faults(&self) -> MockFaults {
        self.device.lock().faults
    }

    pub fn set_faults(&self, faults: MockFaults) {
        self.device.lock().faults = faults;
    }

    /// Every request decoded so far, in arrival order.
    pub fn requests(&self) -> Vec<Request> {
        self.device.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.device.lock().requests.clear();
    }

    pub fn accepted_connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Close every open client socket; the listener stays up.
    pub fn drop_connections(&self) {
        self.kick.send_modify(|generation| *generation += 1);
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for MockPlc {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    device: Arc<Mutex<Device>>,
    accepted: Arc<AtomicUsize>,
    kick: watch::Sender<u64>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            incoming = listener.accept() => match incoming {
                Ok((stream, peer)) => {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    debug!(%peer, "mock plc accepted connection");
                    connections.spawn(serve_connection(stream, device.clone(), kick.subscribe()));
                }
                Err(err) => {
                    warn!(error = %err, "mock plc accept failed");
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.abort_all();
    info!("mock plc stopped");
}

async fn serve_connection(stream: TcpStream, device: Arc<Mutex<Device>>, mut kick: watch::Receiver<u64>) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(512);
    loop {
        tokio::select! {
            _ = kick.changed() => break,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }

        loop {
            let frame = match decode_frame(&mut buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "mock plc dropped an unreadable frame");
                    continue;
                }
            };
            let reply = device.lock().respond(&frame);
            let Some((reply, fragment)) = reply else {
                continue;
            };
            let bytes = reply.to_bytes();
            let written = if fragment {
                let (head, tail) = bytes.split_at(bytes.len() / 2);
                let first = writer.write_all(head).await;
                tokio::time::sleep(FRAGMENT_PAUSE).await;
                match first {
                    Ok(()) => writer.write_all(tail).await,
                    Err(err) => Err(err),
                }
            } else {
                writer.write_all(&bytes).await
            };
            if let Err(err) = written {
                debug!(error = %err, "mock plc write failed");
                return;
            }
        }
    }
}
