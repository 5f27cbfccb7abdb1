//! ---
//! cbx_section: "01-core-runtime"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Command channel into the running control loop."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
//! The loop task owns all controller and dwell state; callers talk to it only through
//! [`ControlHandle`], which forwards each call as a command with a oneshot reply.
use std::time::Duration;

use coldbox_common::{ActuatorId, StrategyKind, TemperatureReading};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::error::{CoreError, Result};
use crate::events::CoreEvent;

/// Snapshot of the loop for status displays and the daemon's probe output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopStatus {
    pub connected: bool,
    pub using_synthetic: bool,
    pub automatic: bool,
    pub setpoint: f64,
    pub strategy: StrategyKind,
    pub last_reading: Option<TemperatureReading>,
    pub actuators: Vec<(ActuatorId, bool)>,
}

#[derive(Debug)]
pub enum ControlCommand {
    Connect {
        host: String,
        port: u16,
        unit_id: u8,
        timeout: Duration,
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    SetTargetTemperature {
        celsius: f64,
        reply: oneshot::Sender<Result<()>>,
    },
    SetAutomaticMode {
        enabled: bool,
        reply: oneshot::Sender<()>,
    },
    SetActuatorManual {
        actuator: ActuatorId,
        on: bool,
        reply: oneshot::Sender<Result<bool>>,
    },
    SelectControlStrategy {
        kind: StrategyKind,
        reply: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        reply: oneshot::Sender<mpsc::UnboundedReceiver<CoreEvent>>,
    },
    Status {
        reply: oneshot::Sender<LoopStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door of the control loop.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    commands: mpsc::Sender<ControlCommand>,
}

impl ControlHandle {
    pub(crate) fn new(commands: mpsc::Sender<ControlCommand>) -> Self {
        Self { commands }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> ControlCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| CoreError::Stopped)?;
        response.await.map_err(|_| CoreError::Stopped)
    }

    /// Connect to a PLC. `false` when the connection could not be established; the
    /// loop then keeps retrying the endpoint with backoff.
    pub async fn connect(&self, host: impl Into<String>, port: u16, unit_id: u8, timeout: Duration) -> Result<bool> {
        let host = host.into();
        self.request(|reply| ControlCommand::Connect {
            host,
            port,
            unit_id,
            timeout,
            reply,
        })
        .await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| ControlCommand::Disconnect { reply }).await
    }

    pub async fn set_target_temperature(&self, celsius: f64) -> Result<()> {
        self.request(|reply| ControlCommand::SetTargetTemperature { celsius, reply })
            .await?
    }

    pub async fn set_automatic_mode(&self, enabled: bool) -> Result<()> {
        self.request(|reply| ControlCommand::SetAutomaticMode { enabled, reply })
            .await
    }

    /// Switch one actuator by hand. Returns the state the governor allowed.
    pub async fn set_actuator_manual(&self, actuator: ActuatorId, on: bool) -> Result<bool> {
        self.request(|reply| ControlCommand::SetActuatorManual { actuator, on, reply })
            .await?
    }

    pub async fn select_control_strategy(&self, kind: StrategyKind) -> Result<()> {
        self.request(|reply| ControlCommand::SelectControlStrategy { kind, reply })
            .await?
    }

    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<CoreEvent>> {
        self.request(|reply| ControlCommand::Subscribe { reply }).await
    }

    pub async fn status(&self) -> Result<LoopStatus> {
        self.request(|reply| ControlCommand::Status { reply }).await
    }

    /// Stop the loop. Actuators are commanded off before the task exits.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| ControlCommand::Shutdown { reply }).await
    }
}
