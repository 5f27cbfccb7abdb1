//! ---
//! cbx_section: "01-core-runtime"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Notifications published by the control loop."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
use coldbox_common::{ActuatorId, TemperatureReading};
use coldbox_control::Diagnostics;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Everything an observer can learn about the loop. Delivered in publication order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    TemperatureUpdate(TemperatureReading),
    ConnectionStatusChanged {
        connected: bool,
        using_synthetic: bool,
    },
    ActuatorStateChanged {
        actuator: ActuatorId,
        is_on: bool,
    },
    ControlDecision(Diagnostics),
}

/// Explicit observer list. Each subscriber owns an unbounded channel so a slow
/// reader never stalls a tick and never loses an event.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Vec<mpsc::UnboundedSender<CoreEvent>>,
}

impl EventBus {
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<CoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn publish(&mut self, event: CoreEvent) {
        let before = self.subscribers.len();
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        let dropped = before - self.subscribers.len();
        if dropped > 0 {
            debug!(dropped, "removed closed event subscribers");
        }
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
