//! ---
//! cbx_section: "01-core-runtime"
//! cbx_subsection: "module"
//! cbx_type: "source"
//! cbx_scope: "code"
//! cbx_description: "Tick scheduler: read, decide, govern, write, notify."
//! cbx_version: "v0.1.0"
//! cbx_owner: "tbd"
//! ---
//! One task owns the strategy, the governor and the synthetic feed, so none of them
//! need locking. Within a tick the order is strict: read, decide, write. Device I/O in a
//! tick shares one deadline inside the poll period; whatever is still outstanding when it
//! passes is dropped and retried next tick.
use std::time::{Duration, Instant};

use anyhow::Context;
use coldbox_common::time::duration_to_millis;
use coldbox_common::{ActuatorId, AppConfig, LoopTimingReporter, StrategyKind, TemperatureReading};
use coldbox_control::{
    ActuationGovernor, ActuatorIntent, ControlStrategy, Controller, GovernorDecision, SampleLimits,
};
use coldbox_device::{ActuatorObservation, PlcDevice, WritePath};
use coldbox_metrics::ControlMetrics;
use coldbox_protocol::TcpTransport;
use coldbox_rt::RateLimiter;
use coldbox_sim::SyntheticFeed;
use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant as Deadline;
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::handle::{ControlCommand, ControlHandle, LoopStatus};

const COMMAND_QUEUE: usize = 32;
/// Share of the poll period a tick may spend waiting on the PLC.
const TICK_IO_SHARE: f64 = 0.9;

/// Where to reconnect after an unexpected disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    host: String,
    port: u16,
    timeout: Duration,
}

/// Exponential reconnect schedule.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    next_attempt: Option<Instant>,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            next_attempt: None,
        }
    }

    fn reset(&mut self) {
        self.current = self.initial;
        self.next_attempt = None;
    }

    /// Arm the first retry if none is pending.
    fn arm(&mut self, now: Instant) {
        if self.next_attempt.is_none() {
            self.next_attempt = Some(now + self.current);
        }
    }

    fn due(&self, now: Instant) -> bool {
        self.next_attempt.is_some_and(|at| now >= at)
    }

    fn failed(&mut self, now: Instant) {
        self.current = (self.current * 2).min(self.max);
        self.next_attempt = Some(now + self.current);
    }
}

/// What one tick did, for callers driving the loop by hand.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub reading: Option<TemperatureReading>,
    pub decisions: Vec<GovernorDecision>,
    pub write_failures: usize,
}

enum Flow {
    Continue,
    Stop(oneshot::Sender<()>),
}

pub struct ControlLoop {
    config: AppConfig,
    transport: TcpTransport,
    device: PlcDevice<TcpTransport>,
    strategy: ControlStrategy,
    governor: ActuationGovernor,
    limits: SampleLimits,
    feed: SyntheticFeed,
    events: EventBus,
    metrics: Option<ControlMetrics>,
    automatic: bool,
    endpoint: Option<Endpoint>,
    backoff: Backoff,
    consecutive_failures: u32,
    using_synthetic: bool,
    connected: bool,
    published: Option<(bool, bool)>,
    last_reading: Option<TemperatureReading>,
    last_tick: Option<Instant>,
    /// Last state confirmed written to each actuator.
    written: IndexMap<ActuatorId, bool>,
    /// Last state the governor allowed, whether or not the write landed.
    commanded: IndexMap<ActuatorId, bool>,
}

impl ControlLoop {
    pub fn new(config: AppConfig, metrics: Option<ControlMetrics>) -> anyhow::Result<Self> {
        config.validate().context("invalid configuration")?;
        let transport = TcpTransport::new(config.plc.request_timeout);
        let device = PlcDevice::new(
            transport.clone(),
            config.plc.unit_id,
            config.thermocouple.clone(),
            config.actuators.clone(),
        );
        let limits = SampleLimits::from_config(&config.control);
        let strategy = ControlStrategy::build(
            config.control.strategy,
            config.control.setpoint,
            &config.tuning,
            limits,
        )?;
        let governor = ActuationGovernor::new(&config.actuators);
        let feed = SyntheticFeed::new(&config.synthetic)?;
        let backoff = Backoff::new(config.control.reconnect_initial, config.control.reconnect_max);
        if let Some(metrics) = &metrics {
            metrics.set_setpoint(config.control.setpoint);
            metrics.set_connected(false);
            metrics.set_synthetic(false);
        }
        Ok(Self {
            automatic: config.control.automatic,
            config,
            transport,
            device,
            strategy,
            governor,
            limits,
            feed,
            events: EventBus::default(),
            metrics,
            endpoint: None,
            backoff,
            consecutive_failures: 0,
            using_synthetic: false,
            connected: false,
            published: None,
            last_reading: None,
            last_tick: None,
            written: IndexMap::new(),
            commanded: IndexMap::new(),
        })
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn transport(&self) -> &TcpTransport {
        &self.transport
    }

    pub fn governor(&self) -> &ActuationGovernor {
        &self.governor
    }

    pub fn setpoint(&self) -> f64 {
        self.strategy.setpoint()
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn is_automatic(&self) -> bool {
        self.automatic
    }

    pub fn using_synthetic(&self) -> bool {
        self.using_synthetic
    }

    /// How long one tick may wait on the PLC before moving on.
    pub fn tick_budget(&self) -> Duration {
        self.config.control.poll_interval.mul_f64(TICK_IO_SHARE)
    }

    pub fn status(&self) -> LoopStatus {
        LoopStatus {
            connected: self.connected,
            using_synthetic: self.using_synthetic,
            automatic: self.automatic,
            setpoint: self.strategy.setpoint(),
            strategy: self.strategy.kind(),
            last_reading: self.last_reading.clone(),
            actuators: self
                .governor
                .states()
                .map(|state| (state.actuator, state.is_on))
                .collect(),
        }
    }

    fn publish_status(&mut self) {
        let current = (self.connected, self.using_synthetic);
        if self.published == Some(current) {
            return;
        }
        self.published = Some(current);
        info!(
            connected = current.0,
            using_synthetic = current.1,
            "connection status changed"
        );
        if let Some(metrics) = &self.metrics {
            metrics.set_connected(current.0);
            metrics.set_synthetic(current.1);
        }
        self.events.publish(CoreEvent::ConnectionStatusChanged {
            connected: current.0,
            using_synthetic: current.1,
        });
    }

    /// Connect to a PLC and seed the governor from the actuators' actual state.
    pub async fn connect(&mut self, host: &str, port: u16, unit_id: u8, timeout: Duration, now: Instant) -> bool {
        self.endpoint = Some(Endpoint {
            host: host.to_owned(),
            port,
            timeout,
        });
        self.transport.set_request_timeout(timeout);
        self.device.set_unit_id(unit_id);
        self.backoff.reset();
        self.try_connect(now, None).await
    }

    /// Dial the remembered endpoint. With a `deadline` the dial timeout is cut to fit.
    async fn try_connect(&mut self, now: Instant, deadline: Option<Deadline>) -> bool {
        let Some(endpoint) = self.endpoint.clone() else {
            return false;
        };
        let dial_timeout = deadline.map_or(endpoint.timeout, |deadline| {
            endpoint
                .timeout
                .min(deadline.saturating_duration_since(Deadline::now()))
        });
        match self
            .transport
            .connect(&endpoint.host, endpoint.port, dial_timeout)
            .await
        {
            Ok(()) => {
                info!(host = %endpoint.host, port = endpoint.port, "plc connected");
                self.backoff.reset();
                self.connected = true;
                self.publish_status();
                let budget = self.tick_budget();
                let readback_deadline = deadline.unwrap_or_else(|| Deadline::now() + budget);
                self.read_back(now, readback_deadline).await;
                true
            }
            Err(err) => {
                warn!(host = %endpoint.host, port = endpoint.port, error = %err, "plc connection failed");
                self.backoff.failed(now);
                self.connected = false;
                self.publish_status();
                false
            }
        }
    }

    async fn read_back(&mut self, now: Instant, deadline: Deadline) {
        let ids: Vec<ActuatorId> = self.config.actuators.iter().map(|a| a.id).collect();
        for id in ids {
            let Ok(observation) =
                tokio::time::timeout_at(deadline, self.device.read_actuator(id)).await
            else {
                warn!(actuator = %id, "actuator readback cut off by the tick budget");
                continue;
            };
            match observation {
                Ok(ActuatorObservation::Unknown) => {}
                Ok(observation) => {
                    let is_on = observation == ActuatorObservation::On;
                    if let Err(err) = self.governor.seed(id, is_on, now) {
                        warn!(actuator = %id, error = %err, "cannot seed governor");
                        continue;
                    }
                    self.commanded.insert(id, is_on);
                    self.record_written(id, is_on);
                }
                Err(err) => warn!(actuator = %id, error = %err, "actuator readback failed"),
            }
        }
    }

    /// Stop using the PLC and cancel any pending reconnect.
    pub async fn disconnect(&mut self) {
        self.endpoint = None;
        self.backoff.reset();
        self.transport.disconnect().await;
        self.connected = false;
        self.publish_status();
    }

    /// Notice a dropped link and schedule reconnects while an endpoint is wanted.
    fn sync_link(&mut self, now: Instant) {
        let up = self.transport.is_connected();
        if up != self.connected {
            if !up {
                warn!("plc link lost");
            }
            self.connected = up;
            self.publish_status();
        }
        if !up && self.endpoint.is_some() {
            self.backoff.arm(now);
        }
    }

    async fn maintain_link(&mut self, now: Instant, deadline: Deadline) {
        self.sync_link(now);
        if !self.connected && self.backoff.due(now) {
            if let Some(metrics) = &self.metrics {
                metrics.inc_reconnect();
            }
            debug!("retrying plc connection");
            self.try_connect(now, Some(deadline)).await;
        }
    }

    /// Read from the device, or the synthetic feed after repeated failures.
    async fn acquire(&mut self, now: Instant, deadline: Deadline) -> Option<TemperatureReading> {
        let read = match tokio::time::timeout_at(deadline, self.device.read_temperature()).await {
            Ok(read) => read.map_err(CoreError::from),
            Err(_) => Err(CoreError::TickBudgetExceeded(self.tick_budget())),
        };
        match read {
            Ok(reading) => {
                self.consecutive_failures = 0;
                if self.using_synthetic {
                    info!(value = reading.value(), "device temperature restored");
                    self.using_synthetic = false;
                    self.publish_status();
                }
                return Some(reading);
            }
            Err(err) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if let Some(metrics) = &self.metrics {
                    metrics.inc_read_failure();
                }
                warn!(
                    failures = self.consecutive_failures,
                    error = %err,
                    "temperature read failed"
                );
            }
        }

        if !self.using_synthetic
            && self.consecutive_failures >= self.config.control.synthetic_after_failures
        {
            if let Some(previous) = &self.last_reading {
                self.feed.seed_from(previous.value());
            }
            warn!(
                failures = self.consecutive_failures,
                "switching to synthetic temperature feed"
            );
            self.using_synthetic = true;
            self.publish_status();
        }
        if !self.using_synthetic {
            return None;
        }
        let dt = self
            .last_tick
            .map_or(Duration::ZERO, |last| now.saturating_duration_since(last));
        let active = self.commanded.values().filter(|on| **on).count();
        Some(self.feed.next_reading(active, dt))
    }

    /// One control tick at logical time `now`. PLC I/O is cut off after [`Self::tick_budget`].
    pub async fn step(&mut self, now: Instant) -> TickReport {
        let started = Instant::now();
        let deadline = Deadline::now() + self.tick_budget();
        self.maintain_link(now, deadline).await;

        let mut report = TickReport {
            reading: self.acquire(now, deadline).await,
            ..TickReport::default()
        };
        self.last_tick = Some(now);

        if let Some(reading) = report.reading.clone() {
            if let Some(metrics) = &self.metrics {
                metrics.set_temperature(reading.value());
            }
            self.last_reading = Some(reading.clone());
            self.events.publish(CoreEvent::TemperatureUpdate(reading.clone()));

            if self.automatic {
                match self.strategy.update(reading.value(), now) {
                    Ok(Some(update)) => {
                        self.events
                            .publish(CoreEvent::ControlDecision(update.diagnostics.clone()));
                        for intent in update.intents {
                            // Dwell is measured from when the write goes out.
                            let at = now + started.elapsed();
                            match self.apply(intent, at, Some(deadline)).await {
                                Ok(decision) => report.decisions.push(decision),
                                Err(err) => {
                                    report.write_failures += 1;
                                    error!(actuator = %intent.actuator, error = %err, "actuator write failed");
                                }
                            }
                        }
                        self.strategy.observe_applied(self.applied_action());
                    }
                    Ok(None) => debug!("sample inside minimum interval skipped"),
                    Err(err) => warn!(error = %err, "sample rejected; holding actuators"),
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.observe_tick(started.elapsed().as_secs_f64());
        }
        report
    }

    /// Primary and secondary state the plant is running with: confirmed writes, or the
    /// governed commands while the synthetic feed stands in for the device.
    fn applied_action(&self) -> [bool; 2] {
        let source = if self.using_synthetic {
            &self.commanded
        } else {
            &self.written
        };
        let state = |id| source.get(&id).copied().unwrap_or(false);
        [state(ActuatorId::PRIMARY), state(ActuatorId::SECONDARY)]
    }

    async fn write_actuator(
        &self,
        actuator: ActuatorId,
        on: bool,
        deadline: Option<Deadline>,
    ) -> Result<WritePath> {
        let write = self.device.set_actuator(actuator, on);
        let Some(deadline) = deadline else {
            return Ok(write.await?);
        };
        if Deadline::now() >= deadline {
            return Err(CoreError::TickBudgetExceeded(self.tick_budget()));
        }
        match tokio::time::timeout_at(deadline, write).await {
            Ok(written) => Ok(written?),
            Err(_) => Err(CoreError::TickBudgetExceeded(self.tick_budget())),
        }
    }

    /// Pass one intent through the governor and write any allowed transition. A write
    /// that fails or misses `deadline` rolls the transition back.
    async fn apply(
        &mut self,
        intent: ActuatorIntent,
        now: Instant,
        deadline: Option<Deadline>,
    ) -> Result<GovernorDecision> {
        let decision = self
            .governor
            .propose(intent.actuator, intent.desired_on, now)?;
        let label = intent.actuator.to_string();
        if decision.held() {
            if let Some(metrics) = &self.metrics {
                metrics.record_held(&label);
            }
        }
        self.commanded.insert(intent.actuator, decision.allowed_on);

        let needs_write = decision.transitioned
            || self.written.get(&intent.actuator) != Some(&decision.allowed_on);
        if !needs_write {
            return Ok(decision);
        }

        match self
            .write_actuator(intent.actuator, decision.allowed_on, deadline)
            .await
        {
            Ok(path) => {
                debug!(actuator = %intent.actuator, on = decision.allowed_on, ?path, "actuator written");
                if decision.transitioned {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_transition(&label);
                    }
                }
                self.record_written(intent.actuator, decision.allowed_on);
                Ok(decision)
            }
            Err(err) => {
                self.governor.rollback(&decision);
                if let Some(metrics) = &self.metrics {
                    metrics.inc_write_failure(&label);
                }
                Err(err)
            }
        }
    }

    fn record_written(&mut self, actuator: ActuatorId, is_on: bool) {
        let previous = self.written.insert(actuator, is_on);
        if let Some(metrics) = &self.metrics {
            metrics.set_actuator(&actuator.to_string(), is_on);
        }
        if previous != Some(is_on) {
            self.events
                .publish(CoreEvent::ActuatorStateChanged { actuator, is_on });
        }
    }

    pub fn set_target_temperature(&mut self, celsius: f64) -> Result<()> {
        let (min, max) = (self.config.control.valid_min, self.config.control.valid_max);
        if !celsius.is_finite() || !(min..=max).contains(&celsius) {
            return Err(CoreError::TargetOutOfRange {
                value: celsius,
                min,
                max,
            });
        }
        self.strategy.configure(celsius, &self.config.tuning)?;
        self.config.control.setpoint = celsius;
        if let Some(metrics) = &self.metrics {
            metrics.set_setpoint(celsius);
        }
        info!(setpoint = celsius, "target temperature updated");
        Ok(())
    }

    /// Toggle automatic control. Actuators stay as they are when it is turned off.
    pub fn set_automatic_mode(&mut self, enabled: bool) {
        if enabled && !self.automatic {
            self.strategy.reset();
        }
        self.automatic = enabled;
        info!(automatic = enabled, "automatic mode changed");
    }

    /// Drive an actuator by hand. Rejected while automatic mode is on; the dwell
    /// times still apply.
    pub async fn set_actuator_manual(&mut self, actuator: ActuatorId, on: bool, now: Instant) -> Result<bool> {
        if self.automatic {
            return Err(CoreError::ManualWhileAutomatic(actuator));
        }
        let decision = self
            .apply(ActuatorIntent::switch(actuator, on), now, None)
            .await?;
        info!(%actuator, desired = on, allowed = decision.allowed_on, "manual actuator command");
        Ok(decision.allowed_on)
    }

    /// Replace the running strategy with a fresh instance of `kind`.
    pub fn select_control_strategy(&mut self, kind: StrategyKind) -> Result<()> {
        let strategy = ControlStrategy::build(
            kind,
            self.strategy.setpoint(),
            &self.config.tuning,
            self.limits,
        )?;
        self.strategy = strategy;
        self.config.control.strategy = kind;
        info!(strategy = %kind, "control strategy selected");
        Ok(())
    }

    /// Command every actuator off, ignoring dwell times. Best effort.
    pub async fn shutdown_outputs(&mut self) {
        if !self.transport.is_connected() {
            return;
        }
        let ids: Vec<ActuatorId> = self.config.actuators.iter().map(|a| a.id).collect();
        for id in ids {
            match self.device.set_actuator(id, false).await {
                Ok(_) => self.record_written(id, false),
                Err(err) => warn!(actuator = %id, error = %err, "could not switch actuator off"),
            }
        }
    }

    async fn handle(&mut self, command: ControlCommand) -> Flow {
        let now = Instant::now();
        match command {
            ControlCommand::Connect {
                host,
                port,
                unit_id,
                timeout,
                reply,
            } => {
                let connected = self.connect(&host, port, unit_id, timeout, now).await;
                let _ = reply.send(connected);
            }
            ControlCommand::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            ControlCommand::SetTargetTemperature { celsius, reply } => {
                let _ = reply.send(self.set_target_temperature(celsius));
            }
            ControlCommand::SetAutomaticMode { enabled, reply } => {
                self.set_automatic_mode(enabled);
                let _ = reply.send(());
            }
            ControlCommand::SetActuatorManual { actuator, on, reply } => {
                let result = self.set_actuator_manual(actuator, on, now).await;
                let _ = reply.send(result);
            }
            ControlCommand::SelectControlStrategy { kind, reply } => {
                let _ = reply.send(self.select_control_strategy(kind));
            }
            ControlCommand::Subscribe { reply } => {
                let _ = reply.send(self.events.subscribe());
            }
            ControlCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            ControlCommand::Shutdown { reply } => return Flow::Stop(reply),
        }
        Flow::Continue
    }

    /// Run until shutdown or until every handle is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<ControlCommand>) -> anyhow::Result<()> {
        let poll = self.config.control.poll_interval;
        let mut limiter = RateLimiter::new(poll);
        let reporter = LoopTimingReporter::new(poll);
        let mut link = self.transport.subscribe();
        info!(
            poll_ms = duration_to_millis(poll),
            strategy = %self.strategy.kind(),
            setpoint = self.strategy.setpoint(),
            "control loop started"
        );

        let mut stopped_by = None;
        loop {
            tokio::select! {
                _ = limiter.tick() => {
                    let now = Instant::now();
                    if let Some(jitter) = reporter.record_tick(now) {
                        debug!(jitter_us = jitter.as_micros() as u64, "tick");
                    }
                    self.step(now).await;
                }
                command = commands.recv() => match command {
                    Some(command) => {
                        if let Flow::Stop(reply) = self.handle(command).await {
                            stopped_by = Some(reply);
                            break;
                        }
                    }
                    None => break,
                },
                Ok(()) = link.changed() => {
                    self.sync_link(Instant::now());
                }
            }
        }

        self.shutdown_outputs().await;
        self.transport.disconnect().await;
        if let Some(summary) = reporter.histogram().summary() {
            info!(
                samples = summary.samples,
                mean_us = summary.mean_us,
                max_us = summary.max_us,
                "control loop jitter summary"
            );
        }
        info!("control loop stopped");
        if let Some(reply) = stopped_by {
            let _ = reply.send(());
        }
        Ok(())
    }

    /// Spawn the loop task, connecting first when the configuration asks for it.
    pub fn spawn(mut self) -> (ControlHandle, JoinHandle<anyhow::Result<()>>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let task = tokio::spawn(async move {
            if self.config.plc.auto_connect {
                let plc = self.config.plc.clone();
                self.connect(&plc.host, plc.port, plc.unit_id, plc.connect_timeout, Instant::now())
                    .await;
            }
            self.run(rx).await
        });
        (ControlHandle::new(tx), task)
    }
}
