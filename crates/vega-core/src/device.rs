//! Per-device connection state machine.
//!
//! Each configured device runs one [`DeviceWorker`] task. The task owns the
//! device's [`DeviceSessionState`] and is driven by a single `select!` loop
//! over:
//!
//! - commands from the registry,
//! - the in-flight connect, ready, init or poll future,
//! - link status events,
//! - the reconnect and next-poll deadlines.
//!
//! Because every step is a future held by the loop, a disconnect or force
//! reconnect arriving mid round trip simply drops that future.
//!
//! Observers read a [`DeviceSnapshot`] published on a `watch` channel after
//! every change, and receive the state and reading callbacks of the
//! [`EventSink`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;
use utoipa::ToSchema;

use crate::backoff::ReconnectBackoff;
use crate::config::{DeviceConfig, DeviceId, PipelineConfig};
use crate::events::EventSink;
use crate::poll::{PollTracker, PollVerdict};
use crate::session::Session;
use crate::state::ConnectionState;
use crate::telemetry::{decode_latest_realtime, Reading};
use crate::transport::{Connector, LinkEvent, LinkEvents, TransportError, TransportResult};

/// Status text of a device whose address cannot be used.
pub const INVALID_ADDRESS_STATUS: &str = "Invalid address";

/// Instruction to a device task.
#[derive(Debug)]
pub(crate) enum DeviceCommand {
    /// Start connecting if idle.
    Connect,
    /// User disconnect; acknowledged after teardown.
    Disconnect { ack: Option<oneshot::Sender<()>> },
    /// Reset backoff and reconnect now, if the device is active.
    ForceReconnect,
    /// Replace the configuration. `auto_connect` allows an enable to connect.
    UpdateConfig {
        config: DeviceConfig,
        auto_connect: bool,
    },
    /// Tear down and end the task.
    Shutdown { ack: oneshot::Sender<()> },
}

/// Observable state of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DeviceSnapshot {
    /// Current configuration.
    pub device: DeviceConfig,
    /// Connection state.
    pub state: ConnectionState,
    /// Human-readable status.
    #[schema(example = "Connected")]
    pub status: String,
    /// Whether a session handle is held.
    pub has_session: bool,
    /// Consecutive failed polls in the current session.
    pub consecutive_failures: u32,
    /// Failed connect cycles since the last successful connect.
    pub reconnect_attempt: u32,
    /// Backoff delay of the pending reconnect, if one is scheduled.
    pub retry_delay_ms: Option<u64>,
    /// Wall-clock time of the last decoded reading, ms since the epoch.
    pub last_success_ms: Option<i64>,
    /// Reason of the last failure.
    pub last_error: Option<String>,
    /// Last decoded reading.
    pub last_reading: Option<Reading>,
}

impl DeviceSnapshot {
    fn initial(device: DeviceConfig) -> Self {
        Self {
            device,
            state: ConnectionState::Disconnected,
            status: ConnectionState::Disconnected.status_text().to_string(),
            has_session: false,
            consecutive_failures: 0,
            reconnect_attempt: 0,
            retry_delay_ms: None,
            last_success_ms: None,
            last_error: None,
            last_reading: None,
        }
    }
}

/// State owned exclusively by a device task.
#[derive(Debug)]
pub struct DeviceSessionState {
    /// Current connection state.
    pub state: ConnectionState,
    /// The live session, if any.
    pub session: Option<Arc<Session>>,
    /// Poll bookkeeping; present only while connected.
    pub tracker: Option<PollTracker>,
    /// Reconnect backoff.
    pub backoff: ReconnectBackoff,
    /// Set by a user disconnect; suppresses reconnect scheduling.
    pub intentional_close: bool,
    /// Deadline of the pending reconnect.
    pub reconnect_at: Option<Instant>,
    /// When the last transport was closed.
    pub closed_at: Option<Instant>,
}

type Pending<T> = Option<BoxFuture<'static, T>>;

/// Futures and timers currently driving the loop.
#[derive(Default)]
struct InFlight {
    connect: Pending<TransportResult<(Session, LinkEvents)>>,
    ready: Pending<TransportResult<()>>,
    init: Pending<TransportResult<()>>,
    poll: Pending<TransportResult<Vec<u8>>>,
    link_events: Option<LinkEvents>,
    next_poll_at: Option<Instant>,
}

impl InFlight {
    fn cancel(&mut self) {
        *self = Self::default();
    }
}

async fn maybe_await<T>(fut: &mut Pending<T>) -> T {
    match fut {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_event(events: &mut Option<LinkEvents>) -> Option<LinkEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn whole_secs_ceil(d: Duration) -> u128 {
    d.as_millis().div_ceil(1000)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Handle the registry keeps for a running device task.
#[derive(Debug)]
pub(crate) struct DeviceHandle {
    commands: mpsc::UnboundedSender<DeviceCommand>,
    snapshot: watch::Receiver<DeviceSnapshot>,
    task: JoinHandle<()>,
}

impl DeviceHandle {
    /// Sends a command. Returns `false` if the task is gone.
    pub(crate) fn send(&self, command: DeviceCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Sends a user disconnect and waits for teardown.
    pub(crate) async fn disconnect(&self) {
        let (ack, done) = oneshot::channel();
        if self.send(DeviceCommand::Disconnect { ack: Some(ack) }) {
            let _ = done.await;
        }
    }

    /// Stops the task and waits for it to finish.
    pub(crate) async fn shutdown(self) {
        let (ack, done) = oneshot::channel();
        if self.send(DeviceCommand::Shutdown { ack }) {
            let _ = done.await;
        }
        let _ = self.task.await;
    }

    pub(crate) fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.clone()
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }
}

/// The per-device actor.
pub(crate) struct DeviceWorker {
    id: DeviceId,
    config: DeviceConfig,
    pipeline: PipelineConfig,
    connector: Arc<dyn Connector>,
    sink: Arc<EventSink>,
    snapshot: watch::Sender<DeviceSnapshot>,
    session: DeviceSessionState,
    flight: InFlight,
    status: String,
    last_error: Option<String>,
    last_reading: Option<Reading>,
    retry_delay: Option<Duration>,
}

impl DeviceWorker {
    /// Spawns the task for `config` and returns its handle.
    pub(crate) fn spawn(
        config: DeviceConfig,
        pipeline: PipelineConfig,
        connector: Arc<dyn Connector>,
        sink: Arc<EventSink>,
    ) -> DeviceHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(DeviceSnapshot::initial(config.clone()));
        let span = tracing::info_span!("device", device_id = %config.id);
        let worker = Self {
            id: config.id,
            session: DeviceSessionState {
                state: ConnectionState::Disconnected,
                session: None,
                tracker: None,
                backoff: pipeline.backoff(),
                intentional_close: false,
                reconnect_at: None,
                closed_at: None,
            },
            config,
            pipeline,
            connector,
            sink,
            snapshot: snapshot_tx,
            flight: InFlight::default(),
            status: ConnectionState::Disconnected.status_text().to_string(),
            last_error: None,
            last_reading: None,
            retry_delay: None,
        };
        let task = tokio::spawn(worker.run(commands_rx).instrument(span));
        DeviceHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<DeviceCommand>) {
        tracing::debug!(address = %self.config.address, "device task started");
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(DeviceCommand::Shutdown { ack }) => {
                        self.disconnect().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.disconnect().await;
                        break;
                    }
                },
                event = next_event(&mut self.flight.link_events) => self.on_link_event(event).await,
                opened = maybe_await(&mut self.flight.connect) => {
                    self.flight.connect = None;
                    self.on_opened(opened).await;
                }
                ready = maybe_await(&mut self.flight.ready) => {
                    self.flight.ready = None;
                    self.on_ready(ready).await;
                }
                initialized = maybe_await(&mut self.flight.init) => {
                    self.flight.init = None;
                    self.on_initialized(initialized).await;
                }
                polled = maybe_await(&mut self.flight.poll) => {
                    self.flight.poll = None;
                    self.on_polled(polled).await;
                }
                () = sleep_until_opt(self.session.reconnect_at) => {
                    self.session.reconnect_at = None;
                    tracing::debug!(attempt = self.session.backoff.attempt(), "backoff elapsed");
                    self.begin_connect().await;
                }
                () = sleep_until_opt(self.flight.next_poll_at) => {
                    self.flight.next_poll_at = None;
                    self.start_poll();
                }
            }
        }
        tracing::debug!("device task stopped");
    }

    async fn handle_command(&mut self, command: DeviceCommand) {
        match command {
            DeviceCommand::Connect => {
                if !self.session.state.is_active() {
                    self.session.backoff.reset();
                    self.begin_connect().await;
                }
            }
            DeviceCommand::Disconnect { ack } => {
                self.disconnect().await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            DeviceCommand::ForceReconnect => {
                if self.session.state.is_active() {
                    tracing::info!(state = %self.session.state, "forced reconnect");
                    self.session.backoff.reset();
                    self.begin_connect().await;
                }
            }
            DeviceCommand::UpdateConfig {
                config,
                auto_connect,
            } => self.update_config(config, auto_connect).await,
            // handled by the loop
            DeviceCommand::Shutdown { ack } => {
                let _ = ack.send(());
            }
        }
    }

    async fn update_config(&mut self, config: DeviceConfig, auto_connect: bool) {
        let previous = std::mem::replace(&mut self.config, config);
        let state = self.session.state;

        if !self.config.enabled {
            if state != ConnectionState::Disconnected {
                self.disconnect().await;
                return;
            }
        } else if previous.needs_reconnect(&self.config) && state.is_active() {
            tracing::info!(address = %self.config.address, "address changed, reconnecting");
            self.session.backoff.reset();
            self.begin_connect().await;
            return;
        } else if auto_connect
            && (!previous.enabled
                || (state == ConnectionState::Error && previous.needs_reconnect(&self.config)))
        {
            self.session.backoff.reset();
            self.begin_connect().await;
            return;
        }
        self.publish();
    }

    /// Cancels everything in flight and closes the transport. The session
    /// handle is cleared only after the transport is closed.
    async fn teardown(&mut self) {
        self.flight.cancel();
        self.session.reconnect_at = None;
        self.session.tracker = None;
        self.retry_delay = None;
        if let Some(session) = &self.session.session {
            session.close().await;
            self.session.closed_at = Some(Instant::now());
        }
        self.session.session = None;
    }

    async fn disconnect(&mut self) {
        self.session.intentional_close = true;
        self.teardown().await;
        self.session.backoff.reset();
        if self.session.state != ConnectionState::Disconnected {
            tracing::info!("disconnected by request");
        }
        self.transition(
            ConnectionState::Disconnected,
            ConnectionState::Disconnected.status_text(),
        );
    }

    async fn begin_connect(&mut self) {
        self.teardown().await;
        self.session.intentional_close = false;

        if !self.config.has_valid_address() {
            self.enter_error(INVALID_ADDRESS_STATUS);
            return;
        }

        let settle = self.session.closed_at.map_or(Duration::ZERO, |closed| {
            (closed + self.pipeline.settle_delay()).saturating_duration_since(Instant::now())
        });
        tracing::info!(
            address = %self.config.address,
            attempt = self.session.backoff.attempt(),
            "connecting"
        );
        self.transition(
            ConnectionState::Connecting,
            ConnectionState::Connecting.status_text(),
        );

        let connector = Arc::clone(&self.connector);
        let address = self.config.address.clone();
        let timeout = self.pipeline.connect_timeout();
        self.flight.connect = Some(Box::pin(async move {
            if !settle.is_zero() {
                tokio::time::sleep(settle).await;
            }
            Session::connect(connector.as_ref(), &address, timeout).await
        }));
    }

    /// The transport is open: keep the session so teardown closes it, then
    /// wait for link-layer setup.
    async fn on_opened(&mut self, opened: TransportResult<(Session, LinkEvents)>) {
        match opened {
            Ok((session, events)) => {
                let session = Arc::new(session);
                self.session.session = Some(Arc::clone(&session));
                self.flight.link_events = Some(events);
                let timeout = self.pipeline.connect_timeout();
                self.flight.ready = Some(Box::pin(async move { session.ready(timeout).await }));
                self.publish();
            }
            Err(err) => self.fail(&err).await,
        }
    }

    async fn on_ready(&mut self, ready: TransportResult<()>) {
        if let Err(err) = ready {
            self.fail(&err).await;
            return;
        }
        let Some(session) = self.session.session.clone() else {
            return;
        };
        let timeout = self.pipeline.init_timeout();
        self.flight.init = Some(Box::pin(async move { session.initialize(timeout).await }));
        self.set_status("Initializing...");
    }

    async fn on_initialized(&mut self, initialized: TransportResult<()>) {
        if let Err(err) = initialized {
            self.fail(&err).await;
            return;
        }
        self.session.backoff.reset();
        self.session.tracker = Some(PollTracker::new(self.pipeline.poll_policy(), Instant::now()));
        self.last_error = None;
        tracing::info!(address = %self.config.address, "connected");
        self.transition(
            ConnectionState::Connected,
            ConnectionState::Connected.status_text(),
        );
        self.start_poll();
    }

    fn start_poll(&mut self) {
        if self.session.state != ConnectionState::Connected || self.flight.poll.is_some() {
            return;
        }
        let Some(session) = self.session.session.clone() else {
            return;
        };
        let timeout = self.pipeline.read_timeout();
        self.flight.poll = Some(Box::pin(async move { session.read_data_buf(timeout).await }));
    }

    async fn on_polled(&mut self, polled: TransportResult<Vec<u8>>) {
        if self.session.state != ConnectionState::Connected {
            return;
        }
        let Some(tracker) = self.session.tracker.as_mut() else {
            return;
        };
        let now = Instant::now();

        let verdict = match polled {
            Ok(buf) => match decode_latest_realtime(&buf) {
                Some(record) => {
                    tracker.record_success(now);
                    let reading =
                        Reading::from_record(self.id, &record, Utc::now().timestamp_millis());
                    tracing::trace!(
                        dose_rate = reading.dose_rate,
                        count_rate = reading.count_rate,
                        "reading"
                    );
                    self.sink.emit_reading(&reading);
                    self.last_reading = Some(reading);
                    PollVerdict::Continue
                }
                None => {
                    tracing::debug!(len = buf.len(), "no real-time record in buffer");
                    tracker.record_empty(now)
                }
            },
            Err(err) => {
                let verdict = tracker.record_failure(now);
                tracing::warn!(
                    error = %err,
                    failures = tracker.consecutive_failures(),
                    "poll failed"
                );
                self.last_error = Some(err.reason().to_string());
                verdict
            }
        };

        match verdict {
            PollVerdict::Continue => {
                self.flight.next_poll_at = Some(now + self.pipeline.poll_policy().interval());
                self.publish();
            }
            PollVerdict::TooManyFailures(failures) => {
                tracing::warn!(failures, "failure threshold reached");
                let reason = self
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "Read failed".to_string());
                self.schedule_reconnect(&reason).await;
            }
            PollVerdict::Stale(idle) => {
                tracing::warn!(idle_ms = millis(idle), "telemetry stale");
                self.schedule_reconnect(&format!("No data for {}s", idle.as_secs()))
                    .await;
            }
        }
    }

    async fn on_link_event(&mut self, event: Option<LinkEvent>) {
        match event {
            Some(LinkEvent::Lost(message)) => {
                if self.session.session.is_some() && self.session.state.may_hold_session() {
                    tracing::warn!(%message, "link lost");
                    self.schedule_reconnect(&format!("Link lost: {message}")).await;
                }
            }
            Some(LinkEvent::Status(message)) => tracing::debug!(%message, "link status"),
            None => self.flight.link_events = None,
        }
    }

    async fn fail(&mut self, err: &TransportError) {
        if err.is_configuration_error() {
            tracing::error!(error = %err, "configuration error");
            self.teardown().await;
            self.enter_error(err.reason());
        } else {
            tracing::warn!(error = %err, state = %self.session.state, "connect cycle failed");
            self.schedule_reconnect(err.reason()).await;
        }
    }

    /// Moves to `Reconnecting` and arms the backoff timer. Does nothing when a
    /// reconnect is already pending or the device was closed on purpose.
    async fn schedule_reconnect(&mut self, reason: &str) {
        if self.session.intentional_close || self.session.reconnect_at.is_some() {
            return;
        }
        self.teardown().await;

        let delay = self.session.backoff.next_delay();
        let attempt = self.session.backoff.attempt();
        self.session.reconnect_at = Some(Instant::now() + delay);
        self.retry_delay = Some(delay);
        self.last_error = Some(reason.to_string());
        tracing::info!(
            reason,
            attempt,
            delay_ms = millis(delay),
            "scheduling reconnect"
        );
        self.transition(
            ConnectionState::Reconnecting,
            &format!(
                "{reason}. Retrying in {}s (attempt {attempt})",
                whole_secs_ceil(delay)
            ),
        );
    }

    fn enter_error(&mut self, reason: &str) {
        self.last_error = Some(reason.to_string());
        tracing::error!(address = %self.config.address, reason, "device parked in error state");
        self.transition(ConnectionState::Error, reason);
    }

    fn transition(&mut self, next: ConnectionState, status: &str) {
        let current = self.session.state;
        if !current.can_transition_to(next) {
            tracing::warn!(from = %current, to = %next, "unexpected state transition");
        }
        let changed = current != next || self.status != status;
        self.session.state = next;
        self.status = status.to_string();
        if current != next {
            tracing::debug!(from = %current, to = %next, status, "state changed");
        }
        self.publish();
        if changed {
            self.sink.emit_state(self.id, next, status);
        }
    }

    fn set_status(&mut self, status: &str) {
        let state = self.session.state;
        self.transition(state, status);
    }

    fn publish(&self) {
        let snapshot = DeviceSnapshot {
            device: self.config.clone(),
            state: self.session.state,
            status: self.status.clone(),
            has_session: self.session.session.is_some(),
            consecutive_failures: self
                .session
                .tracker
                .as_ref()
                .map_or(0, PollTracker::consecutive_failures),
            reconnect_attempt: self.session.backoff.attempt(),
            retry_delay_ms: self.retry_delay.map(millis),
            last_success_ms: self.last_reading.as_ref().map(|r| r.timestamp_ms),
            last_error: self.last_error.clone(),
            last_reading: self.last_reading.clone(),
        };
        self.snapshot.send_replace(snapshot);
    }
}
