//! In-process transport simulator.
//!
//! [`MockConnector`] hands out links whose behaviour is scripted per device
//! address through [`MockDevice`]. Used by the test suites and by the server
//! when it is built without the `bluetooth` feature.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::transport::{
    Connector, Link, LinkEvent, OpenedLink, TransportError, TransportResult,
};

/// Scripted result of a connect, ready or init step.
#[derive(Debug, Clone)]
pub enum MockStep {
    /// The step succeeds.
    Succeed,
    /// The step fails with the given error.
    Fail(TransportError),
    /// The step never completes.
    Hang,
}

/// Scripted result of a telemetry read.
#[derive(Debug, Clone)]
pub enum MockRead {
    /// The read returns these bytes.
    Data(Vec<u8>),
    /// The read returns a fresh real-time record with these values.
    Realtime {
        /// Count rate, counts per second.
        count_rate: f32,
        /// Dose rate, device units.
        dose_rate: f32,
    },
    /// The read fails with the given error.
    Fail(TransportError),
    /// The read never completes.
    Hang,
}

#[derive(Debug)]
struct DeviceScript {
    connects: VecDeque<MockStep>,
    readies: VecDeque<MockStep>,
    inits: VecDeque<MockStep>,
    reads: VecDeque<MockRead>,
    default_read: MockRead,
    latency: Duration,
    seq: u8,
    connect_attempts: usize,
    init_attempts: usize,
    read_attempts: usize,
    closes: usize,
    live_links: usize,
    events: Option<mpsc::UnboundedSender<LinkEvent>>,
}

impl Default for DeviceScript {
    fn default() -> Self {
        Self {
            connects: VecDeque::new(),
            readies: VecDeque::new(),
            inits: VecDeque::new(),
            reads: VecDeque::new(),
            default_read: MockRead::Realtime {
                count_rate: 4.2,
                dose_rate: 1.1e-5,
            },
            latency: Duration::ZERO,
            seq: 0,
            connect_attempts: 0,
            init_attempts: 0,
            read_attempts: 0,
            closes: 0,
            live_links: 0,
            events: None,
        }
    }
}

fn lock(script: &Mutex<DeviceScript>) -> MutexGuard<'_, DeviceScript> {
    script.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle for scripting and inspecting one simulated peripheral.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    script: Arc<Mutex<DeviceScript>>,
}

impl MockDevice {
    /// Queues the outcome of the next connect attempt.
    pub fn push_connect(&self, step: MockStep) -> &Self {
        lock(&self.script).connects.push_back(step);
        self
    }

    /// Queues the outcome of the next link-ready step.
    pub fn push_ready(&self, step: MockStep) -> &Self {
        lock(&self.script).readies.push_back(step);
        self
    }

    /// Queues the outcome of the next initialization.
    pub fn push_init(&self, step: MockStep) -> &Self {
        lock(&self.script).inits.push_back(step);
        self
    }

    /// Queues the outcome of the next telemetry read.
    pub fn push_read(&self, read: MockRead) -> &Self {
        lock(&self.script).reads.push_back(read);
        self
    }

    /// Sets the read outcome used once the queue is empty.
    pub fn set_default_read(&self, read: MockRead) -> &Self {
        lock(&self.script).default_read = read;
        self
    }

    /// Adds a fixed delay to every step.
    pub fn set_latency(&self, latency: Duration) -> &Self {
        lock(&self.script).latency = latency;
        self
    }

    /// Sends a status event on the most recently opened link.
    ///
    /// Returns `false` when that link's receiver is already gone.
    pub fn inject(&self, event: LinkEvent) -> bool {
        lock(&self.script)
            .events
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// Number of connect attempts so far.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        lock(&self.script).connect_attempts
    }

    /// Number of initialization attempts so far.
    #[must_use]
    pub fn init_attempts(&self) -> usize {
        lock(&self.script).init_attempts
    }

    /// Number of telemetry reads so far.
    #[must_use]
    pub fn read_attempts(&self) -> usize {
        lock(&self.script).read_attempts
    }

    /// Number of links closed so far.
    #[must_use]
    pub fn closes(&self) -> usize {
        lock(&self.script).closes
    }

    /// Links opened and not yet closed. Dropping a link without closing it
    /// leaves it counted, like a peripheral that stays connected.
    #[must_use]
    pub fn live_links(&self) -> usize {
        lock(&self.script).live_links
    }

    fn latency(&self) -> Duration {
        lock(&self.script).latency
    }
}

async fn run_step(step: MockStep) -> TransportResult<()> {
    match step {
        MockStep::Succeed => Ok(()),
        MockStep::Fail(err) => Err(err),
        MockStep::Hang => std::future::pending().await,
    }
}

async fn pause(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

/// Connector producing simulated links.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    devices: Arc<Mutex<HashMap<String, MockDevice>>>,
}

impl MockConnector {
    /// Creates a connector where every address behaves like a healthy device.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the script handle for `address`, creating it on first use.
    #[must_use]
    pub fn device(&self, address: &str) -> MockDevice {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(address.to_owned())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: &str) -> TransportResult<OpenedLink> {
        let device = self.device(address);
        let step = {
            let mut script = lock(&device.script);
            script.connect_attempts += 1;
            script.connects.pop_front().unwrap_or(MockStep::Succeed)
        };
        pause(device.latency()).await;
        run_step(step).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut script = lock(&device.script);
            script.live_links += 1;
            script.events = Some(tx);
        }
        Ok(OpenedLink {
            link: Box::new(MockLink {
                device,
                open: true,
            }),
            events: rx,
        })
    }
}

struct MockLink {
    device: MockDevice,
    open: bool,
}

#[async_trait]
impl Link for MockLink {
    async fn ready(&mut self) -> TransportResult<()> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        let step = lock(&self.device.script)
            .readies
            .pop_front()
            .unwrap_or(MockStep::Succeed);
        run_step(step).await
    }

    async fn initialize(&mut self) -> TransportResult<()> {
        let step = {
            let mut script = lock(&self.device.script);
            script.init_attempts += 1;
            script.inits.pop_front().unwrap_or(MockStep::Succeed)
        };
        pause(self.device.latency()).await;
        run_step(step).await
    }

    async fn read_data_buf(&mut self) -> TransportResult<Vec<u8>> {
        let read = {
            let mut script = lock(&self.device.script);
            script.read_attempts += 1;
            let next = script.reads.pop_front();
            next.unwrap_or_else(|| script.default_read.clone())
        };
        pause(self.device.latency()).await;
        match read {
            MockRead::Data(bytes) => Ok(bytes),
            MockRead::Realtime {
                count_rate,
                dose_rate,
            } => {
                let mut script = lock(&self.device.script);
                let seq = script.seq;
                script.seq = script.seq.wrapping_add(1);
                Ok(realtime_buffer(seq, count_rate, dose_rate))
            }
            MockRead::Fail(err) => Err(err),
            MockRead::Hang => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        if std::mem::replace(&mut self.open, false) {
            let mut script = lock(&self.device.script);
            script.closes += 1;
            script.live_links = script.live_links.saturating_sub(1);
        }
    }
}

/// Encodes a telemetry buffer holding one real-time record.
#[must_use]
pub fn realtime_buffer(seq: u8, count_rate: f32, dose_rate: f32) -> Vec<u8> {
    let mut out = Vec::with_capacity(22);
    out.extend_from_slice(&[seq, 0, 0]);
    out.extend_from_slice(&0i32.to_le_bytes());
    out.extend_from_slice(&count_rate.to_le_bytes());
    out.extend_from_slice(&dose_rate.to_le_bytes());
    out.extend_from_slice(&50u16.to_le_bytes());
    out.extend_from_slice(&80u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.push(0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::decode_latest_realtime;

    #[tokio::test]
    async fn test_default_device_is_healthy() {
        let connector = MockConnector::new();
        let mut opened = connector.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
        opened.link.ready().await.unwrap();
        opened.link.initialize().await.unwrap();
        let buf = opened.link.read_data_buf().await.unwrap();
        assert!(decode_latest_realtime(&buf).is_some());

        let device = connector.device("AA:BB:CC:DD:EE:FF");
        assert_eq!(device.live_links(), 1);
        opened.link.close().await;
        opened.link.close().await;
        assert_eq!(device.live_links(), 0);
        assert_eq!(device.closes(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failures_then_default() {
        let connector = MockConnector::new();
        let device = connector.device("dev");
        device
            .push_connect(MockStep::Fail(TransportError::ConnectFailed("busy".into())))
            .push_read(MockRead::Fail(TransportError::ReadFailed("crc".into())));

        assert!(connector.connect("dev").await.is_err());
        let mut opened = connector.connect("dev").await.unwrap();
        assert!(opened.link.read_data_buf().await.is_err());
        assert!(opened.link.read_data_buf().await.is_ok());
        assert_eq!(device.connect_attempts(), 2);
        assert_eq!(device.read_attempts(), 2);
    }

    #[tokio::test]
    async fn test_inject_reaches_latest_link() {
        let connector = MockConnector::new();
        let device = connector.device("dev");
        assert!(!device.inject(LinkEvent::Lost("early".into())));

        let mut opened = connector.connect("dev").await.unwrap();
        assert!(device.inject(LinkEvent::from_status("Disconnected")));
        assert_eq!(
            opened.events.recv().await,
            Some(LinkEvent::Lost("Disconnected".into()))
        );

        drop(opened);
        assert!(!device.inject(LinkEvent::Lost("late".into())));
        assert_eq!(device.live_links(), 1);
        assert_eq!(device.closes(), 0);
    }
}
