//! End-to-end behaviour of the registry, device tasks and sessions against the
//! simulated transport.

#![cfg(any(feature = "mock-bluetooth", not(feature = "bluetooth")))]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use vega_core::{
    ConnectionState, DeviceConfig, DeviceId, DeviceRegistry, DeviceSnapshot, LinkEvent,
    MemoryDeviceStore, MockConnector, MockRead, MockStep, PipelineConfig, TransportError,
};

const ADDR_A: &str = "52:43:06:60:00:0A";
const ADDR_B: &str = "52:43:06:60:00:0B";

type StateLog = Arc<Mutex<Vec<(DeviceId, ConnectionState, String)>>>;

fn registry(connector: &MockConnector) -> DeviceRegistry {
    DeviceRegistry::new(
        Arc::new(connector.clone()),
        Arc::new(MemoryDeviceStore::new()),
        PipelineConfig::default(),
    )
}

fn record_states(registry: &DeviceRegistry) -> StateLog {
    let log: StateLog = Arc::default();
    let sink = Arc::clone(&log);
    registry.events().on_state(move |id, state, status| {
        sink.lock().unwrap().push((id, state, status.to_string()));
    });
    log
}

fn count_state(log: &StateLog, id: DeviceId, state: ConnectionState) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(d, s, _)| *d == id && *s == state)
        .count()
}

async fn wait_until(
    registry: &DeviceRegistry,
    id: DeviceId,
    predicate: impl FnMut(&DeviceSnapshot) -> bool,
) -> DeviceSnapshot {
    let mut rx = registry.watch(id).await.unwrap();
    let snapshot = rx.wait_for(predicate).await.unwrap().clone();
    snapshot
}

async fn connected_device(
    registry: &DeviceRegistry,
    address: &str,
) -> DeviceConfig {
    let config = DeviceConfig::new(address, address);
    registry.add_device(config.clone(), true).await.unwrap();
    wait_until(registry, config.id, |s| s.state == ConnectionState::Connected).await;
    config
}

#[tokio::test(start_paused = true)]
async fn transient_read_failures_recover_without_reconnect() {
    let connector = MockConnector::new();
    connector
        .device(ADDR_A)
        .push_read(MockRead::Fail(TransportError::ReadFailed("crc".into())))
        .push_read(MockRead::Fail(TransportError::ReadFailed("crc".into())));
    let registry = registry(&connector);
    let log = record_states(&registry);
    registry.start().await;
    let config = connected_device(&registry, ADDR_A).await;

    let streak = wait_until(&registry, config.id, |s| s.consecutive_failures == 2).await;
    assert_eq!(streak.state, ConnectionState::Connected);
    assert!(streak.last_success_ms.is_none());

    let recovered = wait_until(&registry, config.id, |s| s.last_reading.is_some()).await;
    assert_eq!(recovered.state, ConnectionState::Connected);
    assert_eq!(recovered.consecutive_failures, 0);
    assert!(recovered.last_success_ms.is_some());
    assert_eq!(count_state(&log, config.id, ConnectionState::Reconnecting), 0);
    assert_eq!(connector.device(ADDR_A).connect_attempts(), 1);

    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn init_timeout_schedules_first_backoff() {
    let connector = MockConnector::new();
    connector.device(ADDR_A).push_init(MockStep::Hang);
    let registry = registry(&connector);
    let log = record_states(&registry);
    registry.start().await;

    let config = DeviceConfig::new(ADDR_A, "A");
    registry.add_device(config.clone(), true).await.unwrap();

    let initializing = wait_until(&registry, config.id, |s| s.status == "Initializing...").await;
    assert_eq!(initializing.state, ConnectionState::Connecting);
    assert!(initializing.has_session);

    let retrying = wait_until(&registry, config.id, |s| {
        s.state == ConnectionState::Reconnecting
    })
    .await;
    assert_eq!(retrying.reconnect_attempt, 1);
    assert_eq!(retrying.retry_delay_ms, Some(2000));
    assert!(!retrying.has_session);
    assert_eq!(retrying.status, "Init timed out. Retrying in 2s (attempt 1)");
    assert_eq!(connector.device(ADDR_A).live_links(), 0);

    let states: Vec<ConnectionState> = log.lock().unwrap().iter().map(|(_, s, _)| *s).collect();
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connecting,
            ConnectionState::Reconnecting
        ]
    );

    // the retry uses the default (healthy) script
    wait_until(&registry, config.id, |s| s.state == ConnectionState::Connected).await;
    assert_eq!(connector.device(ADDR_A).connect_attempts(), 2);
    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failure_threshold_reconnects_exactly_once() {
    let connector = MockConnector::new();
    let device = connector.device(ADDR_A);
    for _ in 0..3 {
        device.push_read(MockRead::Fail(TransportError::ReadFailed("no reply".into())));
    }
    let registry = registry(&connector);
    let log = record_states(&registry);
    registry.start().await;
    let config = connected_device(&registry, ADDR_A).await;

    let retrying = wait_until(&registry, config.id, |s| {
        s.state == ConnectionState::Reconnecting
    })
    .await;
    assert_eq!(retrying.reconnect_attempt, 1);
    assert!(retrying.status.starts_with("Read failed. Retrying in 2s"));

    // a late link loss for the torn-down session is ignored
    device.inject(LinkEvent::Lost("Disconnected".into()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    wait_until(&registry, config.id, |s| s.state == ConnectionState::Connected).await;
    assert_eq!(count_state(&log, config.id, ConnectionState::Reconnecting), 1);
    assert_eq!(device.connect_attempts(), 2);
    assert_eq!(device.live_links(), 1);

    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn link_loss_reconnects() {
    let connector = MockConnector::new();
    let registry = registry(&connector);
    registry.start().await;
    let config = connected_device(&registry, ADDR_A).await;

    assert!(connector.device(ADDR_A).inject(LinkEvent::from_status("Disconnected")));
    let retrying = wait_until(&registry, config.id, |s| {
        s.state == ConnectionState::Reconnecting
    })
    .await;
    assert_eq!(retrying.status, "Link lost: Disconnected. Retrying in 2s (attempt 1)");
    assert!(!retrying.has_session);

    let back = wait_until(&registry, config.id, |s| s.state == ConnectionState::Connected).await;
    assert_eq!(back.reconnect_attempt, 0);
    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stopped_device_does_not_reconnect() {
    let connector = MockConnector::new();
    let registry = registry(&connector);
    registry.start().await;
    let config = connected_device(&registry, ADDR_A).await;

    registry.stop().await;
    let device = connector.device(ADDR_A);
    device.inject(LinkEvent::Lost("Disconnected".into()));
    tokio::time::sleep(Duration::from_secs(120)).await;

    let snapshot = registry.snapshot(config.id).await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert!(!snapshot.has_session);
    assert_eq!(device.connect_attempts(), 1);
    assert_eq!(device.live_links(), 0);
    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn removed_device_cancels_pending_retry() {
    let connector = MockConnector::new();
    let device = connector.device(ADDR_A);
    device.push_connect(MockStep::Fail(TransportError::ConnectFailed("busy".into())));
    let registry = registry(&connector);
    registry.start().await;

    let config = DeviceConfig::new(ADDR_A, "A");
    registry.add_device(config.clone(), true).await.unwrap();
    wait_until(&registry, config.id, |s| s.state == ConnectionState::Reconnecting).await;

    registry.remove_device(config.id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(device.connect_attempts(), 1);
    assert!(registry.snapshot(config.id).await.is_none());
}

async fn stalled_in_link_setup(registry: &DeviceRegistry, address: &str) -> DeviceConfig {
    let config = DeviceConfig::new(address, address);
    registry.add_device(config.clone(), true).await.unwrap();
    let opening = wait_until(registry, config.id, |s| s.has_session).await;
    assert_eq!(opening.state, ConnectionState::Connecting);
    config
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_link_setup_closes_transport() {
    let connector = MockConnector::new();
    let device = connector.device(ADDR_A);
    device.push_ready(MockStep::Hang);
    let registry = registry(&connector);
    registry.start().await;
    let config = stalled_in_link_setup(&registry, ADDR_A).await;
    assert_eq!(device.live_links(), 1);

    registry.disconnect(config.id).await.unwrap();
    let snapshot = registry.snapshot(config.id).await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert!(!snapshot.has_session);
    assert_eq!(device.closes(), 1);
    assert_eq!(device.live_links(), 0);
    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn force_reconnect_during_link_setup_keeps_one_transport() {
    let connector = MockConnector::new();
    let device = connector.device(ADDR_A);
    device.push_ready(MockStep::Hang);
    let registry = registry(&connector);
    registry.start().await;
    let config = stalled_in_link_setup(&registry, ADDR_A).await;

    registry.force_reconnect(config.id).await.unwrap();
    wait_until(&registry, config.id, |s| s.state == ConnectionState::Connected).await;
    assert_eq!(device.connect_attempts(), 2);
    assert_eq!(device.closes(), 1);
    assert_eq!(device.live_links(), 1);

    registry.remove_device(config.id).await.unwrap();
    assert_eq!(device.live_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn force_reconnect_all_resets_backoff() {
    let connector = MockConnector::new();
    let b = connector.device(ADDR_B);
    b.push_connect(MockStep::Fail(TransportError::AdapterPoweredOff));
    let registry = registry(&connector);
    registry.start().await;

    let a_config = connected_device(&registry, ADDR_A).await;
    let b_config = DeviceConfig::new(ADDR_B, "B");
    registry.add_device(b_config.clone(), true).await.unwrap();
    let b_retrying = wait_until(&registry, b_config.id, |s| {
        s.state == ConnectionState::Reconnecting
    })
    .await;
    assert_eq!(b_retrying.reconnect_attempt, 1);
    assert!(b_retrying.status.starts_with("Bluetooth off"));

    // keep both devices in Connecting long enough to observe it
    connector.device(ADDR_A).set_latency(Duration::from_secs(1));
    b.set_latency(Duration::from_secs(1));
    registry.force_reconnect_all().await;

    for id in [a_config.id, b_config.id] {
        let snapshot = wait_until(&registry, id, |s| s.state == ConnectionState::Connecting).await;
        assert_eq!(snapshot.reconnect_attempt, 0);
        assert_eq!(snapshot.retry_delay_ms, None);
    }

    for id in [a_config.id, b_config.id] {
        wait_until(&registry, id, |s| s.state == ConnectionState::Connected).await;
    }
    // the cancelled backoff timer of B must not fire a second connect
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(b.connect_attempts(), 2);
    assert_eq!(connector.device(ADDR_A).connect_attempts(), 2);
    assert_eq!(connector.device(ADDR_A).live_links(), 1);
    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn force_reconnect_ignores_idle_devices() {
    let connector = MockConnector::new();
    let registry = registry(&connector);
    let config = DeviceConfig::new(ADDR_A, "A");
    registry.add_device(config.clone(), false).await.unwrap();

    registry.force_reconnect(config.id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(connector.device(ADDR_A).connect_attempts(), 0);
    assert_eq!(
        registry.snapshot(config.id).await.unwrap().state,
        ConnectionState::Disconnected
    );
}

#[tokio::test(start_paused = true)]
async fn idle_states_never_hold_a_session() {
    let connector = MockConnector::new();
    let registry = registry(&connector);
    registry.start().await;
    let good = connected_device(&registry, ADDR_A).await;
    let bad = DeviceConfig::new("not-an-address", "Broken");
    registry.add_device(bad.clone(), true).await.unwrap();

    let violations = Arc::new(Mutex::new(0usize));
    for id in [good.id, bad.id] {
        let mut rx = registry.watch(id).await.unwrap();
        let violations = Arc::clone(&violations);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let s = rx.borrow_and_update().clone();
                if !s.state.may_hold_session() && s.has_session {
                    *violations.lock().unwrap() += 1;
                }
            }
        });
    }

    let error = wait_until(&registry, bad.id, |s| s.state == ConnectionState::Error).await;
    assert!(!error.has_session);

    connector.device(ADDR_A).inject(LinkEvent::Lost("Disconnected".into()));
    wait_until(&registry, good.id, |s| s.state == ConnectionState::Reconnecting).await;
    wait_until(&registry, good.id, |s| s.state == ConnectionState::Connected).await;
    registry.disconnect(good.id).await.unwrap();
    let idle = registry.snapshot(good.id).await.unwrap();
    assert_eq!(idle.state, ConnectionState::Disconnected);
    assert!(!idle.has_session);

    registry.shutdown().await;
    assert_eq!(*violations.lock().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn callbacks_report_states_and_readings() {
    let connector = MockConnector::new();
    connector.device(ADDR_A).set_default_read(MockRead::Realtime {
        count_rate: 5.0,
        dose_rate: 2.5e-5,
    });
    let registry = registry(&connector);
    let states = record_states(&registry);
    let readings: Arc<Mutex<Vec<(DeviceId, f64, f64, i64)>>> = Arc::default();
    let sink = Arc::clone(&readings);
    registry.events().on_reading(move |id, dose, count, ts| {
        sink.lock().unwrap().push((id, dose, count, ts));
    });
    registry.start().await;

    let config = connected_device(&registry, ADDR_A).await;
    wait_until(&registry, config.id, |s| s.last_reading.is_some()).await;
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let seen: Vec<(ConnectionState, String)> = states
        .lock()
        .unwrap()
        .iter()
        .map(|(_, s, status)| (*s, status.clone()))
        .collect();
    assert_eq!(
        seen,
        vec![
            (ConnectionState::Connecting, "Connecting...".to_string()),
            (ConnectionState::Connecting, "Initializing...".to_string()),
            (ConnectionState::Connected, "Connected".to_string()),
        ]
    );

    let readings = readings.lock().unwrap().clone();
    assert!(readings.len() >= 3);
    let (id, dose, count, ts) = readings[0];
    assert_eq!(id, config.id);
    assert!((dose - 0.25).abs() < 1e-6);
    assert!((count - 5.0).abs() < f64::EPSILON);
    assert!(ts > 0);

    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn empty_buffers_escalate_after_staleness_timeout() {
    let connector = MockConnector::new();
    connector.device(ADDR_A).set_default_read(MockRead::Data(Vec::new()));
    let registry = DeviceRegistry::new(
        Arc::new(connector.clone()),
        Arc::new(MemoryDeviceStore::new()),
        PipelineConfig {
            staleness_timeout_secs: 5,
            ..PipelineConfig::default()
        },
    );
    registry.start().await;
    let config = connected_device(&registry, ADDR_A).await;

    let stale = wait_until(&registry, config.id, |s| {
        s.state == ConnectionState::Reconnecting
    })
    .await;
    assert!(stale.status.starts_with("No data for 6s"));
    assert_eq!(stale.consecutive_failures, 0);
    registry.shutdown().await;
}
