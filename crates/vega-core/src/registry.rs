//! The set of configured devices.
//!
//! [`DeviceRegistry`] owns one device task per configured device, persists
//! configuration changes through the injected [`DeviceStore`] and fans state
//! and reading callbacks out through a shared [`EventSink`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, RwLock};

use crate::config::{DeviceConfig, DeviceId, PipelineConfig};
use crate::device::{DeviceCommand, DeviceHandle, DeviceSnapshot, DeviceWorker};
use crate::error::{Result, VegaError};
use crate::events::EventSink;
use crate::state::ConnectionState;
use crate::storage::DeviceStore;
use crate::transport::Connector;

/// Registry of device state machines.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceId, DeviceHandle>>,
    connector: Arc<dyn Connector>,
    store: Arc<dyn DeviceStore>,
    pipeline: PipelineConfig,
    events: Arc<EventSink>,
    running: AtomicBool,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("pipeline", &self.pipeline)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl DeviceRegistry {
    /// Creates an empty, stopped registry.
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        store: Arc<dyn DeviceStore>,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            connector,
            store,
            pipeline,
            events: Arc::new(EventSink::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Callback registration point.
    #[must_use]
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Whether [`start`](Self::start) is in effect.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn spawn(&self, config: DeviceConfig) -> DeviceHandle {
        DeviceWorker::spawn(
            config,
            self.pipeline.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.events),
        )
    }

    /// Adds every stored device not yet registered. Enabled devices connect
    /// if the registry is running. Returns how many were added.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn load_from_store(&self) -> Result<usize> {
        let stored = self.store.list()?;
        let running = self.is_running();
        let mut devices = self.devices.write().await;
        let mut added = 0;
        for config in stored {
            if devices.contains_key(&config.id) {
                continue;
            }
            let enabled = config.enabled;
            let id = config.id;
            let handle = self.spawn(config);
            if running && enabled {
                handle.send(DeviceCommand::Connect);
            }
            devices.insert(id, handle);
            added += 1;
        }
        tracing::info!(added, total = devices.len(), "loaded devices from store");
        Ok(added)
    }

    /// Registers and persists a device. With `auto_connect`, an enabled
    /// device starts connecting right away if the registry is running.
    ///
    /// # Errors
    ///
    /// [`VegaError::InvalidDevice`] for unusable fields,
    /// [`VegaError::DeviceAlreadyExists`] for a duplicate id, or a store error.
    pub async fn add_device(&self, config: DeviceConfig, auto_connect: bool) -> Result<DeviceSnapshot> {
        config.validate().map_err(VegaError::invalid_device)?;
        let mut devices = self.devices.write().await;
        if devices.contains_key(&config.id) {
            return Err(VegaError::DeviceAlreadyExists(config.id));
        }
        self.store.save(&config)?;

        let id = config.id;
        let enabled = config.enabled;
        tracing::info!(device_id = %id, address = %config.address, name = %config.name, "device added");
        let handle = self.spawn(config);
        if auto_connect && enabled && self.is_running() {
            handle.send(DeviceCommand::Connect);
        }
        let snapshot = handle.snapshot();
        devices.insert(id, handle);
        Ok(snapshot)
    }

    /// Forgets the device, then tears it down as a user disconnect.
    ///
    /// The store is updated first; if that fails the device stays registered
    /// and untouched.
    ///
    /// # Errors
    ///
    /// [`VegaError::DeviceNotFound`] or a store error.
    pub async fn remove_device(&self, id: DeviceId) -> Result<()> {
        let handle = {
            let mut devices = self.devices.write().await;
            if !devices.contains_key(&id) {
                return Err(VegaError::DeviceNotFound(id));
            }
            self.store.remove(id)?;
            devices.remove(&id).ok_or(VegaError::DeviceNotFound(id))?
        };
        handle.shutdown().await;
        tracing::info!(device_id = %id, "device removed");
        Ok(())
    }

    /// Replaces a device's configuration.
    ///
    /// Disabling disconnects; enabling connects while running; an address
    /// change reconnects; other changes apply without touching the session.
    ///
    /// # Errors
    ///
    /// [`VegaError::DeviceNotFound`], [`VegaError::InvalidDevice`] or a store
    /// error.
    pub async fn update_device(&self, config: DeviceConfig) -> Result<DeviceSnapshot> {
        config.validate().map_err(VegaError::invalid_device)?;
        let devices = self.devices.read().await;
        let handle = devices
            .get(&config.id)
            .ok_or(VegaError::DeviceNotFound(config.id))?;
        let current = handle.snapshot().device;
        let config = DeviceConfig {
            created_at: current.created_at,
            ..config
        };
        self.store.save(&config)?;
        tracing::info!(device_id = %config.id, enabled = config.enabled, "device updated");

        let mut rx = handle.subscribe();
        let expected = config.clone();
        handle.send(DeviceCommand::UpdateConfig {
            config,
            auto_connect: self.is_running(),
        });
        drop(devices);
        // the task acknowledges by publishing the new configuration
        let snapshot = rx
            .wait_for(|s| s.device == expected)
            .await
            .map(|s| (*s).clone())
            .map_err(|_| VegaError::DeviceNotFound(expected.id))?;
        Ok(snapshot)
    }

    /// Connects every enabled device.
    pub async fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        let devices = self.devices.read().await;
        let mut started = 0;
        for handle in devices.values() {
            if handle.snapshot().device.enabled {
                handle.send(DeviceCommand::Connect);
                started += 1;
            }
        }
        tracing::info!(started, total = devices.len(), "registry started");
    }

    /// Disconnects every device and cancels every pending timer.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let devices = self.devices.read().await;
        futures::future::join_all(devices.values().map(|h| h.disconnect())).await;
        tracing::info!(total = devices.len(), "registry stopped");
    }

    async fn with_device<T>(&self, id: DeviceId, f: impl FnOnce(&DeviceHandle) -> T) -> Result<T> {
        let devices = self.devices.read().await;
        devices.get(&id).map(f).ok_or(VegaError::DeviceNotFound(id))
    }

    /// User-initiated connect of one device.
    ///
    /// # Errors
    ///
    /// [`VegaError::DeviceNotFound`].
    pub async fn connect(&self, id: DeviceId) -> Result<()> {
        self.with_device(id, |h| {
            h.send(DeviceCommand::Connect);
        })
        .await
    }

    /// User-initiated disconnect of one device; returns after teardown.
    ///
    /// # Errors
    ///
    /// [`VegaError::DeviceNotFound`].
    pub async fn disconnect(&self, id: DeviceId) -> Result<()> {
        let devices = self.devices.read().await;
        let handle = devices.get(&id).ok_or(VegaError::DeviceNotFound(id))?;
        handle.disconnect().await;
        Ok(())
    }

    /// Resets the backoff of an active device and reconnects it immediately.
    ///
    /// # Errors
    ///
    /// [`VegaError::DeviceNotFound`].
    pub async fn force_reconnect(&self, id: DeviceId) -> Result<()> {
        self.with_device(id, |h| {
            h.send(DeviceCommand::ForceReconnect);
        })
        .await
    }

    /// [`force_reconnect`](Self::force_reconnect) for every device. Used when
    /// the radio adapter powers on.
    pub async fn force_reconnect_all(&self) {
        let devices = self.devices.read().await;
        tracing::info!(total = devices.len(), "forcing reconnect of all devices");
        for handle in devices.values() {
            handle.send(DeviceCommand::ForceReconnect);
        }
    }

    /// Current snapshot of one device.
    pub async fn snapshot(&self, id: DeviceId) -> Option<DeviceSnapshot> {
        self.devices.read().await.get(&id).map(DeviceHandle::snapshot)
    }

    /// Snapshots of all devices, oldest first.
    pub async fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let mut all: Vec<DeviceSnapshot> = self
            .devices
            .read()
            .await
            .values()
            .map(DeviceHandle::snapshot)
            .collect();
        all.sort_by_key(|s| (s.device.created_at, s.device.id));
        all
    }

    /// Subscribes to a device's snapshots.
    pub async fn watch(&self, id: DeviceId) -> Option<watch::Receiver<DeviceSnapshot>> {
        self.devices.read().await.get(&id).map(DeviceHandle::subscribe)
    }

    /// Number of devices in `Connected`.
    pub async fn connected_count(&self) -> usize {
        self.devices
            .read()
            .await
            .values()
            .filter(|h| h.state() == ConnectionState::Connected)
            .count()
    }

    /// Number of registered devices.
    pub async fn total_count(&self) -> usize {
        self.devices.read().await.len()
    }

    /// Whether any device is `Connected`.
    pub async fn any_connected(&self) -> bool {
        self.connected_count().await > 0
    }

    /// Stops every device task and empties the registry. Stored devices are
    /// kept.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handles: Vec<DeviceHandle> = self.devices.write().await.drain().map(|(_, h)| h).collect();
        futures::future::join_all(handles.into_iter().map(DeviceHandle::shutdown)).await;
        tracing::info!("registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::mock::MockConnector;
    use crate::storage::{MemoryDeviceStore, StoreError, StoreResult};

    /// Store whose removals fail, as on a read-only data directory.
    struct PinnedStore(MemoryDeviceStore);

    impl DeviceStore for PinnedStore {
        fn list(&self) -> StoreResult<Vec<DeviceConfig>> {
            self.0.list()
        }

        fn save(&self, device: &DeviceConfig) -> StoreResult<()> {
            self.0.save(device)
        }

        fn remove(&self, _id: DeviceId) -> StoreResult<bool> {
            Err(StoreError::WriteError {
                path: PathBuf::from("devices.json"),
                source: std::io::ErrorKind::PermissionDenied.into(),
            })
        }
    }

    fn registry(store: Arc<MemoryDeviceStore>) -> DeviceRegistry {
        DeviceRegistry::new(
            Arc::new(MockConnector::new()),
            store,
            PipelineConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_persists_and_rejects_duplicates() {
        let store = Arc::new(MemoryDeviceStore::new());
        let registry = registry(Arc::clone(&store));
        let config = DeviceConfig::new("52:43:06:60:12:34", "Kitchen");

        let snapshot = registry.add_device(config.clone(), true).await.unwrap();
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
        assert_eq!(store.list().unwrap(), vec![config.clone()]);
        assert!(matches!(
            registry.add_device(config.clone(), true).await,
            Err(VegaError::DeviceAlreadyExists(_))
        ));

        registry.remove_device(config.id).await.unwrap();
        assert!(store.list().unwrap().is_empty());
        assert_eq!(registry.total_count().await, 0);
        assert!(matches!(
            registry.remove_device(config.id).await,
            Err(VegaError::DeviceNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_store_removal_keeps_device() {
        let store = Arc::new(PinnedStore(MemoryDeviceStore::new()));
        let registry = DeviceRegistry::new(
            Arc::new(MockConnector::new()),
            Arc::clone(&store) as Arc<dyn DeviceStore>,
            PipelineConfig::default(),
        );
        registry.start().await;
        let config = DeviceConfig::new("52:43:06:60:12:34", "Kitchen");
        registry.add_device(config.clone(), true).await.unwrap();
        let mut rx = registry.watch(config.id).await.unwrap();
        rx.wait_for(|s| s.state == ConnectionState::Connected).await.unwrap();

        assert!(matches!(
            registry.remove_device(config.id).await,
            Err(VegaError::PersistenceError(_))
        ));
        assert_eq!(registry.total_count().await, 1);
        assert_eq!(
            registry.snapshot(config.id).await.unwrap().state,
            ConnectionState::Connected
        );
        assert_eq!(store.list().unwrap(), vec![config]);
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_fields_are_rejected() {
        let registry = registry(Arc::new(MemoryDeviceStore::new()));
        let config = DeviceConfig::new("52:43:06:60:12:34", "");
        assert!(matches!(
            registry.add_device(config, true).await,
            Err(VegaError::InvalidDevice(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_from_store_skips_known() {
        let a = DeviceConfig::new("52:43:06:60:12:01", "A");
        let b = DeviceConfig::new("52:43:06:60:12:02", "B").with_enabled(false);
        let store = Arc::new(MemoryDeviceStore::with_devices([a.clone(), b]));
        let registry = registry(store);

        assert_eq!(registry.load_from_store().await.unwrap(), 2);
        assert_eq!(registry.load_from_store().await.unwrap(), 0);
        assert_eq!(registry.total_count().await, 2);

        registry.start().await;
        let mut rx = registry.watch(a.id).await.unwrap();
        rx.wait_for(|s| s.state == ConnectionState::Connected).await.unwrap();
        assert_eq!(registry.connected_count().await, 1);
        assert!(registry.any_connected().await);

        registry.stop().await;
        assert!(!registry.any_connected().await);
        registry.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_keeps_creation_time() {
        let store = Arc::new(MemoryDeviceStore::new());
        let registry = registry(Arc::clone(&store));
        let config = DeviceConfig::new("52:43:06:60:12:34", "Kitchen");
        registry.add_device(config.clone(), false).await.unwrap();

        let mut renamed = config.clone().with_name("Hall").with_color("#112233");
        renamed.created_at = chrono::Utc::now() + chrono::Duration::days(1);
        let snapshot = registry.update_device(renamed).await.unwrap();
        assert_eq!(snapshot.device.name, "Hall");
        assert_eq!(snapshot.device.created_at, config.created_at);
        assert_eq!(store.get(config.id).unwrap().unwrap().name, "Hall");
        assert_eq!(snapshot.state, ConnectionState::Disconnected);
    }
}
