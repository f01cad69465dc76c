//! BlueZ transport (Linux, feature `bluetooth`).
//!
//! [`BluezConnector`] opens GATT links to RadiaCode-class detectors through
//! `bluer`. Requests go to the write characteristic in 18-byte chunks;
//! responses arrive on the notify characteristic and are reassembled by
//! [`ResponseMatcher`].

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
};
use chrono::Utc;
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{
    check_write_sfr, parse_virtual_string, set_time_args, write_sfr_args, Command, RequestEncoder,
    ResponseMatcher, EXCHANGE_ARGS, VSFR_DEVICE_TIME, VS_DATA_BUF,
};
use crate::transport::{
    Connector, Link, LinkEvent, OpenedLink, TransportError, TransportResult,
};

/// GATT service exposing the command channel.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xe632_15e5_7003_49d8_96b0_b024_798f_b901);

/// Characteristic requests are written to.
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0xe632_15e6_7003_49d8_96b0_b024_798f_b901);

/// Characteristic responses are notified on.
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0xe632_15e7_7003_49d8_96b0_b024_798f_b901);

const SERVICES_POLL: Duration = Duration::from_millis(100);

type Notifications = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

fn bt_err(wrap: fn(String) -> TransportError) -> impl Fn(bluer::Error) -> TransportError {
    move |e| wrap(e.to_string())
}

/// Opens links through the system's default adapter.
#[derive(Debug, Clone)]
pub struct BluezConnector {
    adapter: Adapter,
}

impl BluezConnector {
    /// Connects to BlueZ and picks the default adapter.
    ///
    /// # Errors
    ///
    /// [`TransportError::AdapterUnavailable`] if BlueZ or the adapter is missing.
    pub async fn new() -> TransportResult<Self> {
        let session = bluer::Session::new()
            .await
            .map_err(bt_err(TransportError::AdapterUnavailable))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(bt_err(TransportError::AdapterUnavailable))?;
        tracing::info!(adapter = adapter.name(), "using Bluetooth adapter");
        Ok(Self { adapter })
    }

    /// Whether the adapter is powered.
    ///
    /// # Errors
    ///
    /// [`TransportError::AdapterUnavailable`] if the adapter went away.
    pub async fn is_powered(&self) -> TransportResult<bool> {
        self.adapter
            .is_powered()
            .await
            .map_err(bt_err(TransportError::AdapterUnavailable))
    }

    /// Streams adapter power changes (`true` = powered on).
    ///
    /// # Errors
    ///
    /// [`TransportError::AdapterUnavailable`] if the event stream cannot be opened.
    pub async fn power_changes(&self) -> TransportResult<mpsc::UnboundedReceiver<bool>> {
        let events = self
            .adapter
            .events()
            .await
            .map_err(bt_err(TransportError::AdapterUnavailable))?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut events = std::pin::pin!(events);
            while let Some(event) = events.next().await {
                if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    tracing::info!(powered, "adapter power changed");
                    if tx.send(powered).is_err() {
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }
}

#[async_trait]
impl Connector for BluezConnector {
    async fn connect(&self, address: &str) -> TransportResult<OpenedLink> {
        let parsed: Address = address
            .parse()
            .map_err(|_| TransportError::InvalidAddress(address.to_string()))?;
        if !self.is_powered().await? {
            return Err(TransportError::AdapterPoweredOff);
        }

        let device = self
            .adapter
            .device(parsed)
            .map_err(bt_err(TransportError::ConnectFailed))?;
        let connected = device
            .is_connected()
            .await
            .map_err(bt_err(TransportError::ConnectFailed))?;
        if !connected {
            tracing::debug!(address, "connecting");
            device
                .connect()
                .await
                .map_err(bt_err(TransportError::ConnectFailed))?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = spawn_device_watcher(&device, tx).await?;
        Ok(OpenedLink {
            link: Box::new(BluezLink {
                device,
                watcher: Some(watcher),
                write: None,
                notifications: None,
                encoder: RequestEncoder::new(),
            }),
            events: rx,
        })
    }
}

async fn spawn_device_watcher(
    device: &Device,
    tx: mpsc::UnboundedSender<LinkEvent>,
) -> TransportResult<JoinHandle<()>> {
    let events = device
        .events()
        .await
        .map_err(bt_err(TransportError::ConnectFailed))?;
    Ok(tokio::spawn(async move {
        let mut events = std::pin::pin!(events);
        while let Some(DeviceEvent::PropertyChanged(property)) = events.next().await {
            let event = match property {
                DeviceProperty::Connected(false) => LinkEvent::from_status("Disconnected"),
                DeviceProperty::ServicesResolved(resolved) => {
                    LinkEvent::Status(format!("Services resolved: {resolved}"))
                }
                _ => continue,
            };
            if tx.send(event).is_err() {
                break;
            }
        }
    }))
}

struct BluezLink {
    device: Device,
    watcher: Option<JoinHandle<()>>,
    write: Option<Characteristic>,
    notifications: Option<Notifications>,
    encoder: RequestEncoder,
}

async fn wait_services_resolved(device: &Device) -> TransportResult<()> {
    loop {
        let resolved = device
            .is_services_resolved()
            .await
            .map_err(bt_err(TransportError::DiscoveryFailed))?;
        if resolved {
            return Ok(());
        }
        tokio::time::sleep(SERVICES_POLL).await;
    }
}

async fn find_characteristics(device: &Device) -> TransportResult<(Characteristic, Characteristic)> {
    let discovery = bt_err(TransportError::DiscoveryFailed);
    for service in device.services().await.map_err(&discovery)? {
        if service.uuid().await.map_err(&discovery)? != SERVICE_UUID {
            continue;
        }
        let mut write = None;
        let mut notify = None;
        for characteristic in service.characteristics().await.map_err(&discovery)? {
            match characteristic.uuid().await.map_err(&discovery)? {
                uuid if uuid == WRITE_CHAR_UUID => write = Some(characteristic),
                uuid if uuid == NOTIFY_CHAR_UUID => notify = Some(characteristic),
                _ => {}
            }
        }
        return match (write, notify) {
            (Some(write), Some(notify)) => Ok((write, notify)),
            _ => Err(TransportError::DiscoveryFailed(
                "command characteristics missing".into(),
            )),
        };
    }
    Err(TransportError::DiscoveryFailed(format!(
        "service {SERVICE_UUID} not found"
    )))
}

impl BluezLink {
    /// Sends one request and returns the response payload after the echoed
    /// header.
    async fn execute(&mut self, command: Command, args: &[u8]) -> TransportResult<Vec<u8>> {
        let (Some(write), Some(notifications)) = (&self.write, &mut self.notifications) else {
            return Err(TransportError::Closed);
        };
        // leftovers of a request abandoned by a read timeout
        let mut stale = 0usize;
        while let Some(Some(_)) = notifications.next().now_or_never() {
            stale += 1;
        }
        if stale > 0 {
            tracing::debug!(stale, "discarded queued notifications");
        }

        let request = self.encoder.encode(command, args);
        for chunk in request.chunks() {
            write
                .write(chunk)
                .await
                .map_err(bt_err(TransportError::ReadFailed))?;
        }

        let mut matcher = ResponseMatcher::new(request.header);
        loop {
            let chunk = notifications.next().await.ok_or(TransportError::Closed)?;
            if let Some(payload) = matcher.push(&chunk)? {
                return Ok(payload);
            }
        }
    }
}

fn as_init_error(err: TransportError) -> TransportError {
    match err {
        TransportError::Protocol(msg) | TransportError::ReadFailed(msg) => {
            TransportError::InitFailed(msg)
        }
        other => other,
    }
}

#[async_trait]
impl Link for BluezLink {
    async fn ready(&mut self) -> TransportResult<()> {
        wait_services_resolved(&self.device).await?;
        let (write, notify) = find_characteristics(&self.device).await?;
        let notifications = notify
            .notify()
            .await
            .map_err(bt_err(TransportError::DiscoveryFailed))?;
        self.write = Some(write);
        self.notifications = Some(Box::pin(notifications));
        Ok(())
    }

    async fn initialize(&mut self) -> TransportResult<()> {
        self.execute(Command::SetExchange, &EXCHANGE_ARGS)
            .await
            .map_err(as_init_error)?;
        self.execute(Command::SetTime, &set_time_args(Utc::now()))
            .await
            .map_err(as_init_error)?;
        let reply = self
            .execute(Command::WriteVirtualSfr, &write_sfr_args(VSFR_DEVICE_TIME, 0))
            .await
            .map_err(as_init_error)?;
        check_write_sfr(&reply).map_err(as_init_error)
    }

    async fn read_data_buf(&mut self) -> TransportResult<Vec<u8>> {
        let reply = self
            .execute(Command::ReadVirtualString, &VS_DATA_BUF.to_le_bytes())
            .await?;
        parse_virtual_string(&reply)
    }

    async fn close(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.notifications = None;
        self.write = None;
        if let Err(e) = self.device.disconnect().await {
            tracing::debug!(error = %e, "disconnect failed");
        }
    }
}

impl Drop for BluezLink {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gatt_uuids() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "e63215e5-7003-49d8-96b0-b024798fb901"
        );
        assert_eq!(
            WRITE_CHAR_UUID.to_string(),
            "e63215e6-7003-49d8-96b0-b024798fb901"
        );
        assert_eq!(
            NOTIFY_CHAR_UUID.to_string(),
            "e63215e7-7003-49d8-96b0-b024798fb901"
        );
    }

    #[test]
    fn test_init_errors_are_relabelled() {
        assert_eq!(
            as_init_error(TransportError::Protocol("echo".into())),
            TransportError::InitFailed("echo".into())
        );
        assert_eq!(as_init_error(TransportError::Closed), TransportError::Closed);
    }
}
