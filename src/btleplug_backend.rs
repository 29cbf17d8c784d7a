//! `Transport` backed by btleplug
//!
//! Each request spawns a task on the tokio runtime the transport was created
//! on; completions are reported through the event channel returned by
//! `BtleplugTransport::new`, which the caller pumps into
//! `ConnectionManager::run_events`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::{Outcome, Transport, TransportEvent};
use crate::types::{ChannelId, DeviceIdentity};

/// Status reported when a request fails inside btleplug
const BACKEND_FAILURE: i32 = -1;

#[derive(Debug, Clone)]
pub struct BtleplugConfig {
    pub service_uuid: Uuid,
    pub scan_timeout: Duration,
    pub poll_interval: Duration,
    pub event_queue_capacity: usize,
}

impl Default for BtleplugConfig {
    fn default() -> Self {
        Self {
            service_uuid: crate::config::DEFAULT_SERVICE_UUID,
            scan_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            event_queue_capacity: 1024,
        }
    }
}

#[derive(Default)]
struct Tasks {
    peripheral: Option<Peripheral>,
    connect: Option<JoinHandle<()>>,
    notifications: Option<JoinHandle<()>>,
    watch: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for handle in [
            self.connect.take(),
            self.notifications.take(),
            self.watch.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

pub struct BtleplugTransport {
    adapter: Adapter,
    config: BtleplugConfig,
    events: mpsc::Sender<TransportEvent>,
    runtime: Handle,
    tasks: Arc<Mutex<Tasks>>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(
        config: BtleplugConfig,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| TransportError::Backend(e.to_string()))?
            .into_iter()
            .next()
            .ok_or(TransportError::AdapterUnavailable)?;
        let (events, rx) = mpsc::channel(config.event_queue_capacity);

        Ok((
            Self {
                adapter,
                config,
                events,
                runtime: Handle::current(),
                tasks: Arc::new(Mutex::new(Tasks::default())),
            },
            rx,
        ))
    }

    fn current_peripheral(&self) -> Option<Peripheral> {
        self.tasks.lock().ok().and_then(|t| t.peripheral.clone())
    }
}

impl Transport for BtleplugTransport {
    fn is_enabled(&self) -> bool {
        true
    }

    fn connect(
        &self,
        identity: &DeviceIdentity,
        auto_reconnect: bool,
    ) -> Result<(), TransportError> {
        if auto_reconnect {
            debug!("btleplug has no auto-connect mode, relying on reconnect timer");
        }
        let mut tasks = self
            .tasks
            .lock()
            .map_err(|_| TransportError::DispatchFailed("transport lock poisoned".to_string()))?;
        tasks.abort_all();

        let adapter = self.adapter.clone();
        let config = self.config.clone();
        let events = self.events.clone();
        let shared = self.tasks.clone();
        let address = identity.as_str().to_string();

        tasks.connect = Some(self.runtime.spawn(async move {
            match find_and_connect(&adapter, &config, &address).await {
                Ok(peripheral) => {
                    info!(address = %address, "peripheral connected");
                    let watch = tokio::spawn(watch_disconnect(
                        adapter,
                        peripheral.clone(),
                        events.clone(),
                    ));
                    if let Ok(mut tasks) = shared.lock() {
                        tasks.peripheral = Some(peripheral);
                        tasks.watch = Some(watch);
                    }
                    let _ = events.send(TransportEvent::LinkEstablished).await;
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "connection failed");
                    let _ = events.send(TransportEvent::LinkLost).await;
                }
            }
        }));
        Ok(())
    }

    fn request_larger_unit(&self, size: u16) -> bool {
        debug!(size, "btleplug does not expose MTU negotiation");
        false
    }

    fn discover_channels(&self) -> Result<(), TransportError> {
        let peripheral = self
            .current_peripheral()
            .ok_or_else(|| TransportError::DispatchFailed("not connected".to_string()))?;
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let outcome = match peripheral.discover_services().await {
                Ok(()) => Outcome::Success,
                Err(e) => {
                    warn!(error = %e, "service discovery failed");
                    Outcome::Failure(BACKEND_FAILURE)
                }
            };
            let _ = events
                .send(TransportEvent::ChannelsDiscovered { outcome })
                .await;
        });
        Ok(())
    }

    fn enable_notifications(&self, channel: &ChannelId) -> Result<(), TransportError> {
        let peripheral = self
            .current_peripheral()
            .ok_or_else(|| TransportError::DispatchFailed("not connected".to_string()))?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == channel.characteristic && c.service_uuid == channel.service)
            .ok_or_else(|| {
                TransportError::Backend(format!(
                    "characteristic {} not found",
                    channel.characteristic
                ))
            })?;

        let events = self.events.clone();
        let handle = self.runtime.spawn(async move {
            if let Err(e) = peripheral.subscribe(&characteristic).await {
                warn!(error = %e, "subscribe failed");
                return;
            }
            let mut stream = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "notification stream unavailable");
                    return;
                }
            };
            while let Some(notification) = stream.next().await {
                if notification.uuid != characteristic.uuid {
                    continue;
                }
                if events
                    .send(TransportEvent::DataReceived(notification.value))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            debug!("notification stream ended");
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(previous) = tasks.notifications.replace(handle) {
                previous.abort();
            }
        }
        Ok(())
    }

    fn close(&self) {
        let peripheral = match self.tasks.lock() {
            Ok(mut tasks) => {
                tasks.abort_all();
                tasks.peripheral.take()
            }
            Err(_) => None,
        };
        if let Some(peripheral) = peripheral {
            self.runtime.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!(error = %e, "disconnect on close failed");
                }
            });
        }
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.abort_all();
        }
    }
}

async fn find_and_connect(
    adapter: &Adapter,
    config: &BtleplugConfig,
    address: &str,
) -> Result<Peripheral, TransportError> {
    adapter
        .start_scan(ScanFilter {
            services: vec![config.service_uuid],
        })
        .await
        .map_err(|e| TransportError::Backend(e.to_string()))?;

    let found = tokio::time::timeout(config.scan_timeout, async {
        loop {
            if let Ok(peripherals) = adapter.peripherals().await {
                if let Some(p) = peripherals
                    .into_iter()
                    .find(|p| p.address().to_string().eq_ignore_ascii_case(address))
                {
                    return p;
                }
            }
            tokio::time::sleep(config.poll_interval).await;
        }
    })
    .await;
    let _ = adapter.stop_scan().await;

    let peripheral = found.map_err(|_| TransportError::DeviceNotFound(address.to_string()))?;
    peripheral
        .connect()
        .await
        .map_err(|e| TransportError::Backend(e.to_string()))?;
    Ok(peripheral)
}

async fn watch_disconnect(
    adapter: Adapter,
    peripheral: Peripheral,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut central_events = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "cannot watch adapter events");
            return;
        }
    };
    let id = peripheral.id();
    while let Some(event) = central_events.next().await {
        if let CentralEvent::DeviceDisconnected(disconnected) = event {
            if disconnected == id {
                info!("peripheral disconnected");
                let _ = events.send(TransportEvent::LinkLost).await;
                return;
            }
        }
    }
}
