//! BLE central abstraction and the btleplug-backed implementation.
//!
//! The connection manager talks to hardware only through [`BleCentral`],
//! so tests can substitute a deterministic mock central.

use crate::sensors::gatt::{
    HEART_RATE_MEASUREMENT_UUID, HEART_RATE_SERVICE_UUID, RSC_MEASUREMENT_UUID, RSC_SERVICE_UUID,
};
use crate::sensors::types::{DiscoveredDevice, SensorConfig, SensorError};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use uuid::Uuid;

/// Hardware-side events funneled into the connection manager's run loop.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// A device matching the discovery filter appeared
    DeviceDiscovered(DiscoveredDevice),
    /// An established link dropped
    DeviceDisconnected {
        /// Identifier of the dropped device
        device_id: String,
    },
    /// A subscribed characteristic notified a new payload
    Notification {
        /// Identifier of the notifying device
        device_id: String,
        /// Characteristic UUID
        characteristic: Uuid,
        /// Raw payload bytes
        payload: Vec<u8>,
    },
}

/// Platform BLE central role: scanning, connecting, subscribing.
///
/// Implementations push all asynchronous hardware callbacks through the
/// event channel handed out by [`BleCentral::take_events`].
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Begin a discovery scan.
    async fn start_scan(&self) -> Result<(), SensorError>;

    /// Stop an in-progress discovery scan.
    async fn stop_scan(&self) -> Result<(), SensorError>;

    /// Connect to a device and subscribe to the heart-rate and RSC
    /// measurement characteristics. Returns the device display name.
    async fn connect(&self, device_id: &str) -> Result<String, SensorError>;

    /// Disconnect from a device.
    async fn disconnect(&self, device_id: &str) -> Result<(), SensorError>;

    /// Take the adapter event receiver. Yields `None` after the first call.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<AdapterEvent>>;
}

/// [`BleCentral`] implementation over btleplug.
pub struct BtleplugCentral {
    adapter: Adapter,
    config: SensorConfig,
    event_tx: mpsc::UnboundedSender<AdapterEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<AdapterEvent>>,
    connected: Arc<Mutex<HashMap<String, Peripheral>>>,
}

impl BtleplugCentral {
    /// Initialize the first available Bluetooth adapter and start the
    /// central event pump.
    pub async fn new(config: SensorConfig) -> Result<Self, SensorError> {
        let manager = Manager::new()
            .await
            .map_err(|e| SensorError::BluetoothUnavailable(e.to_string()))?;

        let adapters = manager
            .adapters()
            .await
            .map_err(|e| SensorError::BluetoothUnavailable(e.to_string()))?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(SensorError::AdapterNotFound)?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let central = Self {
            adapter,
            config,
            event_tx,
            event_rx: Some(event_rx),
            connected: Arc::new(Mutex::new(HashMap::new())),
        };
        central.spawn_event_pump().await?;

        tracing::info!("BLE adapter initialized");
        Ok(central)
    }

    /// Forward adapter-level central events into the manager's channel.
    async fn spawn_event_pump(&self) -> Result<(), SensorError> {
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?;

        let adapter = self.adapter.clone();
        let config = self.config.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        let peripherals = match adapter.peripherals().await {
                            Ok(p) => p,
                            Err(_) => continue,
                        };
                        for peripheral in peripherals {
                            if peripheral.id() != id {
                                continue;
                            }
                            if let Some(device) = classify_peripheral(&peripheral, &config).await {
                                if event_tx
                                    .send(AdapterEvent::DeviceDiscovered(device))
                                    .is_err()
                                {
                                    return;
                                }
                            }
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        if event_tx
                            .send(AdapterEvent::DeviceDisconnected {
                                device_id: id.to_string(),
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    _ => {}
                }
            }
        });

        Ok(())
    }

    async fn find_peripheral(&self, device_id: &str) -> Result<Peripheral, SensorError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?;

        peripherals
            .into_iter()
            .find(|p| p.id().to_string() == device_id)
            .ok_or_else(|| SensorError::DeviceNotFound(device_id.to_string()))
    }
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    async fn start_scan(&self) -> Result<(), SensorError> {
        // Unfiltered scan; matching by name pattern, advertised service and
        // manufacturer ID happens in classify_peripheral.
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| SensorError::ScanFailed(e.to_string()))
    }

    async fn stop_scan(&self) -> Result<(), SensorError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| SensorError::ScanFailed(e.to_string()))
    }

    async fn connect(&self, device_id: &str) -> Result<String, SensorError> {
        let peripheral = self.find_peripheral(device_id).await?;

        timeout(
            Duration::from_secs(self.config.connection_timeout_secs),
            peripheral.connect(),
        )
        .await
        .map_err(|_| SensorError::ConnectionTimeout)?
        .map_err(|e| SensorError::ConnectionFailed(e.to_string()))?;

        peripheral
            .discover_services()
            .await
            .map_err(|e| SensorError::ConnectionFailed(e.to_string()))?;

        let mut subscribed = 0usize;
        for characteristic in peripheral.characteristics() {
            if characteristic.uuid == HEART_RATE_MEASUREMENT_UUID
                || characteristic.uuid == RSC_MEASUREMENT_UUID
            {
                peripheral
                    .subscribe(&characteristic)
                    .await
                    .map_err(|e| SensorError::SubscriptionFailed(e.to_string()))?;
                subscribed += 1;
                tracing::debug!("Subscribed to characteristic {}", characteristic.uuid);
            }
        }
        if subscribed == 0 {
            return Err(SensorError::SubscriptionFailed(
                "no heart-rate or RSC measurement characteristic".to_string(),
            ));
        }

        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.local_name)
            .unwrap_or_else(|| device_id.to_string());

        // Forward notifications until the link drops.
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| SensorError::BleError(e.to_string()))?;
        let event_tx = self.event_tx.clone();
        let notify_device_id = device_id.to_string();

        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let forwarded = event_tx.send(AdapterEvent::Notification {
                    device_id: notify_device_id.clone(),
                    characteristic: notification.uuid,
                    payload: notification.value,
                });
                if forwarded.is_err() {
                    return;
                }
            }
            // Stream end means the peripheral dropped the link.
            let _ = event_tx.send(AdapterEvent::DeviceDisconnected {
                device_id: notify_device_id,
            });
        });

        self.connected
            .lock()
            .await
            .insert(device_id.to_string(), peripheral);

        Ok(name)
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), SensorError> {
        if let Some(peripheral) = self.connected.lock().await.remove(device_id) {
            peripheral
                .disconnect()
                .await
                .map_err(|e| SensorError::BleError(e.to_string()))?;
        }
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<AdapterEvent>> {
        self.event_rx.take()
    }
}

/// Apply the discovery filter to an advertising peripheral.
///
/// A device qualifies when it advertises one of the measurement services,
/// its name contains a configured vendor pattern, or its manufacturer data
/// carries a configured manufacturer ID.
async fn classify_peripheral(
    peripheral: &Peripheral,
    config: &SensorConfig,
) -> Option<DiscoveredDevice> {
    let properties = peripheral.properties().await.ok()??;

    let name = properties
        .local_name
        .clone()
        .unwrap_or_else(|| "Unknown Sensor".to_string());

    let has_heart_rate = properties.services.contains(&HEART_RATE_SERVICE_UUID);
    let has_cadence = properties.services.contains(&RSC_SERVICE_UUID);

    let name_lower = name.to_lowercase();
    let vendor_match = config
        .vendor_name_patterns
        .iter()
        .any(|pattern| name_lower.contains(&pattern.to_lowercase()))
        || config
            .vendor_manufacturer_ids
            .iter()
            .any(|id| properties.manufacturer_data.contains_key(id));

    if !has_heart_rate && !has_cadence && !vendor_match {
        return None;
    }

    Some(DiscoveredDevice {
        device_id: peripheral.id().to_string(),
        name,
        signal_strength: properties.rssi,
        has_heart_rate,
        has_cadence,
        vendor_match,
        last_seen: Instant::now(),
    })
}
