//! Bluetooth Low Energy transport
//!
//! The instrument exposes a serial-over-GATT service with two
//! characteristics: one the host writes frames to, one that streams
//! notifications back. Every notification carries at most 20 bytes.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{TransportEvent, TransportReceiver, TransportSender};

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use uuid::Uuid;

/// Serial-over-GATT service advertised by the instrument
pub const INSTRUMENT_SERVICE_UUID: Uuid = Uuid::from_u128(0x1BC5FFA0_0200_62AB_E411_F254E005DBD4);

/// Characteristic the host writes frames to
pub const SERIAL_IN_UUID: Uuid = Uuid::from_u128(0x1BC5FFA1_0200_62AB_E411_F254E005DBD4);

/// Characteristic the instrument notifies frames on
pub const SERIAL_OUT_UUID: Uuid = Uuid::from_u128(0x1BC5FFA2_0200_62AB_E411_F254E005DBD4);

/// BLE transport configuration
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Device name filter applied on top of the service UUID match
    pub device_name_filter: Option<String>,
    /// How long to scan before giving up
    pub scan_timeout: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            device_name_filter: None,
            scan_timeout: Duration::from_secs(10),
        }
    }
}

/// BLE transport bound to one local adapter
pub struct BleTransport {
    config: BleConfig,
    adapter: Adapter,
}

impl BleTransport {
    pub async fn new() -> Result<Self> {
        Self::with_config(BleConfig::default()).await
    }

    pub async fn with_config(config: BleConfig) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("BLE manager error: {e}")))?;

        let adapter = manager
            .adapters()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("adapter enumeration: {e}")))?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        info!("BLE adapter initialized");
        Ok(Self { config, adapter })
    }

    /// Find an instrument: check devices the adapter already knows, then
    /// scan for the service UUID until one appears or the timeout elapses.
    ///
    /// The timeout is terminal; callers decide whether to retry.
    pub async fn find_instrument(&self) -> Result<BleDevice> {
        if let Some(device) = self.known_instrument().await? {
            info!(name = ?device.name, "instrument already known to adapter");
            return Ok(device);
        }

        info!(timeout = ?self.config.scan_timeout, "scanning for instrument");
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("event stream: {e}")))?;

        self.adapter
            .start_scan(ScanFilter {
                services: vec![INSTRUMENT_SERVICE_UUID],
            })
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("scan failed: {e}")))?;

        let found = tokio::time::timeout(self.config.scan_timeout, async {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDiscovered(id) = event {
                    let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                        continue;
                    };
                    if let Some(device) = self.match_instrument(peripheral).await {
                        return Some(device);
                    }
                }
            }
            None
        })
        .await;

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("stop scan failed: {e}");
        }

        match found {
            Ok(Some(device)) => Ok(device),
            Ok(None) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                warn!("no instrument found within {:?}", self.config.scan_timeout);
                Err(TransportError::ScanTimeout)
            }
        }
    }

    async fn known_instrument(&self) -> Result<Option<BleDevice>> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("peripheral list: {e}")))?;
        for peripheral in peripherals {
            if let Some(device) = self.match_instrument(peripheral).await {
                return Ok(Some(device));
            }
        }
        Ok(None)
    }

    /// Keep a peripheral only if it advertises the instrument service and
    /// passes the optional name filter.
    async fn match_instrument(&self, peripheral: Peripheral) -> Option<BleDevice> {
        let props = peripheral.properties().await.ok()??;
        if !props
            .services
            .iter()
            .any(|uuid| *uuid == INSTRUMENT_SERVICE_UUID)
        {
            return None;
        }
        if let Some(filter) = &self.config.device_name_filter {
            if !props
                .local_name
                .as_deref()
                .is_some_and(|n| n.contains(filter.as_str()))
            {
                return None;
            }
        }
        Some(BleDevice {
            name: props.local_name,
            address: props.address.to_string(),
            rssi: props.rssi,
            peripheral,
        })
    }

    /// Connect and wire up the serial characteristics. Notifications start
    /// flowing through the returned receiver immediately.
    pub async fn connect(&self, device: &BleDevice) -> Result<(BleSender, BleReceiver)> {
        info!(name = ?device.name, address = %device.address, "connecting to instrument");

        device
            .peripheral
            .connect()
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("connect failed: {e}")))?;

        device.peripheral.discover_services().await.map_err(|e| {
            TransportError::ConnectionFailed(format!("service discovery failed: {e}"))
        })?;

        let chars = device.peripheral.characteristics();
        let serial_in = chars
            .iter()
            .find(|c| c.uuid == SERIAL_IN_UUID)
            .cloned()
            .ok_or(TransportError::CharacteristicMissing("serial in"))?;
        let serial_out = chars
            .iter()
            .find(|c| c.uuid == SERIAL_OUT_UUID)
            .cloned()
            .ok_or(TransportError::CharacteristicMissing("serial out"))?;

        device
            .peripheral
            .subscribe(&serial_out)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("subscribe failed: {e}")))?;

        let (tx, rx) = mpsc::channel(100);
        let peripheral = device.peripheral.clone();
        let connected = Arc::new(Mutex::new(true));
        let connected_task = connected.clone();

        tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(n) => n,
                Err(e) => {
                    error!("notification stream unavailable: {e}");
                    return;
                }
            };

            while let Some(data) = notifications.next().await {
                if data.uuid == SERIAL_OUT_UUID {
                    debug!(len = data.value.len(), "notification");
                    let bytes = Bytes::copy_from_slice(&data.value);
                    if tx.send(TransportEvent::Data(bytes)).await.is_err() {
                        break;
                    }
                }
            }

            *connected_task.lock() = false;
            let _ = tx.send(TransportEvent::Disconnected { reason: None }).await;
        });

        let sender = BleSender {
            peripheral: device.peripheral.clone(),
            serial_in,
            connected,
        };
        let receiver = BleReceiver { rx };

        info!(name = ?device.name, "instrument connected");
        Ok((sender, receiver))
    }
}

/// Discovered instrument
pub struct BleDevice {
    /// Advertised name, if any
    pub name: Option<String>,
    /// Adapter-specific device address
    pub address: String,
    /// Signal strength at discovery time
    pub rssi: Option<i16>,
    peripheral: Peripheral,
}

/// Writes frames to the instrument's serial-in characteristic
pub struct BleSender {
    peripheral: Peripheral,
    serial_in: Characteristic,
    connected: Arc<Mutex<bool>>,
}

#[async_trait]
impl TransportSender for BleSender {
    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        self.peripheral
            .write(&self.serial_in, &data, WriteType::WithResponse)
            .await
            .map_err(|e| TransportError::SendFailed(format!("BLE write failed: {e}")))?;

        debug!(len = data.len(), "frame written");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected.lock()
    }

    async fn close(&self) -> Result<()> {
        *self.connected.lock() = false;
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| TransportError::SendFailed(format!("disconnect failed: {e}")))?;
        Ok(())
    }
}

/// Receives inbound notifications as transport events
pub struct BleReceiver {
    rx: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
impl TransportReceiver for BleReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}
