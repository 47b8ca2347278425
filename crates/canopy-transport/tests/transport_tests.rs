//! Transport surface tests
//!
//! BLE itself needs hardware, so these cover the pieces that do not: the
//! well-known UUIDs and the trait surface the session layer depends on.

use async_trait::async_trait;
use bytes::Bytes;
use canopy_transport::{
    BleConfig, Result, TransportEvent, TransportReceiver, TransportSender,
    INSTRUMENT_SERVICE_UUID, SERIAL_IN_UUID, SERIAL_OUT_UUID,
};
use std::time::Duration;
use tokio::sync::mpsc;

#[test]
fn serial_characteristics_live_under_the_service() {
    assert_eq!(
        INSTRUMENT_SERVICE_UUID.to_string(),
        "1bc5ffa0-0200-62ab-e411-f254e005dbd4"
    );
    // the characteristics differ from the service only in the last byte of
    // the first field
    let base = INSTRUMENT_SERVICE_UUID.as_u128();
    assert_eq!(SERIAL_IN_UUID.as_u128(), base | (0x1 << 96));
    assert_eq!(SERIAL_OUT_UUID.as_u128(), base | (0x2 << 96));
}

#[test]
fn default_scan_timeout_is_ten_seconds() {
    let config = BleConfig::default();
    assert_eq!(config.scan_timeout, Duration::from_secs(10));
    assert!(config.device_name_filter.is_none());
}

struct ChannelSender {
    tx: mpsc::Sender<Bytes>,
}

#[async_trait]
impl TransportSender for ChannelSender {
    async fn send(&self, data: Bytes) -> Result<()> {
        self.tx
            .send(data)
            .await
            .map_err(|_| canopy_transport::TransportError::NotConnected)
    }

    fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct ChannelReceiver {
    rx: mpsc::Receiver<TransportEvent>,
}

#[async_trait]
impl TransportReceiver for ChannelReceiver {
    async fn recv(&mut self) -> Option<TransportEvent> {
        self.rx.recv().await
    }
}

/// The traits stay object-safe and usable behind Box<dyn ...>, which is how
/// the session layer holds them.
#[tokio::test]
async fn traits_are_object_safe_over_channels() {
    let (data_tx, mut data_rx) = mpsc::channel(8);
    let (event_tx, event_rx) = mpsc::channel(8);

    let sender: Box<dyn TransportSender> = Box::new(ChannelSender { tx: data_tx });
    let mut receiver: Box<dyn TransportReceiver> = Box::new(ChannelReceiver { rx: event_rx });

    sender.send(Bytes::from_static(&[0x00, 0x01])).await.unwrap();
    assert_eq!(data_rx.recv().await.unwrap(), Bytes::from_static(&[0x00, 0x01]));
    assert!(sender.is_connected());

    event_tx
        .send(TransportEvent::Data(Bytes::from_static(&[0x42])))
        .await
        .unwrap();
    match receiver.recv().await {
        Some(TransportEvent::Data(b)) => assert_eq!(b.as_ref(), &[0x42]),
        other => panic!("unexpected event: {other:?}"),
    }

    event_tx
        .send(TransportEvent::Disconnected { reason: None })
        .await
        .unwrap();
    drop(event_tx);
    assert!(matches!(
        receiver.recv().await,
        Some(TransportEvent::Disconnected { .. })
    ));
    assert!(receiver.recv().await.is_none());
}
