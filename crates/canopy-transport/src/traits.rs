//! Transport trait definitions
//!
//! The session layer only sees these traits, so it can run against the BLE
//! transport in production and channel-backed fakes in tests.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Events that can occur on a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// One inbound notification payload
    Data(Bytes),
    /// Connection closed (clean or error)
    Disconnected { reason: Option<String> },
}

/// Trait for sending frames to the instrument
#[async_trait]
pub trait TransportSender: Send + Sync {
    /// Send one frame
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// Trait for receiving transport events
#[async_trait]
pub trait TransportReceiver: Send {
    /// Receive the next event; `None` once the stream is exhausted
    async fn recv(&mut self) -> Option<TransportEvent>;
}
