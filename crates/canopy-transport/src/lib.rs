//! Canopy Transport Layer
//!
//! BLE transport for canopy instruments. The instrument speaks a
//! serial-over-GATT protocol: the host writes 20-byte frames to one
//! characteristic and receives 20-byte notifications on another.
//!
//! The [`TransportSender`] / [`TransportReceiver`] traits decouple the
//! session layer from the radio, so it can be driven by fakes in tests.

pub mod ble;
pub mod error;
pub mod traits;

pub use ble::{
    BleConfig, BleDevice, BleReceiver, BleSender, BleTransport, INSTRUMENT_SERVICE_UUID,
    SERIAL_IN_UUID, SERIAL_OUT_UUID,
};
pub use error::{Result, TransportError};
pub use traits::{TransportEvent, TransportReceiver, TransportSender};
