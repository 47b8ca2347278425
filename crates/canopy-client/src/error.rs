//! Client error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("not connected")]
    NotConnected,

    #[error("session closed before initialization")]
    SessionClosed,

    #[error("protocol error: {0}")]
    Protocol(#[from] canopy_core::Error),

    #[error("transport error: {0}")]
    Transport(#[from] canopy_transport::TransportError),
}
