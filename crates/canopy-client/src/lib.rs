//! Canopy Client Library
//!
//! High-level async client for tree-described wireless instruments.
//!
//! # Example
//!
//! ```ignore
//! use canopy_client::{Result, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let session = Session::builder()
//!         .device_name_filter("Mooshimeter")
//!         .connect()
//!         .await?;
//!     session.wait_until_initialized().await?;
//!
//!     session.subscribe("CH1:VALUE", |value| {
//!         println!("CH1 = {value}");
//!     })?;
//!     session.choose("SAMPLING:TRIGGER:CONTINUOUS").await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod session;

pub use config::{SessionBuilder, SessionConfig};
pub use error::{ClientError, Result};
pub use session::Session;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{SessionBuilder, SessionConfig};
    pub use crate::error::{ClientError, Result};
    pub use crate::session::Session;
    pub use canopy_core::{NodeId, NodeType, Value};
}
