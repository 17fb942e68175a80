//! Error types for the podlink service.
//!
//! Every fallible operation in the crate returns [`PodError`]. Protocol
//! decoding has its own error type in [`crate::airpods::parser::ProtoError`]
//! since malformed packets never escape the receive loop.

use bluer::Address;
use thiserror::Error;

/// Main error type for the podlink service.
#[derive(Error, Debug)]
pub enum PodError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("No active AAP session")]
   NotConnected,

   #[error("All transports failed for {0}")]
   TransportFailure(Address),

   #[error("Initialization failed: {0}")]
   InitializationFailure(&'static str),

   #[error("Invalid argument: {0}")]
   InvalidArgument(String),

   #[error("Send failed: {0}")]
   SendFailure(String),

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Vendor driver not installed")]
   DriverNotFound,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Orchestrator has been shut down")]
   ManagerShutdown,

   #[error("Already connecting to device")]
   AlreadyConnecting,

   #[error("Adapter not available")]
   AdapterNotAvailable,
}

/// Convenience type alias for Results with `PodError`.
pub type Result<T> = std::result::Result<T, PodError>;
