//! Error types for the accessory client.
//!
//! Transport failures (socket, timeouts, exhausted retries) drive the
//! connection state machine, protocol violations are per-packet and never
//! tear a link down, and configuration errors fail before anything is sent.

use thiserror::Error;

use crate::aap::parser::ProtoError;

/// Main error type for the accessory client.
#[derive(Error, Debug)]
pub enum AapError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Protocol violation: {0}")]
   Protocol(#[from] ProtoError),

   #[error("Invalid link address: {0:?}")]
   InvalidAddress(String),

   #[error("Device not connected")]
   NotConnected,

   #[error("Connection lost")]
   ConnectionLost,

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Gave up after {attempts} connection attempts")]
   RetriesExhausted { attempts: u32 },

   #[error("Already connecting to device")]
   AlreadyConnecting,

   #[error("No data read from attribute channel")]
   EmptyResponse,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

impl AapError {
   /// Whether this error belongs to the transport layer and should be
   /// answered by the retry machinery rather than by the caller.
   pub const fn is_transport(&self) -> bool {
      matches!(
         self,
         Self::Io(_)
            | Self::Bluetooth(_)
            | Self::NotConnected
            | Self::ConnectionLost
            | Self::ConnectionClosed
            | Self::RequestTimeout
            | Self::RetriesExhausted { .. }
            | Self::EmptyResponse
      )
   }
}

/// Convenience type alias for Results with `AapError`.
pub type Result<T> = std::result::Result<T, AapError>;
