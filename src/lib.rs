//! Host-side client for the AirPods accessory control protocol (AACP) and
//! the attribute protocol, over Bluetooth L2CAP.
//!
//! [`aap::session::AapSession`] drives the control channel: handshake,
//! notifications, control-command registry and ownership negotiation.
//! [`att::client::AttClient`] reads and writes settings blocks by handle.

pub mod aap;
pub mod att;
pub mod bluetooth;
pub mod config;
pub mod debounce;
pub mod error;
pub mod event;
