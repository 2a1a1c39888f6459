//! Bluetooth transport.
//!
//! L2CAP channel management and the connection lifecycle primitives shared
//! by the accessory and attribute protocol clients.

pub mod l2cap;
pub mod link;
#[cfg(test)]
pub mod mock;
