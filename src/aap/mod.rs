//! Accessory control protocol.
//!
//! Wire codec, per-opcode decoders, the control-command registry, the
//! ownership negotiation codec, and the session that ties them to a channel.

pub mod parser;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
pub mod smart_routing;
