//! Attribute protocol: handle-addressed reads and writes for settings blocks.

pub mod client;
pub mod hearing;
