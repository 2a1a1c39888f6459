//! Event handling system for accessory notifications.
//!
//! Every per-opcode callback the router exposes is an [`AapEvent`]
//! variant delivered through an [`EventBus`].

use std::sync::Arc;

use bluer::Address;

use crate::{
   aap::{
      parser::Metadata,
      protocol::{
         AudioSource, BatteryInfo, ConnectedDevice, ControlCommand, EarDetectionStatus,
         ProximityKey, StemPressEvent,
      },
   },
   bluetooth::{l2cap::Packet, link::ConnectionState},
};

/// Events that can be emitted by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum AapEvent {
   ConnectionStateChanged(ConnectionState),
   BatteryUpdated(BatteryInfo),
   EarDetectionChanged(EarDetectionStatus),
   /// Raw conversation-awareness packet.
   ConversationAwareness(Packet),
   /// Any decoded control command, known identifier or not.
   ControlCommand(ControlCommand),
   OwnershipChanged(bool),
   DeviceMetadata(Metadata),
   /// Raw head-tracking packet, at least 70 bytes.
   HeadTracking(Packet),
   ProximityKeys(Vec<ProximityKey>),
   StemPress(StemPressEvent),
   AudioSourceChanged(AudioSource),
   ConnectedDevicesChanged(Vec<ConnectedDevice>),
   OwnershipReleaseRequested { reverse_banner_tapped: bool },
   ShowNearbyUi,
   UnknownPacket(Packet),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners. Must not block.
   fn emit(&self, device: Address, event: AapEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
