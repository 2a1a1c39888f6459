//! Opcode router.
//!
//! Takes every packet read from the accessory, updates the cached state it
//! carries and turns it into [`AapEvent`]s.

use std::sync::Arc;

use bluer::Address;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
   aap::{
      parser::{self, ProtoError, ProtoResult},
      protocol::{
         AudioSource, ConnectedDevice, ControlCommandId, ControlValue, HEADER, OPCODE_OFFSET,
         Opcode,
      },
      registry::{ControlRegistry, UpdateOp},
      smart_routing,
   },
   bluetooth::l2cap::Packet,
   event::{AapEvent, EventSender},
};

/// Head-tracking frames shorter than this are truncated.
pub const HEAD_TRACKING_MIN_LEN: usize = 70;

#[derive(Debug, Default)]
struct RoutingState {
   connected_devices: Vec<ConnectedDevice>,
   previous_devices: Vec<ConnectedDevice>,
   audio_source: Option<AudioSource>,
}

pub struct Router {
   device: Address,
   registry: Arc<ControlRegistry>,
   routing: Mutex<RoutingState>,
   events: EventSender,
}

impl Router {
   pub fn new(device: Address, events: EventSender) -> Self {
      Self {
         device,
         registry: Arc::new(ControlRegistry::new()),
         routing: Mutex::default(),
         events,
      }
   }

   pub const fn registry(&self) -> &Arc<ControlRegistry> {
      &self.registry
   }

   pub fn connected_devices(&self) -> Vec<ConnectedDevice> {
      self.routing.lock().connected_devices.clone()
   }

   /// The device list as it was before the latest update.
   pub fn previous_connected_devices(&self) -> Vec<ConnectedDevice> {
      self.routing.lock().previous_devices.clone()
   }

   pub fn audio_source(&self) -> Option<AudioSource> {
      self.routing.lock().audio_source
   }

   fn emit(&self, event: AapEvent) {
      self.events.emit(self.device, event);
   }

   /// Stores a control value and notifies its listeners. Used for both
   /// received and locally sent commands.
   pub fn apply_control(
      &self,
      id: ControlCommandId,
      value: ControlValue,
   ) -> UpdateOp<ControlValue> {
      let op = self.registry.set_status(id, value);
      if id == ControlCommandId::OwnsConnection {
         let owns = self.registry.owns();
         info!("Ownership for {}: {owns}", self.device);
         self.emit(AapEvent::OwnershipChanged(owns));
      }
      op
   }

   /// Drops all cached state.
   pub fn reset(&self, keep_listeners: bool) {
      self.registry.clear(keep_listeners);
      *self.routing.lock() = RoutingState::default();
   }

   /// Dispatches one received packet.
   ///
   /// A packet without the sync header never reaches a handler. Errors are
   /// per packet; the caller logs them and keeps reading.
   pub fn route(&self, packet: &[u8]) -> ProtoResult<()> {
      if !packet.starts_with(&HEADER) {
         return Err(ProtoError::BadHeader);
      }
      if packet.len() < OPCODE_OFFSET + 2 {
         return Err(ProtoError::PacketTooShort {
            expected: OPCODE_OFFSET + 2,
            actual: packet.len(),
         });
      }

      let Some(opcode) = Opcode::from_repr(packet[OPCODE_OFFSET]) else {
         debug!("Unknown opcode 0x{:02x}", packet[OPCODE_OFFSET]);
         self.emit(AapEvent::UnknownPacket(Packet::from_slice(packet)));
         return Ok(());
      };

      match opcode {
         Opcode::BatteryInfo => {
            let battery = parser::parse_battery_status(packet)?;
            self.emit(AapEvent::BatteryUpdated(battery));
         },
         Opcode::ControlCommand => {
            let cmd = parser::decode_control_command(packet)?;
            debug!("Control command received: {cmd}");
            match cmd.id() {
               Some(id) => {
                  self.apply_control(id, cmd.value.clone());
               },
               None => warn!("Unknown control command identifier 0x{:02x}", cmd.identifier),
            }
            self.emit(AapEvent::ControlCommand(cmd));
         },
         Opcode::EarDetection => {
            let status = parser::parse_ear_detection(packet)?;
            self.emit(AapEvent::EarDetectionChanged(status));
         },
         Opcode::ConversationAwareness => {
            self.emit(AapEvent::ConversationAwareness(Packet::from_slice(packet)));
         },
         Opcode::DeviceMetadata => {
            let metadata = parser::parse_metadata(packet)?;
            self.emit(AapEvent::DeviceMetadata(metadata));
         },
         Opcode::HeadTracking => {
            if packet.len() < HEAD_TRACKING_MIN_LEN {
               return Err(ProtoError::PacketTooShort {
                  expected: HEAD_TRACKING_MIN_LEN,
                  actual: packet.len(),
               });
            }
            self.emit(AapEvent::HeadTracking(Packet::from_slice(packet)));
         },
         Opcode::ProximityKeysResponse => {
            let keys = parser::parse_proximity_keys(packet)?;
            self.emit(AapEvent::ProximityKeys(keys));
         },
         Opcode::StemPress => {
            let press = parser::parse_stem_press(packet)?;
            self.emit(AapEvent::StemPress(press));
         },
         Opcode::AudioSource => {
            // Undecodable frames still reach the event stream raw
            let source = parser::parse_audio_source(packet).inspect_err(|_| {
               self.emit(AapEvent::UnknownPacket(Packet::from_slice(packet)));
            })?;
            self.routing.lock().audio_source = Some(source);
            self.emit(AapEvent::AudioSourceChanged(source));
         },
         Opcode::ConnectedDevices => {
            let devices = parser::parse_connected_devices(packet)?;
            {
               let mut routing = self.routing.lock();
               routing.previous_devices =
                  std::mem::replace(&mut routing.connected_devices, devices.clone());
            }
            self.emit(AapEvent::ConnectedDevicesChanged(devices));
         },
         Opcode::SmartRoutingResponse => {
            let response = smart_routing::scan_response(packet);
            if let Some(reverse_banner_tapped) = response.release {
               self.emit(AapEvent::OwnershipReleaseRequested {
                  reverse_banner_tapped,
               });
            }
            if response.show_nearby_ui {
               self.emit(AapEvent::ShowNearbyUi);
            }
         },
         _ => {
            self.emit(AapEvent::UnknownPacket(Packet::from_slice(packet)));
         },
      }
      Ok(())
   }
}
