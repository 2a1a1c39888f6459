//! Accessory protocol definitions and data structures.
//!
//! This module contains the wire constants, opcode and identifier tables,
//! packet builders and the value types exchanged with the accessory.

use std::fmt;
use std::num::NonZeroU8;

use bluer::Address;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::bluetooth::l2cap::Packet;

/// Sync header prefixing every accessory-protocol packet.
pub const HEADER: [u8; 4] = [0x04, 0x00, 0x04, 0x00];
/// Offset of the opcode byte in a full packet.
pub const OPCODE_OFFSET: usize = HEADER.len();

pub const PKT_HANDSHAKE: &[u8] = &[
   0x00, 0x00, 0x04, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
pub const PAYLOAD_SET_FEATURES: &[u8] =
   &[0x4d, 0x00, 0xd7, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
pub const PAYLOAD_REQUEST_NOTIFY: &[u8] = &[0x0f, 0x00, 0xff, 0xff, 0xff, 0xff];

pub const PAYLOAD_START_HEAD_TRACKING: &[u8] = &[
   0x17, 0x00, 0x00, 0x00, 0x10, 0x00, 0x10, 0x00, 0x08, 0xa1, 0x02, 0x42, 0x0b, 0x08, 0x0e, 0x10,
   0x02, 0x1a, 0x05, 0x01, 0x40, 0x9c, 0x00, 0x00,
];
pub const PAYLOAD_STOP_HEAD_TRACKING: &[u8] = &[
   0x17, 0x00, 0x00, 0x00, 0x10, 0x00, 0x11, 0x00, 0x08, 0x7e, 0x10, 0x02, 0x42, 0x0b, 0x08, 0x4e,
   0x10, 0x02, 0x1a, 0x05, 0x01, 0x00, 0x00, 0x00, 0x00,
];

/// Opcodes understood by the router. Anything else is an unknown packet.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum Opcode {
   BatteryInfo = 0x04,
   EarDetection = 0x06,
   ControlCommand = 0x09,
   AudioSource = 0x0e,
   RequestNotifications = 0x0f,
   SmartRouting = 0x10,
   SmartRoutingResponse = 0x11,
   HeadTracking = 0x17,
   StemPress = 0x19,
   DeviceMetadata = 0x1d,
   Rename = 0x1e,
   ConnectedDevices = 0x2e,
   ProximityKeysRequest = 0x30,
   ProximityKeysResponse = 0x31,
   ConversationAwareness = 0x4b,
   SetFeatureFlags = 0x4d,
   EqData = 0x53,
}

/// Identifiers of settable/readable accessory features carried by
/// control-command packets.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   PartialOrd,
   Ord,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
   strum::EnumIter,
)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommandId {
   MicMode = 0x01,
   ButtonSendMode = 0x05,
   OwnsConnection = 0x06,
   ListeningMode = 0x0d,
   VoiceTrigger = 0x12,
   SingleClickMode = 0x14,
   DoubleClickMode = 0x15,
   ClickHoldMode = 0x16,
   DoubleClickInterval = 0x17,
   ClickHoldInterval = 0x18,
   ListeningModeConfigs = 0x1a,
   OneBudAncMode = 0x1b,
   CrownRotationDirection = 0x1c,
   AutoAnswerMode = 0x1e,
   ChimeVolume = 0x1f,
   VolumeSwipeInterval = 0x23,
   CallManagementConfig = 0x24,
   VolumeSwipeMode = 0x25,
   AdaptiveVolumeConfig = 0x26,
   SoftwareMuteConfig = 0x27,
   ConversationDetectConfig = 0x28,
   Ssl = 0x29,
   HearingAid = 0x2c,
   AutoAncStrength = 0x2e,
   HpsGainSwipe = 0x2f,
   HrmState = 0x30,
   InCaseToneConfig = 0x31,
   SiriMultitoneConfig = 0x32,
   HearingAssistConfig = 0x33,
   AllowOffOption = 0x34,
   StemConfig = 0x39,
}

impl ControlCommandId {
   pub const fn id(self) -> u8 {
      self as u8
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Width of the value slot in a control-command packet.
pub const CONTROL_VALUE_LEN: usize = 4;

/// Control-command value; never longer than the wire slot.
pub type ControlValue = heapless::Vec<u8, CONTROL_VALUE_LEN>;

/// Builds a control value from arbitrary bytes.
///
/// Bytes past the 4-byte wire slot are silently dropped: the slot is fixed
/// width and the accessory never sees anything beyond it.
pub fn control_value(bytes: &[u8]) -> ControlValue {
   let len = bytes.len().min(CONTROL_VALUE_LEN);
   ControlValue::from_slice(&bytes[..len]).unwrap_or_default()
}

/// Boolean toggles are encoded as 1 (on) / 2 (off).
pub fn bool_value(enabled: bool) -> ControlValue {
   control_value(&[if enabled { 0x01 } else { 0x02 }])
}

/// A decoded control command. The identifier is kept raw so that unknown
/// identifiers can still be reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
   pub identifier: u8,
   pub value: ControlValue,
}

impl ControlCommand {
   pub fn id(&self) -> Option<ControlCommandId> {
      ControlCommandId::from_repr(self.identifier)
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "identifier": self.identifier,
          "name": self.id().map(ControlCommandId::to_str),
          "value": hex::encode(&self.value),
      })
   }
}

impl fmt::Display for ControlCommand {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self.id() {
         Some(id) => write!(f, "{id}={}", hex::encode(&self.value)),
         None => write!(f, "{:#04x}={}", self.identifier, hex::encode(&self.value)),
      }
   }
}

/// Noise control modes, sent on [`ControlCommandId::ListeningMode`].
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum NoiseControlMode {
   #[strum(serialize = "off")]
   Off = 0x01,
   #[strum(serialize = "nc")]
   NC = 0x02,
   #[strum(serialize = "trans", serialize = "transparency")]
   Trans = 0x03,
   #[strum(serialize = "adapt", serialize = "adaptive")]
   Adapt = 0x04,
}

impl NoiseControlMode {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Stem-config bitmask: which press kinds are handled by the host.
pub const fn stem_config(single: bool, double: bool, triple: bool, long: bool) -> u8 {
   (single as u8) | (double as u8) << 1 | (triple as u8) << 2 | (long as u8) << 3
}

#[repr(u8)]
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::FromRepr, strum::Display,
)]
pub enum StemPressType {
   Single = 0x05,
   Double = 0x06,
   Triple = 0x07,
   Long = 0x08,
}

#[repr(u8)]
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::FromRepr, strum::Display,
)]
pub enum BudSide {
   Left = 0x01,
   Right = 0x02,
}

/// A physical button interaction on one bud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StemPressEvent {
   pub bud: BudSide,
   pub press: StemPressType,
}

#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum AudioSourceType {
   None = 0x00,
   Call = 0x01,
   Media = 0x02,
}

/// The host the accessory currently routes audio for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSource {
   pub address: Address,
   pub kind: AudioSourceType,
}

impl AudioSource {
   pub fn to_json(self) -> serde_json::Value {
      let kind: &'static str = self.kind.into();
      json!({
          "address": self.address.to_string(),
          "type": kind,
      })
   }
}

/// A host simultaneously paired to the accessory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectedDevice {
   pub address: Address,
   pub info1: u8,
   pub info2: u8,
}

impl ConnectedDevice {
   pub fn to_json(self) -> serde_json::Value {
      json!({
          "address": self.address.to_string(),
          "info1": self.info1,
          "info2": self.info2,
      })
   }
}

#[repr(u8)]
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::FromRepr, strum::Display,
)]
pub enum ProximityKeyType {
   Irk = 0x01,
   EncKey = 0x04,
}

/// Opaque key material returned by the accessory; transported, never used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProximityKey {
   pub kind: ProximityKeyType,
   pub key: Vec<u8>,
}

/// Represents different components of `AirPods`.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
pub enum Component {
   Right = 0x02,
   Left = 0x04,
   Case = 0x08,
}

/// Battery status for `AirPods` components.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[repr(u8)]
pub enum BatteryStatus {
   Normal = 0x00,
   Charging = 0x01,
   Discharging = 0x02,
   Disconnected = 0x04,
}

/// Battery state for a single component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryState {
   pub level: u8,
   pub status: BatteryStatus,
}

impl BatteryState {
   pub const fn new() -> Self {
      Self {
         level: 0,
         status: BatteryStatus::Disconnected,
      }
   }

   pub fn is_charging(&self) -> bool {
      self.status == BatteryStatus::Charging
   }

   pub fn is_available(&self) -> bool {
      self.status != BatteryStatus::Disconnected
   }
}

/// Complete battery information for all components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryInfo {
   pub left: BatteryState,
   pub right: BatteryState,
   pub case: BatteryState,
}

impl BatteryInfo {
   pub const fn new() -> Self {
      Self {
         left: BatteryState::new(),
         right: BatteryState::new(),
         case: BatteryState::new(),
      }
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "left_level": u32::from(self.left.level),
          "right_level": u32::from(self.right.level),
          "case_level": u32::from(self.case.level),
          "left_charging": self.left.is_charging(),
          "right_charging": self.right.is_charging(),
          "case_charging": self.case.is_charging(),
          "left_available": self.left.is_available(),
          "right_available": self.right.is_available(),
          "case_available": self.case.is_available(),
      })
   }
}

impl fmt::Display for BatteryInfo {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(
         f,
         "L:{}% R:{}% C:{}%",
         self.left.level, self.right.level, self.case.level
      )
   }
}

/// Ear detection status for left and right buds.
#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct EarDetectionStatus(NonZeroU8);

impl EarDetectionStatus {
   pub const LEFT: u8 = 1 << 0;
   pub const RIGHT: u8 = 1 << 1;
   pub const VALID: u8 = 0x80;

   pub const fn new(left_in_ear: bool, right_in_ear: bool) -> Self {
      let mut flags = Self::VALID;
      if left_in_ear {
         flags |= Self::LEFT;
      }
      if right_in_ear {
         flags |= Self::RIGHT;
      }
      Self(NonZeroU8::new(flags).expect("(x|valid) != 0"))
   }

   pub const fn is_left_in_ear(&self) -> bool {
      self.0.get() & Self::LEFT != 0
   }
   pub const fn is_right_in_ear(&self) -> bool {
      self.0.get() & Self::RIGHT != 0
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "left_in_ear": self.is_left_in_ear(),
          "right_in_ear": self.is_right_in_ear(),
      })
   }
}

/// Prepends the sync header to an opcode + payload buffer.
pub fn data_packet(payload: &[u8]) -> Packet {
   HEADER.iter().chain(payload).copied().collect()
}

/// Builds the fixed 7-byte control-command payload:
/// `[opcode][0x00][identifier][value, zero padded to 4 bytes]`.
pub fn control_command(identifier: u8, value: &[u8]) -> [u8; 7] {
   let mut payload = [0u8; 7];
   payload[0] = Opcode::ControlCommand as u8;
   payload[2] = identifier;
   let value = control_value(value);
   payload[3..3 + value.len()].copy_from_slice(&value);
   payload
}

pub const fn request_proximity_keys(kind: ProximityKeyType) -> [u8; 4] {
   [Opcode::ProximityKeysRequest as u8, 0x00, kind as u8, 0x00]
}

/// Rename payload: `[0x1e][0x00][len][0x00][name..][0x00]`.
pub fn rename(name: &str) -> Vec<u8> {
   let name = &name.as_bytes()[..name.len().min(u8::MAX as usize)];
   let mut payload = Vec::with_capacity(5 + name.len());
   payload.extend_from_slice(&[Opcode::Rename as u8, 0x00, name.len() as u8, 0x00]);
   payload.extend_from_slice(name);
   payload.push(0x00);
   payload
}

/// Phone/media equalizer payload: eight bands repeated over four blocks.
pub fn phone_media_eq(eq: &[f32; 8], phone: u8, media: u8) -> Vec<u8> {
   let mut payload = Vec::with_capacity(8 + 4 * 8 * 4);
   payload.extend_from_slice(&[Opcode::EqData as u8, 0x00, 0x84, 0x00, 0x02, 0x02, phone, media]);
   for _ in 0..4 {
      for band in eq {
         payload.extend_from_slice(&band.to_le_bytes());
      }
   }
   payload
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_control_command_layout() {
      let payload = control_command(ControlCommandId::ListeningMode.id(), &[0x02]);
      assert_eq!(payload, [0x09, 0x00, 0x0d, 0x02, 0x00, 0x00, 0x00]);
   }

   #[test]
   fn test_control_command_truncates_long_values() {
      let payload = control_command(0x2c, &[1, 2, 3, 4, 5, 6]);
      assert_eq!(payload, [0x09, 0x00, 0x2c, 1, 2, 3, 4]);
      assert_eq!(control_value(&[9, 8, 7, 6, 5]).as_slice(), &[9, 8, 7, 6]);
   }

   #[test]
   fn test_data_packet_prepends_header() {
      let packet = data_packet(PAYLOAD_REQUEST_NOTIFY);
      assert_eq!(
         packet.as_slice(),
         &[0x04, 0x00, 0x04, 0x00, 0x0f, 0x00, 0xff, 0xff, 0xff, 0xff]
      );
   }

   #[test]
   fn test_identifier_names() {
      assert_eq!(ControlCommandId::OwnsConnection.to_str(), "owns_connection");
      assert_eq!(
         "listening_mode".parse::<ControlCommandId>().ok(),
         Some(ControlCommandId::ListeningMode)
      );
      assert_eq!(ControlCommandId::from_repr(0x39), Some(ControlCommandId::StemConfig));
      assert_eq!(ControlCommandId::from_repr(0x02), None);
   }

   #[test]
   fn test_stem_config_bits() {
      assert_eq!(stem_config(true, false, false, false), 0x01);
      assert_eq!(stem_config(false, true, true, true), 0x0e);
   }

   #[test]
   fn test_rename_payload() {
      assert_eq!(rename("Pods"), [0x1e, 0x00, 0x04, 0x00, b'P', b'o', b'd', b's', 0x00]);
   }

   #[test]
   fn test_phone_media_eq_length() {
      let payload = phone_media_eq(&[50.0; 8], 0x01, 0x02);
      assert_eq!(payload.len(), 8 + 128);
      assert_eq!(&payload[..8], &[0x53, 0x00, 0x84, 0x00, 0x02, 0x02, 0x01, 0x02]);
      assert_eq!(&payload[8..12], &50.0f32.to_le_bytes());
   }
}
