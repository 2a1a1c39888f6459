//! Packet parsing utilities for the accessory protocol.
//!
//! This module contains functions to parse the packet types received from
//! the accessory over the L2CAP connection. Every parser is pure; failures
//! are reported as [`ProtoError`] and never affect the connection.

use std::str;

use bluer::Address;
use log::{debug, warn};
use smol_str::SmolStr;
use thiserror::Error;

use crate::aap::protocol::{
   AudioSource, AudioSourceType, BatteryInfo, BatteryState, BatteryStatus, BudSide, Component,
   ConnectedDevice, ControlCommand, EarDetectionStatus, HEADER, OPCODE_OFFSET, Opcode,
   ProximityKey, ProximityKeyType, StemPressEvent, StemPressType, control_value,
};

/// Error type for protocol parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
   /// Packet does not start with the sync header
   #[error("Missing sync header")]
   BadHeader,

   /// A second sync header follows the first one
   #[error("Nested sync header")]
   NestedHeader,

   /// Packet is not of the expected type
   #[error("Not a {expected} packet")]
   WrongPacketType { expected: &'static str },

   /// Packet is too short for the expected format
   #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
   PacketTooShort { expected: usize, actual: usize },

   /// Packet size doesn't match expected size based on content
   #[error("Packet size mismatch: expected {expected} bytes, got {actual} bytes")]
   PacketSizeMismatch { expected: usize, actual: usize },

   /// Invalid battery count in battery status packet
   #[error("Invalid battery count: {count} (must be 0-3)")]
   InvalidBatteryCount { count: u8 },

   #[error("Unknown proximity key type: 0x{0:02x}")]
   UnknownProximityKeyType(u8),

   #[error("Unknown stem press type: 0x{0:02x}")]
   UnknownStemPress(u8),

   #[error("Unknown bud side: 0x{0:02x}")]
   UnknownBud(u8),

   #[error("Unknown audio source type: 0x{0:02x}")]
   UnknownAudioSource(u8),
}

pub type ProtoResult<T> = std::result::Result<T, ProtoError>;

const fn ensure_len(data: &[u8], expected: usize) -> ProtoResult<()> {
   if data.len() < expected {
      Err(ProtoError::PacketTooShort {
         expected,
         actual: data.len(),
      })
   } else {
      Ok(())
   }
}

fn ensure_opcode(data: &[u8], opcode: Opcode, expected: &'static str) -> ProtoResult<()> {
   ensure_len(data, OPCODE_OFFSET + 1)?;
   if !data.starts_with(&HEADER) {
      return Err(ProtoError::BadHeader);
   }
   if data[OPCODE_OFFSET] != opcode as u8 {
      return Err(ProtoError::WrongPacketType { expected });
   }
   Ok(())
}

/// Decodes a control command from either a full packet or a bare
/// opcode payload.
///
/// At most one sync header is stripped. The value is the 4-byte slot with
/// trailing zeros trimmed, but an all-zero slot decodes to a single `0x00`.
pub fn decode_control_command(data: &[u8]) -> ProtoResult<ControlCommand> {
   let data = match data.strip_prefix(&HEADER) {
      Some(rest) if rest.starts_with(&HEADER) => return Err(ProtoError::NestedHeader),
      Some(rest) => rest,
      None => data,
   };
   ensure_len(data, 7)?;
   if data[0] != Opcode::ControlCommand as u8 {
      return Err(ProtoError::WrongPacketType {
         expected: "control command",
      });
   }

   let slot = &data[3..7];
   let used = slot.iter().rposition(|&b| b != 0x00).map_or(1, |i| i + 1);
   Ok(ControlCommand {
      identifier: data[2],
      value: control_value(&slot[..used]),
   })
}

/// Parses a battery status packet.
///
/// The packet format contains battery information for up to 3 components
/// (left, right, case).
pub fn parse_battery_status(data: &[u8]) -> ProtoResult<BatteryInfo> {
   ensure_opcode(data, Opcode::BatteryInfo, "battery status")?;
   ensure_len(data, 7)?;

   let battery_count = data[6];
   let expected_length = 7 + 5 * battery_count as usize;

   debug!(
      "Battery count: {}, expected length: {}, actual: {}",
      battery_count,
      expected_length,
      data.len()
   );

   if battery_count > 3 {
      return Err(ProtoError::InvalidBatteryCount {
         count: battery_count,
      });
   }

   if data.len() != expected_length {
      return Err(ProtoError::PacketSizeMismatch {
         expected: expected_length,
         actual: data.len(),
      });
   }

   let mut battery_info = BatteryInfo::new();

   for record in data[7..].chunks_exact(5) {
      let &[id, _, level, status, _] = record else {
         continue;
      };

      let Some(component) = Component::from_repr(id) else {
         warn!("Unknown component type 0x{id:02x}");
         continue;
      };

      let bat_status = BatteryStatus::from_repr(status).unwrap_or_else(|| {
         warn!(
            "Unknown battery status 0x{status:02x} for component {component}, treating as Normal"
         );
         BatteryStatus::Normal
      });

      if bat_status != BatteryStatus::Disconnected {
         let battery_state = BatteryState {
            level,
            status: bat_status,
         };

         match component {
            Component::Left => battery_info.left = battery_state,
            Component::Right => battery_info.right = battery_state,
            Component::Case => battery_info.case = battery_state,
         }
      }
   }
   debug!("Battery parsed - {battery_info}");
   Ok(battery_info)
}

pub fn parse_ear_detection(data: &[u8]) -> ProtoResult<EarDetectionStatus> {
   ensure_opcode(data, Opcode::EarDetection, "ear detection")?;
   ensure_len(data, 8)?;
   let left_out = data[6] == 0x01;
   let right_out = data[7] == 0x01;
   Ok(EarDetectionStatus::new(!left_out, !right_out))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Metadata {
   pub name_candidate: Option<SmolStr>,
}

pub fn parse_metadata(data: &[u8]) -> ProtoResult<Metadata> {
   ensure_opcode(data, Opcode::DeviceMetadata, "metadata")?;
   ensure_len(data, 20)?;

   // First printable run that looks like a name
   let payload = &data[6..];
   let name_candidate = payload
      .split(|b| !b.is_ascii_graphic() && *b != b' ')
      .filter_map(|run| str::from_utf8(run).ok())
      .map(str::trim)
      .find(|text| text.len() > 2 && text.chars().any(char::is_alphabetic))
      .map(SmolStr::from);

   Ok(Metadata { name_candidate })
}

/// Stem press: exactly 8 bytes, press kind at 6, bud side at 7.
pub fn parse_stem_press(data: &[u8]) -> ProtoResult<StemPressEvent> {
   if data.len() != 8 {
      return Err(ProtoError::PacketSizeMismatch {
         expected: 8,
         actual: data.len(),
      });
   }
   ensure_opcode(data, Opcode::StemPress, "stem press")?;
   let press = StemPressType::from_repr(data[6]).ok_or(ProtoError::UnknownStemPress(data[6]))?;
   let bud = BudSide::from_repr(data[7]).ok_or(ProtoError::UnknownBud(data[7]))?;
   Ok(StemPressEvent { bud, press })
}

/// Audio source: byte-reversed address at 6..12, audio class at 12.
pub fn parse_audio_source(data: &[u8]) -> ProtoResult<AudioSource> {
   ensure_opcode(data, Opcode::AudioSource, "audio source")?;
   ensure_len(data, 13)?;
   let mut address = [0u8; 6];
   address.copy_from_slice(&data[6..12]);
   address.reverse();
   let kind =
      AudioSourceType::from_repr(data[12]).ok_or(ProtoError::UnknownAudioSource(data[12]))?;
   Ok(AudioSource {
      address: Address::new(address),
      kind,
   })
}

/// Connected devices: count at 8, then 6 address bytes + 2 status bytes each.
pub fn parse_connected_devices(data: &[u8]) -> ProtoResult<Vec<ConnectedDevice>> {
   ensure_opcode(data, Opcode::ConnectedDevices, "connected devices")?;
   ensure_len(data, 9)?;
   let count = data[8] as usize;
   ensure_len(data, 9 + 8 * count)?;

   Ok(data[9..9 + 8 * count]
      .chunks_exact(8)
      .map(|record| {
         let mut address = [0u8; 6];
         address.copy_from_slice(&record[..6]);
         ConnectedDevice {
            address: Address::new(address),
            info1: record[6],
            info2: record[7],
         }
      })
      .collect())
}

/// Proximity keys: count at 6, then `[type][reserved][len][reserved]` + key.
pub fn parse_proximity_keys(data: &[u8]) -> ProtoResult<Vec<ProximityKey>> {
   ensure_opcode(data, Opcode::ProximityKeysResponse, "proximity keys")?;
   ensure_len(data, 7)?;
   let count = data[6];
   let mut keys = Vec::with_capacity(count as usize);
   let mut offset = 7;
   for _ in 0..count {
      ensure_len(data, offset + 4)?;
      let key_type = data[offset];
      let key_len = data[offset + 2] as usize;
      offset += 4;
      ensure_len(data, offset + key_len)?;
      let kind = ProximityKeyType::from_repr(key_type)
         .ok_or(ProtoError::UnknownProximityKeyType(key_type))?;
      keys.push(ProximityKey {
         kind,
         key: data[offset..offset + key_len].to_vec(),
      });
      offset += key_len;
   }
   Ok(keys)
}
