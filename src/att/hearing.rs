//! Hearing-aid / transparency settings block.
//!
//! The block is 25 little-endian `f32`s: the enable flag followed by the
//! left and right bud tuning.

use serde::{Deserialize, Serialize};

use crate::{
   aap::parser::{ProtoError, ProtoResult},
   att::client::ATT_READ_RESPONSE,
};

const BANDS: usize = 8;

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudTuning {
   pub eq: [f32; BANDS],
   pub amplification: f32,
   pub tone: f32,
   pub conversation_boost: bool,
   pub ambient_noise_reduction: f32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HearingAidSettings {
   pub enabled: bool,
   pub left: BudTuning,
   pub right: BudTuning,
}

const fn flag(value: bool) -> f32 {
   if value { 1.0 } else { 0.0 }
}

impl BudTuning {
   fn write(&self, out: &mut Vec<u8>) {
      for value in self
         .eq
         .iter()
         .chain(&[
            self.amplification,
            self.tone,
            flag(self.conversation_boost),
            self.ambient_noise_reduction,
         ])
      {
         out.extend_from_slice(&value.to_le_bytes());
      }
   }

   fn read(floats: &mut impl Iterator<Item = f32>) -> Self {
      let mut tuning = Self::default();
      for band in &mut tuning.eq {
         *band = floats.next().unwrap_or_default();
      }
      tuning.amplification = floats.next().unwrap_or_default();
      tuning.tone = floats.next().unwrap_or_default();
      tuning.conversation_boost = floats.next().unwrap_or_default() > 0.5;
      tuning.ambient_noise_reduction = floats.next().unwrap_or_default();
      tuning
   }
}

impl HearingAidSettings {
   /// Encoded size of the block.
   pub const LEN: usize = 100;

   pub fn to_bytes(&self) -> Vec<u8> {
      let mut out = Vec::with_capacity(Self::LEN);
      out.extend_from_slice(&flag(self.enabled).to_le_bytes());
      self.left.write(&mut out);
      self.right.write(&mut out);
      out
   }

   /// Decodes a block, optionally prefixed by the read-response opcode.
   pub fn from_bytes(data: &[u8]) -> ProtoResult<Self> {
      let data = match data {
         [ATT_READ_RESPONSE, rest @ ..] if rest.len() >= Self::LEN => rest,
         _ => data,
      };
      if data.len() < Self::LEN {
         return Err(ProtoError::PacketTooShort {
            expected: Self::LEN,
            actual: data.len(),
         });
      }

      let mut floats = data[..Self::LEN]
         .chunks_exact(4)
         .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]));
      let enabled = floats.next().unwrap_or_default() > 0.5;
      let left = BudTuning::read(&mut floats);
      let right = BudTuning::read(&mut floats);
      Ok(Self {
         enabled,
         left,
         right,
      })
   }

   /// Average amplification of both buds, clamped to [-1, 1].
   pub fn net_amplification(&self) -> f32 {
      ((self.left.amplification + self.right.amplification) / 2.0).clamp(-1.0, 1.0)
   }

   /// Right minus left amplification, clamped to [-1, 1].
   pub fn balance(&self) -> f32 {
      (self.right.amplification - self.left.amplification).clamp(-1.0, 1.0)
   }
}
