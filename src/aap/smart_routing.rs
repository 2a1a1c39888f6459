//! Ownership negotiation ("smart routing") messages.
//!
//! The accessory relays these between the hosts it is paired with. Payloads
//! use a loose tag + literal encoding; every builder below reproduces a
//! captured message byte for byte, zero padded to its fixed size. The target
//! address is always written byte-reversed, the own address as ASCII text.

use bluer::Address;

use crate::{
   aap::protocol::Opcode,
   error::{AapError, Result},
};

const MEDIA_INFORMATION_LEN: usize = 134;
const MEDIA_INFORMATION_NEW_DEVICE_LEN: usize = 112;
const HIJACK_REQUEST_LEN: usize = 106;
const HIJACK_REVERSED_LEN: usize = 97;
const SHOW_NEARBY_UI_LEN: usize = 134;
const ADD_TIPI_DEVICE_LEN: usize = 86;

const MARKER_RELEASE: &[u8] = b"SetOwnershipToFalse";
const MARKER_REVERSE_BANNER: &[u8] = b"ReverseBannerTapped";
const MARKER_SHOW_NEARBY_UI: &[u8] = b"ShowNearbyUI";

/// Parses a link address of the exact form `XX:XX:XX:XX:XX:XX`.
pub fn parse_address(text: &str) -> Result<Address> {
   let invalid = || AapError::InvalidAddress(text.to_owned());
   if text.len() != 17 {
      return Err(invalid());
   }
   let mut bytes = [0u8; 6];
   let mut groups = text.split(':');
   for byte in &mut bytes {
      let group = groups.next().ok_or_else(invalid)?;
      if group.len() != 2 || !group.bytes().all(|b| b.is_ascii_hexdigit()) {
         return Err(invalid());
      }
      *byte = u8::from_str_radix(group, 16).map_err(|_| invalid())?;
   }
   if groups.next().is_some() {
      return Err(invalid());
   }
   Ok(Address::new(bytes))
}

/// Fixed-size smart-routing payload under construction.
struct Frame {
   buf: Vec<u8>,
   size: usize,
}

impl Frame {
   fn new(target: Address, size: usize) -> Self {
      let mut buf = Vec::with_capacity(2 + size);
      buf.extend_from_slice(&[Opcode::SmartRouting as u8, 0x00]);
      buf.extend(target.0.iter().rev());
      Self { buf, size }
   }

   fn bytes(mut self, bytes: &[u8]) -> Self {
      self.buf.extend_from_slice(bytes);
      self
   }

   fn tag(self, tag: u8) -> Self {
      self.bytes(&[tag])
   }

   fn text(self, text: &str) -> Self {
      self.bytes(text.as_bytes())
   }

   fn finish(mut self) -> Vec<u8> {
      self.buf.resize(2 + self.size, 0x00);
      self.buf
   }
}

/// Announces what this host is playing to the accessory's other host.
pub fn media_information(self_address: &str, target: Address, streaming: bool) -> Result<Vec<u8>> {
   parse_address(self_address)?;
   Ok(Frame::new(target, MEDIA_INFORMATION_LEN)
      .bytes(&[0x7e, 0x00])
      .bytes(&[0x01, 0xe5, 0x4a])
      .text("PlayingApp")
      .tag(0x56)
      .text("com.google.ios.youtube")
      .tag(0x52)
      .text("HostStreamingState")
      .tag(0x42)
      .text(if streaming { "YES" } else { "NO" })
      .tag(0x49)
      .text("btAddress")
      .tag(0x51)
      .text(self_address)
      .text("btName")
      .tag(0x44)
      .text("iPho")
      .tag(0x58)
      .text("otherDevice")
      .text("AudioCategory")
      .bytes(&[0x31, 0x2d, 0x01])
      .finish())
}

/// Media information sent when this host first appears to `target`.
pub fn media_information_new_device(self_address: &str, target: &str) -> Result<Vec<u8>> {
   parse_address(self_address)?;
   let target = parse_address(target)?;
   Ok(Frame::new(target, MEDIA_INFORMATION_NEW_DEVICE_LEN)
      .bytes(&[0x68, 0x00])
      .bytes(&[0x01, 0xe5, 0x4a])
      .text("playingApp")
      .tag(0x42)
      .text("NA")
      .tag(0x52)
      .text("hostStreamingState")
      .tag(0x42)
      .text("NO")
      .tag(0x49)
      .text("btAddress")
      .tag(0x51)
      .text(self_address)
      .tag(0x46)
      .text("btName")
      .tag(0x43)
      .text("And")
      .tag(0x58)
      .text("otherDevice")
      .text("AudioCategory")
      .bytes(&[0x30, 0x64])
      .finish())
}

/// Asks `target` to hand audio ownership over to this host.
pub fn hijack_request(target: Address) -> Vec<u8> {
   Frame::new(target, HIJACK_REQUEST_LEN)
      .bytes(&[0x62, 0x00])
      .bytes(&[0x01, 0xe5])
      .tag(0x4a)
      .text("localscore")
      .bytes(&[0x30, 0x64])
      .tag(0x46)
      .text("reason")
      .tag(0x48)
      .text("Hijackv2")
      .tag(0x51)
      .text("audioRoutingScore")
      .bytes(&[0x31, 0x2d, 0x01, 0x5f])
      .text("audioRoutingSetOwnershipToFalse")
      .tag(0x01)
      .tag(0x4b)
      .text("remotescore")
      .tag(0xa5)
      .finish()
}

/// Gives audio ownership back to `target`.
pub fn hijack_reversed(target: Address) -> Vec<u8> {
   Frame::new(target, HIJACK_REVERSED_LEN)
      .bytes(&[0x59, 0x00])
      .bytes(&[0x01, 0xe3])
      .tag(0x5f)
      .text("audioRoutingSetOwnershipToFalse")
      .tag(0x01)
      .tag(0x59)
      .text("audioRoutingShowReverseUI")
      .tag(0x01)
      .tag(0x46)
      .text("reason")
      .tag(0x53)
      .text("ReverseBannerTapped")
      .finish()
}

/// Makes `target` show its "audio moved" banner.
pub fn show_nearby_ui(target: Address) -> Vec<u8> {
   Frame::new(target, SHOW_NEARBY_UI_LEN)
      .bytes(&[0x7e, 0x00])
      .bytes(&[0x01, 0xe6, 0x5b])
      .text("SmartRoutingKeyShowNearbyUI")
      .tag(0x01)
      .tag(0x4a)
      // The score byte lands on the key's last letter
      .text("localscor")
      .tag(0x2d)
      .tag(0x01)
      .tag(0x46)
      .text("reasonHhijackv2")
      .tag(0x51)
      .text("audioRoutingScore")
      .tag(0xa2)
      .tag(0x5f)
      .text("audioRoutingSetOwnershipToFalse")
      .tag(0x01)
      .tag(0x4b)
      .text("remotescore")
      .tag(0xa2)
      .finish()
}

pub fn add_tipi_device(self_address: &str, target: &str) -> Result<Vec<u8>> {
   parse_address(self_address)?;
   let target = parse_address(target)?;
   Ok(Frame::new(target, ADD_TIPI_DEVICE_LEN)
      .bytes(&[0x4e, 0x00])
      .bytes(&[0x01, 0xe5])
      .tag(0x48)
      .text("idleTime")
      .bytes(&[0x08, 0x47])
      .text("newTipi")
      .bytes(&[0x01, 0x49])
      .text("btAddress")
      .tag(0x51)
      .text(self_address)
      .tag(0x46)
      .text("btName")
      .tag(0x43)
      .text("And")
      .tag(0x50)
      .text("nearbyAudioScore")
      .tag(0x0e)
      .finish())
}

/// What a smart-routing response asks of this host.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoutingResponse {
   /// Ownership release requested; the flag tells whether the user tapped
   /// the reverse banner on the other host.
   pub release: Option<bool>,
   pub show_nearby_ui: bool,
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
   haystack.windows(needle.len()).any(|w| w == needle)
}

/// Scans a smart-routing response for the literal markers it may carry.
pub fn scan_response(packet: &[u8]) -> RoutingResponse {
   RoutingResponse {
      release: contains(packet, MARKER_RELEASE)
         .then(|| contains(packet, MARKER_REVERSE_BANNER)),
      show_nearby_ui: contains(packet, MARKER_SHOW_NEARBY_UI),
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const TARGET: Address = Address([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
   const SELF_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

   #[test]
   fn test_parse_address() {
      assert_eq!(
         parse_address("aa:BB:cc:DD:ee:0f").unwrap(),
         Address::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x0f])
      );
      for bad in [
         "",
         "AA:BB:CC:DD:EE",
         "AA:BB:CC:DD:EE:FF:00",
         "AA:BB:CC:DD:EE:GG",
         "AABB:CC:DD:EE:FF:",
         "AA-BB-CC-DD-EE-FF",
         "+A:BB:CC:DD:EE:FF",
      ] {
         assert!(
            matches!(parse_address(bad), Err(AapError::InvalidAddress(ref s)) if s == bad),
            "{bad:?} accepted"
         );
      }
   }

   /// Checks opcode, reversed target, `payload` and the zero padding up to
   /// `size`.
   fn assert_frame(packet: &[u8], size: usize, payload: &str) {
      let payload = hex::decode(payload).unwrap();
      assert_eq!(packet.len(), 2 + size);
      assert_eq!(&packet[..8], &[0x10, 0x00, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
      assert_eq!(&packet[8..8 + payload.len()], payload.as_slice());
      assert!(packet[8 + payload.len()..].iter().all(|&b| b == 0));
   }

   #[test]
   fn test_hijack_request_matches_capture() {
      assert_frame(
         &hijack_request(TARGET),
         HIJACK_REQUEST_LEN,
         "620001E54A6C6F63616C73636F7265306446726561736F6E4848696A61636B763251617564696F526F7574696E6753636F7265312D015F617564696F526F7574696E675365744F776E657273686970546F46616C7365014B72656D6F746573636F7265A5",
      );
   }

   #[test]
   fn test_media_information_bytes() {
      assert_frame(
         &media_information(SELF_ADDRESS, TARGET, true).unwrap(),
         MEDIA_INFORMATION_LEN,
         "7E0001E54A506C6179696E6741707056636F6D2E676F6F676C652E696F732E796F757475626552486F737453747265616D696E67537461746542594553496274416464726573735141413A42423A43433A44443A45453A464662744E616D65446950686F586F74686572446576696365417564696F43617465676F7279312D01",
      );
      assert_frame(
         &media_information(SELF_ADDRESS, TARGET, false).unwrap(),
         MEDIA_INFORMATION_LEN,
         "7E0001E54A506C6179696E6741707056636F6D2E676F6F676C652E696F732E796F757475626552486F737453747265616D696E675374617465424E4F496274416464726573735141413A42423A43433A44443A45453A464662744E616D65446950686F586F74686572446576696365417564696F43617465676F7279312D01",
      );
   }

   #[test]
   fn test_media_information_new_device_bytes() {
      // Fills the template exactly, no padding
      assert_frame(
         &media_information_new_device(SELF_ADDRESS, "11:22:33:44:55:66").unwrap(),
         MEDIA_INFORMATION_NEW_DEVICE_LEN,
         "680001E54A706C6179696E67417070424E4152686F737453747265616D696E675374617465424E4F496274416464726573735141413A42423A43433A44443A45453A46464662744E616D6543416E64586F74686572446576696365417564696F43617465676F72793064",
      );
   }

   #[test]
   fn test_hijack_reversed_bytes() {
      assert_frame(
         &hijack_reversed(TARGET),
         HIJACK_REVERSED_LEN,
         "590001E35F617564696F526F7574696E675365744F776E657273686970546F46616C73650159617564696F526F7574696E6753686F775265766572736555490146726561736F6E535265766572736542616E6E6572546170706564",
      );
   }

   #[test]
   fn test_show_nearby_ui_bytes() {
      let packet = show_nearby_ui(TARGET);
      assert_frame(
         &packet,
         SHOW_NEARBY_UI_LEN,
         "7E0001E65B536D617274526F7574696E674B657953686F774E65617262795549014A6C6F63616C73636F722D0146726561736F6E4868696A61636B763251617564696F526F7574696E6753636F7265A25F617564696F526F7574696E675365744F776E657273686970546F46616C7365014B72656D6F746573636F7265A2",
      );
      assert!(contains(&packet, b"Jlocalscor-\x01Freason"));
   }

   #[test]
   fn test_add_tipi_device_bytes() {
      assert_frame(
         &add_tipi_device(SELF_ADDRESS, "11:22:33:44:55:66").unwrap(),
         ADD_TIPI_DEVICE_LEN,
         "4E0001E54869646C6554696D6508476E65775469706901496274416464726573735141413A42423A43433A44443A45453A46464662744E616D6543416E64506E6561726279417564696F53636F72650E",
      );
   }

   #[test]
   fn test_media_information_embeds_self_address_text() {
      let packet = media_information(SELF_ADDRESS, TARGET, false).unwrap();
      assert!(contains(&packet, b"QAA:BB:CC:DD:EE:FFbtName"));
      assert!(contains(&packet, b"HostStreamingStateBNOI"));
   }

   #[test]
   fn test_builders_reject_bad_addresses() {
      assert!(matches!(
         media_information("AA:BB:CC:DD:EE", TARGET, false),
         Err(AapError::InvalidAddress(_))
      ));
      assert!(matches!(
         add_tipi_device(SELF_ADDRESS, "11:22:33:44:55:ZZ"),
         Err(AapError::InvalidAddress(_))
      ));
      assert!(matches!(
         media_information_new_device("nope", "11:22:33:44:55:66"),
         Err(AapError::InvalidAddress(_))
      ));
   }

   #[test]
   fn test_scan_response() {
      let mut packet = vec![0x04, 0x00, 0x04, 0x00, 0x11, 0x00];
      packet.extend_from_slice(b"\x01\xe3_audioRoutingSetOwnershipToFalse\x01");
      assert_eq!(
         scan_response(&packet),
         RoutingResponse {
            release: Some(false),
            show_nearby_ui: false,
         }
      );

      packet.extend_from_slice(b"FreasonSReverseBannerTapped");
      assert_eq!(scan_response(&packet).release, Some(true));

      let nearby = b"\x04\x00\x04\x00\x11\x00SmartRoutingKeyShowNearbyUI";
      assert_eq!(
         scan_response(nearby),
         RoutingResponse {
            release: None,
            show_nearby_ui: true,
         }
      );
      assert_eq!(scan_response(&[0x04, 0x00]), RoutingResponse::default());
   }
}
