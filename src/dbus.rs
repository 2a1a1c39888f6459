use std::{fmt, str::FromStr};

use aacpd::{
   aap::{
      protocol::{ControlCommandId, NoiseControlMode, ProximityKeyType},
      session::AapSession,
   },
   att::{client::AttClient, hearing::HearingAidSettings},
   bluetooth::l2cap::L2capFactory,
};
use log::info;
use serde_json::json;
use zbus::{fdo, interface, object_server::SignalEmitter};

pub const SERVICE_NAME: &str = "org.aacpd";
pub const OBJECT_PATH: &str = "/org/aacpd/device";

fn invalid(e: impl fmt::Display) -> fdo::Error {
   fdo::Error::InvalidArgs(e.to_string())
}

fn failed(e: impl fmt::Display) -> fdo::Error {
   fdo::Error::Failed(e.to_string())
}

/// Accepts a snake_case name (`listening_mode`) or a raw identifier (`0x0d`).
fn parse_identifier(text: &str) -> fdo::Result<ControlCommandId> {
   if let Ok(id) = ControlCommandId::from_str(text) {
      return Ok(id);
   }
   u8::from_str_radix(text.trim_start_matches("0x"), 16)
      .ok()
      .and_then(ControlCommandId::from_repr)
      .ok_or_else(|| invalid(format!("Unknown control identifier: {text}")))
}

pub struct AapService {
   session: AapSession<L2capFactory>,
   att: AttClient<L2capFactory>,
   self_address: Option<String>,
}

impl AapService {
   pub const fn new(
      session: AapSession<L2capFactory>,
      att: AttClient<L2capFactory>,
      self_address: Option<String>,
   ) -> Self {
      Self {
         session,
         att,
         self_address,
      }
   }

   fn self_address(&self) -> fdo::Result<&str> {
      self
         .self_address
         .as_deref()
         .ok_or_else(|| failed("self_address is not configured"))
   }

   async fn att(&self) -> fdo::Result<&AttClient<L2capFactory>> {
      if !self.att.is_connected().await {
         self.att.connect().await.map_err(failed)?;
      }
      Ok(&self.att)
   }
}

#[interface(name = "org.aacpd.Device")]
impl AapService {
   async fn get_state(&self) -> String {
      self.session.state().to_str().to_owned()
   }

   async fn get_status(&self, identifier: String) -> fdo::Result<String> {
      let id = parse_identifier(&identifier)?;
      self
         .session
         .status(id)
         .map(hex::encode)
         .ok_or_else(|| failed(format!("No status for {id}")))
   }

   async fn get_all_statuses(&self) -> String {
      let statuses: serde_json::Map<String, serde_json::Value> = self
         .session
         .registry()
         .statuses()
         .into_iter()
         .map(|(id, value)| (id.to_str().to_owned(), json!(hex::encode(value))))
         .collect();
      serde_json::Value::Object(statuses).to_string()
   }

   async fn send_control_command(&self, identifier: String, value: String) -> fdo::Result<bool> {
      let id = parse_identifier(&identifier)?;
      let value = hex::decode(value).map_err(invalid)?;
      self
         .session
         .send_control_command(id, &value)
         .await
         .map_err(failed)?;
      info!("Sent {id} = {}", hex::encode(&value));
      Ok(true)
   }

   async fn set_noise_mode(&self, mode: String) -> fdo::Result<bool> {
      let mode = NoiseControlMode::from_str(&mode)
         .map_err(|_| invalid(format!("Invalid noise mode: {mode}")))?;
      self.session.set_noise_control(mode).await.map_err(failed)?;
      info!("Set noise mode to {mode}");
      Ok(true)
   }

   async fn retry(&self) -> bool {
      self.session.retry();
      true
   }

   async fn disconnect(&self) -> bool {
      self.session.disconnect().await;
      self.att.disconnect().await;
      true
   }

   async fn connected_devices(&self) -> String {
      let devices: Vec<_> = self
         .session
         .connected_devices()
         .into_iter()
         .map(|d| d.to_json())
         .collect();
      serde_json::Value::Array(devices).to_string()
   }

   async fn audio_source(&self) -> String {
      self
         .session
         .audio_source()
         .map_or(serde_json::Value::Null, |s| s.to_json())
         .to_string()
   }

   async fn owns(&self) -> bool {
      self.session.owns()
   }

   async fn request_proximity_keys(&self, kind: u8) -> fdo::Result<bool> {
      let kind = ProximityKeyType::from_repr(kind)
         .ok_or_else(|| invalid(format!("Unknown proximity key type: {kind:#04x}")))?;
      self
         .session
         .request_proximity_keys(kind)
         .await
         .map_err(failed)?;
      Ok(true)
   }

   /// Asks the other connected hosts to hand over audio routing.
   async fn take_ownership(&self) -> fdo::Result<u32> {
      let sent = self
         .session
         .send_hijack_request(self.self_address()?)
         .await
         .map_err(failed)?;
      Ok(sent as u32)
   }

   async fn release_ownership(&self) -> fdo::Result<u32> {
      let sent = self
         .session
         .send_hijack_reversed(self.self_address()?)
         .await
         .map_err(failed)?;
      Ok(sent as u32)
   }

   async fn passthrough(&self, packet: String) -> fdo::Result<bool> {
      let packet = hex::decode(packet).map_err(invalid)?;
      self.session.send_packet(&packet).await.map_err(failed)?;
      Ok(true)
   }

   async fn get_hearing_aid(&self) -> fdo::Result<String> {
      let settings = self.att().await?.read_hearing_aid().await.map_err(failed)?;
      let mut value = serde_json::to_value(settings).map_err(failed)?;
      value["net_amplification"] = json!(settings.net_amplification());
      value["balance"] = json!(settings.balance());
      Ok(value.to_string())
   }

   async fn set_hearing_aid(&self, settings: String) -> fdo::Result<bool> {
      let settings: HearingAidSettings = serde_json::from_str(&settings).map_err(invalid)?;
      self.att().await?.schedule_hearing_aid(settings);
      Ok(true)
   }

   #[zbus(signal)]
   pub async fn connection_state_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      state: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn battery_updated(
      emitter: &SignalEmitter<'_>,
      address: &str,
      battery: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn ear_detection_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      ear_detection: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn conversation_awareness(
      emitter: &SignalEmitter<'_>,
      address: &str,
      packet: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn control_command(
      emitter: &SignalEmitter<'_>,
      address: &str,
      command: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn ownership_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      owns: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_name_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn head_tracking(
      emitter: &SignalEmitter<'_>,
      address: &str,
      packet: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn proximity_keys(
      emitter: &SignalEmitter<'_>,
      address: &str,
      keys: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn stem_press(
      emitter: &SignalEmitter<'_>,
      address: &str,
      press: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn audio_source_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      source: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connected_devices_changed(
      emitter: &SignalEmitter<'_>,
      address: &str,
      devices: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn ownership_release_requested(
      emitter: &SignalEmitter<'_>,
      address: &str,
      reverse_banner_tapped: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn show_nearby_ui(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn unknown_packet(
      emitter: &SignalEmitter<'_>,
      address: &str,
      packet: &str,
   ) -> zbus::Result<()>;

   #[zbus(property)]
   async fn state(&self) -> String {
      self.get_state().await
   }
}
