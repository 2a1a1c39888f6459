//! AACP daemon.
//!
//! Drives one accessory over L2CAP and exposes it on the session bus as
//! `org.aacpd`, re-emitting every accessory notification as a signal.

use std::{env, str::FromStr, sync::Arc, time::Duration};

use aacpd::{
   aap::session::{AapSession, SessionParams},
   att::client::AttClient,
   bluetooth::{l2cap::L2capFactory, link::RetryPolicy},
   config::Config,
   error::{AapError, Result},
   event::{AapEvent, EventBus},
};
use bluer::Address;
use crossbeam::queue::SegQueue;
use log::{error, info, warn};
use serde_json::json;
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use dbus::{AapService, OBJECT_PATH, SERVICE_NAME};

mod dbus;

use crate::dbus::AapServiceSignals;

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting aacpd...");

   let config = Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   let Some(target) = env::args()
      .nth(1)
      .or_else(|| config.known_devices.first().map(|d| d.address.clone()))
   else {
      error!("No accessory address given and none configured");
      return Err(AapError::InvalidAddress(String::new()));
   };
   let address = Address::from_str(&target).map_err(|_| AapError::InvalidAddress(target.clone()))?;
   if let Some(name) = config.is_known_device(&target) {
      info!("Driving {name} ({address})");
   }

   let bt = bluer::Session::new().await?;
   let adapter = bt.default_adapter().await?;
   if !adapter.is_powered().await? {
      info!("Powering on adapter {}", adapter.name());
      adapter.set_powered(true).await?;
   }

   let event_bus = EventProcessor::new();
   let session = AapSession::new(
      address,
      L2capFactory::aap(),
      SessionParams::from_config(&config),
      event_bus.clone(),
   );
   let att = AttClient::new(
      address,
      L2capFactory::att(),
      RetryPolicy::from_config(&config),
      Duration::from_millis(config.debounce_ms),
   );
   let service = AapService::new(session.clone(), att, config.self_address.clone());

   let connection = connection::Builder::session()?
      .name(SERVICE_NAME)?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("aacpd D-Bus service started at {SERVICE_NAME}");

   event_bus.spawn_dispatcher(connection).await?;

   let supervisor = tokio::spawn({
      let session = session.clone();
      async move { session.run().await }
   });

   signal::ctrl_c().await?;
   info!("Shutting down aacpd...");
   supervisor.abort();
   session.disconnect().await;

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<(Address, AapEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, device: Address, event: AapEvent) {
      self.queue.push((device, event));
      self.notifier.notify_one();
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<(Address, AapEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<AapService>,
      (device, event): (Address, AapEvent),
   ) -> Result<()> {
      let addr = device.to_string();
      let addr = addr.as_str();
      match event {
         AapEvent::ConnectionStateChanged(state) => {
            iface.connection_state_changed(addr, state.to_str()).await?;
         },
         AapEvent::BatteryUpdated(battery) => {
            iface
               .battery_updated(addr, &battery.to_json().to_string())
               .await?;
         },
         AapEvent::EarDetectionChanged(ear_detection) => {
            iface
               .ear_detection_changed(addr, &ear_detection.to_json().to_string())
               .await?;
         },
         AapEvent::ConversationAwareness(packet) => {
            iface
               .conversation_awareness(addr, &hex::encode(&packet))
               .await?;
         },
         AapEvent::ControlCommand(cmd) => {
            iface
               .control_command(addr, &cmd.to_json().to_string())
               .await?;
         },
         AapEvent::OwnershipChanged(owns) => {
            iface.ownership_changed(addr, owns).await?;
         },
         AapEvent::DeviceMetadata(metadata) => {
            if let Some(name) = metadata.name_candidate {
               iface.device_name_changed(addr, &name).await?;
            }
         },
         AapEvent::HeadTracking(packet) => {
            iface.head_tracking(addr, &hex::encode(&packet)).await?;
         },
         AapEvent::ProximityKeys(keys) => {
            let keys: Vec<_> = keys
               .iter()
               .map(|k| json!({ "type": k.kind.to_string(), "key": hex::encode(&k.key) }))
               .collect();
            iface
               .proximity_keys(addr, &serde_json::Value::Array(keys).to_string())
               .await?;
         },
         AapEvent::StemPress(press) => {
            let press = serde_json::to_string(&press).unwrap_or_default();
            iface.stem_press(addr, &press).await?;
         },
         AapEvent::AudioSourceChanged(source) => {
            iface
               .audio_source_changed(addr, &source.to_json().to_string())
               .await?;
         },
         AapEvent::ConnectedDevicesChanged(devices) => {
            let devices: Vec<_> = devices.into_iter().map(|d| d.to_json()).collect();
            iface
               .connected_devices_changed(addr, &serde_json::Value::Array(devices).to_string())
               .await?;
         },
         AapEvent::OwnershipReleaseRequested {
            reverse_banner_tapped,
         } => {
            iface
               .ownership_release_requested(addr, reverse_banner_tapped)
               .await?;
         },
         AapEvent::ShowNearbyUi => {
            iface.show_nearby_ui(addr).await?;
         },
         AapEvent::UnknownPacket(packet) => {
            iface.unknown_packet(addr, &hex::encode(&packet)).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, AapService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}
