//! Accessory-protocol session.
//!
//! An [`AapSession`] owns the control channel to one accessory. It runs the
//! connect/handshake/listen lifecycle with bounded retries, feeds every
//! received packet to the [`Router`] and exposes the send API.

use core::fmt;
use std::{
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, AtomicU32, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use log::{debug, error, info, warn};
use tokio::{
   sync::{Mutex, Notify, RwLock},
   task::{AbortHandle, JoinSet},
};

use crate::{
   aap::{
      parser,
      protocol::{
         AudioSource, ConnectedDevice, ControlCommandId, ControlValue, HEADER, NoiseControlMode,
         OPCODE_OFFSET, Opcode, PAYLOAD_REQUEST_NOTIFY, PAYLOAD_SET_FEATURES,
         PAYLOAD_START_HEAD_TRACKING, PAYLOAD_STOP_HEAD_TRACKING, PKT_HANDSHAKE, ProximityKeyType,
         bool_value, control_command, data_packet, phone_media_eq, rename,
         request_proximity_keys, stem_config,
      },
      registry::{ControlListener, ControlRegistry},
      router::Router,
      smart_routing,
   },
   bluetooth::{
      l2cap::{self, ChannelFactory, L2CAP_MTU, L2CapSender},
      link::{ConnectionState, RetryPolicy, with_retry},
   },
   config::Config,
   debounce::Debouncer,
   error::{AapError, Result},
   event::{AapEvent, EventSender},
};

/// Tunables for a session.
#[derive(Debug, Clone)]
pub struct SessionParams {
   pub retry: RetryPolicy,
   /// Re-enter `Connecting` on link loss when driven by [`AapSession::run`].
   pub auto_reconnect: bool,
   /// Keep listener registrations across a disconnect.
   pub keep_listeners: bool,
   pub debounce: Duration,
}

impl Default for SessionParams {
   fn default() -> Self {
      Self {
         retry: RetryPolicy::default(),
         auto_reconnect: true,
         keep_listeners: false,
         debounce: Duration::from_millis(100),
      }
   }
}

impl SessionParams {
   pub fn from_config(config: &Config) -> Self {
      Self {
         retry: RetryPolicy::from_config(config),
         auto_reconnect: config.auto_reconnect,
         keep_listeners: config.keep_listeners_on_disconnect,
         debounce: Duration::from_millis(config.debounce_ms),
      }
   }
}

/// A live channel: the writer task and the listener reading from it.
struct Link {
   sender: L2CapSender,
   jset: JoinSet<()>,
   listener: Option<AbortHandle>,
}

impl Drop for Link {
   fn drop(&mut self) {
      self.jset.abort_all();
      if let Some(listener) = self.listener.take() {
         listener.abort();
      }
   }
}

struct SessionInner<F: ChannelFactory> {
   address: Address,
   factory: F,
   params: SessionParams,
   state: AtomicCell<ConnectionState>,
   attempts: AtomicU32,
   router: Router,
   events: EventSender,
   link: RwLock<Option<Link>>,
   lifecycle: Mutex<()>,
   lost: Notify,
   retry: Notify,
   cancel: Notify,
   stopped: AtomicBool,
   debouncer: Debouncer,
}

pub struct AapSession<F: ChannelFactory>(Arc<SessionInner<F>>);

impl<F: ChannelFactory> Clone for AapSession<F> {
   fn clone(&self) -> Self {
      Self(self.0.clone())
   }
}

impl<F: ChannelFactory> fmt::Debug for AapSession<F> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("AapSession")
         .field("address", &self.0.address)
         .field("state", &self.state())
         .field("attempts", &self.attempts())
         .field("registry", self.registry())
         .finish_non_exhaustive()
   }
}

struct WeakSession<F: ChannelFactory>(Weak<SessionInner<F>>);

impl<F: ChannelFactory> WeakSession<F> {
   fn new(session: &AapSession<F>) -> Self {
      Self(Arc::downgrade(&session.0))
   }

   fn upgrade(&self) -> Option<AapSession<F>> {
      self.0.upgrade().map(AapSession)
   }
}

impl<F: ChannelFactory> AapSession<F> {
   pub fn new(address: Address, factory: F, params: SessionParams, events: EventSender) -> Self {
      let debouncer = Debouncer::new(params.debounce);
      Self(Arc::new(SessionInner {
         address,
         factory,
         params,
         state: AtomicCell::new(ConnectionState::Disconnected),
         attempts: AtomicU32::new(0),
         router: Router::new(address, events.clone()),
         events,
         link: RwLock::new(None),
         lifecycle: Mutex::new(()),
         lost: Notify::new(),
         retry: Notify::new(),
         cancel: Notify::new(),
         stopped: AtomicBool::new(false),
         debouncer,
      }))
   }

   pub fn address(&self) -> Address {
      self.0.address
   }

   pub fn state(&self) -> ConnectionState {
      self.0.state.load()
   }

   /// Connection attempts made in the current attempt sequence.
   pub fn attempts(&self) -> u32 {
      self.0.attempts.load(Ordering::Relaxed)
   }

   pub fn registry(&self) -> &Arc<ControlRegistry> {
      self.0.router.registry()
   }

   pub fn status(&self, id: ControlCommandId) -> Option<ControlValue> {
      self.registry().status(id)
   }

   /// Registers a listener for `id`.
   ///
   /// Registrations are dropped on disconnect unless the session was built
   /// with `keep_listeners`; subscribers must re-register after reconnecting.
   pub fn register_listener(&self, id: ControlCommandId, listener: ControlListener) {
      self.registry().register_listener(id, listener);
   }

   pub fn unregister_listener(&self, id: ControlCommandId, listener: &ControlListener) -> bool {
      self.registry().unregister_listener(id, listener)
   }

   pub fn owns(&self) -> bool {
      self.registry().owns()
   }

   pub fn connected_devices(&self) -> Vec<ConnectedDevice> {
      self.0.router.connected_devices()
   }

   pub fn previous_connected_devices(&self) -> Vec<ConnectedDevice> {
      self.0.router.previous_connected_devices()
   }

   pub fn audio_source(&self) -> Option<AudioSource> {
      self.0.router.audio_source()
   }

   fn set_state(&self, state: ConnectionState) {
      let prev = self.0.state.swap(state);
      if prev != state {
         info!("{}: {prev} -> {state}", self.0.address);
         self
            .0
            .events
            .emit(self.0.address, AapEvent::ConnectionStateChanged(state));
      }
   }

   /// Opens the channel, performs the handshake and starts listening.
   ///
   /// Up to `max_attempts` attempts are made, with the attempt counter
   /// starting from zero on every call. When all of them fail the session
   /// is left `Failed`.
   pub async fn connect(&self) -> Result<()> {
      let Ok(_guard) = self.0.lifecycle.try_lock() else {
         return Err(AapError::AlreadyConnecting);
      };
      self.teardown().await;

      info!("Connecting to accessory at {}", self.0.address);
      self.0.attempts.store(0, Ordering::Relaxed);
      let attempts = with_retry(
         &self.0.params.retry,
         move |n| {
            self.0.attempts.store(n, Ordering::Relaxed);
            self.set_state(ConnectionState::Connecting);
            self.establish()
         },
         move |_, _| self.set_state(ConnectionState::Reconnecting),
      );

      let res = tokio::select! {
         res = attempts => res,
         () = self.0.cancel.notified() => Err(AapError::ConnectionClosed),
      };
      match res {
         Ok(()) => {
            info!("Successfully connected to {}", self.0.address);
            Ok(())
         },
         Err(AapError::ConnectionClosed) => {
            info!("{}: Connect cancelled", self.0.address);
            self.set_state(ConnectionState::Disconnected);
            Err(AapError::ConnectionClosed)
         },
         Err(e) => {
            error!("{}: Giving up: {e}", self.0.address);
            self.set_state(ConnectionState::Failed);
            Err(e)
         },
      }
   }

   async fn establish(&self) -> Result<()> {
      let address = self.0.address;
      let channel = Arc::new(self.0.factory.connect(address).await?);
      let mut jset = JoinSet::new();
      let sender = l2cap::spawn_writer(&mut jset, address, channel.clone());
      self.set_state(ConnectionState::Connected);

      info!("{address}: Starting handshake sequence...");
      sender.send(PKT_HANDSHAKE).await?;
      sender.send(&data_packet(PAYLOAD_SET_FEATURES)).await?;
      sender.send(&data_packet(PAYLOAD_REQUEST_NOTIFY)).await?;
      debug!("{address}: Handshake sequence completed");

      // The listener may only observe a link loss once the link is installed
      let mut link = self.0.link.write().await;
      let listener = tokio::spawn(listen(WeakSession::new(self), address, channel));
      *link = Some(Link {
         sender,
         jset,
         listener: Some(listener.abort_handle()),
      });
      self.set_state(ConnectionState::Listening);
      Ok(())
   }

   /// Drops the link, and with it every cached value. Without a live link
   /// the registry is left alone.
   async fn teardown(&self) {
      let link = self.0.link.write().await.take();
      self.0.debouncer.cancel();
      if let Some(link) = link {
         drop(link);
         self.0.router.reset(self.0.params.keep_listeners);
         info!("Disconnected from {}", self.0.address);
      }
   }

   async fn on_link_lost(&self, err: AapError) {
      warn!("{}: Link lost: {err}", self.0.address);
      if let Some(mut link) = self.0.link.write().await.take() {
         // Called from the listener itself
         link.listener = None;
      }
      self.0.debouncer.cancel();
      self.0.router.reset(self.0.params.keep_listeners);
      self.set_state(ConnectionState::Disconnected);
      self.0.lost.notify_one();
   }

   /// Closes the link and stops [`run`](Self::run) from reconnecting until
   /// [`retry`](Self::retry) is called. A connect in progress is cancelled.
   pub async fn disconnect(&self) {
      self.0.stopped.store(true, Ordering::Release);
      self.0.cancel.notify_waiters();
      let _guard = self.0.lifecycle.lock().await;
      self.teardown().await;
      self.set_state(ConnectionState::Disconnected);
      self.0.lost.notify_one();
   }

   /// External retry trigger, the only way out of `Failed` or a
   /// [`disconnect`](Self::disconnect) for [`run`](Self::run).
   pub fn retry(&self) {
      info!("{}: Retry requested", self.0.address);
      self.0.stopped.store(false, Ordering::Release);
      self.0.attempts.store(0, Ordering::Relaxed);
      self.0.retry.notify_one();
   }

   /// Connection supervisor. Connects, waits for the link to go away and
   /// reconnects while auto-reconnect is enabled. Never returns.
   pub async fn run(&self) {
      loop {
         if self.0.stopped.load(Ordering::Acquire) {
            self.0.retry.notified().await;
            continue;
         }

         match self.connect().await {
            Ok(()) => {
               while self.state().is_up() {
                  self.0.lost.notified().await;
               }
               if !self.0.params.auto_reconnect {
                  info!("{}: Auto-reconnect disabled, waiting for retry", self.0.address);
                  self.0.retry.notified().await;
               }
            },
            Err(AapError::AlreadyConnecting) => {
               self.0.lost.notified().await;
            },
            Err(e) => {
               if !self.0.stopped.load(Ordering::Acquire) {
                  warn!("{}: {e}, waiting for retry", self.0.address);
                  self.0.retry.notified().await;
               }
            },
         }
      }
   }

   async fn sender(&self) -> Result<L2CapSender> {
      self
         .0
         .link
         .read()
         .await
         .as_ref()
         .map(|link| link.sender.clone())
         .ok_or(AapError::NotConnected)
   }

   /// Writes a complete packet.
   ///
   /// Control commands with a known identifier are mirrored into the
   /// registry once written, exactly as if the accessory had reported them.
   pub async fn send_packet(&self, packet: &[u8]) -> Result<()> {
      let control = if packet.starts_with(&HEADER)
         && packet.get(OPCODE_OFFSET) == Some(&(Opcode::ControlCommand as u8))
      {
         Some(parser::decode_control_command(packet)?)
      } else {
         None
      };

      self.sender().await?.send(packet).await?;

      if let Some(cmd) = control {
         match cmd.id() {
            Some(id) => {
               self.0.router.apply_control(id, cmd.value);
            },
            None => debug!("Sent unknown control identifier 0x{:02x}", cmd.identifier),
         }
      }
      Ok(())
   }

   /// Prepends the sync header to `payload` and writes it.
   pub async fn send_data_packet(&self, payload: &[u8]) -> Result<()> {
      self.send_packet(&data_packet(payload)).await
   }

   /// Writes `payload` after the debounce delay unless superseded by a later
   /// call. Failures are logged.
   pub fn schedule_data_packet(&self, payload: Vec<u8>) {
      let session = self.clone();
      self.0.debouncer.schedule(async move {
         if let Err(e) = session.send_data_packet(&payload).await {
            warn!("{}: Debounced write failed: {e}", session.0.address);
         }
      });
   }

   /// Values longer than four bytes are truncated.
   pub async fn send_control_command(&self, id: ControlCommandId, value: &[u8]) -> Result<()> {
      self.send_data_packet(&control_command(id.id(), value)).await
   }

   pub async fn set_feature(&self, id: ControlCommandId, enabled: bool) -> Result<()> {
      self.send_control_command(id, &bool_value(enabled)).await
   }

   pub async fn set_noise_control(&self, mode: NoiseControlMode) -> Result<()> {
      self
         .send_control_command(ControlCommandId::ListeningMode, &[mode as u8])
         .await
   }

   /// Selects which stem press kinds are reported instead of handled by the
   /// accessory.
   pub async fn send_stem_config(
      &self,
      single: bool,
      double: bool,
      triple: bool,
      long: bool,
   ) -> Result<()> {
      self
         .send_control_command(
            ControlCommandId::StemConfig,
            &[stem_config(single, double, triple, long)],
         )
         .await
   }

   pub async fn request_proximity_keys(&self, kind: ProximityKeyType) -> Result<()> {
      self.send_data_packet(&request_proximity_keys(kind)).await
   }

   pub async fn start_head_tracking(&self) -> Result<()> {
      self.send_data_packet(PAYLOAD_START_HEAD_TRACKING).await
   }

   pub async fn stop_head_tracking(&self) -> Result<()> {
      self.send_data_packet(PAYLOAD_STOP_HEAD_TRACKING).await
   }

   pub async fn rename(&self, name: &str) -> Result<()> {
      self.send_data_packet(&rename(name)).await
   }

   pub async fn send_phone_media_eq(&self, eq: &[f32; 8], phone: u8, media: u8) -> Result<()> {
      self.send_data_packet(&phone_media_eq(eq, phone, media)).await
   }

   fn other_hosts(&self, self_address: Address) -> impl Iterator<Item = Address> {
      self
         .connected_devices()
         .into_iter()
         .map(|d| d.address)
         .filter(move |address| *address != self_address)
   }

   /// Tells the first other host what this host is playing. Returns false
   /// when no other host is connected.
   pub async fn send_media_information(&self, self_address: &str, streaming: bool) -> Result<bool> {
      let own = smart_routing::parse_address(self_address)?;
      let Some(target) = self.other_hosts(own).next() else {
         warn!("Cannot send media information: no other host connected");
         return Ok(false);
      };
      debug!("Sending media information to {target}");
      let payload = smart_routing::media_information(self_address, target, streaming)?;
      self.send_data_packet(&payload).await?;
      Ok(true)
   }

   pub async fn send_media_information_new_device(
      &self,
      self_address: &str,
      target: &str,
   ) -> Result<()> {
      let payload = smart_routing::media_information_new_device(self_address, target)?;
      self.send_data_packet(&payload).await
   }

   /// Asks every other host to release audio ownership. Returns the number
   /// of hosts addressed.
   pub async fn send_hijack_request(&self, self_address: &str) -> Result<usize> {
      let own = smart_routing::parse_address(self_address)?;
      let mut sent = 0;
      for target in self.other_hosts(own) {
         debug!("Sending hijack request to {target}");
         self
            .send_data_packet(&smart_routing::hijack_request(target))
            .await?;
         sent += 1;
      }
      Ok(sent)
   }

   /// Hands audio ownership back to every other host.
   pub async fn send_hijack_reversed(&self, self_address: &str) -> Result<usize> {
      let own = smart_routing::parse_address(self_address)?;
      let mut sent = 0;
      for target in self.other_hosts(own) {
         debug!("Sending hijack reversed to {target}");
         self
            .send_data_packet(&smart_routing::hijack_reversed(target))
            .await?;
         sent += 1;
      }
      Ok(sent)
   }

   pub async fn send_show_nearby_ui(&self, self_address: &str) -> Result<bool> {
      let own = smart_routing::parse_address(self_address)?;
      let Some(target) = self.other_hosts(own).next() else {
         warn!("Cannot send show-nearby-UI: no other host connected");
         return Ok(false);
      };
      self
         .send_data_packet(&smart_routing::show_nearby_ui(target))
         .await?;
      Ok(true)
   }

   pub async fn send_add_tipi_device(&self, self_address: &str, target: &str) -> Result<()> {
      let payload = smart_routing::add_tipi_device(self_address, target)?;
      self.send_data_packet(&payload).await
   }
}

/// Receive loop. Packets are routed one at a time; protocol errors drop
/// the packet only.
async fn listen<F: ChannelFactory>(
   weak: WeakSession<F>,
   address: Address,
   channel: Arc<F::Channel>,
) {
   let mut stack = [0u8; L2CAP_MTU];
   loop {
      match l2cap::recv_packet(address, &*channel, &mut stack).await {
         Ok(packet) => {
            let Some(session) = weak.upgrade() else {
               warn!("{address}: Session was dropped");
               return;
            };
            if let Err(e) = session.0.router.route(&packet) {
               warn!("{address}: Dropped packet {}: {e}", hex::encode(&packet));
            }
         },
         Err(e) => {
            if let Some(session) = weak.upgrade() {
               session.on_link_lost(e).await;
            } else {
               warn!("{address}: Connection closed: {e}");
            }
            return;
         },
      }
   }
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::AtomicUsize;

   use super::*;
   use crate::{
      aap::protocol::control_value,
      bluetooth::mock::{MockFactory, Outcome, RecordingBus, eventually},
   };

   const DEVICE: Address = Address([0x10, 0x20, 0x30, 0x40, 0x50, 0x60]);
   const SELF_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

   fn params() -> SessionParams {
      SessionParams {
         retry: RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
            attempt_timeout: Duration::from_millis(200),
         },
         auto_reconnect: true,
         keep_listeners: false,
         debounce: Duration::from_millis(20),
      }
   }

   fn session_with(
      params: SessionParams,
   ) -> (AapSession<Arc<MockFactory>>, Arc<MockFactory>, Arc<RecordingBus>) {
      let factory = MockFactory::new();
      let bus = RecordingBus::new();
      let session = AapSession::new(DEVICE, factory.clone(), params, bus.clone());
      (session, factory, bus)
   }

   fn session() -> (AapSession<Arc<MockFactory>>, Arc<MockFactory>, Arc<RecordingBus>) {
      session_with(params())
   }

   fn states(bus: &RecordingBus) -> Vec<ConnectionState> {
      bus.events()
         .into_iter()
         .filter_map(|e| match e {
            AapEvent::ConnectionStateChanged(s) => Some(s),
            _ => None,
         })
         .collect()
   }

   #[tokio::test]
   async fn test_connect_performs_handshake() {
      let (session, factory, bus) = session();
      let (_inbound, written) = factory.push_channel();

      session.connect().await.unwrap();

      assert_eq!(session.state(), ConnectionState::Listening);
      assert_eq!(session.attempts(), 1);
      let written = written.lock();
      assert_eq!(written.len(), 3);
      assert_eq!(written[0], PKT_HANDSHAKE);
      assert_eq!(written[1], data_packet(PAYLOAD_SET_FEATURES).to_vec());
      assert_eq!(written[2], data_packet(PAYLOAD_REQUEST_NOTIFY).to_vec());
      assert_eq!(
         states(&bus),
         vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Listening
         ]
      );
   }

   #[tokio::test]
   async fn test_connect_gives_up_after_max_attempts() {
      let (session, factory, bus) = session();

      let res = session.connect().await;
      assert!(matches!(res, Err(AapError::RetriesExhausted { attempts: 3 })));
      assert_eq!(factory.attempts(), 3);
      assert_eq!(session.attempts(), 3);
      assert_eq!(session.state(), ConnectionState::Failed);
      assert_eq!(
         states(&bus),
         vec![
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Reconnecting,
            ConnectionState::Connecting,
            ConnectionState::Failed
         ]
      );

      // A fresh sequence starts counting from zero
      factory.push(Outcome::Refuse);
      let (_inbound, _written) = factory.push_channel();
      session.connect().await.unwrap();
      assert_eq!(session.attempts(), 2);
      assert_eq!(factory.attempts(), 5);
   }

   #[tokio::test]
   async fn test_hanging_attempt_times_out() {
      let (session, factory, _bus) = session();
      factory.push(Outcome::Hang);
      let (_inbound, _written) = factory.push_channel();
      session.connect().await.unwrap();
      assert_eq!(session.attempts(), 2);
   }

   #[tokio::test]
   async fn test_concurrent_connect_is_rejected() {
      let (session, factory, _bus) = session();
      factory.push(Outcome::Hang);
      let (_inbound, _written) = factory.push_channel();

      let first = tokio::spawn({
         let session = session.clone();
         async move { session.connect().await }
      });
      eventually(|| factory.attempts() == 1).await;
      assert!(matches!(session.connect().await, Err(AapError::AlreadyConnecting)));
      first.await.unwrap().unwrap();
   }

   #[tokio::test]
   async fn test_received_packets_are_routed() {
      let (session, factory, bus) = session();
      let (inbound, _written) = factory.push_channel();
      session.connect().await.unwrap();

      // Malformed packets are dropped without touching the link
      inbound.send(vec![0x01, 0x02, 0x03]).unwrap();
      inbound
         .send(vec![0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0d, 0x03, 0x00, 0x00, 0x00])
         .unwrap();

      eventually(|| session.status(ControlCommandId::ListeningMode).is_some()).await;
      assert_eq!(
         session.status(ControlCommandId::ListeningMode),
         Some(control_value(&[0x03]))
      );
      assert_eq!(session.state(), ConnectionState::Listening);
      assert!(bus.events().iter().any(|e| matches!(e, AapEvent::ControlCommand(_))));
   }

   #[tokio::test]
   async fn test_send_updates_registry_and_listeners() {
      let (session, factory, _bus) = session();
      let (_inbound, written) = factory.push_channel();
      session.connect().await.unwrap();

      let calls = Arc::new(AtomicUsize::new(0));
      {
         let calls = calls.clone();
         session.register_listener(
            ControlCommandId::ListeningMode,
            Arc::new(move |_: ControlCommandId, _: &ControlValue| {
               calls.fetch_add(1, Ordering::SeqCst);
            }),
         );
      }

      session.set_noise_control(NoiseControlMode::NC).await.unwrap();

      assert_eq!(
         written.lock().last().unwrap(),
         &vec![0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0d, 0x02, 0x00, 0x00, 0x00]
      );
      assert_eq!(
         session.status(ControlCommandId::ListeningMode),
         Some(control_value(&[0x02]))
      );
      assert_eq!(calls.load(Ordering::SeqCst), 1);
   }

   #[tokio::test]
   async fn test_failed_write_leaves_registry_untouched() {
      let (session, factory, _bus) = session();
      let (channel, _inbound, _written) = crate::bluetooth::mock::MockChannel::new();
      let fail = channel.write_failure();
      factory.push(Outcome::Connect(channel));
      session.connect().await.unwrap();

      fail.store(true, Ordering::SeqCst);
      assert!(matches!(
         session.set_feature(ControlCommandId::VoiceTrigger, true).await,
         Err(AapError::Io(_))
      ));
      assert_eq!(session.status(ControlCommandId::VoiceTrigger), None);
   }

   #[tokio::test]
   async fn test_send_requires_connection() {
      let (session, _factory, _bus) = session();
      assert!(matches!(
         session.send_control_command(ControlCommandId::MicMode, &[0x01]).await,
         Err(AapError::NotConnected)
      ));
   }

   #[tokio::test]
   async fn test_link_loss_clears_state() {
      let (session, factory, _bus) = session();
      let (inbound, _written) = factory.push_channel();
      session.connect().await.unwrap();

      session.register_listener(
         ControlCommandId::MicMode,
         Arc::new(|_: ControlCommandId, _: &ControlValue| {}),
      );
      inbound
         .send(vec![0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x01, 0x01, 0x00, 0x00, 0x00])
         .unwrap();
      eventually(|| session.status(ControlCommandId::MicMode).is_some()).await;

      drop(inbound);
      eventually(|| session.state() == ConnectionState::Disconnected).await;
      assert!(session.registry().statuses().is_empty());
      assert_eq!(session.registry().listener_count(ControlCommandId::MicMode), 0);
      assert!(matches!(session.rename("x").await, Err(AapError::NotConnected)));
   }

   #[tokio::test]
   async fn test_link_loss_can_keep_listeners() {
      let (session, factory, _bus) = session_with(SessionParams {
         keep_listeners: true,
         ..params()
      });
      let (inbound, _written) = factory.push_channel();
      session.connect().await.unwrap();
      session.register_listener(
         ControlCommandId::MicMode,
         Arc::new(|_: ControlCommandId, _: &ControlValue| {}),
      );

      drop(inbound);
      eventually(|| session.state() == ConnectionState::Disconnected).await;
      assert_eq!(session.registry().listener_count(ControlCommandId::MicMode), 1);
   }

   #[tokio::test]
   async fn test_listener_registered_before_connect_survives() {
      let (session, factory, _bus) = session();
      let calls = Arc::new(AtomicUsize::new(0));
      {
         let calls = calls.clone();
         session.register_listener(
            ControlCommandId::MicMode,
            Arc::new(move |_: ControlCommandId, _: &ControlValue| {
               calls.fetch_add(1, Ordering::SeqCst);
            }),
         );
      }

      // A failed sequence leaves no link behind and must not drop it either
      assert!(session.connect().await.is_err());
      assert_eq!(session.state(), ConnectionState::Failed);

      let (inbound, _written) = factory.push_channel();
      session.connect().await.unwrap();
      assert_eq!(session.registry().listener_count(ControlCommandId::MicMode), 1);

      inbound
         .send(vec![0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x01, 0x01, 0x00, 0x00, 0x00])
         .unwrap();
      eventually(|| calls.load(Ordering::SeqCst) == 1).await;
   }

   #[tokio::test]
   async fn test_reconnect_over_live_link_resets_registry() {
      let (session, factory, _bus) = session();
      let (inbound, _written) = factory.push_channel();
      session.connect().await.unwrap();
      inbound
         .send(vec![0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x01, 0x01, 0x00, 0x00, 0x00])
         .unwrap();
      eventually(|| session.status(ControlCommandId::MicMode).is_some()).await;

      let (_second, _written) = factory.push_channel();
      session.connect().await.unwrap();
      assert_eq!(session.status(ControlCommandId::MicMode), None);
   }

   #[tokio::test]
   async fn test_supervisor_reconnects_after_link_loss() {
      let (session, factory, _bus) = session();
      let (first, _) = factory.push_channel();
      let (_second, second_written) = factory.push_channel();

      let supervisor = tokio::spawn({
         let session = session.clone();
         async move { session.run().await }
      });
      eventually(|| session.state() == ConnectionState::Listening).await;

      drop(first);
      eventually(|| second_written.lock().len() == 3).await;
      eventually(|| session.state() == ConnectionState::Listening).await;
      assert_eq!(factory.attempts(), 2);
      supervisor.abort();
   }

   #[tokio::test]
   async fn test_supervisor_waits_for_retry_after_failure() {
      let (session, factory, _bus) = session();
      let supervisor = tokio::spawn({
         let session = session.clone();
         async move { session.run().await }
      });
      eventually(|| session.state() == ConnectionState::Failed).await;
      assert_eq!(factory.attempts(), 3);

      tokio::time::sleep(Duration::from_millis(30)).await;
      assert_eq!(factory.attempts(), 3);

      let (_inbound, _written) = factory.push_channel();
      session.retry();
      eventually(|| session.state() == ConnectionState::Listening).await;
      assert_eq!(session.attempts(), 1);
      assert_eq!(factory.attempts(), 4);
      supervisor.abort();
   }

   #[tokio::test]
   async fn test_disconnect_stops_supervisor() {
      let (session, factory, _bus) = session();
      let (_first, _) = factory.push_channel();
      let (_second, _) = factory.push_channel();
      let supervisor = tokio::spawn({
         let session = session.clone();
         async move { session.run().await }
      });
      eventually(|| session.state() == ConnectionState::Listening).await;

      session.disconnect().await;
      assert_eq!(session.state(), ConnectionState::Disconnected);
      tokio::time::sleep(Duration::from_millis(30)).await;
      assert_eq!(factory.attempts(), 1);

      session.retry();
      eventually(|| session.state() == ConnectionState::Listening).await;
      assert_eq!(factory.attempts(), 2);
      supervisor.abort();
   }

   #[tokio::test]
   async fn test_ownership_builders_validate_before_writing() {
      let (session, factory, _bus) = session();
      let (_inbound, written) = factory.push_channel();
      session.connect().await.unwrap();
      let before = written.lock().len();

      for bad in ["AA:BB:CC:DD:EE", "AA:BB:CC:DD:EE:GG", "AABBCCDDEEFF00000"] {
         assert!(matches!(
            session.send_hijack_request(bad).await,
            Err(AapError::InvalidAddress(_))
         ));
         assert!(matches!(
            session.send_media_information(bad, true).await,
            Err(AapError::InvalidAddress(_))
         ));
         assert!(matches!(
            session.send_add_tipi_device(SELF_ADDRESS, bad).await,
            Err(AapError::InvalidAddress(_))
         ));
      }
      assert_eq!(written.lock().len(), before);
   }

   #[tokio::test]
   async fn test_hijack_request_skips_self() {
      let (session, factory, _bus) = session();
      let (inbound, written) = factory.push_channel();
      session.connect().await.unwrap();

      inbound
         .send(vec![
            0x04, 0x00, 0x04, 0x00, 0x2e, 0x00, 0x00, 0x00, 0x02, // two hosts
            0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x01, 0x01, // self
            0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x01, 0x00,
         ])
         .unwrap();
      eventually(|| session.connected_devices().len() == 2).await;

      assert_eq!(session.send_hijack_request(SELF_ADDRESS).await.unwrap(), 1);
      let written = written.lock();
      let packet = written.last().unwrap();
      assert_eq!(packet.len(), 4 + 2 + 106);
      assert_eq!(&packet[4..12], &[0x10, 0x00, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
   }

   #[tokio::test]
   async fn test_show_nearby_ui_without_other_host() {
      let (session, factory, _bus) = session();
      let (_inbound, _written) = factory.push_channel();
      session.connect().await.unwrap();
      assert!(!session.send_show_nearby_ui(SELF_ADDRESS).await.unwrap());
   }

   #[tokio::test]
   async fn test_scheduled_writes_coalesce() {
      let (session, factory, _bus) = session();
      let (_inbound, written) = factory.push_channel();
      session.connect().await.unwrap();

      for level in 0..4u8 {
         let payload = control_command(ControlCommandId::ChimeVolume.id(), &[level]);
         session.schedule_data_packet(payload.to_vec());
      }
      eventually(|| written.lock().len() == 4).await;
      tokio::time::sleep(Duration::from_millis(60)).await;
      assert_eq!(written.lock().len(), 4);
      assert_eq!(
         session.status(ControlCommandId::ChimeVolume),
         Some(control_value(&[0x03]))
      );
   }
}
