//! Attribute-protocol client.
//!
//! Handle-addressed read/write over its own channel. A receive worker owns
//! the channel; the single outstanding request is completed by the next PDU
//! that arrives.

use std::{fmt, sync::Arc, time::Duration};

use bluer::Address;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
   sync::{self, oneshot},
   task::JoinSet,
   time,
};

use crate::{
   att::hearing::HearingAidSettings,
   bluetooth::{
      l2cap::{self, Channel, ChannelFactory, L2CAP_MTU, L2CapSender, Packet},
      link::{RetryPolicy, with_retry},
   },
   debounce::Debouncer,
   error::{AapError, Result},
};

pub const ATT_READ_REQUEST: u8 = 0x0a;
pub const ATT_READ_RESPONSE: u8 = 0x0b;
pub const ATT_WRITE_REQUEST: u8 = 0x12;
pub const ATT_WRITE_RESPONSE: u8 = 0x13;

/// Transparency / hearing-aid settings block
pub const HANDLE_TRANSPARENCY: u16 = 0x18;
pub const HANDLE_LOUD_SOUND_REDUCTION: u16 = 0x1b;

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn read_request(handle: u16) -> [u8; 3] {
   let [lo, hi] = handle.to_le_bytes();
   [ATT_READ_REQUEST, lo, hi]
}

pub fn write_request(handle: u16, value: &[u8]) -> Vec<u8> {
   let [lo, hi] = handle.to_le_bytes();
   let mut pdu = Vec::with_capacity(3 + value.len());
   pdu.extend_from_slice(&[ATT_WRITE_REQUEST, lo, hi]);
   pdu.extend_from_slice(value);
   pdu
}

enum Pending {
   Idle,
   Waiting(oneshot::Sender<Result<Packet>>),
   Closed,
}

type PendingSlot = Arc<Mutex<Pending>>;

struct AttLink {
   sender: L2CapSender,
   pending: PendingSlot,
   jset: JoinSet<()>,
}

impl AttLink {
   /// Both the writer and the receive worker are still running.
   fn is_alive(&self) -> bool {
      self.sender.is_connected() && !matches!(*self.pending.lock(), Pending::Closed)
   }
}

impl Drop for AttLink {
   fn drop(&mut self) {
      self.jset.abort_all();
   }
}

struct AttInner<F: ChannelFactory> {
   address: Address,
   factory: F,
   retry: RetryPolicy,
   link: sync::RwLock<Option<AttLink>>,
   request: sync::Mutex<()>,
   debouncer: Debouncer,
}

pub struct AttClient<F: ChannelFactory>(Arc<AttInner<F>>);

impl<F: ChannelFactory> Clone for AttClient<F> {
   fn clone(&self) -> Self {
      Self(self.0.clone())
   }
}

impl<F: ChannelFactory> fmt::Debug for AttClient<F> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("AttClient")
         .field("address", &self.0.address)
         .finish_non_exhaustive()
   }
}

impl<F: ChannelFactory> AttClient<F> {
   pub fn new(address: Address, factory: F, retry: RetryPolicy, debounce: Duration) -> Self {
      Self(Arc::new(AttInner {
         address,
         factory,
         retry,
         link: sync::RwLock::new(None),
         request: sync::Mutex::new(()),
         debouncer: Debouncer::new(debounce),
      }))
   }

   pub fn address(&self) -> Address {
      self.0.address
   }

   /// False once the channel was closed by either side, so callers know to
   /// [`connect`](Self::connect) again.
   pub async fn is_connected(&self) -> bool {
      self.0.link.read().await.as_ref().is_some_and(AttLink::is_alive)
   }

   /// Opens the attribute channel, retrying per the client's policy.
   pub async fn connect(&self) -> Result<()> {
      let address = self.0.address;
      let mut link = self.0.link.write().await;
      link.take();

      info!("Connecting attribute channel to {address}");
      let channel = with_retry(
         &self.0.retry,
         |_| self.0.factory.connect(address),
         |n, _| debug!("{address}: Attribute channel attempt {n} failed"),
      )
      .await?;

      let channel = Arc::new(channel);
      let mut jset = JoinSet::new();
      let sender = l2cap::spawn_writer(&mut jset, address, channel.clone());
      let pending = PendingSlot::new(Mutex::new(Pending::Idle));
      jset.spawn(receive(address, channel, pending.clone()));
      *link = Some(AttLink {
         sender,
         pending,
         jset,
      });
      info!("Attribute channel to {address} open");
      Ok(())
   }

   pub async fn disconnect(&self) {
      self.0.debouncer.cancel();
      if self.0.link.write().await.take().is_some() {
         info!("Attribute channel to {} closed", self.0.address);
      }
   }

   /// Sends `pdu` and waits for the next PDU received.
   async fn request(&self, pdu: &[u8]) -> Result<Packet> {
      let _serial = self.0.request.lock().await;
      let (sender, pending) = {
         let link = self.0.link.read().await;
         let link = link.as_ref().ok_or(AapError::NotConnected)?;
         (link.sender.clone(), link.pending.clone())
      };

      let (tx, rx) = oneshot::channel();
      {
         let mut slot = pending.lock();
         if matches!(*slot, Pending::Closed) {
            return Err(AapError::ConnectionLost);
         }
         *slot = Pending::Waiting(tx);
      }

      if let Err(e) = sender.send(pdu).await {
         abandon(&pending);
         return Err(e);
      }

      match time::timeout(RESPONSE_TIMEOUT, rx).await {
         Ok(Ok(res)) => res,
         Ok(Err(_)) => Err(AapError::ConnectionLost),
         Err(_) => {
            abandon(&pending);
            Err(AapError::RequestTimeout)
         },
      }
   }

   /// Reads the attribute at `handle`, returning the raw response PDU.
   pub async fn read(&self, handle: u16) -> Result<Packet> {
      debug!("{}: Read handle 0x{handle:04x}", self.0.address);
      self.request(&read_request(handle)).await
   }

   /// Writes `value` to `handle`. The response PDU is consumed and dropped.
   pub async fn write(&self, handle: u16, value: &[u8]) -> Result<()> {
      debug!("{}: Write handle 0x{handle:04x}", self.0.address);
      let response = self.request(&write_request(handle, value)).await?;
      if response.first() != Some(&ATT_WRITE_RESPONSE) {
         debug!("{}: Write answered with {}", self.0.address, hex::encode(&response));
      }
      Ok(())
   }

   pub async fn read_hearing_aid(&self) -> Result<HearingAidSettings> {
      let response = self.read(HANDLE_TRANSPARENCY).await?;
      Ok(HearingAidSettings::from_bytes(&response)?)
   }

   pub async fn write_hearing_aid(&self, settings: &HearingAidSettings) -> Result<()> {
      self.write(HANDLE_TRANSPARENCY, &settings.to_bytes()).await
   }

   /// Writes `settings` after the debounce delay unless a newer block is
   /// scheduled first.
   pub fn schedule_hearing_aid(&self, settings: HearingAidSettings) {
      let client = self.clone();
      self.0.debouncer.schedule(async move {
         if let Err(e) = client.write_hearing_aid(&settings).await {
            warn!("{}: Debounced hearing-aid write failed: {e}", client.0.address);
         }
      });
   }
}

fn abandon(pending: &PendingSlot) {
   let mut slot = pending.lock();
   if matches!(*slot, Pending::Waiting(_)) {
      *slot = Pending::Idle;
   }
}

async fn receive<C: Channel>(address: Address, channel: Arc<C>, pending: PendingSlot) {
   let mut stack = [0u8; L2CAP_MTU];
   loop {
      match l2cap::recv_packet(address, &*channel, &mut stack).await {
         Ok(pdu) => {
            let slot = std::mem::replace(&mut *pending.lock(), Pending::Idle);
            match slot {
               Pending::Waiting(tx) => {
                  let _ = tx.send(Ok(pdu));
               },
               other => {
                  *pending.lock() = other;
                  warn!("{address}: Unsolicited attribute PDU {}", hex::encode(&pdu));
               },
            }
         },
         Err(e) => {
            warn!("{address}: Attribute channel closed: {e}");
            let slot = std::mem::replace(&mut *pending.lock(), Pending::Closed);
            if let Pending::Waiting(tx) = slot {
               let err = match e {
                  AapError::ConnectionLost => AapError::EmptyResponse,
                  other => other,
               };
               let _ = tx.send(Err(err));
            }
            return;
         },
      }
   }
}
