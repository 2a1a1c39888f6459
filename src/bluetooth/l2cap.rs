//! L2CAP channel plumbing.
//!
//! The protocol layers only see the [`Channel`] and [`ChannelFactory`]
//! traits. [`L2capFactory`] backs them with a `bluer` sequential-packet
//! socket; tests substitute an in-memory implementation.

use std::{future::Future, io, sync::Arc, time::Duration};

use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, Socket, SocketAddr},
};
use log::{debug, warn};
use smallvec::SmallVec;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::error::{AapError, Result};

pub type Packet = SmallVec<[u8; 32]>;

/// PSM of the accessory control channel
pub const PSM_AAP: u16 = 0x1001;
/// PSM of the attribute channel
pub const PSM_ATT: u16 = 0x001f;
/// Maximum transmission unit for L2CAP packets
pub const L2CAP_MTU: usize = 672;
/// Timeout for write operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(25);

/// A connected, packet-framed byte channel.
///
/// One `recv` call yields one logical packet; `Ok(0)` means end of stream.
/// Sending and receiving may happen concurrently through shared references.
pub trait Channel: Send + Sync + 'static {
   fn send(&self, data: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
   fn recv(&self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;
}

/// Opens channels to a remote device.
pub trait ChannelFactory: Send + Sync + 'static {
   type Channel: Channel;

   fn connect(&self, address: Address) -> impl Future<Output = Result<Self::Channel>> + Send;
}

impl<T: ChannelFactory> ChannelFactory for Arc<T> {
   type Channel = T::Channel;

   fn connect(&self, address: Address) -> impl Future<Output = Result<Self::Channel>> + Send {
      (**self).connect(address)
   }
}

impl Channel for SeqPacket {
   async fn send(&self, data: &[u8]) -> io::Result<()> {
      let written = SeqPacket::send(self, data).await?;
      if written != data.len() {
         return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write: {written} of {} bytes", data.len()),
         ));
      }
      Ok(())
   }

   async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
      SeqPacket::recv(self, buf).await
   }
}

/// Opens BR/EDR sequential-packet sockets on a fixed PSM.
#[derive(Debug, Clone, Copy)]
pub struct L2capFactory {
   psm: u16,
}

impl L2capFactory {
   pub const fn new(psm: u16) -> Self {
      Self { psm }
   }

   pub const fn aap() -> Self {
      Self::new(PSM_AAP)
   }

   pub const fn att() -> Self {
      Self::new(PSM_ATT)
   }
}

impl ChannelFactory for L2capFactory {
   type Channel = SeqPacket;

   async fn connect(&self, address: Address) -> Result<SeqPacket> {
      debug!("Creating L2CAP socket for {address}");
      let socket = Socket::new_seq_packet()?;
      let addr = SocketAddr::new(address, AddressType::BrEdr, self.psm);
      debug!("Connecting to {address}:{:#06x}", self.psm);
      Ok(socket.connect(addr).await?)
   }
}

enum Command {
   Send {
      data: Packet,
      then: oneshot::Sender<Result<()>>,
   },
}

/// Sender half of a channel.
///
/// Every write goes through one writer task, so concurrent callers never
/// interleave on the socket. This type is cheaply cloneable.
#[derive(Debug, Clone)]
pub struct L2CapSender {
   tx: mpsc::Sender<Command>,
}

impl L2CapSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   pub async fn send(&self, data: &[u8]) -> Result<()> {
      if !self.is_connected() {
         return Err(AapError::ConnectionClosed);
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: Packet::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| AapError::ConnectionClosed)?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| AapError::RequestTimeout)?
         .map_err(|_| AapError::ConnectionClosed)?
   }
}

/// Spawns the writer task for `channel` and returns its sender.
pub fn spawn_writer<C: Channel>(
   jset: &mut JoinSet<()>,
   address: Address,
   channel: Arc<C>,
) -> L2CapSender {
   let (cmd_tx, cmd_rx) = mpsc::channel(128);
   jset.spawn(send_thread(address, cmd_rx, channel));
   L2CapSender { tx: cmd_tx }
}

/// Reads one packet. End of stream is reported as [`AapError::ConnectionLost`].
pub async fn recv_packet<C: Channel>(
   address: Address,
   channel: &C,
   stack: &mut [u8; L2CAP_MTU],
) -> Result<Packet> {
   let n = channel.recv(stack).await?;
   if n == 0 {
      warn!("Connection lost");
      return Err(AapError::ConnectionLost);
   }
   let recvd = &stack[..n];
   debug!("← {address}: {}", hex::encode(recvd));
   let bytes = Packet::from_slice(recvd);
   stack[..n].fill(0);
   Ok(bytes)
}

async fn send_thread<C: Channel>(
   adr: Address,
   mut rx: mpsc::Receiver<Command>,
   channel: Arc<C>,
) {
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {adr}: {}", hex::encode(&data));
            if let Err(e) = channel.send(&data).await {
               warn!("Failed to send data: {e}");
               let _ = then.send(Err(AapError::Io(e)));
            } else {
               _ = then.send(Ok(()));
            }
         },
      }
   }
   debug!("Writer for {adr} shut down");
}
