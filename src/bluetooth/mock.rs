//! In-memory channels and event sinks for tests.

use std::{
   collections::VecDeque,
   future, io,
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicU32, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use parking_lot::Mutex;
use tokio::{sync::mpsc, time};

use crate::{
   bluetooth::l2cap::{Channel, ChannelFactory},
   error::{AapError, Result},
   event::{AapEvent, EventBus},
};

pub type Written = Arc<Mutex<Vec<Vec<u8>>>>;

/// Channel fed through an unbounded sender. Dropping the sender ends the
/// stream; every write is recorded.
pub struct MockChannel {
   inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
   written: Written,
   fail_writes: Arc<AtomicBool>,
}

impl MockChannel {
   pub fn new() -> (Self, mpsc::UnboundedSender<Vec<u8>>, Written) {
      let (tx, rx) = mpsc::unbounded_channel();
      let written = Written::default();
      let channel = Self {
         inbound: tokio::sync::Mutex::new(rx),
         written: written.clone(),
         fail_writes: Arc::default(),
      };
      (channel, tx, written)
   }

   /// Handle that makes subsequent writes fail with a broken pipe.
   pub fn write_failure(&self) -> Arc<AtomicBool> {
      self.fail_writes.clone()
   }
}

impl Channel for MockChannel {
   async fn send(&self, data: &[u8]) -> io::Result<()> {
      if self.fail_writes.load(Ordering::SeqCst) {
         return Err(io::Error::from(io::ErrorKind::BrokenPipe));
      }
      self.written.lock().push(data.to_vec());
      Ok(())
   }

   async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
      match self.inbound.lock().await.recv().await {
         Some(data) => {
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            Ok(n)
         },
         None => Ok(0),
      }
   }
}

pub enum Outcome {
   Connect(MockChannel),
   Refuse,
   Hang,
}

/// Factory answering connection attempts from a script. An exhausted
/// script refuses.
#[derive(Default)]
pub struct MockFactory {
   script: Mutex<VecDeque<Outcome>>,
   attempts: AtomicU32,
}

impl MockFactory {
   pub fn new() -> Arc<Self> {
      Arc::default()
   }

   pub fn push(&self, outcome: Outcome) {
      self.script.lock().push_back(outcome);
   }

   /// Queues a fresh channel and returns its inbound sender and write log.
   pub fn push_channel(&self) -> (mpsc::UnboundedSender<Vec<u8>>, Written) {
      let (channel, tx, written) = MockChannel::new();
      self.push(Outcome::Connect(channel));
      (tx, written)
   }

   pub fn attempts(&self) -> u32 {
      self.attempts.load(Ordering::SeqCst)
   }
}

impl ChannelFactory for MockFactory {
   type Channel = MockChannel;

   async fn connect(&self, _address: Address) -> Result<MockChannel> {
      self.attempts.fetch_add(1, Ordering::SeqCst);
      let outcome = self.script.lock().pop_front();
      match outcome {
         Some(Outcome::Connect(channel)) => Ok(channel),
         Some(Outcome::Hang) => future::pending().await,
         Some(Outcome::Refuse) | None => Err(AapError::Io(io::ErrorKind::ConnectionRefused.into())),
      }
   }
}

#[derive(Default)]
pub struct RecordingBus {
   events: Mutex<Vec<(Address, AapEvent)>>,
}

impl RecordingBus {
   pub fn new() -> Arc<Self> {
      Arc::default()
   }

   pub fn events(&self) -> Vec<AapEvent> {
      self.events.lock().iter().map(|(_, e)| e.clone()).collect()
   }

   pub fn clear(&self) {
      self.events.lock().clear();
   }
}

impl EventBus for RecordingBus {
   fn emit(&self, device: Address, event: AapEvent) {
      self.events.lock().push((device, event));
   }
}

/// Polls `cond` until it holds, panicking after about two seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
   for _ in 0..400 {
      if cond() {
         return;
      }
      time::sleep(Duration::from_millis(5)).await;
   }
   panic!("condition not reached in time");
}
