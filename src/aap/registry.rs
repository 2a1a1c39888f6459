//! Control-command registry.
//!
//! Caches the last value seen per control identifier and fans changes out
//! to listeners. Local sends and remote notifications both go through
//! [`ControlRegistry::set_status`].

use std::{collections::BTreeMap, fmt, sync::Arc};

use log::debug;
use parking_lot::{Mutex, ReentrantMutex};

use crate::aap::protocol::{ControlCommandId, ControlValue};

/// Callback invoked with every new value for the identifier it was
/// registered on. Runs on the thread performing the update; must not block.
pub type ControlListener = Arc<dyn Fn(ControlCommandId, &ControlValue) + Send + Sync>;

/// Outcome of replacing a cached value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOp<T> {
   /// No change occurred
   Noop,
   /// A new value was inserted (None -> Some)
   Inserted,
   /// A value was deleted (Some -> None)
   Deleted(T),
   /// An existing value was updated
   Updated(T),
}

impl<T: PartialEq> UpdateOp<T> {
   pub fn new(prev: Option<T>, new: Option<&T>) -> Self {
      match (prev, new) {
         (Some(p), Some(n)) if p == *n => Self::Noop,
         (None, Some(_)) => Self::Inserted,
         (Some(p), None) => Self::Deleted(p),
         (Some(p), Some(_)) => Self::Updated(p),
         (None, None) => Self::Noop,
      }
   }

   pub const fn is_changed(&self) -> bool {
      !matches!(self, Self::Noop)
   }
}

#[derive(Default)]
pub struct ControlRegistry {
   statuses: Mutex<BTreeMap<ControlCommandId, ControlValue>>,
   listeners: Mutex<BTreeMap<ControlCommandId, Vec<ControlListener>>>,
   /// Held from store to last notification. Reentrant so listeners may
   /// update the registry themselves.
   dispatch: ReentrantMutex<()>,
}

impl fmt::Debug for ControlRegistry {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ControlRegistry")
         .field("statuses", &*self.statuses.lock())
         .field("listeners", &self.listeners.lock().len())
         .finish()
   }
}

impl ControlRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   /// Replaces the cached value for `id`, then invokes every listener
   /// registered for `id` in registration order.
   ///
   /// Updates from different threads are applied one at a time, so the last
   /// value a listener sees is the cached one. Listeners run without the
   /// map locks held and may query or update the registry.
   pub fn set_status(&self, id: ControlCommandId, value: ControlValue) -> UpdateOp<ControlValue> {
      let _dispatch = self.dispatch.lock();
      let prev = self.statuses.lock().insert(id, value.clone());
      let op = UpdateOp::new(prev, Some(&value));
      debug!("Control {id} = {} ({op:?})", hex::encode(&value));

      let listeners = self.listeners.lock().get(&id).cloned().unwrap_or_default();
      for listener in &listeners {
         listener(id, &value);
      }
      op
   }

   pub fn status(&self, id: ControlCommandId) -> Option<ControlValue> {
      self.statuses.lock().get(&id).cloned()
   }

   /// Snapshot of every cached status, ordered by identifier.
   pub fn statuses(&self) -> Vec<(ControlCommandId, ControlValue)> {
      self
         .statuses
         .lock()
         .iter()
         .map(|(id, value)| (*id, value.clone()))
         .collect()
   }

   pub fn register_listener(&self, id: ControlCommandId, listener: ControlListener) {
      self.listeners.lock().entry(id).or_default().push(listener);
   }

   /// Removes `listener` (compared by identity). Returns whether it was
   /// registered.
   pub fn unregister_listener(&self, id: ControlCommandId, listener: &ControlListener) -> bool {
      let mut listeners = self.listeners.lock();
      let Some(list) = listeners.get_mut(&id) else {
         return false;
      };
      let Some(pos) = list.iter().position(|l| Arc::ptr_eq(l, listener)) else {
         return false;
      };
      list.remove(pos);
      if list.is_empty() {
         listeners.remove(&id);
      }
      true
   }

   pub fn listener_count(&self, id: ControlCommandId) -> usize {
      self.listeners.lock().get(&id).map_or(0, Vec::len)
   }

   /// Whether this host currently owns the accessory's audio routing.
   pub fn owns(&self) -> bool {
      self
         .status(ControlCommandId::OwnsConnection)
         .is_some_and(|value| value.first() == Some(&0x01))
   }

   /// Drops every cached status and, unless `keep_listeners`, every
   /// listener registration.
   pub fn clear(&self, keep_listeners: bool) {
      self.statuses.lock().clear();
      if !keep_listeners {
         self.listeners.lock().clear();
      }
   }
}
