//! Single-slot delayed task.
//!
//! Scheduling replaces whatever is pending; only the most recent task runs,
//! once the delay has passed without a newer one arriving. A task whose
//! delay already elapsed is never interrupted.

use std::{
   future::Future,
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
   time::Duration,
};

use tokio::time;

#[derive(Debug, Clone)]
pub struct Debouncer {
   delay: Duration,
   generation: Arc<AtomicU64>,
}

impl Debouncer {
   pub fn new(delay: Duration) -> Self {
      Self {
         delay,
         generation: Arc::default(),
      }
   }

   /// Schedules `task` to run after the delay, superseding any pending one.
   /// Must be called from within a Tokio runtime.
   pub fn schedule<F>(&self, task: F)
   where
      F: Future<Output = ()> + Send + 'static,
   {
      let ticket = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
      let generation = self.generation.clone();
      let delay = self.delay;
      tokio::spawn(async move {
         time::sleep(delay).await;
         if generation.load(Ordering::Acquire) == ticket {
            task.await;
         }
      });
   }

   /// Drops the pending task, if any.
   pub fn cancel(&self) {
      self.generation.fetch_add(1, Ordering::AcqRel);
   }
}
