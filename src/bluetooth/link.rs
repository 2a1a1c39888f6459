//! Connection lifecycle primitives shared by both protocol clients.

use std::{future::Future, time::Duration};

use log::{debug, warn};
use serde::Serialize;
use tokio::time;

use crate::{
   config::Config,
   error::{AapError, Result},
};

/// Transport-level state of a session.
#[derive(
   Debug,
   Default,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   strum::Display,
   strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
   #[default]
   Disconnected,
   Connecting,
   Connected,
   Listening,
   Reconnecting,
   Failed,
}

impl ConnectionState {
   pub fn to_str(self) -> &'static str {
      self.into()
   }

   /// The link is up and commands can be written.
   pub const fn is_up(self) -> bool {
      matches!(self, Self::Connected | Self::Listening)
   }
}

/// Bounded retry parameters for channel acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
   pub max_attempts: u32,
   pub backoff: Duration,
   pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
   fn default() -> Self {
      Self {
         max_attempts: 3,
         backoff: Duration::from_secs(2),
         attempt_timeout: Duration::from_secs(5),
      }
   }
}

impl RetryPolicy {
   pub fn from_config(config: &Config) -> Self {
      Self {
         max_attempts: config.connection_retry_count,
         backoff: Duration::from_millis(config.reconnect_delay_ms),
         attempt_timeout: Duration::from_millis(config.connect_timeout_ms),
      }
   }
}

/// Runs `attempt` until it succeeds, at most `policy.max_attempts` times.
///
/// Each attempt is bounded by `policy.attempt_timeout`. `on_failure` is
/// called after every failed attempt that will be followed by another one,
/// before the backoff delay. Attempt numbers start at 1.
///
/// Only transport errors are retried; any other error ends the sequence
/// and is returned as is.
pub async fn with_retry<T, Fut>(
   policy: &RetryPolicy,
   mut attempt: impl FnMut(u32) -> Fut,
   mut on_failure: impl FnMut(u32, &AapError),
) -> Result<T>
where
   Fut: Future<Output = Result<T>>,
{
   let attempts = policy.max_attempts.max(1);
   for n in 1..=attempts {
      debug!("Connection attempt {n}/{attempts}");
      let err = match time::timeout(policy.attempt_timeout, attempt(n)).await {
         Ok(Ok(value)) => return Ok(value),
         Ok(Err(e)) => e,
         Err(_) => AapError::RequestTimeout,
      };
      if !err.is_transport() {
         warn!("Attempt {n}/{attempts} failed, not retrying: {err}");
         return Err(err);
      }
      warn!("Attempt {n}/{attempts} failed: {err}");
      if n < attempts {
         on_failure(n, &err);
         time::sleep(policy.backoff).await;
      }
   }
   Err(AapError::RetriesExhausted { attempts })
}
