//! Process-wide timestamp governing when a full refresh pass is due.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

#[derive(Debug)]
pub struct RefreshClock {
  last_refresh: Mutex<DateTime<Utc>>,
  interval: Duration,
  /// Held for the duration of a refresh pass so at most one runs at a time.
  pass: AsyncMutex<()>,
}

impl RefreshClock {
  /// Start the clock at `now`: caches just initialized are fresh.
  pub fn new(interval: Duration) -> Self {
    Self::starting_at(Utc::now(), interval)
  }

  pub fn starting_at(last_refresh: DateTime<Utc>, interval: Duration) -> Self {
    Self {
      last_refresh: Mutex::new(last_refresh),
      interval,
      pass: AsyncMutex::new(()),
    }
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  pub fn last_refresh(&self) -> DateTime<Utc> {
    *self
      .last_refresh
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  pub fn is_due(&self) -> bool {
    self.is_due_at(Utc::now())
  }

  pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
    now - self.last_refresh() >= self.interval
  }

  /// Move the clock forward. Never moves it backwards.
  pub fn advance_to(&self, now: DateTime<Utc>) {
    let mut last = self
      .last_refresh
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    if now > *last {
      *last = now;
    }
  }

  /// Wait for exclusive right to run a refresh pass.
  pub async fn begin_pass(&self) -> AsyncMutexGuard<'_, ()> {
    self.pass.lock().await
  }
}
