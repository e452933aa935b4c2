//! crates/likeshelf_core/src/cooldown.rs
//!
//! Per-user cooldown for expensive entry points.
//!
//! The registry is in-process only: it resets on restart and is not shared between
//! instances. It exists to avoid wasted external work; transactional writes in the
//! store remain the correctness guarantee.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub struct CooldownRegistry {
    window: Duration,
    started: Mutex<HashMap<Uuid, Instant>>,
}

impl CooldownRegistry {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            started: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a cooldown for `user_id` unless one is already running.
    ///
    /// Check and set happen under one lock, so of two concurrent callers exactly one
    /// gets `Ok`. On refusal the time left is returned. Expired entries are dropped
    /// on every call.
    pub fn try_begin(&self, user_id: Uuid) -> Result<(), Duration> {
        let now = Instant::now();
        let mut started = self
            .started
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        started.retain(|_, at| now.duration_since(*at) < self.window);

        if let Some(at) = started.get(&user_id) {
            return Err(self.window.saturating_sub(now.duration_since(*at)));
        }
        started.insert(user_id, now);
        Ok(())
    }

    pub fn tracked_users(&self) -> usize {
        self.started
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
