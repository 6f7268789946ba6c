//! Per-user fixed-window rate limiting. In-process and best effort; the
//! purpose is abuse damping, not a cross-instance correctness guarantee.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use uuid::Uuid;

pub trait RateLimiter: Send + Sync {
    /// Counts one request against the user's window. False means over limit.
    fn allow(&self, user_id: Uuid) -> bool;
    /// Drops any tracked state for the user (used on disconnect).
    fn reset(&self, user_id: Uuid);
}

struct WindowSlot {
    started_at: Instant,
    count: u32,
}

struct Inner {
    windows: HashMap<Uuid, WindowSlot>,
    last_sweep: Instant,
}

pub struct FixedWindowLimiter {
    limit: u32,
    window: Duration,
    inner: Mutex<Inner>,
}

impl FixedWindowLimiter {
    pub fn per_minute(limit: u32) -> Self {
        Self::with_window(limit, Duration::from_secs(60))
    }

    pub fn with_window(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            inner: Mutex::new(Inner {
                windows: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    fn sweep_expired(&self, inner: &mut Inner, now: Instant) {
        if now.duration_since(inner.last_sweep) < self.window {
            return;
        }
        let window = self.window;
        inner
            .windows
            .retain(|_, slot| now.duration_since(slot.started_at) < window);
        inner.last_sweep = now;
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn allow(&self, user_id: Uuid) -> bool {
        let now = Instant::now();
        // A poisoned window map is still a usable window map.
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.sweep_expired(&mut inner, now);

        let slot = inner.windows.entry(user_id).or_insert(WindowSlot {
            started_at: now,
            count: 0,
        });
        if now.duration_since(slot.started_at) >= self.window {
            slot.started_at = now;
            slot.count = 0;
        }
        if slot.count >= self.limit {
            return false;
        }
        slot.count += 1;
        true
    }

    fn reset(&self, user_id: Uuid) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.windows.remove(&user_id);
    }
}
