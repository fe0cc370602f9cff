//! Per-device throttle on payment notifications.
//!
//! Each device gets a token bucket holding `rate_limit_per_minute`
//! submissions, refilled continuously over one minute. A device that
//! resubmits a burst of captured SMS faster than that gets 429s until its
//! bucket refills; other devices are unaffected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone)]
pub struct NotifyThrottle {
    devices: Arc<Mutex<HashMap<String, Allowance>>>,
    per_minute: f64,
}

struct Allowance {
    remaining: f64,
    updated: Instant,
}

impl NotifyThrottle {
    pub fn new(per_minute: u32) -> Self {
        Self {
            devices: Arc::new(Mutex::new(HashMap::new())),
            per_minute: f64::from(per_minute.max(1)),
        }
    }

    /// Take one submission from `device_id`'s allowance.
    pub fn admit(&self, device_id: &str) -> bool {
        self.admit_at(device_id, Instant::now())
    }

    fn admit_at(&self, device_id: &str, now: Instant) -> bool {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let allowance = devices
            .entry(device_id.to_string())
            .or_insert_with(|| Allowance {
                remaining: self.per_minute,
                updated: now,
            });

        let minutes = now.saturating_duration_since(allowance.updated).as_secs_f64() / 60.0;
        allowance.remaining = (allowance.remaining + minutes * self.per_minute).min(self.per_minute);
        allowance.updated = now;

        if allowance.remaining < 1.0 {
            return false;
        }
        allowance.remaining -= 1.0;
        true
    }

    /// Forget devices that have not submitted for `idle`. Returns how many.
    pub fn forget_idle(&self, idle: Duration) -> usize {
        let mut devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        let before = devices.len();
        let now = Instant::now();
        devices.retain(|_, a| now.saturating_duration_since(a.updated) < idle);
        before - devices.len()
    }
}
