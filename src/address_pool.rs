//! A rotating pool of candidate server addresses with per-slot cooldown.
//!
//! Each draw puts the slot on cooldown; the cooldown grows by
//! `factor^attempts` and caps at the base timeout, so a flapping peer gets
//! retried quickly at first and then backs off. `reset` with no values keeps
//! the address list and re-bases the cooldowns, which the dialing loop uses
//! after a successful handshake to shorten backoff against a now-healthy
//! peer.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct Slot {
    value: String,
    attempts: u32,
    usable_at: Instant,
}

struct PoolInner {
    slots: Vec<Slot>,
    next: usize,
    factor: u32,
    base_timeout: Duration,
}

pub struct AddressPool {
    inner: Mutex<PoolInner>,
}

impl AddressPool {
    pub fn new(values: &[String], factor: u32, base_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(PoolInner {
                slots: values
                    .iter()
                    .map(|v| Slot { value: v.clone(), attempts: 0, usable_at: now })
                    .collect(),
                next: 0,
                factor,
                base_timeout,
            }),
        }
    }

    /// Installs a new value list, or keeps the current one when `values` is
    /// `None`. Cooldowns and attempt counts restart against the new base.
    pub fn reset(&self, values: Option<&[String]>, factor: u32, base_timeout: Duration) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        if let Some(values) = values {
            inner.slots = values
                .iter()
                .map(|v| Slot { value: v.clone(), attempts: 0, usable_at: now })
                .collect();
            inner.next = 0;
        } else {
            for slot in inner.slots.iter_mut() {
                slot.attempts = 0;
                slot.usable_at = now;
            }
        }
        inner.factor = factor;
        inner.base_timeout = base_timeout;
    }

    /// The next available address, waiting out cooldowns. Fair round-robin
    /// across equally-cool slots. Cancellation-safe: callers select against
    /// their own stop signal.
    pub async fn get_value(&self) -> Option<String> {
        loop {
            let wait_until = {
                let mut inner = self.inner.lock().unwrap();
                if inner.slots.is_empty() {
                    return None;
                }
                let now = Instant::now();
                let n = inner.slots.len();
                let start = inner.next;
                let mut earliest = inner.slots[start % n].usable_at;
                let mut found = None;
                for i in start..start + n {
                    let slot = &inner.slots[i % n];
                    if slot.usable_at <= now {
                        found = Some(i % n);
                        break;
                    }
                    earliest = earliest.min(slot.usable_at);
                }
                match found {
                    Some(idx) => {
                        inner.next = (idx + 1) % n;
                        let cooldown = cooldown(inner.factor, inner.base_timeout, {
                            let slot = &inner.slots[idx];
                            slot.attempts
                        });
                        let slot = &mut inner.slots[idx];
                        slot.attempts = slot.attempts.saturating_add(1);
                        slot.usable_at = now + cooldown;
                        return Some(slot.value.clone());
                    }
                    None => earliest,
                }
            };
            tokio::time::sleep_until(wait_until).await;
        }
    }

    /// When the next slot leaves cooldown; callers bound one connection
    /// attempt with this.
    pub fn when_next_value_usable(&self) -> Instant {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .map(|s| s.usable_at)
            .min()
            .unwrap_or_else(|| Instant::now() + inner.base_timeout)
    }

    /// Releases pool state when the channel stops.
    pub fn gc(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.slots = Vec::new();
        inner.next = 0;
    }
}

/// Cooldown schedule: starts at `base/factor^2`, multiplies by `factor` per
/// draw, saturates at `base`. A zero factor pins the cooldown at `base`.
fn cooldown(factor: u32, base: Duration, attempts: u32) -> Duration {
    if factor <= 1 {
        return base;
    }
    let denominator_pow = 2u32.saturating_sub(attempts);
    let mut d = base;
    for _ in 0..denominator_pow {
        d /= factor;
    }
    d.min(base)
}
