use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use std::sync::Arc;

/// Token bucket: refills continuously at `rate` tokens/sec up to `capacity`.
#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(rate: f64, capacity: f64) -> Self {
        Self {
            rate,
            capacity,
            tokens: capacity,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_update = now;
    }

    /// Take one token if available. Returns true on success.
    fn try_take(&mut self) -> bool {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Rolling request/error counts used for the `should_backpressure` signal.
#[derive(Debug, Default, Clone, Copy)]
struct RollingCounts {
    requests: u64,
    errors: u64,
}

struct HostState {
    bucket: TokenBucket,
    cooldown_until: Option<Instant>,
    counts: RollingCounts,
}

impl HostState {
    fn new(rate: f64, capacity: f64) -> Self {
        Self {
            bucket: TokenBucket::new(rate, capacity),
            cooldown_until: None,
            counts: RollingCounts::default(),
        }
    }
}

/// Per-host token buckets plus a global in-flight semaphore and per-host
/// cooldowns driven by `Retry-After`.
pub struct RateLimiter {
    hosts: Mutex<HashMap<String, HostState>>,
    global: Arc<Semaphore>,
    per_host_rps: f64,
    per_host_capacity: f64,
}

/// Held for the duration of one in-flight request. Dropping releases the
/// global permit — every successful acquire is paired with exactly one release.
pub struct RateLimitPermit {
    _global: OwnedSemaphorePermit,
}

impl RateLimiter {
    pub fn new(global_concurrency: usize, per_host_rps: f64) -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
            global: Arc::new(Semaphore::new(global_concurrency)),
            per_host_rps,
            per_host_capacity: 10.0,
        }
    }

    /// Wait out any active cooldown, then take a global permit and try the
    /// host bucket. `Ok(None)` means "not ready" — the global permit was
    /// already released and the caller should reschedule shortly, per the
    /// contract that the limiter never blocks on bucket exhaustion alone.
    pub async fn acquire(&self, host: &str) -> Option<RateLimitPermit> {
        loop {
            let wait = {
                let hosts = self.hosts.lock().await;
                hosts.get(host).and_then(|s| s.cooldown_until)
            };
            match wait {
                Some(until) if until > Instant::now() => {
                    tokio::time::sleep(until - Instant::now()).await;
                }
                _ => break,
            }
        }
        {
            let mut hosts = self.hosts.lock().await;
            if let Some(state) = hosts.get_mut(host) {
                state.cooldown_until = None;
            }
        }

        let global = self
            .global
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore not closed");

        let mut hosts = self.hosts.lock().await;
        let state = hosts
            .entry(host.to_string())
            .or_insert_with(|| HostState::new(self.per_host_rps, self.per_host_capacity));

        if state.bucket.try_take() {
            Some(RateLimitPermit { _global: global })
        } else {
            drop(global);
            None
        }
    }

    /// Set (or extend) a host's cooldown deadline to `now + delay`.
    pub async fn set_cooldown(&self, host: &str, delay: Duration) {
        let mut hosts = self.hosts.lock().await;
        let state = hosts
            .entry(host.to_string())
            .or_insert_with(|| HostState::new(self.per_host_rps, self.per_host_capacity));
        let until = Instant::now() + delay;
        state.cooldown_until = Some(match state.cooldown_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
    }

    /// Update rolling request/error counts for `host`.
    pub async fn record(&self, host: &str, success: bool) {
        let mut hosts = self.hosts.lock().await;
        let state = hosts
            .entry(host.to_string())
            .or_insert_with(|| HostState::new(self.per_host_rps, self.per_host_capacity));
        state.counts.requests += 1;
        if !success {
            state.counts.errors += 1;
        }
    }

    /// Advisory-only: true once a host's error rate exceeds 50%. Does not
    /// block `acquire` — callers may use it to deprioritize a host.
    pub async fn should_backpressure(&self, host: &str) -> bool {
        let hosts = self.hosts.lock().await;
        hosts
            .get(host)
            .map(|s| {
                s.counts.requests > 0
                    && (s.counts.errors as f64 / s.counts.requests as f64) > 0.5
            })
            .unwrap_or(false)
    }

    #[cfg(test)]
    async fn is_in_cooldown(&self, host: &str) -> bool {
        let hosts = self.hosts.lock().await;
        hosts
            .get(host)
            .and_then(|s| s.cooldown_until)
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }
}
