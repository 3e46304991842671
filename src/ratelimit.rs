//! Fixed-window rate limiting keyed by caller class, fingerprint and endpoint.
//!
//! A window is `floor(now / window_ms)`; its counter only grows and is
//! dropped by the reaper once the window has passed. Storage sits behind
//! [`WindowStore`] so a shared backend can replace the in-memory map. When the
//! store fails the limiter lets the request through and logs.

use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::model::Ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallerClass {
    Automation,
    Console,
    Anonymous,
}

impl CallerClass {
    /// Classify a pre-verified connection user.
    pub fn from_user(user: &str) -> Self {
        let user = user.to_ascii_lowercase();
        if user.starts_with("agent") {
            CallerClass::Automation
        } else if user.starts_with("host") || user.starts_with("console") {
            CallerClass::Console
        } else {
            CallerClass::Anonymous
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallerClass::Automation => "automation",
            CallerClass::Console => "console",
            CallerClass::Anonymous => "anonymous",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    pub window_ms: Ms,
    pub quota: u64,
}

impl WindowPolicy {
    pub const fn per_minute(quota: u64) -> Self {
        Self {
            window_ms: 60_000,
            quota,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicies {
    pub automation: WindowPolicy,
    pub console: WindowPolicy,
    pub anonymous: WindowPolicy,
}

impl Default for RatePolicies {
    fn default() -> Self {
        Self {
            automation: WindowPolicy::per_minute(600),
            console: WindowPolicy::per_minute(120),
            anonymous: WindowPolicy::per_minute(30),
        }
    }
}

impl RatePolicies {
    pub fn for_class(&self, class: CallerClass) -> WindowPolicy {
        match class {
            CallerClass::Automation => self.automation,
            CallerClass::Console => self.console,
            CallerClass::Anonymous => self.anonymous,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub class: CallerClass,
    pub fingerprint: String,
    pub endpoint: String,
    pub bucket: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_in_ms: Ms,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rate-limit store unavailable: {0}")]
    Unavailable(String),
}

/// Counter storage for rate-limit windows.
pub trait WindowStore: Send + Sync {
    /// Atomically add one to the window's counter, creating it with
    /// `expires_at` if absent. Returns the post-increment count.
    fn increment(&self, key: &RateLimitKey, expires_at: Ms) -> Result<u64, StoreError>;

    fn get(&self, key: &RateLimitKey) -> Result<u64, StoreError>;

    /// Drop windows whose expiry is at or before `now`. Returns how many went.
    fn purge_expired(&self, now: Ms) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryWindowStore {
    windows: DashMap<RateLimitKey, (u64, Ms)>,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl WindowStore for InMemoryWindowStore {
    fn increment(&self, key: &RateLimitKey, expires_at: Ms) -> Result<u64, StoreError> {
        let mut entry = self.windows.entry(key.clone()).or_insert((0, expires_at));
        entry.0 += 1;
        Ok(entry.0)
    }

    fn get(&self, key: &RateLimitKey) -> Result<u64, StoreError> {
        Ok(self.windows.get(key).map(|e| e.0).unwrap_or(0))
    }

    fn purge_expired(&self, now: Ms) -> Result<usize, StoreError> {
        let before = self.windows.len();
        self.windows.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(before.saturating_sub(self.windows.len()))
    }
}

/// SHA-256 hex over the parts that identify a caller.
pub fn fingerprint(tenant: &str, user: &str, origin: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tenant.as_bytes());
    hasher.update(b"|");
    hasher.update(user.as_bytes());
    hasher.update(b"|");
    hasher.update(origin.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct RateLimiter {
    store: Arc<dyn WindowStore>,
    policies: RatePolicies,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn WindowStore>, policies: RatePolicies, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policies,
            clock,
        }
    }

    pub fn policies(&self) -> &RatePolicies {
        &self.policies
    }

    fn key(&self, class: CallerClass, fingerprint: &str, endpoint: &str, now: Ms) -> (RateLimitKey, WindowPolicy, Ms) {
        let policy = self.policies.for_class(class);
        let window = policy.window_ms.max(1);
        let bucket = now.div_euclid(window);
        let window_end = (bucket + 1) * window;
        let key = RateLimitKey {
            class,
            fingerprint: fingerprint.to_string(),
            endpoint: endpoint.to_string(),
            bucket,
        };
        (key, policy, window_end)
    }

    fn decide(policy: WindowPolicy, count: u64, reset_in_ms: Ms) -> Decision {
        Decision {
            allowed: count <= policy.quota,
            limit: policy.quota,
            remaining: policy.quota.saturating_sub(count),
            reset_in_ms,
        }
    }

    /// Count this request against the current window and decide.
    pub fn check(&self, class: CallerClass, fingerprint: &str, endpoint: &str) -> Decision {
        let now = self.clock.now_ms();
        let (key, policy, window_end) = self.key(class, fingerprint, endpoint, now);
        match self.store.increment(&key, window_end) {
            Ok(count) => {
                let decision = Self::decide(policy, count, window_end - now);
                if !decision.allowed {
                    debug!(
                        class = class.as_str(),
                        endpoint, count, quota = policy.quota, "rate limited"
                    );
                }
                decision
            }
            Err(e) => {
                warn!("rate limiter failing open on {endpoint}: {e}");
                metrics::counter!(crate::observability::RATE_LIMIT_STORE_FAILURES_TOTAL).increment(1);
                Self::decide(policy, 0, window_end - now)
            }
        }
    }

    /// Read the current window without counting a request.
    pub fn peek(&self, class: CallerClass, fingerprint: &str, endpoint: &str) -> Decision {
        let now = self.clock.now_ms();
        let (key, policy, window_end) = self.key(class, fingerprint, endpoint, now);
        let count = match self.store.get(&key) {
            Ok(c) => c,
            Err(e) => {
                warn!("rate limiter peek failing open on {endpoint}: {e}");
                0
            }
        };
        let mut decision = Self::decide(policy, count, window_end - now);
        // A peek answers "may the next request go through"
        decision.allowed = count < policy.quota;
        decision
    }

    pub fn purge_expired(&self) -> usize {
        match self.store.purge_expired(self.clock.now_ms()) {
            Ok(n) => n,
            Err(e) => {
                warn!("rate-limit purge failed: {e}");
                0
            }
        }
    }
}
