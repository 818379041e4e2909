//! Admission control: token buckets per request class, with optional
//! per-client buckets that replace the class bucket for that client.
//!
//! Local to this node and best effort; nothing here is replicated.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use moka::sync::Cache;

use mimir_types::OpClass;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub enabled: bool,
    pub read_per_sec: u32,
    pub write_per_sec: u32,
    pub admin_per_sec: u32,
    /// Requests per second, per class, for the named clients.
    pub client_overrides: HashMap<String, u32>,
    /// Idle per-client buckets are dropped after this long.
    pub client_idle_secs: u64,
    pub max_clients: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        AdmissionConfig {
            enabled: true,
            read_per_sec: 5_000,
            write_per_sec: 500,
            admin_per_sec: 50,
            client_overrides: HashMap::new(),
            client_idle_secs: 300,
            max_clients: 10_000,
        }
    }
}

/// Continuous-refill token bucket.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    capacity: f64,
    tokens: f64,
    per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A bucket that starts full and holds one second's worth of tokens.
    pub(crate) fn per_second(rate: u32) -> Self {
        TokenBucket {
            capacity: rate as f64,
            tokens: rate as f64,
            per_sec: rate as f64,
            last_refill: Instant::now(),
        }
    }

    pub(crate) fn try_consume(&mut self) -> bool {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

type SharedBucket = Arc<Mutex<TokenBucket>>;

pub struct AdmissionControl {
    config: AdmissionConfig,
    read: Mutex<TokenBucket>,
    write: Mutex<TokenBucket>,
    admin: Mutex<TokenBucket>,
    clients: Cache<(Arc<str>, OpClass), SharedBucket>,
}

impl AdmissionControl {
    pub fn new(config: AdmissionConfig) -> Self {
        let clients = Cache::builder()
            .max_capacity(config.max_clients)
            .time_to_idle(Duration::from_secs(config.client_idle_secs.max(1)))
            .build();
        AdmissionControl {
            read: Mutex::new(TokenBucket::per_second(config.read_per_sec)),
            write: Mutex::new(TokenBucket::per_second(config.write_per_sec)),
            admin: Mutex::new(TokenBucket::per_second(config.admin_per_sec)),
            clients,
            config,
        }
    }

    /// Admit or refuse one request of `class` from `client_id`.
    pub fn allow(&self, client_id: &str, class: OpClass) -> bool {
        if !self.config.enabled {
            return true;
        }
        if let Some(&rate) = self.config.client_overrides.get(client_id) {
            let bucket = self
                .clients
                .get_with((Arc::from(client_id), class), || {
                    Arc::new(Mutex::new(TokenBucket::per_second(rate)))
                });
            let mut guard = bucket.lock().unwrap_or_else(|e| e.into_inner());
            return guard.try_consume();
        }
        let bucket = match class {
            OpClass::Read => &self.read,
            OpClass::Write => &self.write,
            OpClass::Admin => &self.admin,
        };
        let mut guard = bucket.lock().unwrap_or_else(|e| e.into_inner());
        guard.try_consume()
    }
}
