//! Per-client token-bucket admission control
//!
//! Every authenticated client owns a continuous-valued bucket holding up to
//! `capacity` tokens that refills lazily at `refill_rate` tokens per second.
//! One token is spent per admitted request.
//!
//! # Locking
//!
//! Two tiers, never nested in the opposite order:
//!
//! 1. The registry `RwLock` guards the map structure. Requests take it only
//!    to look up (read) or insert (write) a bucket and release it before any
//!    arithmetic. The idle sweep takes it exclusively.
//! 2. Each bucket has its own `Mutex`. Refill-then-consume for one client is
//!    serialized on it; different clients never contend.
//!
//! The sweep acquires an entry lock before deciding to evict and marks what it
//! removes. An `admit` that looked up a bucket just before the sweep evicted
//! it sees the mark once it holds the entry lock and retries against the
//! registry, so tokens are never spent from a detached bucket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::auth::IdentityClaims;
use super::router::AppState;
use crate::config::RateLimitConfig;
use crate::error::GatewayError;

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Request may proceed; one token was spent
    Allowed,
    /// Bucket is empty
    Denied {
        /// Seconds after which one token will be available
        retry_after_secs: u64,
    },
}

impl Admission {
    /// Whether the request was admitted
    #[must_use]
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug)]
struct ClientBucket {
    tokens_remaining: f64,
    last_refill: Instant,
    /// Set by the sweep when the bucket leaves the registry
    evicted: bool,
}

type Registry = HashMap<String, Arc<Mutex<ClientBucket>>>;

/// Token-bucket admission controller keyed by client identity
#[derive(Debug)]
pub struct AdmissionController {
    enabled: bool,
    capacity: f64,
    refill_rate: f64,
    idle_threshold: Duration,
    sweep_interval: Duration,
    buckets: RwLock<Registry>,
}

impl AdmissionController {
    /// Create a controller from configuration
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            idle_threshold: config.idle_threshold,
            sweep_interval: config.sweep_interval,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Decide whether `client` may make a request now
    pub fn admit(&self, client: &str) -> Admission {
        self.admit_at(client, Instant::now())
    }

    /// Decide whether `client` may make a request at `now`
    pub fn admit_at(&self, client: &str, now: Instant) -> Admission {
        if !self.enabled {
            return Admission::Allowed;
        }

        loop {
            let bucket = self.bucket_for(client, now);
            if let Some(admission) = self.spend(&bucket, now) {
                return admission;
            }
        }
    }

    /// Refill then try to take one token. `None` if the sweep evicted the
    /// bucket after it was looked up.
    fn spend(&self, bucket: &Mutex<ClientBucket>, now: Instant) -> Option<Admission> {
        let mut bucket = bucket.lock();
        if bucket.evicted {
            return None;
        }

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if !elapsed.is_zero() {
            bucket.tokens_remaining = self
                .capacity
                .min(bucket.tokens_remaining + elapsed.as_secs_f64() * self.refill_rate);
            bucket.last_refill = now;
        }

        if bucket.tokens_remaining >= 1.0 {
            bucket.tokens_remaining -= 1.0;
            Some(Admission::Allowed)
        } else {
            let missing = 1.0 - bucket.tokens_remaining;
            Some(Admission::Denied {
                retry_after_secs: retry_after(missing, self.refill_rate),
            })
        }
    }

    /// Look up the bucket for `client`, creating a full one on first sight.
    /// The registry lock is released before this returns.
    fn bucket_for(&self, client: &str, now: Instant) -> Arc<Mutex<ClientBucket>> {
        if let Some(bucket) = self.buckets.read().get(client) {
            return Arc::clone(bucket);
        }

        let mut buckets = self.buckets.write();
        // Another request from the same client may have inserted meanwhile
        Arc::clone(buckets.entry(client.to_string()).or_insert_with(|| {
            debug!(client, "Creating token bucket");
            Arc::new(Mutex::new(ClientBucket {
                tokens_remaining: self.capacity,
                last_refill: now,
                evicted: false,
            }))
        }))
    }

    /// Evict buckets idle for longer than the threshold. Returns the number removed.
    pub fn sweep_idle(&self) -> usize {
        self.sweep_idle_at(Instant::now())
    }

    /// Evict buckets whose last refill is older than `now - idle_threshold`
    pub fn sweep_idle_at(&self, now: Instant) -> usize {
        let Some(cutoff) = now.checked_sub(self.idle_threshold) else {
            return 0;
        };

        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let mut bucket = bucket.lock();
            bucket.evicted = bucket.last_refill < cutoff;
            !bucket.evicted
        });
        let removed = before - buckets.len();

        if removed > 0 {
            debug!(removed, remaining = buckets.len(), "Evicted idle token buckets");
        }
        removed
    }

    /// Number of tracked clients
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    /// Whether no client is tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }

    /// Tokens currently held by `client`, as of its last refill
    #[must_use]
    pub fn tokens_remaining(&self, client: &str) -> Option<f64> {
        let bucket = self.buckets.read().get(client).map(Arc::clone)?;
        let tokens = bucket.lock().tokens_remaining;
        Some(tokens)
    }

    /// Spawn the periodic idle sweep.
    ///
    /// The task ticks every `sweep_interval` and exits when `shutdown` fires
    /// (or its sender is dropped).
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.sweep_interval);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        controller.sweep_idle();
                    }
                    _ = shutdown.recv() => {
                        debug!("Token bucket sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}

/// Whole seconds needed to accumulate `missing` tokens at `rate` per second
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn retry_after(missing: f64, rate: f64) -> u64 {
    (missing / rate).ceil().max(0.0) as u64
}

/// Admission middleware for protected routes
///
/// Runs after [`auth_middleware`](super::auth::auth_middleware). Requests
/// without resolved identity pass through untouched.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(client) = request
        .extensions()
        .get::<IdentityClaims>()
        .map(|claims| claims.subject_id.to_string())
    else {
        return next.run(request).await;
    };

    match state.admission.admit(&client) {
        Admission::Allowed => next.run(request).await,
        Admission::Denied { retry_after_secs } => {
            warn!(
                client = %client,
                path = %request.uri().path(),
                retry_after = retry_after_secs,
                "Rate limit exceeded"
            );
            GatewayError::RateLimitExceeded {
                retry_after: retry_after_secs,
            }
            .into_response()
        }
    }
}
