//! Per-client admission controller.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::bucket::{Bucket, Reservation};
use super::key::LimiterKey;
use super::rules::Policy;
use super::store::ExpiringStore;
use crate::config::RateLimitingConfig;
use crate::error::Result;

/// How long a client's bucket survives without requests.
pub const DEFAULT_ENTRY_LIFETIME: Duration = Duration::from_secs(60 * 60);
/// How often idle buckets are reclaimed.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// A bucket shared between the store and the requests reserving from it.
pub type SharedBucket = Arc<Mutex<Bucket>>;

/// Decides, per request, whether a client may proceed under a policy.
///
/// Buckets are created lazily on a client's first request and kept in an
/// [`ExpiringStore`] whose entry lifetime is refreshed on every decision,
/// so active clients keep their state and idle ones are forgotten. This
/// struct is thread-safe and is meant to be shared behind an `Arc`.
pub struct AdmissionController {
    /// Buckets indexed by policy and client identity
    store: ExpiringStore<LimiterKey, SharedBucket>,
    /// Idle time after which a bucket is dropped
    entry_lifetime: Duration,
}

impl AdmissionController {
    /// Create a controller with the default lifetime and sweep interval.
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_ENTRY_LIFETIME, DEFAULT_CLEANUP_INTERVAL)
    }

    pub fn with_settings(entry_lifetime: Duration, cleanup_interval: Duration) -> Self {
        Self {
            store: ExpiringStore::new(cleanup_interval),
            entry_lifetime,
        }
    }

    pub fn from_config(config: &RateLimitingConfig) -> Self {
        Self::with_settings(config.entry_lifetime(), config.cleanup_interval())
    }

    /// Reserve one unit of capacity for `identity` under `policy`.
    ///
    /// Never fails: a denied request is reported through
    /// [`Reservation::allowed`].
    pub fn decide(&self, identity: &str, policy: &Policy) -> Reservation {
        trace!(
            policy = policy.name(),
            identity = identity,
            "Checking admission"
        );

        let key = LimiterKey::new(policy, identity);
        let bucket = self.store.get_or_insert_with(key, self.entry_lifetime, || {
            debug!(
                policy = policy.name(),
                identity = identity,
                burst = policy.burst(),
                refill_interval_ms = policy.refill_interval().as_millis() as u64,
                "Creating new bucket"
            );
            Arc::new(Mutex::new(Bucket::new(policy)))
        });

        let reservation = {
            let mut bucket = bucket.lock();
            if !bucket.conforms_to(policy) {
                warn!(
                    policy = policy.name(),
                    identity = identity,
                    stored_burst = bucket.capacity(),
                    stored_refill_interval_ms = bucket.refill_interval().as_millis() as u64,
                    burst = policy.burst(),
                    refill_interval_ms = policy.refill_interval().as_millis() as u64,
                    "Stored bucket does not match policy, resetting it"
                );
                *bucket = Bucket::new(policy);
            }
            bucket.reserve()
        };

        if !reservation.allowed {
            debug!(
                policy = policy.name(),
                identity = identity,
                reset_after_ms = reservation.reset_after.as_millis() as u64,
                "Rate limit exceeded"
            );
        }

        reservation
    }

    /// Number of clients with a live bucket, across all policies.
    pub fn tracked_clients(&self) -> usize {
        self.store.live_len()
    }

    /// Number of stored buckets, including idle ones awaiting the sweep.
    /// Unlike [`tracked_clients`](Self::tracked_clients) this never scans.
    pub fn stored_buckets(&self) -> usize {
        self.store.len()
    }

    /// Idle time after which a bucket is dropped.
    pub fn entry_lifetime(&self) -> Duration {
        self.entry_lifetime
    }

    /// The underlying bucket store.
    pub fn store(&self) -> &ExpiringStore<LimiterKey, SharedBucket> {
        &self.store
    }

    /// Start reclaiming idle buckets in the background.
    pub fn start(&self) -> Result<()> {
        self.store.start()
    }

    /// Stop the background reclamation.
    pub async fn stop(&self) {
        self.store.stop().await
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::new()
    }
}
