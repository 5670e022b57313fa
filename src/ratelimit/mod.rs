//! Per-client rate limiting: buckets, their expiring store and the
//! controller that binds them.

mod bucket;
mod controller;
mod key;
mod rules;
mod store;

pub use bucket::{Bucket, Reservation};
pub use controller::{
    AdmissionController, SharedBucket, DEFAULT_CLEANUP_INTERVAL, DEFAULT_ENTRY_LIFETIME,
};
pub use key::LimiterKey;
pub use rules::{default_rules, Policy, PolicyRule, PolicySet};
pub use store::ExpiringStore;
