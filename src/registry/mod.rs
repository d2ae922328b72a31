//! Subscription registry: id allocation, write-through persistence and the
//! expiry index.
//!
//! The registry owns the in-memory view of every live subscription. The
//! document store is authoritative across restarts; [`SubscriptionRegistry::recover`]
//! rebuilds memory from it.

mod expiry;
mod manager;

pub use expiry::ExpiryIndex;
pub use manager::{RecoveryReport, SubscriptionRegistry};
