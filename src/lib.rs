//! # Subscription Engine
//!
//! Lifecycle core for push-notification subscription APIs: clients register
//! a callback and an optional expiry deadline, the engine persists the
//! subscription, pushes notifications to it and retires it when it expires.
//!
//! ## Core Concepts
//!
//! - **Document store**: JSON entries by key, resumable prefix scans, pub/sub
//! - **Registry**: id allocation, write-through persistence, recovery
//! - **Expiry index + sweeper**: per-second buckets reaped on a fixed tick
//! - **Dispatcher**: at-most-once HTTP POST with an audit trail
//!
//! ## Example
//!
//! ```ignore
//! use subscription_engine::{Engine, EngineConfig, Subscription, SubscriptionKind, TimeStamp};
//!
//! let engine = Engine::start(EngineConfig::default())?;
//!
//! let sub = engine.create(
//!     Subscription::new(SubscriptionKind::AssocSta, "http://client/notify")
//!         .with_expiry(TimeStamp::now().plus_secs(60)),
//! )?;
//!
//! // Pushed to every matching AssocSta subscriber
//! engine.route_event(
//!     &DomainEvent::new(SubscriptionKind::AssocSta).with_field("staId", json!("00:11")),
//! );
//!
//! engine.delete(sub.id)?;
//! ```

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod notify;
pub mod registry;
pub mod store;
pub mod sweeper;
pub mod types;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DispatcherConfig, EngineConfig, RegistryConfig, StoreConfig, SweeperConfig};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use events::{default_matcher, DomainEvent, EventRouter, Matcher};
pub use notify::{
    AuditSink, Delivery, HttpLogEntry, HttpTransport, MemoryAuditSink, Notification,
    NotificationDispatcher, RecordingTransport, StoreAuditSink, TracingAuditSink, Transport,
    TransportResponse,
};
pub use registry::{ExpiryIndex, RecoveryReport, SubscriptionRegistry};
pub use store::{
    connect, connect_with, DocumentStore, FileStore, Listener, MemoryStore, PubSubHandle,
    StoreHandle,
};
pub use sweeper::{SweepReport, Sweeper, SweeperHandle};
pub use types::*;
