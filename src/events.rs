//! Routing of domain events to matching subscriptions.

use crate::notify::{Delivery, NotificationDispatcher};
use crate::registry::SubscriptionRegistry;
use crate::types::{Subscription, SubscriptionId, SubscriptionKind};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Something that happened in the simulated network, e.g. a station
/// associating with an access point.
#[derive(Clone, Debug, PartialEq)]
pub struct DomainEvent {
    /// Subscriptions of this kind are candidates.
    pub kind: SubscriptionKind,

    /// Body fields of the resulting notification.
    pub fields: Map<String, Value>,

    /// Attribute values compared against `filterCriteria` by the default matcher.
    pub match_attributes: Map<String, Value>,
}

impl DomainEvent {
    pub fn new(kind: SubscriptionKind) -> Self {
        Self {
            kind,
            fields: Map::new(),
            match_attributes: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn with_match(mut self, key: impl Into<String>, value: Value) -> Self {
        self.match_attributes.insert(key.into(), value);
        self
    }
}

/// Decides whether a subscription wants an event.
pub type Matcher = Arc<dyn Fn(&Subscription, &DomainEvent) -> bool + Send + Sync>;

/// Every match attribute must equal the same key of `filterCriteria`.
pub fn default_matcher(sub: &Subscription, event: &DomainEvent) -> bool {
    event
        .match_attributes
        .iter()
        .all(|(key, value)| sub.filter_criteria.get(key) == Some(value))
}

/// Dispatch table from subscription kind to matcher.
pub struct EventRouter {
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<NotificationDispatcher>,
    matchers: HashMap<SubscriptionKind, Matcher>,
}

impl EventRouter {
    pub fn new(registry: Arc<SubscriptionRegistry>, dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self {
            registry,
            dispatcher,
            matchers: HashMap::new(),
        }
    }

    /// Replace the matcher used for `kind`.
    pub fn register<F>(&mut self, kind: SubscriptionKind, matcher: F)
    where
        F: Fn(&Subscription, &DomainEvent) -> bool + Send + Sync + 'static,
    {
        self.matchers.insert(kind, Arc::new(matcher));
    }

    /// Live subscriptions that want `event`.
    pub fn matching(&self, event: &DomainEvent) -> Vec<Subscription> {
        match self.matchers.get(&event.kind) {
            Some(matcher) => self
                .registry
                .list(|sub| sub.subscription_type == event.kind && matcher(sub, event)),
            None => self
                .registry
                .list(|sub| sub.subscription_type == event.kind && default_matcher(sub, event)),
        }
    }

    /// Notify every matching subscription. Delivery failures are not retried.
    pub fn route(&self, event: &DomainEvent) -> Vec<(SubscriptionId, Delivery)> {
        let targets = self.matching(event);
        debug!(kind = %event.kind, matches = targets.len(), "Routing domain event");

        targets
            .iter()
            .map(|sub| (sub.id, self.dispatcher.send_event(sub, &event.fields)))
            .collect()
    }
}
