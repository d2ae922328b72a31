//! Notification dispatcher implementation.

use super::audit::{AuditSink, HttpLogEntry};
use super::transport::{Transport, TransportResponse};
use crate::clock::Clock;
use crate::config::DispatcherConfig;
use crate::error::Result;
use crate::types::{Subscription, TimeStamp};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const EXPIRY_NOTIFICATION: &str = "ExpiryNotification";
pub const TEST_NOTIFICATION: &str = "TestNotification";

/// Notification document pushed to a callback.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub notification_type: String,
    pub time_stamp: TimeStamp,
    /// Self link of the subscription the notification belongs to.
    pub subscription_href: Option<String>,
    /// Event-specific fields, merged at the top level.
    pub fields: Map<String, Value>,
}

impl Notification {
    pub fn new(notification_type: impl Into<String>, time_stamp: TimeStamp) -> Self {
        Self {
            notification_type: notification_type.into(),
            time_stamp,
            subscription_href: None,
            fields: Map::new(),
        }
    }

    pub fn for_subscription(mut self, sub: &Subscription) -> Self {
        self.subscription_href = sub.self_link().map(str::to_string);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn with_fields(mut self, fields: &Map<String, Value>) -> Self {
        for (key, value) in fields {
            self.fields.insert(key.clone(), value.clone());
        }
        self
    }

    /// Event fields never override the envelope.
    pub fn to_json(&self) -> Result<Value> {
        let mut doc = self.fields.clone();
        doc.insert("notificationType".into(), json!(self.notification_type));
        doc.insert("timeStamp".into(), serde_json::to_value(self.time_stamp)?);
        if let Some(href) = &self.subscription_href {
            doc.insert("_links".into(), json!({"subscription": {"href": href}}));
        }
        Ok(Value::Object(doc))
    }
}

/// Outcome of one delivery attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Endpoint answered 2xx.
    Delivered { status: u16 },
    /// Endpoint answered with anything else.
    Rejected { status: u16 },
    /// No response at all.
    Failed(String),
    /// Nothing to POST to (push-channel only subscription).
    Skipped,
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered { .. })
    }
}

/// Pushes notifications over a [`Transport`] and audits every attempt.
///
/// Delivery is at most once. Failures are logged and reported through the
/// returned [`Delivery`], never as errors.
pub struct NotificationDispatcher {
    transport: Arc<dyn Transport>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    logger_name: String,
    next_log_id: AtomicU64,
}

impl NotificationDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            transport,
            audit,
            clock,
            logger_name: config.logger_name.clone(),
            next_log_id: AtomicU64::new(1),
        }
    }

    /// Push a domain event to one subscriber.
    pub fn send_event(&self, sub: &Subscription, payload: &Map<String, Value>) -> Delivery {
        let notification = Notification::new(
            sub.subscription_type.notification_type(),
            self.clock.now(),
        )
        .for_subscription(sub)
        .with_fields(payload);
        self.send(sub, &notification)
    }

    /// Tell a subscriber its subscription has expired.
    pub fn send_expiry(&self, sub: &Subscription) -> Delivery {
        let mut notification =
            Notification::new(EXPIRY_NOTIFICATION, self.clock.now()).for_subscription(sub);
        if let Some(deadline) = sub.expiry_deadline {
            notification = notification.with_field("expiryDeadline", json!(deadline));
        }
        self.send(sub, &notification)
    }

    pub fn send_test(&self, sub: &Subscription) -> Delivery {
        let notification =
            Notification::new(TEST_NOTIFICATION, self.clock.now()).for_subscription(sub);
        self.send(sub, &notification)
    }

    pub fn send(&self, sub: &Subscription, notification: &Notification) -> Delivery {
        let url = match sub.callback_url() {
            Some(url) => url,
            None => {
                debug!(id = %sub.id, "No callback URL, notification not pushed");
                return Delivery::Skipped;
            }
        };

        let body = match notification.to_json() {
            Ok(doc) => doc.to_string(),
            Err(e) => {
                warn!(id = %sub.id, error = %e, "Failed to encode notification");
                return Delivery::Failed(e.to_string());
            }
        };

        let start = Instant::now();
        let result = self.transport.post_json(url, &body);
        let proc_time_us = start.elapsed().as_micros() as u64;

        self.audit(url, &body, result.as_ref().ok(), proc_time_us);

        match result {
            Ok(response) if response.is_success() => {
                info!(
                    id = %sub.id,
                    url = %url,
                    notification_type = %notification.notification_type,
                    status = response.status,
                    latency_us = proc_time_us,
                    "Notification delivered"
                );
                Delivery::Delivered {
                    status: response.status,
                }
            }
            Ok(response) => {
                warn!(
                    id = %sub.id,
                    url = %url,
                    notification_type = %notification.notification_type,
                    status = response.status,
                    latency_us = proc_time_us,
                    "Notification rejected"
                );
                Delivery::Rejected {
                    status: response.status,
                }
            }
            Err(e) => {
                warn!(
                    id = %sub.id,
                    url = %url,
                    notification_type = %notification.notification_type,
                    error = %e,
                    "Notification delivery failed"
                );
                Delivery::Failed(e.to_string())
            }
        }
    }

    fn audit(&self, url: &str, body: &str, response: Option<&TransportResponse>, proc_time_us: u64) {
        let entry = HttpLogEntry {
            id: self.next_log_id.fetch_add(1, Ordering::Relaxed),
            logger_name: self.logger_name.clone(),
            direction: "TX".to_string(),
            url: url.to_string(),
            endpoint: endpoint_of(url),
            method: "POST".to_string(),
            body: body.to_string(),
            resp_body: response.map(|r| r.body.clone()).unwrap_or_default(),
            resp_code: response
                .map(|r| r.status.to_string())
                .unwrap_or_else(|| "500".to_string()),
            proc_time_us,
        };
        self.audit.record(&entry);
    }
}

fn endpoint_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::{MemoryAuditSink, RecordingTransport};
    use crate::types::{LinkType, SubscriptionKind, SubscriptionLinks};

    fn dispatcher(
        transport: Arc<RecordingTransport>,
    ) -> (NotificationDispatcher, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new(16));
        let dispatcher = NotificationDispatcher::new(
            transport,
            audit.clone(),
            Arc::new(ManualClock::new(1_000)),
            &DispatcherConfig::default(),
        );
        (dispatcher, audit)
    }

    fn linked(sub: Subscription, id: u64) -> Subscription {
        Subscription {
            links: Some(SubscriptionLinks {
                self_link: LinkType {
                    href: format!("http://host/subscriptions/{}", id),
                },
            }),
            ..sub
        }
    }

    #[test]
    fn test_expiry_notification_body() {
        let transport = Arc::new(RecordingTransport::new());
        let (dispatcher, audit) = dispatcher(transport.clone());
        let sub = linked(
            Subscription::new(SubscriptionKind::AssocSta, "http://cb/notify")
                .with_expiry(TimeStamp::from_secs(999)),
            1,
        );

        assert_eq!(dispatcher.send_expiry(&sub), Delivery::Delivered { status: 204 });

        let sent = &transport.requests()[0];
        assert_eq!(sent.url, "http://cb/notify");
        assert_eq!(sent.body["notificationType"], "ExpiryNotification");
        assert_eq!(sent.body["timeStamp"]["seconds"], 1_000);
        assert_eq!(sent.body["expiryDeadline"]["seconds"], 999);
        assert_eq!(
            sent.body["_links"]["subscription"]["href"],
            "http://host/subscriptions/1"
        );

        let logged = &audit.entries()[0];
        assert_eq!(logged.endpoint, "/notify");
        assert_eq!(logged.resp_code, "204");
        assert_eq!(logged.direction, "TX");
    }

    #[test]
    fn test_event_fields_merge_under_envelope() {
        let transport = Arc::new(RecordingTransport::new());
        let (dispatcher, _) = dispatcher(transport.clone());
        let sub = Subscription::new(SubscriptionKind::V2xMsg, "http://cb");

        let mut payload = Map::new();
        payload.insert("msgType".into(), json!("DENM"));
        payload.insert("notificationType".into(), json!("Spoofed"));
        dispatcher.send_event(&sub, &payload);

        let body = &transport.requests()[0].body;
        assert_eq!(body["notificationType"], "V2xMsgNotification");
        assert_eq!(body["msgType"], "DENM");
    }

    #[test]
    fn test_failures_are_swallowed_and_audited() {
        let transport = Arc::new(RecordingTransport::unreachable());
        let (dispatcher, audit) = dispatcher(transport.clone());
        let sub = Subscription::new(SubscriptionKind::RabEst, "http://down");

        assert!(matches!(dispatcher.send_test(&sub), Delivery::Failed(_)));
        assert_eq!(audit.entries()[0].resp_code, "500");

        transport.set_status(503);
        assert_eq!(dispatcher.send_test(&sub), Delivery::Rejected { status: 503 });
        assert_eq!(audit.entries()[1].resp_code, "503");
        assert_ne!(audit.entries()[0].id, audit.entries()[1].id);
    }

    #[test]
    fn test_push_channel_only_is_skipped() {
        let transport = Arc::new(RecordingTransport::new());
        let (dispatcher, audit) = dispatcher(transport.clone());
        let mut sub = Subscription::new(SubscriptionKind::CellChange, "");
        sub.websock_notif_config = Some(json!({"requestWebsocketUri": true}));

        assert_eq!(dispatcher.send_expiry(&sub), Delivery::Skipped);
        assert!(transport.is_empty());
        assert!(audit.is_empty());
    }
}
