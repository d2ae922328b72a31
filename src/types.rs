//! Core types for subscriptions and their wire representation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Registry-assigned subscription identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubscriptionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(SubscriptionId)
    }
}

/// Absolute point in time, second resolution for expiry purposes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeStamp {
    pub seconds: i64,
    #[serde(default)]
    pub nano_seconds: i32,
}

impl TimeStamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        TimeStamp {
            seconds: duration.as_secs() as i64,
            nano_seconds: duration.subsec_nanos() as i32,
        }
    }

    pub fn from_secs(seconds: i64) -> Self {
        TimeStamp {
            seconds,
            nano_seconds: 0,
        }
    }

    pub fn plus_secs(self, secs: i64) -> Self {
        TimeStamp {
            seconds: self.seconds + secs,
            ..self
        }
    }
}

impl fmt::Debug for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimeStamp({}.{:09})", self.seconds, self.nano_seconds)
    }
}

/// Closed set of subscription flavors served by the edge APIs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionKind {
    #[serde(rename = "AssocStaSubscription")]
    AssocSta,
    #[serde(rename = "StaDataRateSubscription")]
    StaDataRate,
    #[serde(rename = "V2xMsgSubscription")]
    V2xMsg,
    #[serde(rename = "ProvChgUuUniSubscription")]
    ProvChgUuUni,
    #[serde(rename = "UserLocationEventSubscription")]
    UserLocationEvent,
    #[serde(rename = "ZoneLocationEventSubscription")]
    ZoneLocationEvent,
    #[serde(rename = "CellChangeSubscription")]
    CellChange,
    #[serde(rename = "RabEstSubscription")]
    RabEst,
}

impl SubscriptionKind {
    pub const ALL: [SubscriptionKind; 8] = [
        SubscriptionKind::AssocSta,
        SubscriptionKind::StaDataRate,
        SubscriptionKind::V2xMsg,
        SubscriptionKind::ProvChgUuUni,
        SubscriptionKind::UserLocationEvent,
        SubscriptionKind::ZoneLocationEvent,
        SubscriptionKind::CellChange,
        SubscriptionKind::RabEst,
    ];

    /// Wire name, as carried in `subscriptionType`.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionKind::AssocSta => "AssocStaSubscription",
            SubscriptionKind::StaDataRate => "StaDataRateSubscription",
            SubscriptionKind::V2xMsg => "V2xMsgSubscription",
            SubscriptionKind::ProvChgUuUni => "ProvChgUuUniSubscription",
            SubscriptionKind::UserLocationEvent => "UserLocationEventSubscription",
            SubscriptionKind::ZoneLocationEvent => "ZoneLocationEventSubscription",
            SubscriptionKind::CellChange => "CellChangeSubscription",
            SubscriptionKind::RabEst => "RabEstSubscription",
        }
    }

    /// `notificationType` of the event notifications pushed for this kind.
    pub fn notification_type(&self) -> &'static str {
        match self {
            SubscriptionKind::AssocSta => "AssocStaNotification",
            SubscriptionKind::StaDataRate => "StaDataRateNotification",
            SubscriptionKind::V2xMsg => "V2xMsgNotification",
            SubscriptionKind::ProvChgUuUni => "ProvChgUuUniNotification",
            SubscriptionKind::UserLocationEvent => "UserLocationEventNotification",
            SubscriptionKind::ZoneLocationEvent => "ZoneLocationEventNotification",
            SubscriptionKind::CellChange => "CellChangeNotification",
            SubscriptionKind::RabEst => "RabEstNotification",
        }
    }
}

impl fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SubscriptionKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown subscription type: {}", s))
    }
}

/// Hypertext reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkType {
    pub href: String,
}

/// `_links` block of a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionLinks {
    #[serde(rename = "self")]
    pub self_link: LinkType,
}

/// A client's registered interest in notifications.
///
/// `id` is not part of the persisted document; it is derived from the
/// trailing segment of the self link when a subscription is read back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    #[serde(skip)]
    pub id: SubscriptionId,

    pub subscription_type: SubscriptionKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_reference: Option<String>,

    /// Structured push-channel descriptor, opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub websock_notif_config: Option<Value>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub request_test_notification: bool,

    #[serde(rename = "_links", default, skip_serializing_if = "Option::is_none")]
    pub links: Option<SubscriptionLinks>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_deadline: Option<TimeStamp>,

    /// Owned by the API layer; passed through untouched.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub filter_criteria: Value,
}

impl Subscription {
    pub fn new(kind: SubscriptionKind, callback_reference: impl Into<String>) -> Self {
        Self {
            id: SubscriptionId::default(),
            subscription_type: kind,
            callback_reference: Some(callback_reference.into()),
            websock_notif_config: None,
            request_test_notification: false,
            links: None,
            expiry_deadline: None,
            filter_criteria: Value::Null,
        }
    }

    pub fn with_expiry(mut self, deadline: TimeStamp) -> Self {
        self.expiry_deadline = Some(deadline);
        self
    }

    pub fn with_filter(mut self, filter_criteria: Value) -> Self {
        self.filter_criteria = filter_criteria;
        self
    }

    pub fn with_test_notification(mut self) -> Self {
        self.request_test_notification = true;
        self
    }

    pub fn self_link(&self) -> Option<&str> {
        self.links.as_ref().map(|l| l.self_link.href.as_str())
    }

    /// Non-empty callback URL, if this subscription is pushed over HTTP.
    pub fn callback_url(&self) -> Option<&str> {
        self.callback_reference
            .as_deref()
            .filter(|url| !url.trim().is_empty())
    }

    /// A subscription must be reachable somehow: a callback URL or a push channel.
    pub fn has_delivery_target(&self) -> bool {
        self.callback_url().is_some() || self.websock_notif_config.is_some()
    }
}

/// Parse the subscription id from the last path segment of a self link.
pub fn id_from_self_link(href: &str) -> Option<SubscriptionId> {
    href.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|segment| segment.parse().ok())
}

/// One entry of a subscription collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionLinkEntry {
    pub href: String,
    pub subscription_type: SubscriptionKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionLinkListLinks {
    #[serde(rename = "self")]
    pub self_link: LinkType,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionLinkEntry>,
}

/// Collection body answered by the List operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionLinkList {
    #[serde(rename = "_links")]
    pub links: SubscriptionLinkListLinks,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscription_wire_shape() {
        let mut sub = Subscription::new(SubscriptionKind::AssocSta, "http://cb")
            .with_expiry(TimeStamp::from_secs(1_700_000_000))
            .with_filter(json!({"apId": {"bssid": "ff:ff"}}));
        sub.links = Some(SubscriptionLinks {
            self_link: LinkType {
                href: "http://host/wai/v2/subscriptions/7".into(),
            },
        });

        let value = serde_json::to_value(&sub).unwrap();
        assert_eq!(value["subscriptionType"], "AssocStaSubscription");
        assert_eq!(value["callbackReference"], "http://cb");
        assert_eq!(value["_links"]["self"]["href"], "http://host/wai/v2/subscriptions/7");
        assert_eq!(value["expiryDeadline"]["seconds"], 1_700_000_000);
        assert_eq!(value["filterCriteria"]["apId"]["bssid"], "ff:ff");
        assert!(value.get("id").is_none());
        assert!(value.get("requestTestNotification").is_none());
    }

    #[test]
    fn test_id_from_self_link() {
        assert_eq!(
            id_from_self_link("http://host/wai/v2/subscriptions/42"),
            Some(SubscriptionId(42))
        );
        assert_eq!(id_from_self_link("subscriptions/5/"), Some(SubscriptionId(5)));
        assert_eq!(id_from_self_link("http://host/subscriptions/abc"), None);
        assert_eq!(id_from_self_link(""), None);
    }

    #[test]
    fn test_kind_round_trips_through_name() {
        for kind in SubscriptionKind::ALL {
            assert_eq!(kind.as_str().parse::<SubscriptionKind>().unwrap(), kind);
            assert!(kind.notification_type().ends_with("Notification"));
        }
        assert!("MeasurementReportSubscription".parse::<SubscriptionKind>().is_err());
    }

    #[test]
    fn test_delivery_target() {
        let sub = Subscription::new(SubscriptionKind::V2xMsg, "  ");
        assert!(!sub.has_delivery_target());

        let mut ws = sub.clone();
        ws.websock_notif_config = Some(json!({"requestWebsocketUri": true}));
        assert!(ws.has_delivery_target());
        assert!(ws.callback_url().is_none());
    }

    #[test]
    fn test_timestamp_ordering() {
        let a = TimeStamp::from_secs(10);
        let b = TimeStamp {
            seconds: 10,
            nano_seconds: 5,
        };
        assert!(a < b);
        assert!(b < TimeStamp::from_secs(11));
        assert_eq!(a.plus_secs(2).seconds, 12);
    }
}
