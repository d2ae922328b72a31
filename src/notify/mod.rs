//! Outbound notifications: document building, HTTP push and audit.

mod audit;
mod dispatcher;
mod transport;

pub use audit::{
    AuditSink, HttpLogEntry, MemoryAuditSink, StoreAuditSink, TracingAuditSink,
    HTTP_LOG_RESOURCE,
};
pub use dispatcher::{
    Delivery, Notification, NotificationDispatcher, EXPIRY_NOTIFICATION, TEST_NOTIFICATION,
};
pub use transport::{
    HttpTransport, RecordedRequest, RecordingTransport, Transport, TransportResponse,
};
