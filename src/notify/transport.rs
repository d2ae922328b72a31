//! Outbound transport for notification POSTs.

use crate::error::{EngineError, Result};
use parking_lot::Mutex;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

/// What came back from a callback endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Delivers a JSON body to a URL.
///
/// An `Err` means no response was obtained at all (refused, reset, timed
/// out). Non-2xx answers are `Ok` responses.
pub trait Transport: Send + Sync {
    fn post_json(&self, url: &str, body: &str) -> Result<TransportResponse>;
}

/// Blocking HTTP transport.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// `None` keeps the client's default request timeout.
    pub fn new(timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn post_json(&self, url: &str, body: &str) -> Result<TransportResponse> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        // Body is audit-only; an unreadable one is recorded as empty.
        let body = response.text().unwrap_or_default();
        Ok(TransportResponse { status, body })
    }
}

/// A POST captured by [`RecordingTransport`].
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedRequest {
    pub url: String,
    pub body: Value,
}

/// In-process transport that records every POST and answers with a fixed
/// status. Status 0 simulates an unreachable endpoint.
#[derive(Debug)]
pub struct RecordingTransport {
    requests: Mutex<Vec<RecordedRequest>>,
    status: AtomicU16,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::with_status(204)
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            status: AtomicU16::new(status),
        }
    }

    /// Every request fails without a response.
    pub fn unreachable() -> Self {
        Self::with_status(0)
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_to(&self, url: &str) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url == url)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for RecordingTransport {
    fn post_json(&self, url: &str, body: &str) -> Result<TransportResponse> {
        self.requests.lock().push(RecordedRequest {
            url: url.to_string(),
            body: serde_json::from_str(body)?,
        });

        match self.status.load(Ordering::SeqCst) {
            0 => Err(EngineError::Transport(format!("connection refused: {}", url))),
            status => Ok(TransportResponse {
                status,
                body: String::new(),
            }),
        }
    }
}
