use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    completion::{CancelReason, CompletionSignal},
    event::event_bus::ReplyOutcome,
};

/// Payload parameter that overrides the coordinator's default timeout.
pub const TIMEOUT_PARAMETER: &str = "timeout_ms";

/// Opaque request parameters (user, flow, action, filters ...).
pub type Payload = HashMap<String, serde_json::Value>;

/// Caller identity, used as the registry key and as the correlation id that
/// replies carry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for RequestKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

// A client address identifies the caller; the port is dropped so that one
// client host maps to one in-flight reservation.
impl From<IpAddr> for RequestKey {
    fn from(addr: IpAddr) -> Self {
        Self(addr.to_string())
    }
}

impl From<SocketAddr> for RequestKey {
    fn from(addr: SocketAddr) -> Self {
        Self::from(addr.ip())
    }
}

/// An in-flight request: the caller's key and payload plus the completion
/// signal its coordinator waits on.
///
/// Shared by `Arc` between the registry, the event bus and the reply listener.
/// Everything except the completion signal is immutable after construction.
#[derive(Debug)]
pub struct CorrelatedRequest {
    key: RequestKey,
    request_id: Uuid,
    payload: Payload,
    created_at: DateTime<Utc>,
    completion: CompletionSignal,
}

impl CorrelatedRequest {
    pub fn new(key: RequestKey, payload: Payload) -> Self {
        Self {
            key,
            request_id: Uuid::new_v4(),
            payload,
            created_at: Utc::now(),
            completion: CompletionSignal::new(),
        }
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    /// Unique per request, distinguishes two requests made under the same key.
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn parameter(&self, name: &str) -> Option<&serde_json::Value> {
        self.payload.get(name)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    pub fn completion(&self) -> &CompletionSignal {
        &self.completion
    }

    pub fn signal(&self, outcome: ReplyOutcome) -> bool {
        self.completion.signal(outcome)
    }

    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.completion.cancel(reason)
    }

    pub fn is_same_request(&self, other: &CorrelatedRequest) -> bool {
        self.request_id == other.request_id
    }

    /// Timeout requested through the payload, if any.
    ///
    /// Returns `Err` with a description when the parameter is present but is
    /// not a positive integer number of milliseconds.
    pub fn requested_timeout(&self) -> Result<Option<Duration>, String> {
        match self.payload.get(TIMEOUT_PARAMETER) {
            None => Ok(None),
            Some(value) => match value.as_u64() {
                Some(ms) if ms > 0 => Ok(Some(Duration::from_millis(ms))),
                _ => Err(format!(
                    "{} must be a positive integer, got {}",
                    TIMEOUT_PARAMETER, value
                )),
            },
        }
    }
}
