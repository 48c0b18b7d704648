//! # Request Coordinator
//!
//! Turns the fire-and-forget event bus into a bounded request/response call.
//!
//! ```text
//! Created ─▶ Registered ─▶ Dispatched ─▶ Completed ─┐
//!     │           │                    ├▶ TimedOut ──┼─▶ CleanedUp
//!     │           │                    └▶ Cancelled ─┘
//!     └───────────┴──▶ (registration failure, returned without dispatch)
//! ```
//!
//! Cleanup is tied to a drop guard, so the registry entry is removed on every
//! exit path: success, failure, timeout, publish error, or the caller dropping
//! the future mid-wait.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::{
    completion::{CancelReason, WaitOutcome},
    config::BrokerConfig,
    event::event_bus::{Event, EventBus, EventError, ObserverFailure, ReplyOutcome},
    registry::{RegistryError, RequestRegistry},
    request::{CorrelatedRequest, Payload, RequestKey},
};

/// Default bound on how long a caller waits for a reply.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Details reported to the caller when a request times out.
pub const TIMEOUT_DETAILS: &str = "timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RequestState {
    Created,
    Registered,
    Dispatched,
    Completed,
    TimedOut,
    Cancelled,
    CleanedUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Failure,
}

/// Caller-facing result, serializable as `{"status": "...", "details": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestResponse {
    pub status: ResponseStatus,
    pub details: String,
}

impl RequestResponse {
    pub fn ok(details: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Ok,
            details: details.into(),
        }
    }

    pub fn failure(details: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Failure,
            details: details.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}

impl From<&RequestError> for RequestResponse {
    fn from(error: &RequestError) -> Self {
        RequestResponse::failure(error.details())
    }
}

pub struct RequestCoordinator {
    registry: Arc<RequestRegistry>,
    event_bus: Arc<EventBus>,
    default_timeout: Duration,
    max_timeout: Duration,
    closed: AtomicBool,
}

impl RequestCoordinator {
    pub fn new(
        registry: Arc<RequestRegistry>,
        event_bus: Arc<EventBus>,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            event_bus,
            default_timeout: timeout,
            max_timeout: timeout.max(REQUEST_TIMEOUT),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(
        registry: Arc<RequestRegistry>,
        event_bus: Arc<EventBus>,
        config: &BrokerConfig,
    ) -> Self {
        Self {
            registry,
            event_bus,
            default_timeout: config.request_timeout,
            max_timeout: config.max_request_timeout,
            closed: AtomicBool::new(false),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Refuses every request from now on with `Cancelled { reason: Shutdown }`.
    /// Requests already waiting are not touched.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Serves one call and always answers with a value: errors become a
    /// `failure` response.
    pub async fn reserve(&self, key: RequestKey, payload: Payload) -> RequestResponse {
        match self.request(key, payload).await {
            Ok(details) => {
                info!("Request SUCCESS");
                RequestResponse::ok(details)
            }
            Err(e) => {
                info!(kind = e.kind(), "Request FAILED: {}", e);
                RequestResponse::from(&e)
            }
        }
    }

    /// Registers, publishes and waits for the reply to one request.
    #[instrument(skip(self, key, payload), fields(key = %key))]
    pub async fn request(&self, key: RequestKey, payload: Payload) -> RequestResult<String> {
        if self.is_closed() {
            return Err(RequestError::Cancelled {
                key,
                reason: CancelReason::Shutdown,
            });
        }
        let request = Arc::new(CorrelatedRequest::new(key, payload));
        trace_state(&request, RequestState::Created);

        let timeout = self.timeout(&request)?;

        self.registry.put(request.clone())?;
        let _cleanup = CleanupGuard {
            registry: self.registry.clone(),
            request: request.clone(),
        };
        trace_state(&request, RequestState::Registered);

        // Closed between the check above and registration; a shutdown sweep
        // may already have passed this entry.
        if self.is_closed() {
            request.cancel(CancelReason::Shutdown);
            trace_state(&request, RequestState::Cancelled);
            return Err(RequestError::Cancelled {
                key: request.key().clone(),
                reason: CancelReason::Shutdown,
            });
        }

        self.event_bus.publish(Event::Request(request.clone())).await?;
        trace_state(&request, RequestState::Dispatched);

        let outcome = request.completion().wait(timeout).await;
        match outcome {
            WaitOutcome::Completed(reply) => {
                trace_state(&request, RequestState::Completed);
                reply_result(reply)
            }
            WaitOutcome::TimedOut => {
                trace_state(&request, RequestState::TimedOut);
                Err(RequestError::Timeout {
                    key: request.key().clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
            WaitOutcome::Cancelled(reason) => {
                trace_state(&request, RequestState::Cancelled);
                Err(match reason {
                    CancelReason::Superseded => RequestError::Superseded {
                        key: request.key().clone(),
                    },
                    reason => RequestError::Cancelled {
                        key: request.key().clone(),
                        reason,
                    },
                })
            }
        }
    }

    /// Cancels the in-flight request for `key`.
    ///
    /// Its waiter returns `Cancelled` and the entry is removed at once, so a
    /// reply arriving later is treated as unmatched. Returns `false` when no
    /// unresolved request exists for the key.
    pub fn cancel(&self, key: &RequestKey) -> bool {
        let Some(request) = self.registry.get(key) else {
            return false;
        };
        let cancelled = request.cancel(CancelReason::Caller);
        self.registry.remove_request(&request);
        if cancelled {
            debug!(%key, request_id = %request.request_id(), "request cancelled by caller");
        }
        cancelled
    }

    fn timeout(&self, request: &CorrelatedRequest) -> RequestResult<Duration> {
        match request.requested_timeout() {
            Ok(Some(requested)) => Ok(requested.min(self.max_timeout)),
            Ok(None) => Ok(self.default_timeout),
            Err(message) => Err(RequestError::InvalidRequest(message)),
        }
    }
}

fn reply_result(reply: ReplyOutcome) -> RequestResult<String> {
    match reply {
        ReplyOutcome::Success { details } => Ok(details),
        ReplyOutcome::Failure(ObserverFailure::NotFound { target }) => {
            Err(RequestError::NotFound { target })
        }
        ReplyOutcome::Failure(ObserverFailure::Rejected { reason }) => {
            Err(RequestError::Rejected { reason })
        }
        ReplyOutcome::Failure(ObserverFailure::Internal { message }) => {
            Err(RequestError::ObserverFailure { message })
        }
    }
}

fn trace_state(request: &CorrelatedRequest, state: RequestState) {
    debug!(
        request_id = %request.request_id(),
        elapsed_ms = request.elapsed().num_milliseconds(),
        "state: {}",
        state
    );
}

struct CleanupGuard {
    registry: Arc<RequestRegistry>,
    request: Arc<CorrelatedRequest>,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.request.completion().is_settled() {
            // The caller dropped the future mid-wait; close the signal so a
            // late reply is ignored.
            warn!(key = %self.request.key(), "request abandoned before completion");
            self.request.cancel(CancelReason::Caller);
        }
        self.registry.remove_request(&self.request);
        trace_state(&self.request, RequestState::CleanedUp);
    }
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Request already in flight for key: {key}")]
    DuplicateRequest { key: RequestKey },
    #[error("Target not found: {target}")]
    NotFound { target: String },
    #[error("Request rejected: {reason}")]
    Rejected { reason: String },
    #[error("Observer failure: {message}")]
    ObserverFailure { message: String },
    #[error("Request timed out: {key} after {timeout_ms}ms")]
    Timeout { key: RequestKey, timeout_ms: u64 },
    #[error("Request superseded by a newer request for key: {key}")]
    Superseded { key: RequestKey },
    #[error("Request cancelled ({reason}): {key}")]
    Cancelled { key: RequestKey, reason: CancelReason },
    #[error("Event bus error: {0}")]
    EventBus(#[from] EventError),
}

impl From<RegistryError> for RequestError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::DuplicateRequest { key } => RequestError::DuplicateRequest { key },
            RegistryError::InvalidKey => {
                RequestError::InvalidRequest(RegistryError::InvalidKey.to_string())
            }
        }
    }
}

impl RequestError {
    /// Stable short name, for logs and for mapping to transport status codes.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestError::InvalidRequest(_) => "invalid_request",
            RequestError::DuplicateRequest { .. } => "duplicate_request",
            RequestError::NotFound { .. } => "not_found",
            RequestError::Rejected { .. } => "rejected",
            RequestError::ObserverFailure { .. } => "observer_failure",
            RequestError::Timeout { .. } => "timeout",
            RequestError::Superseded { .. } => "superseded",
            RequestError::Cancelled { .. } => "cancelled",
            RequestError::EventBus(_) => "event_bus",
        }
    }

    /// Whether the caller's input is at fault (malformed input or unknown
    /// target) rather than the pipeline.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RequestError::InvalidRequest(_)
                | RequestError::NotFound { .. }
                | RequestError::DuplicateRequest { .. }
        )
    }

    /// Text placed in the `details` field of a failure response.
    pub fn details(&self) -> String {
        match self {
            RequestError::Timeout { .. } => TIMEOUT_DETAILS.to_string(),
            e => e.to_string(),
        }
    }
}

pub type RequestResult<T> = Result<T, RequestError>;
