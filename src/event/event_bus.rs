//! # Event Bus Implementation
//!
//! The EventBus is the dispatch hub between the request coordinator and the
//! observer modules (policy, filter, state store, device layer). It provides a
//! broadcast-based publish-subscribe mechanism: every subscriber receives its
//! own copy of every event, and publishing never waits for any subscriber.
//!
//! ## Design Decisions
//!
//! The implementation uses Tokio's broadcast channel rather than MPSC channels to:
//!
//! 1. Allow multiple observers to receive the same request
//! 2. Handle backpressure through the channel capacity (slow receivers lag, the
//!    publisher never blocks)
//! 3. Support non-blocking publish operations from both async and sync contexts
//!
//! Requests and replies travel on the same bus. Observers only look at
//! [`Event::Request`], the reply listener only looks at [`Event::Reply`].

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use uuid::Uuid;

use crate::request::{CorrelatedRequest, RequestKey};

/// A message carried by the [`EventBus`].
#[derive(Debug, Clone)]
pub enum Event {
    /// A new in-flight request, broadcast to every observer.
    Request(Arc<CorrelatedRequest>),
    /// An observer's answer to a request, consumed by the reply listener.
    Reply(ReplyEvent),
}

impl Event {
    pub fn correlation_id(&self) -> &RequestKey {
        match self {
            Event::Request(request) => request.key(),
            Event::Reply(reply) => &reply.correlation_id,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, Event::Reply(_))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Request(request) => write!(
                f,
                "Request(key={}, request_id={})",
                request.key(),
                request.request_id()
            ),
            Event::Reply(reply) => match reply.request_id {
                Some(id) => write!(f, "Reply(key={}, request_id={})", reply.correlation_id, id),
                None => write!(f, "Reply(key={})", reply.correlation_id),
            },
        }
    }
}

/// Reply emitted by an observer, tagged with the correlation id of the
/// request it answers.
///
/// `request_id` pins the reply to one specific request. Without it the reply
/// resolves whatever request is in flight for `correlation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEvent {
    pub correlation_id: RequestKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    pub outcome: ReplyOutcome,
}

impl ReplyEvent {
    pub fn new(correlation_id: RequestKey, outcome: ReplyOutcome) -> Self {
        Self {
            correlation_id,
            request_id: None,
            outcome,
        }
    }

    /// Reply bound to `request`; a later request for the same key ignores it.
    pub fn for_request(request: &CorrelatedRequest, outcome: ReplyOutcome) -> Self {
        Self::new(request.key().clone(), outcome).with_request_id(request.request_id())
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn success(correlation_id: RequestKey, details: impl Into<String>) -> Self {
        Self::new(correlation_id, ReplyOutcome::success(details))
    }

    pub fn failure(correlation_id: RequestKey, failure: ObserverFailure) -> Self {
        Self::new(correlation_id, ReplyOutcome::Failure(failure))
    }
}

/// What an observer decided about a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplyOutcome {
    Success { details: String },
    Failure(ObserverFailure),
}

impl ReplyOutcome {
    pub fn success(details: impl Into<String>) -> Self {
        ReplyOutcome::Success {
            details: details.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ReplyOutcome::Success { .. })
    }
}

/// Error description carried by a failure reply.
///
/// Observers are responsible for replying with one of these when their own
/// processing fails, so the caller is not left waiting for the timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "failure", rename_all = "snake_case")]
pub enum ObserverFailure {
    /// The request targets a resource no observer manages (e.g. an unknown switch).
    #[error("target not found: {target}")]
    NotFound { target: String },
    /// A policy or filter refused the request.
    #[error("rejected: {reason}")]
    Rejected { reason: String },
    /// The observer failed internally.
    #[error("internal observer failure: {message}")]
    Internal { message: String },
}

/// # EventBus
///
/// Central message hub. If the number of unprocessed events exceeds the
/// capacity, the oldest events are dropped for the lagging receivers; the
/// publisher is never blocked.
pub struct EventBus {
    /// Broadcast sender for requests and replies
    event_sender: broadcast::Sender<Event>,
    /// Maximum number of events that can be buffered
    capacity: usize,
    /// Internal receiver to keep the broadcast channel active
    _internal_receiver: broadcast::Receiver<Event>,
}

impl EventBus {
    /// Creates a new EventBus with the specified buffer capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero (tokio's broadcast channel requirement);
    /// [`crate::config::BrokerConfig::validate`] rejects such a configuration.
    pub fn new(capacity: usize) -> Self {
        let (event_sender, event_receiver) = broadcast::channel(capacity);
        Self {
            event_sender,
            capacity,
            _internal_receiver: event_receiver,
        }
    }

    /// Subscribes to all events published after this call.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver::new(self.event_sender.subscribe())
    }

    /// Publishes an event to all subscribers.
    ///
    /// The event is enqueued for every current subscriber before this returns;
    /// no subscriber is awaited. Returns the number of external subscribers the
    /// event was handed to.
    pub async fn publish(&self, event: Event) -> EventResult<usize> {
        self.sync_publish(event)
    }

    /// Publishes an event from a synchronous context.
    pub fn sync_publish(&self, event: Event) -> EventResult<usize> {
        debug_event("Publishing", &event);
        let delivered = self
            .event_sender
            .send(event)
            .map_err(|e| EventError::SendFailed {
                message: e.to_string(),
            })?;
        Ok(delivered.saturating_sub(1))
    }

    pub fn queue_size(&self) -> usize {
        self.event_sender.len()
    }

    /// Number of external subscribers (the internal keep-alive receiver is not counted).
    pub fn subscribers_size(&self) -> usize {
        self.event_sender.receiver_count().saturating_sub(1)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

pub fn debug_event(prefix: &str, event: &Event) {
    match event {
        Event::Request(_) => debug!("{} {}", prefix, event),
        Event::Reply(reply) => trace!("{} {} outcome={:?}", prefix, event, reply.outcome),
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<Event>,
}

impl EventReceiver {
    fn new(receiver: broadcast::Receiver<Event>) -> Self {
        Self { receiver }
    }

    /// Receives the next event.
    ///
    /// When this receiver fell behind, `EventError::Lagged` is returned with
    /// the number of skipped events; the caller should log it and keep
    /// receiving from the oldest event still buffered.
    pub async fn recv(&mut self) -> EventResult<Event> {
        match self.receiver.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                // No resubscribe: the receiver already points at the oldest
                // retained event, and jumping to the tail would drop those too.
                Err(EventError::Lagged { count: n })
            }
            Err(broadcast::error::RecvError::Closed) => Err(EventError::Closed),
        }
    }
}

#[derive(Error, Debug)]
pub enum EventError {
    #[error("Event Send failed: {message}")]
    SendFailed { message: String },

    #[error("Event lagged: {count}")]
    Lagged { count: u64 },

    #[error("Event bus closed")]
    Closed,
}

pub type EventResult<T> = Result<T, EventError>;
