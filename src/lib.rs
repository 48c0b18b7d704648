//! # bandwidth-broker
//!
//! Request/reply coordination for a bandwidth-reservation pipeline.
//!
//! A caller hands a reservation (caller key + payload) to the
//! [`coordinator::RequestCoordinator`]. The request is registered under its
//! key, broadcast to every [`event::observer::Observer`] over the
//! [`event::event_bus::EventBus`], and the caller waits, bounded by a timeout,
//! until the [`event::reply_listener::ReplyListener`] matches a reply to it.
//!
//! - Correlation and one-shot completion ([`request`], [`completion`])
//! - In-flight bookkeeping ([`registry`])
//! - Wiring, startup and shutdown ([`system`], [`config`])

pub mod completion;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod registry;
pub mod request;
pub mod system;

// Re-exports
pub use config::BrokerConfig;
pub use coordinator::{RequestCoordinator, RequestError, RequestResponse, ResponseStatus};
pub use error::Error as BrokerError;
pub use error::InternalResult;
pub use event::event_bus::{Event, EventBus, ObserverFailure, ReplyEvent, ReplyOutcome};
pub use event::observer::{FnObserver, Observer, ObserverContext, ObserverSet};
pub use registry::{DuplicatePolicy, RequestRegistry};
pub use request::{CorrelatedRequest, Payload, RequestKey};
pub use system::Broker;
