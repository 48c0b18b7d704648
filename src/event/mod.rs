//! # Event-Driven Dispatch
//!
//! The reservation pipeline is a set of loosely coupled observers that talk
//! through a single broadcast [`event_bus::EventBus`].
//!
//! ## Request-Reply Flow
//!
//! ```text
//! ┌───────────┐  Request  ┌──────────┐  Request  ┌──────────┐
//! │Coordinator│──────────▶│ EventBus │──────────▶│ Observer │ (policy, filter,
//! └─────▲─────┘           └────┬─────┘           └────┬─────┘  state, device)
//!       │                      │        Reply         │
//!       │ signal          ┌────▼────────┐◀────────────┘
//!       └─────────────────│ReplyListener│
//!                         └─────────────┘
//! ```
//!
//! 1. The coordinator registers a request and publishes it
//! 2. The bus hands it to every observer without waiting for any of them
//! 3. Some observer eventually publishes a reply tagged with the correlation id
//! 4. The reply listener looks the id up in the registry and signals completion

pub mod event_bus;
pub mod observer;
pub mod reply_listener;
