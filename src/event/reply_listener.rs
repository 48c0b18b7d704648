use std::sync::Arc;

use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, instrument, warn};

use super::event_bus::{Event, EventBus, EventError, EventReceiver, ReplyEvent};
use crate::registry::RequestRegistry;

/// How the listener disposed of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ReplyHandling {
    /// The reply settled a waiting request.
    Resolved,
    /// The request was found but already settled (duplicate reply, or lost a
    /// race with its timeout).
    AlreadySettled,
    /// No in-flight request carries this correlation id, or the reply is
    /// bound to an earlier request for the same key.
    Unmatched,
    /// Not a reply.
    Ignored,
}

/// Resolves in-flight requests from reply events.
///
/// Only reads the registry; removal is the coordinator's job.
pub struct ReplyListener {
    registry: Arc<RequestRegistry>,
}

impl ReplyListener {
    pub fn new(registry: Arc<RequestRegistry>) -> Self {
        Self { registry }
    }

    pub fn handle_event(&self, event: &Event) -> ReplyHandling {
        match event {
            Event::Reply(reply) => self.handle_reply(reply),
            Event::Request(_) => ReplyHandling::Ignored,
        }
    }

    #[instrument(level = "debug", skip(self, reply), fields(key = %reply.correlation_id))]
    pub fn handle_reply(&self, reply: &ReplyEvent) -> ReplyHandling {
        let Some(request) = self.registry.get(&reply.correlation_id) else {
            warn!("unmatched reply dropped: {:?}", reply.outcome);
            return ReplyHandling::Unmatched;
        };

        if let Some(reply_id) = reply.request_id {
            if reply_id != request.request_id() {
                warn!(
                    %reply_id,
                    request_id = %request.request_id(),
                    "stale reply dropped: {:?}",
                    reply.outcome
                );
                return ReplyHandling::Unmatched;
            }
        }

        if request.signal(reply.outcome.clone()) {
            debug!(request_id = %request.request_id(), "reply resolved request");
            ReplyHandling::Resolved
        } else {
            debug!(request_id = %request.request_id(), "request already settled, reply ignored");
            ReplyHandling::AlreadySettled
        }
    }

    /// Subscribes to the bus and starts the listener loop.
    ///
    /// The subscription is taken before this returns, so no reply published
    /// afterwards is missed.
    pub fn spawn(
        self: Arc<Self>,
        event_bus: &EventBus,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> JoinHandle<()> {
        let event_rx = event_bus.subscribe();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(self.run(event_rx, shutdown_rx))
    }

    async fn run(
        self: Arc<Self>,
        mut event_rx: EventReceiver,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        debug!("reply listener started");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                event = event_rx.recv() => match event {
                    Ok(event) => {
                        self.handle_event(&event);
                    }
                    Err(EventError::Lagged { count }) => {
                        warn!(count, "reply listener lagged, replies skipped");
                    }
                    Err(e) => {
                        debug!("reply listener stopping: {}", e);
                        break;
                    }
                }
            }
        }
        debug!("reply listener stopped");
    }
}
