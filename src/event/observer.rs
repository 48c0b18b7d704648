//! # Observers
//!
//! An observer is one module of the reservation pipeline (policy, filter,
//! network state, device programming). Each observer receives every request
//! broadcast on the [`EventBus`] and may, at its own pace, answer it.
//!
//! Observers run as independent tasks. Each request is handled in its own
//! spawned task, so a slow or panicking observer neither blocks the publisher
//! nor stops that observer from receiving later requests.

use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use futures::{future::BoxFuture, FutureExt};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, warn};

use super::event_bus::{
    Event, EventBus, EventError, EventReceiver, EventResult, ReplyEvent, ReplyOutcome,
};
use crate::request::CorrelatedRequest;

/// Handle given to observers for emitting replies.
#[derive(Clone)]
pub struct ObserverContext {
    event_bus: Arc<EventBus>,
    observer: String,
    request: Option<Arc<CorrelatedRequest>>,
}

impl ObserverContext {
    pub fn new(event_bus: Arc<EventBus>, observer: &str) -> Self {
        Self {
            event_bus,
            observer: observer.to_string(),
            request: None,
        }
    }

    /// Context for handling `request`. Replies to its key published through
    /// it carry its request id.
    pub fn scoped(&self, request: Arc<CorrelatedRequest>) -> Self {
        Self {
            request: Some(request),
            ..self.clone()
        }
    }

    pub fn observer(&self) -> &str {
        &self.observer
    }

    /// Publishes a reply. Usable any number of times; only the first reply
    /// for a live request has an effect.
    pub fn reply(&self, mut reply: ReplyEvent) -> EventResult<()> {
        if reply.request_id.is_none() {
            if let Some(request) = self
                .request
                .as_ref()
                .filter(|r| r.key() == &reply.correlation_id)
            {
                reply.request_id = Some(request.request_id());
            }
        }
        debug!(observer = %self.observer, key = %reply.correlation_id, "observer reply");
        self.event_bus.sync_publish(Event::Reply(reply))?;
        Ok(())
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Observer: Send + Sync {
    fn name(&self) -> String;

    /// Handles a broadcast request.
    ///
    /// Returning `Some` publishes that outcome as the reply for
    /// `request.key()`. Returning `None` means this observer either does not
    /// answer this request or replies later through `context`.
    async fn receive(
        &self,
        request: Arc<CorrelatedRequest>,
        context: ObserverContext,
    ) -> Option<ReplyOutcome>;
}

pub type ObserverHandler = Box<
    dyn Fn(Arc<CorrelatedRequest>, ObserverContext) -> BoxFuture<'static, Option<ReplyOutcome>>
        + Send
        + Sync,
>;

/// Observer backed by a closure.
pub struct FnObserver {
    name: String,
    handler: ObserverHandler,
}

impl FnObserver {
    pub fn new<F, Fut>(name: &str, handler: F) -> Self
    where
        F: Fn(Arc<CorrelatedRequest>, ObserverContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<ReplyOutcome>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            handler: Box::new(move |request, context| handler(request, context).boxed()),
        }
    }
}

#[async_trait]
impl Observer for FnObserver {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn receive(
        &self,
        request: Arc<CorrelatedRequest>,
        context: ObserverContext,
    ) -> Option<ReplyOutcome> {
        (self.handler)(request, context).await
    }
}

/// The fixed set of observers subscribed to the bus for the process lifetime.
#[derive(Default, Clone)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn Observer>>,
}

impl ObserverSet {
    pub fn new(observers: Vec<Arc<dyn Observer>>) -> Self {
        Self { observers }
    }

    pub fn with(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.observers.iter().map(|o| o.name()).collect()
    }

    /// Subscribes every observer to the bus and starts its receive loop.
    ///
    /// Subscriptions are taken before this returns, so every request
    /// published afterwards reaches every observer.
    pub fn spawn(
        &self,
        event_bus: &Arc<EventBus>,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Vec<JoinHandle<()>> {
        self.observers
            .iter()
            .map(|observer| {
                let event_rx = event_bus.subscribe();
                let shutdown_rx = shutdown_tx.subscribe();
                let context = ObserverContext::new(event_bus.clone(), &observer.name());
                tokio::spawn(run_observer(
                    observer.clone(),
                    context,
                    event_rx,
                    shutdown_rx,
                ))
            })
            .collect()
    }
}

async fn run_observer(
    observer: Arc<dyn Observer>,
    context: ObserverContext,
    mut event_rx: EventReceiver,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    debug!(observer = %context.observer(), "observer started");
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = event_rx.recv() => match event {
                Ok(Event::Request(request)) => {
                    dispatch(observer.clone(), context.clone(), request);
                }
                Ok(Event::Reply(_)) => {}
                Err(EventError::Lagged { count }) => {
                    warn!(observer = %context.observer(), count, "observer lagged, requests skipped");
                }
                Err(e) => {
                    debug!(observer = %context.observer(), "observer stopping: {}", e);
                    break;
                }
            }
        }
    }
    debug!(observer = %context.observer(), "observer stopped");
}

fn dispatch(
    observer: Arc<dyn Observer>,
    context: ObserverContext,
    request: Arc<CorrelatedRequest>,
) {
    tokio::spawn(async move {
        let context = context.scoped(request.clone());
        if let Some(outcome) = observer.receive(request.clone(), context.clone()).await {
            if let Err(e) = context.reply(ReplyEvent::for_request(&request, outcome)) {
                error!(observer = %context.observer(), "failed to publish reply: {}", e);
            }
        }
    });
}
