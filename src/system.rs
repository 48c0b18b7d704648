use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::future::join_all;
use thiserror::Error;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    completion::CancelReason,
    config::BrokerConfig,
    coordinator::{RequestCoordinator, RequestResponse},
    event::{
        event_bus::EventBus,
        observer::{Observer, ObserverSet},
        reply_listener::ReplyListener,
    },
    registry::RequestRegistry,
    request::{Payload, RequestKey},
};

/// Owns the bus, the registry and every background task of one broker.
pub struct Broker {
    config: BrokerConfig,
    event_bus: Arc<EventBus>,
    registry: Arc<RequestRegistry>,
    coordinator: Arc<RequestCoordinator>,
    observers: ObserverSet,
    shutdown_tx: broadcast::Sender<()>, // Brokerがシャットダウンシグナルを送信
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Broker {
    pub fn new(config: BrokerConfig, observers: ObserverSet) -> SystemResult<Self> {
        config
            .validate()
            .map_err(|e| SystemError::Config(e.to_string()))?;

        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));
        let registry = Arc::new(RequestRegistry::new(config.duplicate_policy));
        let coordinator = Arc::new(RequestCoordinator::from_config(
            registry.clone(),
            event_bus.clone(),
            &config,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            event_bus,
            registry,
            coordinator,
            observers,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Builds and starts a broker in one step.
    pub async fn start_with(
        config: BrokerConfig,
        observers: Vec<Arc<dyn Observer>>,
    ) -> SystemResult<Self> {
        let broker = Self::new(config, ObserverSet::new(observers))?;
        broker.start().await?;
        Ok(broker)
    }

    /// Spawns the reply listener and the observer loops.
    ///
    /// All subscriptions exist once this returns.
    pub async fn start(&self) -> SystemResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SystemError::AlreadyStarted);
        }

        let mut tasks = self.tasks.lock().await;
        let listener = Arc::new(ReplyListener::new(self.registry.clone()));
        tasks.push(listener.spawn(&self.event_bus, &self.shutdown_tx));
        tasks.extend(self.observers.spawn(&self.event_bus, &self.shutdown_tx));

        info!(
            observers = ?self.observers.names(),
            buffer = self.config.event_buffer_size,
            policy = %self.config.duplicate_policy,
            "broker started"
        );
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> Arc<RequestCoordinator> {
        self.coordinator.clone()
    }

    pub async fn reserve(&self, key: RequestKey, payload: Payload) -> RequestResponse {
        self.coordinator.reserve(key, payload).await
    }

    /// Refuses new requests, cancels in-flight ones, stops background tasks
    /// and waits for them up to `shutdown_timeout`.
    pub async fn shutdown(&self) -> SystemResult<()> {
        self.coordinator.close();
        let cancelled = self.registry.cancel_all(CancelReason::Shutdown);
        if cancelled > 0 {
            info!(cancelled, "cancelled in-flight requests");
        }

        // シャットダウンシグナルを送信
        if self.shutdown_tx.send(()).is_err() {
            debug!("no background task listening for shutdown");
        }

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        let count = tasks.len();
        match tokio::time::timeout(self.config.shutdown_timeout, join_all(tasks)).await {
            Ok(results) => {
                for result in results.into_iter().filter_map(Result::err) {
                    warn!("background task ended abnormally: {}", result);
                }
                info!(tasks = count, "broker stopped");
                Ok(())
            }
            Err(_) => Err(SystemError::ShutdownTimeout {
                timeout_ms: self.config.shutdown_timeout.as_millis() as u64,
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Broker already started")]
    AlreadyStarted,
    #[error("Invalid broker config: {0}")]
    Config(String),
    #[error("Shutdown did not finish within {timeout_ms}ms")]
    ShutdownTimeout { timeout_ms: u64 },
}

pub type SystemResult<T> = Result<T, SystemError>;
