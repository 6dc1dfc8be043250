// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: wires every component from one [`SyncEngineConfig`].
//!
//! ```text
//! Created ──start()──→ Connecting ──→ Running ──shutdown()──→ ShuttingDown ──→ Stopped
//! ```
//!
//! With `redis_url` set, the token budget, circuit state and remote rate-limit
//! snapshot live in Redis (shared by every instance) and events are also
//! appended to a Redis stream. If Redis cannot be reached the engine keeps
//! going on in-process counters.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::SyncEngineConfig;
use crate::counters::{CounterStore, InMemoryCounterStore, RedisCounterStore};
use crate::error::SyncError;
use crate::events::{BroadcastEventSink, EventSink, FanoutEventSink, RedisStreamEventSink, SyncEvent};
use crate::health::HealthChecker;
use crate::merge::MergeDetector;
use crate::orchestrator::SyncOrchestrator;
use crate::store::{LocalStore, RelationMigrator};
use crate::transport::RemoteTransport;
use crate::webhook::WebhookRouter;

/// Capacity of the in-process event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Connecting to the shared counter store
    Connecting,
    /// Components built, background tasks running
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Components available once the engine is running.
struct Components {
    orchestrator: Arc<SyncOrchestrator>,
    health: Arc<HealthChecker>,
    webhooks: Arc<WebhookRouter>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct SyncEngine {
    config: SyncEngineConfig,
    transport: Arc<dyn RemoteTransport>,
    store: Arc<dyn LocalStore>,
    migrator: Option<Arc<dyn RelationMigrator>>,
    events: Arc<BroadcastEventSink>,
    state: watch::Sender<EngineState>,
    cancel: CancellationToken,
    components: Option<Components>,
}

impl SyncEngine {
    pub fn new(config: SyncEngineConfig, transport: Arc<dyn RemoteTransport>, store: Arc<dyn LocalStore>) -> Self {
        let (state, _) = watch::channel(EngineState::Created);
        Self {
            config,
            transport,
            store,
            migrator: None,
            events: Arc::new(BroadcastEventSink::new(EVENT_CHANNEL_CAPACITY)),
            state,
            cancel: CancellationToken::new(),
            components: None,
        }
    }

    /// Relation migrator used when a merge is inferred.
    #[must_use]
    pub fn with_migrator(mut self, migrator: Arc<dyn RelationMigrator>) -> Self {
        self.migrator = Some(migrator);
        self
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    /// Subscribe to every emitted sync event.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    /// Connect and build the components, then start background tasks.
    #[tracing::instrument(skip(self), fields(has_redis = self.config.redis_url.is_some()))]
    pub async fn start(&mut self) -> Result<(), SyncError> {
        if self.components.is_some() {
            return Ok(());
        }
        self.config.validate()?;
        let _ = self.state.send(EngineState::Connecting);

        let (counters, sink) = self.connect_shared().await;
        let orchestrator = SyncOrchestrator::from_config(
            &self.config,
            self.transport.clone(),
            self.store.clone(),
            counters,
            sink.clone(),
        )?
        .with_cancellation(self.cancel.child_token());
        let orchestrator = Arc::new(orchestrator);

        let mut detector = MergeDetector::new(self.config.merge(), sink.clone())
            .with_registry(orchestrator.registry().clone());
        if let Some(migrator) = &self.migrator {
            detector = detector.with_migrator(migrator.clone());
        }
        let webhooks = Arc::new(WebhookRouter::new(self.store.clone(), sink, Arc::new(detector)));

        let health = Arc::new(HealthChecker::new(self.transport.clone(), self.config.health()));
        let tasks = vec![
            health.clone().spawn_periodic(self.cancel.child_token()),
            spawn_merge_purge(webhooks.clone(), self.cancel.child_token()),
        ];

        self.components = Some(Components {
            orchestrator,
            health,
            webhooks,
            tasks,
        });
        let _ = self.state.send(EngineState::Running);
        info!("Sync engine running");
        Ok(())
    }

    /// Redis-backed counters and event stream when configured and reachable.
    async fn connect_shared(&self) -> (Arc<dyn CounterStore>, Arc<dyn EventSink>) {
        let local: Arc<dyn EventSink> = self.events.clone();
        let Some(url) = self.config.redis_url.as_deref() else {
            info!("No redis_url configured, using in-process counters");
            return (Arc::new(InMemoryCounterStore::new()), local);
        };

        match RedisCounterStore::new(url).await {
            Ok(redis) => {
                info!(prefix = %self.config.key_prefix, "Redis counter store connected");
                let stream = RedisStreamEventSink::new(redis.connection(), &self.config.key_prefix);
                let sink = FanoutEventSink::new(vec![local]).with(Arc::new(stream));
                (Arc::new(redis), Arc::new(sink))
            }
            Err(e) => {
                warn!(error = %e, "Failed to connect to Redis, continuing with in-process counters");
                (Arc::new(InMemoryCounterStore::new()), local)
            }
        }
    }

    fn running(&self) -> Result<&Components, SyncError> {
        self.components
            .as_ref()
            .ok_or_else(|| SyncError::Config(format!("engine is {}, not running", self.state())))
    }

    pub fn orchestrator(&self) -> Result<Arc<SyncOrchestrator>, SyncError> {
        Ok(self.running()?.orchestrator.clone())
    }

    pub fn health(&self) -> Result<Arc<HealthChecker>, SyncError> {
        Ok(self.running()?.health.clone())
    }

    pub fn webhooks(&self) -> Result<Arc<WebhookRouter>, SyncError> {
        Ok(self.running()?.webhooks.clone())
    }

    /// Cancel running syncs and stop background tasks.
    pub async fn shutdown(&mut self) {
        let _ = self.state.send(EngineState::ShuttingDown);
        self.cancel.cancel();
        if let Some(components) = self.components.take() {
            for task in components.tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Background task ended abnormally");
                }
            }
        }
        let _ = self.state.send(EngineState::Stopped);
        info!("Sync engine stopped");
    }
}

/// Drop expired correlation groups once per merge window.
fn spawn_merge_purge(webhooks: Arc<WebhookRouter>, cancel: CancellationToken) -> JoinHandle<()> {
    let period = webhooks.detector().window().window();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let window = webhooks.detector().window();
                    window.purge_expired();
                    crate::metrics::set_merge_groups(window.len());
                }
            }
        }
    })
}
