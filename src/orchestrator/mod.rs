// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync orchestrator.
//!
//! The [`SyncOrchestrator`] drives fetch → classify → retry → upsert for one
//! entity type at a time:
//! - [`RateLimitManager`] admits every call and charges it afterwards
//! - [`ErrorClassifier`] turns failures into retry decisions, guarded by the
//!   shared circuit breaker
//! - [`MemoryManager`] sizes every page and stops a scan at the critical
//!   threshold
//!
//! # Per page
//!
//! ```text
//! batch size → circuit check → admission → call ─┬─ ok ──→ consume tokens, close circuits, next offset
//!                                               └─ err ─→ classify → should_retry? → sleep → call
//! ```
//!
//! Independent entity types can be synced concurrently ([`SyncOrchestrator::sync_many`]);
//! pages within one entity type are strictly sequential because each offset
//! depends on the previous page's length.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use crm_sync::{SyncEngineConfig, SyncOptions};
//! use crm_sync::counters::InMemoryCounterStore;
//! use crm_sync::events::TracingEventSink;
//! use crm_sync::orchestrator::SyncOrchestrator;
//! use crm_sync::store::InMemoryRecordStore;
//! # use crm_sync::transport::{ApiResponse, CallOptions, RemoteTransport, TransportError};
//! # struct Api;
//! # #[async_trait::async_trait]
//! # impl RemoteTransport for Api {
//! #     async fn call(&self, _: &str, _: &CallOptions) -> Result<ApiResponse, TransportError> {
//! #         Ok(ApiResponse::ok(vec![]))
//! #     }
//! # }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let orchestrator = SyncOrchestrator::from_config(
//!     &SyncEngineConfig::default(),
//!     Arc::new(Api),
//!     Arc::new(InMemoryRecordStore::new()),
//!     Arc::new(InMemoryCounterStore::new()),
//!     Arc::new(TracingEventSink),
//! )
//! .expect("valid config");
//!
//! let result = orchestrator.sync(&SyncOptions::new("deals").with_full_scan(true)).await;
//! # let _ = result;
//! # }
//! ```

mod fetch;
mod process;
mod sync;
mod types;

pub use fetch::PageCursor;
pub use types::{PageProgress, RecordOutcome};

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::{PaginationConfig, SyncEngineConfig};
use crate::counters::CounterStore;
use crate::error::SyncError;
use crate::events::EventSink;
use crate::memory::MemoryManager;
use crate::rate_limit::RateLimitManager;
use crate::registry::{EntityDescriptor, EntityRegistry};
use crate::resilience::{CircuitBreaker, ErrorClassifier};
use crate::store::LocalStore;
use crate::transport::RemoteTransport;

pub struct SyncOrchestrator {
    transport: Arc<dyn RemoteTransport>,
    store: Arc<dyn LocalStore>,
    sink: Arc<dyn EventSink>,
    registry: Arc<EntityRegistry>,
    rate_limiter: Arc<RateLimitManager>,
    classifier: Arc<ErrorClassifier>,
    memory: Arc<MemoryManager>,
    pagination: PaginationConfig,
    /// Max entity types synced at once by `sync_many`
    concurrency: usize,
    cancel: CancellationToken,
}

impl SyncOrchestrator {
    /// Assemble from ready-made components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        store: Arc<dyn LocalStore>,
        sink: Arc<dyn EventSink>,
        registry: Arc<EntityRegistry>,
        rate_limiter: Arc<RateLimitManager>,
        classifier: Arc<ErrorClassifier>,
        memory: Arc<MemoryManager>,
        pagination: PaginationConfig,
    ) -> Self {
        Self {
            transport,
            store,
            sink,
            registry,
            rate_limiter,
            classifier,
            memory,
            pagination,
            concurrency: 1,
            cancel: CancellationToken::new(),
        }
    }

    /// Build every component from one config over a shared counter store.
    pub fn from_config(
        config: &SyncEngineConfig,
        transport: Arc<dyn RemoteTransport>,
        store: Arc<dyn LocalStore>,
        counters: Arc<dyn CounterStore>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let breaker = Arc::new(CircuitBreaker::new(counters.clone(), config.circuit()));
        let mut orchestrator = Self::new(
            transport,
            store,
            sink,
            Arc::new(EntityRegistry::with_defaults()),
            Arc::new(RateLimitManager::new(counters, config.rate_limit())),
            Arc::new(ErrorClassifier::new(breaker)),
            Arc::new(MemoryManager::for_process(config.memory())),
            config.pagination(),
        );
        orchestrator.concurrency = config.sync_concurrency.max(1);
        Ok(orchestrator)
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Arc<EntityRegistry>) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_memory_manager(mut self, memory: Arc<MemoryManager>) -> Self {
        self.memory = memory;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Share an external cancellation token (e.g. the host's shutdown token).
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimitManager> {
        &self.rate_limiter
    }

    #[must_use]
    pub fn classifier(&self) -> &Arc<ErrorClassifier> {
        &self.classifier
    }

    #[must_use]
    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Stop every running sync at its next check (between attempts, pages
    /// or during a retry sleep).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn descriptor(&self, entity_type: &str) -> Result<&EntityDescriptor, SyncError> {
        self.registry
            .get(entity_type)
            .ok_or_else(|| SyncError::UnsupportedEntity(entity_type.to_string()))
    }

    fn check_cancelled(&self) -> Result<(), SyncError> {
        if self.cancel.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep, waking early with `Cancelled` if the orchestrator is cancelled.
    async fn pause(&self, delay: Duration) -> Result<(), SyncError> {
        if delay.is_zero() {
            return self.check_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}
