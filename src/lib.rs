//! # CRM Sync Engine
//!
//! Pulls records from a remote CRM API into local storage while staying inside
//! the remote provider's daily token budget, surviving transient failures and
//! adapting to memory pressure.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SyncOrchestrator                       │
//! │  • fetch → classify → retry → upsert, per entity type      │
//! │  • full scans page oldest-first until a short page         │
//! └─────────────────────────────────────────────────────────────┘
//!        │                  │                    │
//!        ▼                  ▼                    ▼
//! ┌──────────────┐  ┌────────────────┐  ┌─────────────────┐
//! │ RateLimit    │  │ ErrorClassifier│  │ MemoryManager   │
//! │ daily tokens │  │ + per-kind     │  │ adaptive batch  │
//! │ remote hints │  │ CircuitBreaker │  │ hard stop       │
//! └──────────────┘  └────────────────┘  └─────────────────┘
//!        │                  │
//!        └────────┬─────────┘
//!                 ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │           CounterStore (in-process or Redis, TTL keys)      │
//! └─────────────────────────────────────────────────────────────┘
//!
//! Webhooks ──→ WebhookRouter ──→ MergeDetector (correlation window)
//!                                  └─→ RelationMigrator + "merged" event
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use crm_sync::{SyncEngine, SyncEngineConfig, SyncOptions};
//! use crm_sync::store::InMemoryRecordStore;
//! # use crm_sync::transport::{ApiResponse, CallOptions, RemoteTransport, TransportError};
//! # struct CrmApi;
//! # #[async_trait::async_trait]
//! # impl RemoteTransport for CrmApi {
//! #     async fn call(&self, _: &str, _: &CallOptions) -> Result<ApiResponse, TransportError> {
//! #         Ok(ApiResponse::ok(vec![]))
//! #     }
//! # }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncEngineConfig {
//!         redis_url: Some("redis://localhost:6379".into()),
//!         ..Default::default()
//!     };
//!     let store = Arc::new(InMemoryRecordStore::new());
//!     let mut engine = SyncEngine::new(config, Arc::new(CrmApi), store.clone()).with_migrator(store);
//!     engine.start().await.expect("Failed to start");
//!
//!     let orchestrator = engine.orchestrator().expect("running");
//!     let result = orchestrator
//!         .sync(&SyncOptions::new("deals").with_full_scan(true))
//!         .await
//!         .expect("sync failed");
//!     println!("{result}");
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`orchestrator`]: the [`SyncOrchestrator`] driving every sync
//! - [`rate_limit`]: daily token budget and remote rate-limit headers
//! - [`resilience`]: error classification, circuit breakers, backoff
//! - [`memory`]: adaptive batch sizing and the memory hard stop
//! - [`health`]: cached remote health probes
//! - [`merge`] / [`webhook`]: inbound notifications and merge inference
//! - [`counters`]: TTL counter stores shared across instances

pub mod config;
pub mod counters;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod memory;
pub mod merge;
pub mod metrics;
pub mod orchestrator;
pub mod rate_limit;
pub mod record;
pub mod registry;
pub mod resilience;
pub mod store;
pub mod transport;
pub mod webhook;

pub use config::SyncEngineConfig;
pub use engine::{EngineState, SyncEngine};
pub use error::SyncError;
pub use events::{EventSink, SyncEvent};
pub use health::{HealthChecker, HealthStats};
pub use memory::{MemoryManager, MemoryPressure};
pub use merge::{MergeDetector, MigrationStrategy, WebhookAction, WebhookEvent};
pub use metrics::LatencyTimer;
pub use orchestrator::SyncOrchestrator;
pub use rate_limit::{RateLimitManager, TokenBudget};
pub use record::{FetchMode, RemoteRecord, SyncOptions, SyncResult};
pub use resilience::{CircuitBreaker, ClassifiedError, ErrorClassifier, ErrorKind, RetryConfig};
pub use store::{LocalStore, RelationMigrator};
pub use transport::RemoteTransport;
pub use webhook::WebhookRouter;
