// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity type → fetch handler table.
//!
//! Adding an entity type is one [`EntityRegistry::register`] call; the
//! orchestrator never branches on entity names.
//!
//! # Example
//!
//! ```
//! use crm_sync::registry::{EntityDescriptor, EntityRegistry};
//!
//! let mut registry = EntityRegistry::with_defaults();
//! assert!(registry.get("deals").is_some());
//!
//! registry.register(EntityDescriptor::new("invoices", "invoices").with_link_field("invoice_id"));
//! assert_eq!(registry.get("invoices").unwrap().endpoint(), "invoices");
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::transport::{ApiResponse, CallOptions, RemoteTransport, TransportError};

/// Custom fetch for entity types whose endpoint is not a plain list call.
pub type FetchFn = Arc<
    dyn Fn(Arc<dyn RemoteTransport>, String, CallOptions) -> BoxFuture<'static, Result<ApiResponse, TransportError>>
        + Send
        + Sync,
>;

/// How one entity type is fetched and linked.
#[derive(Clone)]
pub struct EntityDescriptor {
    entity_type: String,
    endpoint: String,
    /// Field on dependent records that points at this entity (e.g. `deal_id`)
    link_field: Option<String>,
    fetch: Option<FetchFn>,
}

impl std::fmt::Debug for EntityDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("entity_type", &self.entity_type)
            .field("endpoint", &self.endpoint)
            .field("link_field", &self.link_field)
            .field("custom_fetch", &self.fetch.is_some())
            .finish()
    }
}

impl EntityDescriptor {
    pub fn new(entity_type: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            endpoint: endpoint.into(),
            link_field: None,
            fetch: None,
        }
    }

    #[must_use]
    pub fn with_link_field(mut self, field: impl Into<String>) -> Self {
        self.link_field = Some(field.into());
        self
    }

    #[must_use]
    pub fn with_fetch(mut self, fetch: FetchFn) -> Self {
        self.fetch = Some(fetch);
        self
    }

    #[must_use]
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn link_field(&self) -> Option<&str> {
        self.link_field.as_deref()
    }

    /// Fetch one page, through the custom handler when one is registered.
    pub async fn fetch_page(
        &self,
        transport: Arc<dyn RemoteTransport>,
        options: CallOptions,
    ) -> Result<ApiResponse, TransportError> {
        match &self.fetch {
            Some(fetch) => fetch(transport, self.endpoint.clone(), options).await,
            None => transport.call(&self.endpoint, &options).await,
        }
    }
}

/// Registry of supported entity types.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entries: HashMap<String, EntityDescriptor>,
}

impl EntityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-filled with the standard CRM entity types.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (entity, link) in [
            ("deals", Some("deal_id")),
            ("persons", Some("person_id")),
            ("organizations", Some("org_id")),
            ("activities", None),
            ("notes", None),
            ("products", Some("product_id")),
            ("files", None),
            ("leads", Some("lead_id")),
            ("pipelines", Some("pipeline_id")),
            ("stages", Some("stage_id")),
            ("users", Some("user_id")),
        ] {
            let mut descriptor = EntityDescriptor::new(entity, entity);
            if let Some(link) = link {
                descriptor = descriptor.with_link_field(link);
            }
            registry.register(descriptor);
        }
        registry
    }

    /// Add or replace an entity type.
    pub fn register(&mut self, descriptor: EntityDescriptor) {
        self.entries.insert(descriptor.entity_type.clone(), descriptor);
    }

    #[must_use]
    pub fn get(&self, entity_type: &str) -> Option<&EntityDescriptor> {
        self.entries.get(entity_type)
    }

    #[must_use]
    pub fn contains(&self, entity_type: &str) -> bool {
        self.entries.contains_key(entity_type)
    }

    /// Registered entity types, sorted.
    #[must_use]
    pub fn entity_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
