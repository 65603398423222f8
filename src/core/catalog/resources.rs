// src/core/catalog/resources.rs

//! The resource index: resource-specific fetch with URI validation and the
//! `resources/read` pass-through.

use crate::config::ServerSpec;
use crate::core::catalog::defs::ResourceDef;
use crate::core::catalog::index::{CatalogKind, FetchCx, Index, fetch_paginated};
use crate::core::errors::ProcmuxError;
use crate::core::events::CatalogKindId;
use crate::core::traits::MetadataCache;
use crate::core::types::SpecKey;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

pub struct ResourcesKind;

#[async_trait]
impl CatalogKind for ResourcesKind {
    type Def = ResourceDef;

    const KIND: CatalogKindId = CatalogKindId::Resources;

    fn raw_name(def: &ResourceDef) -> &str {
        &def.name
    }

    fn raw_key(def: &ResourceDef) -> &str {
        &def.uri
    }

    async fn fetch(
        cx: FetchCx<'_>,
        server_name: &str,
        spec_key: &SpecKey,
        _spec: &ServerSpec,
    ) -> Result<Vec<ResourceDef>, ProcmuxError> {
        let raw = fetch_paginated(
            &cx,
            server_name,
            spec_key,
            Self::KIND.list_method(),
            "resources",
        )
        .await?;
        let mut out = Vec::with_capacity(raw.len());
        for item in raw {
            let def = match serde_json::from_value::<ResourceDef>(item) {
                Ok(def) => def,
                Err(err) => {
                    debug!(server = server_name, error = %err, "Skipping undecodable resource entry.");
                    continue;
                }
            };
            if def.name.is_empty() {
                continue;
            }
            if Url::parse(&def.uri).is_err() {
                debug!(
                    server = server_name,
                    resource = %def.name,
                    uri = %def.uri,
                    "Skipping resource with unparsable URI."
                );
                continue;
            }
            out.push(def);
        }
        Ok(out)
    }

    fn cache_get(store: &dyn MetadataCache, spec_key: &SpecKey) -> Option<Vec<ResourceDef>> {
        store.get_resources(spec_key)
    }

    fn cache_set(store: &dyn MetadataCache, spec_key: &SpecKey, defs: &[ResourceDef], etag: &str) {
        store.set_resources(spec_key, defs.to_vec(), etag);
    }
}

/// The resource index is the generic engine specialized to resources.
pub type ResourceIndex = Index<ResourcesKind>;

impl Index<ResourcesKind> {
    /// Reads a resource by its display name; the raw URI recorded at merge
    /// time goes on the wire.
    pub async fn read_resource(
        &self,
        cancel: &CancellationToken,
        display_name: &str,
        routing_key: &str,
    ) -> Result<Value, ProcmuxError> {
        let target = self
            .resolve(display_name)
            .ok_or_else(|| ProcmuxError::NotFound(display_name.to_string()))?;
        let params = json!({ "uri": target.raw_key });
        self.dispatch(cancel, &target, "resources/read", params, routing_key)
            .await
    }

    /// Reads a resource resolved against one server's snapshot.
    pub async fn read_resource_for_server(
        &self,
        cancel: &CancellationToken,
        server_name: &str,
        display_name: &str,
        routing_key: &str,
    ) -> Result<Value, ProcmuxError> {
        let target = self
            .resolve_for_server(server_name, display_name)
            .ok_or_else(|| ProcmuxError::NotFound(display_name.to_string()))?;
        let params = json!({ "uri": target.raw_key });
        self.dispatch(cancel, &target, "resources/read", params, routing_key)
            .await
    }
}
