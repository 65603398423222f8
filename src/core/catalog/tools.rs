// src/core/catalog/tools.rs

//! The tool index: tool-specific fetch and filtering, the cache-only
//! fast-path snapshot, and the `tools/call` pass-through.

use crate::config::ServerSpec;
use crate::core::catalog::defs::ToolDef;
use crate::core::catalog::index::{CatalogKind, FetchCx, Index, fetch_paginated};
use crate::core::catalog::snapshot::CatalogSnapshot;
use crate::core::errors::ProcmuxError;
use crate::core::events::CatalogKindId;
use crate::core::traits::MetadataCache;
use crate::core::types::SpecKey;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct ToolsKind;

#[async_trait]
impl CatalogKind for ToolsKind {
    type Def = ToolDef;

    const KIND: CatalogKindId = CatalogKindId::Tools;

    fn raw_name(def: &ToolDef) -> &str {
        &def.name
    }

    fn raw_key(def: &ToolDef) -> &str {
        &def.name
    }

    async fn fetch(
        cx: FetchCx<'_>,
        server_name: &str,
        spec_key: &SpecKey,
        spec: &ServerSpec,
    ) -> Result<Vec<ToolDef>, ProcmuxError> {
        let raw =
            fetch_paginated(&cx, server_name, spec_key, Self::KIND.list_method(), "tools").await?;
        let mut out = Vec::with_capacity(raw.len());
        for item in raw {
            let def = match serde_json::from_value::<ToolDef>(item) {
                Ok(def) => def,
                Err(err) => {
                    debug!(server = server_name, error = %err, "Skipping undecodable tool entry.");
                    continue;
                }
            };
            if !def.is_admissible() {
                debug!(
                    server = server_name,
                    tool = %def.name,
                    "Skipping tool with empty name or non-object schema."
                );
                continue;
            }
            if let Some(allow) = &spec.expose_tools {
                if !allow.iter().any(|name| name == &def.name) {
                    continue;
                }
            }
            out.push(def);
        }
        Ok(out)
    }

    fn cache_get(store: &dyn MetadataCache, spec_key: &SpecKey) -> Option<Vec<ToolDef>> {
        store.get_tools(spec_key)
    }

    fn cache_set(store: &dyn MetadataCache, spec_key: &SpecKey, defs: &[ToolDef], etag: &str) {
        store.set_tools(spec_key, defs.to_vec(), etag);
    }
}

/// The tool index is the generic engine specialized to tools.
pub type ToolIndex = Index<ToolsKind>;

impl Index<ToolsKind> {
    /// Builds a snapshot purely from the persistent metadata cache, with no
    /// live fetch. Answers listing requests while every pool is cold.
    pub fn cached_snapshot(&self) -> CatalogSnapshot<ToolDef> {
        self.snapshot_from_metadata()
    }

    /// Calls a tool by its display name, routing through the pool with the
    /// caller's routing key.
    pub async fn call_tool(
        &self,
        cancel: &CancellationToken,
        display_name: &str,
        arguments: Value,
        routing_key: &str,
    ) -> Result<Value, ProcmuxError> {
        let target = self
            .resolve(display_name)
            .ok_or_else(|| ProcmuxError::NotFound(display_name.to_string()))?;
        let params = json!({ "name": target.raw_key, "arguments": arguments });
        self.dispatch(cancel, &target, "tools/call", params, routing_key)
            .await
    }

    /// Calls a tool resolved against one server's snapshot only.
    pub async fn call_tool_for_server(
        &self,
        cancel: &CancellationToken,
        server_name: &str,
        display_name: &str,
        arguments: Value,
        routing_key: &str,
    ) -> Result<Value, ProcmuxError> {
        let target = self
            .resolve_for_server(server_name, display_name)
            .ok_or_else(|| ProcmuxError::NotFound(display_name.to_string()))?;
        let params = json!({ "name": target.raw_key, "arguments": arguments });
        self.dispatch(cancel, &target, "tools/call", params, routing_key)
            .await
    }
}
