// src/core/catalog/prompts.rs

//! The prompt index: prompt-specific fetch and the `prompts/get`
//! pass-through.

use crate::config::ServerSpec;
use crate::core::catalog::defs::PromptDef;
use crate::core::catalog::index::{CatalogKind, FetchCx, Index, fetch_paginated};
use crate::core::errors::ProcmuxError;
use crate::core::events::CatalogKindId;
use crate::core::traits::MetadataCache;
use crate::core::types::SpecKey;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct PromptsKind;

#[async_trait]
impl CatalogKind for PromptsKind {
    type Def = PromptDef;

    const KIND: CatalogKindId = CatalogKindId::Prompts;

    fn raw_name(def: &PromptDef) -> &str {
        &def.name
    }

    fn raw_key(def: &PromptDef) -> &str {
        &def.name
    }

    async fn fetch(
        cx: FetchCx<'_>,
        server_name: &str,
        spec_key: &SpecKey,
        _spec: &ServerSpec,
    ) -> Result<Vec<PromptDef>, ProcmuxError> {
        let raw =
            fetch_paginated(&cx, server_name, spec_key, Self::KIND.list_method(), "prompts")
                .await?;
        let mut out = Vec::with_capacity(raw.len());
        for item in raw {
            let def = match serde_json::from_value::<PromptDef>(item) {
                Ok(def) => def,
                Err(err) => {
                    debug!(server = server_name, error = %err, "Skipping undecodable prompt entry.");
                    continue;
                }
            };
            if def.name.is_empty() {
                continue;
            }
            out.push(def);
        }
        Ok(out)
    }

    fn cache_get(store: &dyn MetadataCache, spec_key: &SpecKey) -> Option<Vec<PromptDef>> {
        store.get_prompts(spec_key)
    }

    fn cache_set(store: &dyn MetadataCache, spec_key: &SpecKey, defs: &[PromptDef], etag: &str) {
        store.set_prompts(spec_key, defs.to_vec(), etag);
    }
}

/// The prompt index is the generic engine specialized to prompts.
pub type PromptIndex = Index<PromptsKind>;

impl Index<PromptsKind> {
    /// Fetches a rendered prompt by display name.
    pub async fn get_prompt(
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
        self.dispatch(cancel, &target, "prompts/get", params, routing_key)
            .await
    }

    /// Fetches a rendered prompt resolved against one server's snapshot.
    pub async fn get_prompt_for_server(
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
        self.dispatch(cancel, &target, "prompts/get", params, routing_key)
            .await
    }
}
