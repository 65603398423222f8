// src/core/traits.rs

//! Capability interfaces the core consumes. Implementations are injected at
//! construction; there is no runtime registration.

use crate::config::ServerSpec;
use crate::core::catalog::defs::{PromptDef, ResourceDef, ToolDef};
use crate::core::errors::ProcmuxError;
use crate::core::events::{CatalogKindId, ListChangeBus, ListChangeEvent};
use crate::core::types::{Instance, SpecKey, StartCause};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Drives the actual child processes: fork/exec, handshake, teardown.
///
/// `start_instance` returns an instance already in a routable state. It must
/// be safe to cancel through the token; cancellation mid-start must not leak
/// a child. `stop_instance` must be idempotent for a given instance.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn start_instance(
        &self,
        cancel: &CancellationToken,
        spec_key: &SpecKey,
        spec: &ServerSpec,
    ) -> Result<Arc<Instance>, ProcmuxError>;

    async fn stop_instance(
        &self,
        instance: &Arc<Instance>,
        reason: &str,
    ) -> Result<(), ProcmuxError>;
}

/// Options for a routed dispatch.
#[derive(Debug, Clone, Copy)]
pub struct RouteOptions {
    /// When false, routing never triggers an instance start; callers get
    /// `NoReadyInstance` instead. Catalog listings use this so that pulling
    /// a catalog never spawns children.
    pub allow_start: bool,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self { allow_start: true }
    }
}

/// Carries a wire payload to a specific server's pool.
///
/// `payload` is a full JSON-RPC request envelope and the returned value is
/// the full response envelope; the catalog layer decodes `result`/`error`
/// itself.
#[async_trait]
pub trait Router: Send + Sync {
    async fn route_with_options(
        &self,
        cancel: &CancellationToken,
        server_type: &str,
        spec_key: &SpecKey,
        routing_key: &str,
        payload: Value,
        options: RouteOptions,
    ) -> Result<Value, ProcmuxError>;

    /// Dispatch that may start the pool if nothing is ready.
    async fn route(
        &self,
        cancel: &CancellationToken,
        server_type: &str,
        spec_key: &SpecKey,
        routing_key: &str,
        payload: Value,
    ) -> Result<Value, ProcmuxError> {
        self.route_with_options(
            cancel,
            server_type,
            spec_key,
            routing_key,
            payload,
            RouteOptions::default(),
        )
        .await
    }
}

/// Liveness check against a running instance's connection.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn ping(
        &self,
        cancel: &CancellationToken,
        instance: &Arc<Instance>,
    ) -> Result<(), ProcmuxError>;
}

/// Persistent per-spec catalog metadata, used to answer listings while a
/// pool is cold. Implementations own their storage; the indexes only read
/// entries and write back successful fetches.
pub trait MetadataCache: Send + Sync {
    fn get_tools(&self, spec_key: &SpecKey) -> Option<Vec<ToolDef>>;
    fn get_prompts(&self, spec_key: &SpecKey) -> Option<Vec<PromptDef>>;
    fn get_resources(&self, spec_key: &SpecKey) -> Option<Vec<ResourceDef>>;

    fn set_tools(&self, spec_key: &SpecKey, tools: Vec<ToolDef>, etag: &str);
    fn set_prompts(&self, spec_key: &SpecKey, prompts: Vec<PromptDef>, etag: &str);
    fn set_resources(&self, spec_key: &SpecKey, resources: Vec<ResourceDef>, etag: &str);
}

/// Source of asynchronous list-change notifications, filtered by kind.
pub trait ListChangeSubscriber: Send + Sync {
    fn subscribe(&self, kind: CatalogKindId) -> broadcast::Receiver<ListChangeEvent>;
}

impl ListChangeSubscriber for ListChangeBus {
    fn subscribe(&self, kind: CatalogKindId) -> broadcast::Receiver<ListChangeEvent> {
        ListChangeBus::subscribe(self, kind)
    }
}

/// Sink for scheduler and index metrics. The core calls through this trait
/// only; a prometheus-backed implementation lives in `core::metrics`.
pub trait Metrics: Send + Sync {
    fn on_instance_started(&self, server: &str, cause: StartCause);
    fn on_instance_stopped(&self, server: &str, reason: &str);
    fn on_start_failure(&self, server: &str);
    fn on_acquire(&self, server: &str);
    fn on_release(&self, server: &str);
    fn set_pool_size(&self, server: &str, size: usize);
    fn on_refresh(&self, kind: CatalogKindId, duration: Duration, changed: bool);
    fn on_refresh_error(&self, kind: CatalogKindId, server: &str);
    fn on_snapshot_published(&self, kind: CatalogKindId, entries: usize);
}

/// Metrics sink that discards everything. Used in tests and by embeddings
/// that do not export metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn on_instance_started(&self, _server: &str, _cause: StartCause) {}
    fn on_instance_stopped(&self, _server: &str, _reason: &str) {}
    fn on_start_failure(&self, _server: &str) {}
    fn on_acquire(&self, _server: &str) {}
    fn on_release(&self, _server: &str) {}
    fn set_pool_size(&self, _server: &str, _size: usize) {}
    fn on_refresh(&self, _kind: CatalogKindId, _duration: Duration, _changed: bool) {}
    fn on_refresh_error(&self, _kind: CatalogKindId, _server: &str) {}
    fn on_snapshot_published(&self, _kind: CatalogKindId, _entries: usize) {}
}
