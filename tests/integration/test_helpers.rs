// tests/integration/test_helpers.rs

//! Shared mock collaborators and builders for the integration tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use procmux::config::{RuntimeConfig, ServerSpec, SpecRegistry, Strategy};
use procmux::core::Scheduler;
use procmux::core::catalog::{
    PromptDef, RefreshGate, ResourceDef, ToolDef,
};
use procmux::core::errors::ProcmuxError;
use procmux::core::traits::{
    HealthProbe, Lifecycle, MetadataCache, Metrics, NoopMetrics, RouteOptions, Router,
};
use procmux::core::types::{Instance, SpecKey};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// How mock starts behave.
pub enum StartBehavior {
    /// Start succeeds immediately.
    Succeed,
    /// Start fails immediately.
    Fail,
    /// Start blocks until the test fires the notify, then succeeds. The
    /// cancel token is deliberately ignored, like a driver mid-handshake.
    BlockThenSucceed(Arc<Notify>),
}

/// A lifecycle driver that manufactures instances and records every stop.
pub struct MockLifecycle {
    starts: AtomicUsize,
    stops: AtomicUsize,
    next_id: AtomicUsize,
    behavior: Mutex<StartBehavior>,
    stop_reasons: Mutex<Vec<(String, String)>>,
}

impl MockLifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            behavior: Mutex::new(StartBehavior::Succeed),
            stop_reasons: Mutex::new(Vec::new()),
        })
    }

    pub fn set_behavior(&self, behavior: StartBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn stop_reasons(&self) -> Vec<(String, String)> {
        self.stop_reasons.lock().clone()
    }

    pub fn stopped_with_reason(&self, reason: &str) -> bool {
        self.stop_reasons.lock().iter().any(|(_, r)| r == reason)
    }
}

#[async_trait]
impl Lifecycle for MockLifecycle {
    async fn start_instance(
        &self,
        _cancel: &CancellationToken,
        spec_key: &SpecKey,
        _spec: &ServerSpec,
    ) -> Result<Arc<Instance>, ProcmuxError> {
        let blocker = match &*self.behavior.lock() {
            StartBehavior::Succeed => None,
            StartBehavior::Fail => {
                self.starts.fetch_add(1, Ordering::SeqCst);
                return Err(ProcmuxError::StartFailed {
                    spec_key: spec_key.to_string(),
                    message: "injected failure".to_string(),
                });
            }
            StartBehavior::BlockThenSucceed(notify) => Some(notify.clone()),
        };
        if let Some(notify) = blocker {
            notify.notified().await;
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(Instance::new(
            format!("inst-{id}"),
            spec_key.clone(),
            format!("conn-{id}"),
        )))
    }

    async fn stop_instance(
        &self,
        instance: &Arc<Instance>,
        reason: &str,
    ) -> Result<(), ProcmuxError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stop_reasons
            .lock()
            .push((instance.id.clone(), reason.to_string()));
        Ok(())
    }
}

/// A health probe that fails for instance ids put on its dead list.
pub struct MockProbe {
    dead: Mutex<Vec<String>>,
}

impl MockProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dead: Mutex::new(Vec::new()),
        })
    }

    pub fn mark_dead(&self, instance_id: &str) {
        self.dead.lock().push(instance_id.to_string());
    }
}

#[async_trait]
impl HealthProbe for MockProbe {
    async fn ping(
        &self,
        _cancel: &CancellationToken,
        instance: &Arc<Instance>,
    ) -> Result<(), ProcmuxError> {
        if self.dead.lock().contains(&instance.id) {
            return Err(ProcmuxError::Internal("ping failed".to_string()));
        }
        Ok(())
    }
}

/// What the mock router answers for one (server, method) pair.
#[derive(Clone)]
pub enum Reply {
    /// A successful envelope with this `result`.
    Result(Value),
    /// An error envelope with this code and message.
    RpcError(i64, String),
    /// `Err(NoReadyInstance)` before any envelope exists.
    NoReady,
    /// `Err(Internal)` before any envelope exists.
    Fail(String),
}

#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub server: String,
    pub method: String,
    pub params: Value,
    pub routing_key: String,
    pub allow_start: bool,
}

/// A router serving canned responses and recording every dispatch.
pub struct MockRouter {
    replies: Mutex<HashMap<(String, String), Reply>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_reply(&self, server: &str, method: &str, reply: Reply) {
        self.replies
            .lock()
            .insert((server.to_string(), method.to_string()), reply);
    }

    /// Convenience: a `tools/list` result with the given tool definitions.
    pub fn serve_tools(&self, server: &str, tools: Value) {
        self.set_reply(server, "tools/list", Reply::Result(json!({ "tools": tools })));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, method: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Router for MockRouter {
    async fn route_with_options(
        &self,
        _cancel: &CancellationToken,
        server_type: &str,
        _spec_key: &SpecKey,
        routing_key: &str,
        payload: Value,
        options: RouteOptions,
    ) -> Result<Value, ProcmuxError> {
        let method = payload
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let id = payload.get("id").cloned().unwrap_or(Value::Null);
        self.calls.lock().push(RecordedCall {
            server: server_type.to_string(),
            method: method.clone(),
            params: payload.get("params").cloned().unwrap_or(Value::Null),
            routing_key: routing_key.to_string(),
            allow_start: options.allow_start,
        });
        let reply = self
            .replies
            .lock()
            .get(&(server_type.to_string(), method.clone()))
            .cloned();
        match reply {
            Some(Reply::Result(result)) => Ok(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result,
            })),
            Some(Reply::RpcError(code, message)) => Ok(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": message },
            })),
            Some(Reply::NoReady) => Err(ProcmuxError::NoReadyInstance(server_type.to_string())),
            Some(Reply::Fail(message)) => Err(ProcmuxError::Internal(message)),
            None => Ok(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("method not found: {method}") },
            })),
        }
    }
}

/// An in-memory metadata cache.
#[derive(Default)]
pub struct MemoryMetadataCache {
    tools: Mutex<HashMap<SpecKey, Vec<ToolDef>>>,
    prompts: Mutex<HashMap<SpecKey, Vec<PromptDef>>>,
    resources: Mutex<HashMap<SpecKey, Vec<ResourceDef>>>,
}

impl MemoryMetadataCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl MetadataCache for MemoryMetadataCache {
    fn get_tools(&self, spec_key: &SpecKey) -> Option<Vec<ToolDef>> {
        self.tools.lock().get(spec_key).cloned()
    }

    fn get_prompts(&self, spec_key: &SpecKey) -> Option<Vec<PromptDef>> {
        self.prompts.lock().get(spec_key).cloned()
    }

    fn get_resources(&self, spec_key: &SpecKey) -> Option<Vec<ResourceDef>> {
        self.resources.lock().get(spec_key).cloned()
    }

    fn set_tools(&self, spec_key: &SpecKey, tools: Vec<ToolDef>, _etag: &str) {
        self.tools.lock().insert(spec_key.clone(), tools);
    }

    fn set_prompts(&self, spec_key: &SpecKey, prompts: Vec<PromptDef>, _etag: &str) {
        self.prompts.lock().insert(spec_key.clone(), prompts);
    }

    fn set_resources(&self, spec_key: &SpecKey, resources: Vec<ResourceDef>, _etag: &str) {
        self.resources.lock().insert(spec_key.clone(), resources);
    }
}

/// Spec builder with sane test defaults: on-demand stateless, one slot.
pub fn spec(name: &str) -> ServerSpec {
    ServerSpec {
        name: name.to_string(),
        command: format!("/usr/bin/{name}"),
        args: vec![],
        strategy: Strategy::Stateless,
        max_concurrent: 1,
        min_ready: 0,
        idle_seconds: 300,
        session_ttl_seconds: 0,
        drain_timeout_seconds: 1,
        expose_tools: None,
        tool_namespace: None,
    }
}

pub fn stateful_spec(name: &str) -> ServerSpec {
    ServerSpec {
        strategy: Strategy::Stateful,
        ..spec(name)
    }
}

pub fn singleton_spec(name: &str) -> ServerSpec {
    ServerSpec {
        strategy: Strategy::Singleton,
        ..spec(name)
    }
}

/// A scheduler over the given specs with noop metrics.
pub fn scheduler_with(
    lifecycle: Arc<MockLifecycle>,
    specs: Vec<ServerSpec>,
) -> Arc<Scheduler> {
    Scheduler::new(
        lifecycle,
        SpecRegistry::new(specs),
        RuntimeConfig::default(),
        Arc::new(NoopMetrics),
    )
}

pub fn noop_metrics() -> Arc<dyn Metrics> {
    Arc::new(NoopMetrics)
}

pub fn fresh_gate() -> Arc<RefreshGate> {
    Arc::new(RefreshGate::new())
}

/// A minimal admissible tool definition value.
pub fn tool_json(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("{name} tool"),
        "inputSchema": { "type": "object" },
    })
}
