// src/core/catalog/index.rs

//! The generic catalog index engine: periodic refresh with bounded fanout,
//! per-server ETag deduplication, snapshot publication and subscriptions,
//! list-change reactivity, and a per-server circuit breaker on refresh
//! failure. One engine instance exists per catalog kind.

use crate::config::{RuntimeConfig, ServerSpec, SpecRegistry};
use crate::core::catalog::gate::RefreshGate;
use crate::core::catalog::rpc::{RequestIdBuilder, build_request, decode_response};
use crate::core::catalog::snapshot::{
    CatalogSnapshot, ServerCatalog, Target, etag_for, merge_catalogs,
};
use crate::core::errors::ProcmuxError;
use crate::core::events::{CatalogKindId, ListChangeEvent};
use crate::core::traits::{ListChangeSubscriber, MetadataCache, Metrics, RouteOptions, Router};
use crate::core::types::SpecKey;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hard cap on how long `start` waits for the bootstrap hook before
/// refreshing anyway.
const BOOTSTRAP_WAIT_CAP: Duration = Duration::from_secs(60);

/// Per-kind behavior plugged into the generic engine.
#[async_trait]
pub trait CatalogKind: Send + Sync + 'static {
    type Def: Clone + PartialEq + Serialize + Send + Sync + 'static;

    const KIND: CatalogKindId;

    /// Name shown (possibly namespaced) in the merged snapshot.
    fn raw_name(def: &Self::Def) -> &str;
    /// Raw call name or URI recorded in the reverse-lookup target.
    fn raw_key(def: &Self::Def) -> &str;

    /// Full (paginated) fetch of this kind's catalog from one server.
    /// Listing must never spawn children; fetches go through the router
    /// with `allow_start = false`.
    async fn fetch(
        cx: FetchCx<'_>,
        server_name: &str,
        spec_key: &SpecKey,
        spec: &ServerSpec,
    ) -> Result<Vec<Self::Def>, ProcmuxError>;

    fn cache_get(store: &dyn MetadataCache, spec_key: &SpecKey) -> Option<Vec<Self::Def>>;
    fn cache_set(store: &dyn MetadataCache, spec_key: &SpecKey, defs: &[Self::Def], etag: &str);
}

/// Borrowed fetch dependencies handed to `CatalogKind::fetch`.
pub struct FetchCx<'a> {
    pub router: &'a dyn Router,
    pub ids: &'a RequestIdBuilder,
    pub cancel: &'a CancellationToken,
}

/// Pages through a `*/list` method, collecting the raw item values.
pub(crate) async fn fetch_paginated(
    cx: &FetchCx<'_>,
    server_name: &str,
    spec_key: &SpecKey,
    method: &str,
    field: &str,
) -> Result<Vec<Value>, ProcmuxError> {
    let mut out = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let mut params = serde_json::Map::new();
        if let Some(c) = &cursor {
            params.insert("cursor".to_string(), Value::String(c.clone()));
        }
        let id = cx.ids.next_id(method);
        let payload = build_request(&id, method, Value::Object(params));
        let response = cx
            .router
            .route_with_options(
                cx.cancel,
                server_name,
                spec_key,
                "",
                payload,
                RouteOptions { allow_start: false },
            )
            .await?;
        let result = decode_response(response)?;
        if let Some(items) = result.get(field).and_then(Value::as_array) {
            out.extend(items.iter().cloned());
        }
        cursor = result
            .get("nextCursor")
            .and_then(Value::as_str)
            .map(str::to_string);
        if cursor.as_deref().is_none_or(str::is_empty) {
            break;
        }
    }
    Ok(out)
}

/// One server's cached contribution.
struct ServerCache<D> {
    spec_key: SpecKey,
    namespace: crate::config::NamespaceStrategy,
    items: Vec<D>,
    etag: String,
    /// Substituted from the persistent metadata cache because no instance
    /// was ready.
    from_cache: bool,
}

/// Construction options for an index.
#[derive(Default)]
pub struct IndexOptions {
    /// When set, the first refresh waits (up to 60s) for this hook to turn
    /// true. Used for on-demand pools that would otherwise time out while
    /// the system is still coming up.
    pub bootstrap: Option<watch::Receiver<bool>>,
    /// Request-id prefix; random when absent.
    pub id_prefix: Option<String>,
}

/// The generic index engine. See the module docs; `Index<ToolsKind>` etc.
/// add the kind-specific call paths.
pub struct Index<K: CatalogKind> {
    router: Arc<dyn Router>,
    store: Arc<dyn MetadataCache>,
    metrics: Arc<dyn Metrics>,
    gate: Arc<RefreshGate>,
    list_change: Option<Arc<dyn ListChangeSubscriber>>,
    ids: RequestIdBuilder,

    specs: RwLock<Arc<SpecRegistry>>,
    runtime: RwLock<RuntimeConfig>,

    /// Per-server caches in insertion order; guarded by one mutex that is
    /// also held across snapshot rebuild so cache state and published ETag
    /// stay atomic.
    cache: Mutex<IndexMap<String, ServerCache<K::Def>>>,
    /// Consecutive fetch failures per server.
    failures: Mutex<HashMap<String, u32>>,

    snapshot_tx: watch::Sender<Arc<CatalogSnapshot<K::Def>>>,
    per_server: RwLock<HashMap<String, Arc<CatalogSnapshot<K::Def>>>>,

    base: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    listener_active: AtomicBool,
    /// Wakes the refresh loop early: immediate refresh requests and ticker
    /// restarts after a period change.
    kick: Notify,
    bootstrap: Mutex<Option<watch::Receiver<bool>>>,
}

impl<K: CatalogKind> Index<K> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Arc<dyn Router>,
        store: Arc<dyn MetadataCache>,
        metrics: Arc<dyn Metrics>,
        gate: Arc<RefreshGate>,
        list_change: Option<Arc<dyn ListChangeSubscriber>>,
        specs: SpecRegistry,
        runtime: RuntimeConfig,
        options: IndexOptions,
    ) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(Arc::new(CatalogSnapshot::default()));
        let ids = match options.id_prefix {
            Some(prefix) => RequestIdBuilder::with_prefix(prefix),
            None => RequestIdBuilder::default(),
        };
        Arc::new(Self {
            router,
            store,
            metrics,
            gate,
            list_change,
            ids,
            specs: RwLock::new(Arc::new(specs)),
            runtime: RwLock::new(runtime),
            cache: Mutex::new(IndexMap::new()),
            failures: Mutex::new(HashMap::new()),
            snapshot_tx,
            per_server: RwLock::new(HashMap::new()),
            base: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            listener_active: AtomicBool::new(false),
            kick: Notify::new(),
            bootstrap: Mutex::new(options.bootstrap),
        })
    }

    /// Starts the refresh loop and, when supported and enabled, the
    /// list-change listener. Idempotent per `stop`.
    pub fn start(self: &Arc<Self>) {
        let base = CancellationToken::new();
        *self.base.lock() = Some(base.clone());
        let this = self.clone();
        let handle = tokio::spawn(this.run_refresh_loop(base));
        self.tasks.lock().push(handle);
        self.ensure_listener();
    }

    /// Cancels the base context; every derived refresh and listener exits.
    /// Subscriber channels are left open so late senders never panic;
    /// receivers just stop seeing updates.
    pub fn stop(&self) {
        if let Some(base) = self.base.lock().take() {
            base.cancel();
        }
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        self.listener_active.store(false, Ordering::SeqCst);
    }

    async fn run_refresh_loop(self: Arc<Self>, base: CancellationToken) {
        let bootstrap = self.bootstrap.lock().take();
        if let Some(mut ready) = bootstrap {
            let wait = async {
                loop {
                    if *ready.borrow_and_update() {
                        return;
                    }
                    if ready.changed().await.is_err() {
                        return;
                    }
                }
            };
            tokio::select! {
                _ = wait => {}
                _ = tokio::time::sleep(BOOTSTRAP_WAIT_CAP) => {
                    warn!(kind = %K::KIND, "Bootstrap hook did not fire within {BOOTSTRAP_WAIT_CAP:?}; refreshing anyway.");
                }
                _ = base.cancelled() => return,
            }
        }
        info!(kind = %K::KIND, "Catalog index started.");
        loop {
            match self.refresh(&base).await {
                Ok(()) => {}
                Err(ProcmuxError::Canceled) => {
                    info!(kind = %K::KIND, "Catalog index shutting down.");
                    return;
                }
                Err(err) => {
                    warn!(kind = %K::KIND, error = %err, "Catalog refresh pass failed.");
                }
            }
            let period = self.runtime.read().refresh_period();
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = self.kick.notified() => {}
                _ = base.cancelled() => {
                    info!(kind = %K::KIND, "Catalog index shutting down.");
                    return;
                }
            }
        }
    }

    /// Whether this index wants list-change events at all.
    fn should_listen(&self) -> bool {
        K::KIND != CatalogKindId::Tools || self.runtime.read().expose_tools
    }

    /// Spawns the list-change listener if one is wanted and not running.
    fn ensure_listener(self: &Arc<Self>) {
        let Some(subscriber) = &self.list_change else {
            return;
        };
        if !self.should_listen() {
            return;
        }
        let Some(base) = self.base.lock().clone() else {
            return;
        };
        if self.listener_active.swap(true, Ordering::SeqCst) {
            return;
        }
        let rx = subscriber.subscribe(K::KIND);
        let this = self.clone();
        let handle = tokio::spawn(this.run_listener(rx, base));
        self.tasks.lock().push(handle);
    }

    async fn run_listener(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<ListChangeEvent>,
        base: CancellationToken,
    ) {
        debug!(kind = %K::KIND, "List-change listener started.");
        loop {
            let event = tokio::select! {
                event = rx.recv() => event,
                _ = base.cancelled() => {
                    self.listener_active.store(false, Ordering::SeqCst);
                    return;
                }
            };
            match event {
                Ok(event) => {
                    if !self.event_applies(&event) {
                        continue;
                    }
                    debug!(
                        kind = %K::KIND,
                        server = %event.server_type,
                        "List changed; refreshing."
                    );
                    if let Err(err) = self.refresh(&base).await {
                        if matches!(err, ProcmuxError::Canceled) {
                            self.listener_active.store(false, Ordering::SeqCst);
                            return;
                        }
                        warn!(kind = %K::KIND, error = %err, "Event-driven refresh failed.");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(kind = %K::KIND, missed, "List-change stream lagged; refreshing.");
                    let _ = self.refresh(&base).await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.listener_active.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    fn event_applies(&self, event: &ListChangeEvent) -> bool {
        if event.kind != K::KIND {
            return false;
        }
        let specs = self.specs.read();
        specs.contains(&event.spec_key) || specs.get_by_name(&event.server_type).is_some()
    }

    /// One full refresh pass: gate-serialized fanout over every configured
    /// server, cache updates under ETag dedup, and a snapshot rebuild when
    /// anything changed.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<(), ProcmuxError> {
        let _permit = self.gate.acquire(cancel).await?;
        let started = Instant::now();
        let registry = self.specs.read().clone();
        let runtime = self.runtime.read().clone();

        if K::KIND == CatalogKindId::Tools && !runtime.expose_tools {
            let (changed, published) = {
                let mut cache = self.cache.lock();
                let had_entries = !cache.is_empty();
                let published = if had_entries {
                    cache.clear();
                    self.rebuild_snapshot_locked(&mut cache)
                } else {
                    None
                };
                (had_entries, published)
            };
            self.note_published(published);
            self.metrics.on_refresh(K::KIND, started.elapsed(), changed);
            return Ok(());
        }

        let servers = registry.sorted_server_names();
        if servers.is_empty() {
            return Ok(());
        }
        let workers = runtime.tool_refresh_concurrency.min(servers.len()).max(1);
        let fetch_timeout = runtime.route_timeout();

        type Fetched<D> = Option<(SpecKey, ServerSpec, Result<Vec<D>, ProcmuxError>)>;
        let results: Vec<(String, Fetched<K::Def>)> = stream::iter(servers.into_iter().map(
            |name| {
                let registry = registry.clone();
                async move {
                    let Some((key, spec)) = registry
                        .get_by_name(&name)
                        .map(|(k, s)| (k.clone(), s.clone()))
                    else {
                        return (name, None);
                    };
                    let cx = FetchCx {
                        router: self.router.as_ref(),
                        ids: &self.ids,
                        cancel,
                    };
                    let outcome =
                        match tokio::time::timeout(fetch_timeout, K::fetch(cx, &name, &key, &spec))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(ProcmuxError::DeadlineExceeded),
                        };
                    (name, Some((key, spec, outcome)))
                }
            },
        ))
        .buffer_unordered(workers)
        .collect()
        .await;

        let mut changed = false;
        for (server, fetched) in results {
            let Some((key, spec, outcome)) = fetched else {
                continue;
            };
            match outcome {
                Ok(defs) => {
                    self.failures.lock().remove(&server);
                    changed |= self.store_fetch(&server, &key, &spec, &runtime, defs, false);
                }
                Err(err) => {
                    changed |= self.handle_fetch_error(&server, &key, &spec, &runtime, err);
                }
            }
        }

        if changed {
            let published = {
                let mut cache = self.cache.lock();
                self.rebuild_snapshot_locked(&mut cache)
            };
            self.note_published(published);
        }
        self.metrics.on_refresh(K::KIND, started.elapsed(), changed);
        Ok(())
    }

    /// Writes one server's fetched definitions into the cache unless the
    /// per-server ETag is unchanged. Live fetches are written back to the
    /// persistent metadata cache; substituted entries are not.
    fn store_fetch(
        &self,
        server: &str,
        key: &SpecKey,
        spec: &ServerSpec,
        runtime: &RuntimeConfig,
        defs: Vec<K::Def>,
        from_cache: bool,
    ) -> bool {
        let etag = etag_for(&defs);
        {
            let mut cache = self.cache.lock();
            if let Some(prev) = cache.get(server) {
                if prev.etag == etag && prev.from_cache == from_cache {
                    return false;
                }
            }
            cache.insert(
                server.to_string(),
                ServerCache {
                    spec_key: key.clone(),
                    namespace: spec.namespace(runtime.tool_namespace),
                    items: defs.clone(),
                    etag: etag.clone(),
                    from_cache,
                },
            );
        }
        if !from_cache {
            K::cache_set(self.store.as_ref(), key, &defs, &etag);
        }
        true
    }

    /// Applies the per-error refresh policy. Returns whether the cache
    /// changed.
    fn handle_fetch_error(
        &self,
        server: &str,
        key: &SpecKey,
        spec: &ServerSpec,
        runtime: &RuntimeConfig,
        err: ProcmuxError,
    ) -> bool {
        match err.root() {
            ProcmuxError::NoReadyInstance(_) => {
                // Cold pool: substitute the persisted metadata, if any.
                if let Some(defs) = K::cache_get(self.store.as_ref(), key) {
                    debug!(
                        kind = %K::KIND,
                        server,
                        "No ready instance; substituting persisted metadata."
                    );
                    return self.store_fetch(server, key, spec, runtime, defs, true);
                }
                debug!(
                    kind = %K::KIND,
                    server,
                    "No ready instance and no persisted metadata; keeping previous contribution."
                );
                false
            }
            ProcmuxError::MethodNotAllowed(_) => {
                // The server has no such catalog at all.
                let removed = self.cache.lock().shift_remove(server).is_some();
                if removed {
                    debug!(kind = %K::KIND, server, "Server does not implement the list method; dropping its contribution.");
                }
                removed
            }
            ProcmuxError::Canceled => false,
            _ => {
                self.metrics.on_refresh_error(K::KIND, server);
                let threshold = runtime.start_failure_threshold.max(1);
                let count = {
                    let mut failures = self.failures.lock();
                    let count = failures.entry(server.to_string()).or_insert(0);
                    *count += 1;
                    *count
                };
                warn!(
                    kind = %K::KIND,
                    server,
                    consecutive = count,
                    error = %err,
                    "Catalog fetch failed."
                );
                if count >= threshold {
                    let removed = self.cache.lock().shift_remove(server).is_some();
                    if removed {
                        warn!(
                            kind = %K::KIND,
                            server,
                            "Fetch circuit breaker open; dropping server from the snapshot."
                        );
                    }
                    return removed;
                }
                false
            }
        }
    }

    /// Rebuilds and, when the ETag moved, publishes the merged snapshot and
    /// the per-server variants. Runs with the cache lock held so published
    /// state can never regress behind a concurrent cache write. Returns the
    /// published entry count so callers can emit metrics after unlocking.
    fn rebuild_snapshot_locked(
        &self,
        cache: &mut IndexMap<String, ServerCache<K::Def>>,
    ) -> Option<usize> {
        let mut catalogs: Vec<ServerCatalog<K::Def>> = cache
            .iter()
            .map(|(server, sc)| ServerCatalog {
                server_name: server.clone(),
                spec_key: sc.spec_key.clone(),
                namespace: sc.namespace,
                items: sc
                    .items
                    .iter()
                    .map(|d| {
                        (
                            K::raw_name(d).to_string(),
                            K::raw_key(d).to_string(),
                            d.clone(),
                        )
                    })
                    .collect(),
            })
            .collect();
        catalogs.sort_by(|a, b| a.server_name.cmp(&b.server_name));

        let merged = merge_catalogs(&catalogs);
        if merged.etag == self.snapshot_tx.borrow().etag {
            return None;
        }
        let mut per_server = HashMap::with_capacity(catalogs.len());
        for catalog in &catalogs {
            per_server.insert(
                catalog.server_name.clone(),
                Arc::new(merge_catalogs(std::slice::from_ref(catalog))),
            );
        }
        let entries = merged.len();
        let etag = merged.etag.clone();
        *self.per_server.write() = per_server;
        self.snapshot_tx.send_replace(Arc::new(merged));
        debug!(kind = %K::KIND, entries, etag, "Published catalog snapshot.");
        Some(entries)
    }

    fn note_published(&self, published: Option<usize>) {
        if let Some(entries) = published {
            self.metrics.on_snapshot_published(K::KIND, entries);
        }
    }

    /// The current merged snapshot. The returned value is immutable and
    /// shared; cloning it clones the full entry list.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot<K::Def>> {
        self.snapshot_tx.borrow().clone()
    }

    /// The per-server snapshot for a display name, if that server
    /// contributed anything.
    pub fn snapshot_for_server(&self, server_name: &str) -> Option<Arc<CatalogSnapshot<K::Def>>> {
        self.per_server.read().get(server_name).cloned()
    }

    /// A 1-slot subscription: the receiver starts at the current snapshot
    /// and observes updates in monotonic order; slow consumers coalesce to
    /// the latest value.
    pub fn subscribe(&self) -> watch::Receiver<Arc<CatalogSnapshot<K::Def>>> {
        self.snapshot_tx.subscribe()
    }

    /// Constant-time reverse lookup of a display name.
    pub fn resolve(&self, display_name: &str) -> Option<Target> {
        self.snapshot_tx.borrow().resolve(display_name).cloned()
    }

    pub fn resolve_for_server(&self, server_name: &str, display_name: &str) -> Option<Target> {
        self.per_server
            .read()
            .get(server_name)
            .and_then(|snap| snap.resolve(display_name).cloned())
    }

    /// Installs a new spec registry: dead servers lose their cache entries
    /// and the refresh loop is kicked to pick up the rest.
    pub fn update_specs(self: &Arc<Self>, registry: SpecRegistry) {
        let registry = Arc::new(registry);
        *self.specs.write() = registry.clone();
        let published = {
            let mut cache = self.cache.lock();
            let before = cache.len();
            cache.retain(|server, sc| {
                registry
                    .get_by_name(server)
                    .is_some_and(|(key, _)| *key == sc.spec_key)
            });
            if cache.len() != before {
                self.rebuild_snapshot_locked(&mut cache)
            } else {
                None
            }
        };
        self.note_published(published);
        self.failures
            .lock()
            .retain(|server, _| registry.get_by_name(server).is_some());
        self.kick.notify_one();
        self.ensure_listener();
    }

    /// Installs a new runtime config. A changed refresh period restarts the
    /// ticker; flipping the listen predicate on re-subscribes to
    /// list-change events.
    pub fn apply_runtime_config(self: &Arc<Self>, runtime: RuntimeConfig) {
        {
            let mut current = self.runtime.write();
            *current = runtime;
        }
        self.kick.notify_one();
        self.ensure_listener();
    }

    /// Builds a snapshot purely from the persistent metadata cache, without
    /// touching any child. Not published; callers use it to answer listing
    /// requests while every pool is cold.
    pub(crate) fn snapshot_from_metadata(&self) -> CatalogSnapshot<K::Def> {
        let registry = self.specs.read().clone();
        let runtime_ns = self.runtime.read().tool_namespace;
        let mut catalogs: Vec<ServerCatalog<K::Def>> = Vec::new();
        for (key, spec) in registry.iter() {
            let Some(defs) = K::cache_get(self.store.as_ref(), key) else {
                continue;
            };
            catalogs.push(ServerCatalog {
                server_name: spec.name.clone(),
                spec_key: key.clone(),
                namespace: spec.namespace(runtime_ns),
                items: defs
                    .iter()
                    .map(|d| {
                        (
                            K::raw_name(d).to_string(),
                            K::raw_key(d).to_string(),
                            d.clone(),
                        )
                    })
                    .collect(),
            });
        }
        catalogs.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        merge_catalogs(&catalogs)
    }

    /// Builds a call envelope for a resolved target and dispatches it
    /// through the router (starts are allowed here), decoding the JSON-RPC
    /// response.
    pub(crate) async fn dispatch(
        &self,
        cancel: &CancellationToken,
        target: &Target,
        method: &str,
        params: Value,
        routing_key: &str,
    ) -> Result<Value, ProcmuxError> {
        let id = self.ids.next_id(method);
        let payload = build_request(&id, method, params);
        let route_timeout = self.runtime.read().route_timeout();
        let response = tokio::time::timeout(
            route_timeout,
            self.router.route(
                cancel,
                &target.server_type,
                &target.spec_key,
                routing_key,
                payload,
            ),
        )
        .await??;
        decode_response(response)
    }
}
