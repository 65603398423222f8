// tests/integration/catalog_test.rs

//! End-to-end catalog behavior against the mock router: refresh and merge,
//! namespacing, ETag deduplication, cache fallback, circuit breaking,
//! subscriptions, and the pass-through call paths.

use super::test_helpers::*;
use procmux::config::{NamespaceStrategy, RuntimeConfig, ServerSpec, SpecRegistry};
use procmux::core::catalog::{
    IndexOptions, PromptIndex, ResourceIndex, ToolDef, ToolIndex,
};
use procmux::core::errors::{CODE_URL_ELICITATION_REQUIRED, ProcmuxError};
use procmux::core::events::{CatalogKindId, ListChangeBus, ListChangeEvent};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

fn token() -> CancellationToken {
    CancellationToken::new()
}

fn tool_index(
    router: &Arc<MockRouter>,
    store: &Arc<MemoryMetadataCache>,
    specs: Vec<ServerSpec>,
    runtime: RuntimeConfig,
) -> Arc<ToolIndex> {
    ToolIndex::new(
        router.clone(),
        store.clone(),
        noop_metrics(),
        fresh_gate(),
        None,
        SpecRegistry::new(specs),
        runtime,
        IndexOptions::default(),
    )
}

#[tokio::test]
async fn test_prefix_namespace_single_server() {
    let router = MockRouter::new();
    let store = MemoryMetadataCache::new();
    let echo = spec("echo");
    let key = echo.spec_key();
    router.serve_tools("echo", json!([tool_json("echo")]));
    let index = tool_index(&router, &store, vec![echo], RuntimeConfig::default());

    index.refresh(&token()).await.unwrap();

    let snapshot = index.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.entries[0].display_name, "echo.echo");
    assert_eq!(snapshot.entries[0].server_name, "echo");
    assert_eq!(snapshot.entries[0].spec_key, key);

    let target = index.resolve("echo.echo").unwrap();
    assert_eq!(target.server_type, "echo");
    assert_eq!(target.spec_key, key);
    assert_eq!(target.raw_key, "echo");

    // Listing never spawns children.
    assert!(index.resolve("echo").is_none());
    assert!(router.calls().iter().all(|c| !c.allow_start));
}

#[tokio::test]
async fn test_call_tool_routes_inner_name() {
    let router = MockRouter::new();
    let store = MemoryMetadataCache::new();
    let echo = spec("echo");
    router.serve_tools("echo", json!([tool_json("echo")]));
    router.set_reply(
        "echo",
        "tools/call",
        Reply::Result(json!({ "content": [{ "type": "text", "text": "ok" }] })),
    );
    let index = tool_index(&router, &store, vec![echo], RuntimeConfig::default());
    index.refresh(&token()).await.unwrap();

    let result = index
        .call_tool(&token(), "echo.echo", json!({}), "")
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "ok");

    let calls = router.calls_for("tools/call");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].params["name"], "echo");
    assert!(calls[0].allow_start);
}

#[tokio::test]
async fn test_flat_namespace_collision_suffixes() {
    let router = MockRouter::new();
    let store = MemoryMetadataCache::new();
    let a = spec("a");
    let b = spec("b");
    router.serve_tools("a", json!([tool_json("dup")]));
    router.serve_tools("b", json!([tool_json("dup")]));
    let runtime = RuntimeConfig {
        tool_namespace: NamespaceStrategy::Flat,
        ..RuntimeConfig::default()
    };
    let index = tool_index(&router, &store, vec![a, b], runtime);

    index.refresh(&token()).await.unwrap();

    let snapshot = index.snapshot();
    let names: Vec<&str> = snapshot
        .entries
        .iter()
        .map(|e| e.display_name.as_str())
        .collect();
    assert_eq!(names, vec!["dup", "dup_b"]);
    assert_eq!(index.resolve("dup").unwrap().server_type, "a");
    let shadowed = index.resolve("dup_b").unwrap();
    assert_eq!(shadowed.server_type, "b");
    assert_eq!(shadowed.raw_key, "dup");
}

#[tokio::test]
async fn test_metadata_cache_fallback_when_no_instance_ready() {
    let router = MockRouter::new();
    let store = MemoryMetadataCache::new();
    let echo = spec("echo");
    let key = echo.spec_key();
    router.set_reply("echo", "tools/list", Reply::NoReady);
    use procmux::core::traits::MetadataCache;
    store.set_tools(
        &key,
        vec![ToolDef {
            name: "echo".to_string(),
            description: Some("cached".to_string()),
            input_schema: json!({ "type": "object" }),
            output_schema: None,
        }],
        "etag-cached",
    );
    let index = tool_index(&router, &store, vec![echo], RuntimeConfig::default());

    index.refresh(&token()).await.unwrap();

    let snapshot = index.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.entries[0].display_name, "echo.echo");
    assert_eq!(
        snapshot.entries[0].def.description.as_deref(),
        Some("cached")
    );
    assert!(!snapshot.etag.is_empty());
}

#[tokio::test]
async fn test_etag_dedupe_suppresses_identical_snapshots() {
    let router = MockRouter::new();
    let store = MemoryMetadataCache::new();
    let echo = spec("echo");
    router.serve_tools("echo", json!([tool_json("echo")]));
    let index = tool_index(&router, &store, vec![echo], RuntimeConfig::default());

    let mut rx = index.subscribe();
    // Initial (empty) snapshot is immediately visible.
    assert!(rx.borrow_and_update().is_empty());

    index.refresh(&token()).await.unwrap();
    rx.changed().await.unwrap();
    let first = rx.borrow_and_update().clone();
    assert_eq!(first.len(), 1);

    // Identical content: no new broadcast.
    index.refresh(&token()).await.unwrap();
    let waited =
        tokio::time::timeout(Duration::from_millis(100), rx.changed()).await;
    assert!(waited.is_err());
    assert_eq!(index.snapshot().etag, first.etag);
}

#[tokio::test]
async fn test_snapshot_updates_are_monotonic_for_subscribers() {
    let router = MockRouter::new();
    let store = MemoryMetadataCache::new();
    let echo = spec("echo");
    router.serve_tools("echo", json!([tool_json("one")]));
    let index = tool_index(&router, &store, vec![echo], RuntimeConfig::default());

    let mut rx = index.subscribe();
    index.refresh(&token()).await.unwrap();
    router.serve_tools("echo", json!([tool_json("one"), tool_json("two")]));
    index.refresh(&token()).await.unwrap();

    // A slow consumer coalesces to the latest value.
    rx.changed().await.unwrap();
    let seen = rx.borrow_and_update().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen.etag, index.snapshot().etag);
}

#[tokio::test]
async fn test_fetch_circuit_breaker_drops_server_until_success() {
    let router = MockRouter::new();
    let store = MemoryMetadataCache::new();
    let echo = spec("echo");
    router.serve_tools("echo", json!([tool_json("echo")]));
    let index = tool_index(&router, &store, vec![echo], RuntimeConfig::default());

    index.refresh(&token()).await.unwrap();
    assert_eq!(index.snapshot().len(), 1);

    router.set_reply("echo", "tools/list", Reply::Fail("boom".to_string()));
    for _ in 0..2 {
        index.refresh(&token()).await.unwrap();
        // Below the threshold the last good contribution is kept.
        assert_eq!(index.snapshot().len(), 1);
    }
    index.refresh(&token()).await.unwrap();
    assert_eq!(index.snapshot().len(), 0);

    // One successful fetch closes the breaker and restores the entry.
    router.serve_tools("echo", json!([tool_json("echo")]));
    index.refresh(&token()).await.unwrap();
    assert_eq!(index.snapshot().len(), 1);
}

#[tokio::test]
async fn test_method_not_allowed_drops_catalog_contribution() {
    let router = MockRouter::new();
    let store = MemoryMetadataCache::new();
    let echo = spec("echo");
    router.set_reply(
        "echo",
        "prompts/list",
        Reply::Result(json!({ "prompts": [{ "name": "greet" }] })),
    );
    let index = PromptIndex::new(
        router.clone(),
        store.clone(),
        noop_metrics(),
        fresh_gate(),
        None,
        SpecRegistry::new(vec![echo]),
        RuntimeConfig::default(),
        IndexOptions::default(),
    );

    index.refresh(&token()).await.unwrap();
    assert_eq!(index.snapshot().len(), 1);

    // The server stops implementing prompts entirely.
    router.set_reply(
        "echo",
        "prompts/list",
        Reply::RpcError(-32601, "method not found".to_string()),
    );
    index.refresh(&token()).await.unwrap();
    assert_eq!(index.snapshot().len(), 0);
}

#[tokio::test]
async fn test_expose_tools_master_switch_empties_snapshot() {
    let router = MockRouter::new();
    let store = MemoryMetadataCache::new();
    let echo = spec("echo");
    router.serve_tools("echo", json!([tool_json("echo")]));
    let index = tool_index(&router, &store, vec![echo], RuntimeConfig::default());

    index.refresh(&token()).await.unwrap();
    assert_eq!(index.snapshot().len(), 1);

    let runtime = RuntimeConfig {
        expose_tools: false,
        ..RuntimeConfig::default()
    };
    index.apply_runtime_config(runtime);
    index.refresh(&token()).await.unwrap();
    assert_eq!(index.snapshot().len(), 0);
}

#[tokio::test]
async fn test_expose_allowlist_filters_tools() {
    let router = MockRouter::new();
    let store = MemoryMetadataCache::new();
    let mut echo = spec("echo");
    echo.expose_tools = Some(vec!["allowed".to_string()]);
    router.serve_tools(
        "echo",
        json!([tool_json("allowed"), tool_json("hidden")]),
    );
    let index = tool_index(&router, &store, vec![echo], RuntimeConfig::default());

    index.refresh(&token()).await.unwrap();
    let snapshot = index.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.entries[0].display_name, "echo.allowed");
}

#[tokio::test]
async fn test_invalid_schemas_are_skipped() {
    let router = MockRouter::new();
    let store = MemoryMetadataCache::new();
    let echo = spec("echo");
    router.serve_tools(
        "echo",
        json!([
            tool_json("good"),
            { "name": "", "inputSchema": { "type": "object" } },
            { "name": "stringy", "inputSchema": { "type": "string" } },
            {
                "name": "bad-output",
                "inputSchema": { "type": "object" },
                "outputSchema": { "type": "array" },
            },
        ]),
    );
    let index = tool_index(&router, &store, vec![echo], RuntimeConfig::default());

    index.refresh(&token()).await.unwrap();
    let snapshot = index.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.entries[0].display_name, "echo.good");
}

#[tokio::test]
async fn test_update_specs_prunes_removed_server() {
    let router = MockRouter::new();
    let store = MemoryMetadataCache::new();
    let a = spec("a");
    let b = spec("b");
    router.serve_tools("a", json!([tool_json("one")]));
    router.serve_tools("b", json!([tool_json("two")]));
    let index = tool_index(
        &router,
        &store,
        vec![a.clone(), b],
        RuntimeConfig::default(),
    );

    index.refresh(&token()).await.unwrap();
    assert_eq!(index.snapshot().len(), 2);
    assert!(index.snapshot_for_server("b").is_some());

    index.update_specs(SpecRegistry::new(vec![a]));
    let snapshot = index.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.entries[0].server_name, "a");
    assert!(index.snapshot_for_server("b").is_none());
}

#[tokio::test]
async fn test_cached_snapshot_reads_metadata_only() {
    let router = MockRouter::new();
    let store = MemoryMetadataCache::new();
    let echo = spec("echo");
    let key = echo.spec_key();
    use procmux::core::traits::MetadataCache;
    store.set_tools(
        &key,
        vec![ToolDef {
            name: "echo".to_string(),
            description: None,
            input_schema: json!({ "type": "object" }),
            output_schema: None,
        }],
        "etag",
    );
    let index = tool_index(&router, &store, vec![echo], RuntimeConfig::default());

    let snapshot = index.cached_snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.entries[0].display_name, "echo.echo");
    // No live traffic at all.
    assert!(router.calls().is_empty());
}

#[tokio::test]
async fn test_list_change_event_triggers_refresh() {
    let router = MockRouter::new();
    let store = MemoryMetadataCache::new();
    let bus = Arc::new(ListChangeBus::new());
    let echo = spec("echo");
    let key = echo.spec_key();
    router.serve_tools("echo", json!([tool_json("one")]));
    let index = ToolIndex::new(
        router.clone(),
        store.clone(),
        noop_metrics(),
        fresh_gate(),
        Some(bus.clone()),
        SpecRegistry::new(vec![echo]),
        RuntimeConfig::default(),
        IndexOptions::default(),
    );
    index.start();

    let mut rx = index.subscribe();
    // First periodic refresh lands shortly after start.
    tokio::time::timeout(Duration::from_secs(2), rx.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rx.borrow_and_update().len(), 1);

    // The refresh period is 300s; only the event can explain a new snapshot.
    router.serve_tools("echo", json!([tool_json("one"), tool_json("two")]));
    bus.publish(ListChangeEvent {
        server_type: "echo".to_string(),
        spec_key: key,
        kind: CatalogKindId::Tools,
    });
    tokio::time::timeout(Duration::from_secs(2), rx.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rx.borrow_and_update().len(), 2);

    index.stop();
}

#[tokio::test]
async fn test_bootstrap_hook_defers_first_refresh() {
    let router = MockRouter::new();
    let store = MemoryMetadataCache::new();
    let echo = spec("echo");
    router.serve_tools("echo", json!([tool_json("echo")]));
    let (ready_tx, ready_rx) = watch::channel(false);
    let index = ToolIndex::new(
        router.clone(),
        store.clone(),
        noop_metrics(),
        fresh_gate(),
        None,
        SpecRegistry::new(vec![echo]),
        RuntimeConfig::default(),
        IndexOptions {
            bootstrap: Some(ready_rx),
            id_prefix: None,
        },
    );
    index.start();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(router.calls().is_empty());

    let mut rx = index.subscribe();
    ready_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(2), rx.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(index.snapshot().len(), 1);

    index.stop();
}

#[tokio::test]
async fn test_get_prompt_and_read_resource_roundtrip() {
    let router = MockRouter::new();
    let store = MemoryMetadataCache::new();
    let echo = spec("echo");
    router.set_reply(
        "echo",
        "prompts/list",
        Reply::Result(json!({ "prompts": [{ "name": "greet" }] })),
    );
    router.set_reply(
        "echo",
        "prompts/get",
        Reply::Result(json!({ "messages": [] })),
    );
    router.set_reply(
        "echo",
        "resources/list",
        Reply::Result(json!({
            "resources": [{ "uri": "file:///tmp/a.txt", "name": "a" }]
        })),
    );
    router.set_reply(
        "echo",
        "resources/read",
        Reply::Result(json!({ "contents": [] })),
    );

    let prompts = PromptIndex::new(
        router.clone(),
        store.clone(),
        noop_metrics(),
        fresh_gate(),
        None,
        SpecRegistry::new(vec![echo.clone()]),
        RuntimeConfig::default(),
        IndexOptions::default(),
    );
    let resources = ResourceIndex::new(
        router.clone(),
        store.clone(),
        noop_metrics(),
        fresh_gate(),
        None,
        SpecRegistry::new(vec![echo]),
        RuntimeConfig::default(),
        IndexOptions::default(),
    );
    prompts.refresh(&token()).await.unwrap();
    resources.refresh(&token()).await.unwrap();

    prompts
        .get_prompt(&token(), "echo.greet", json!({}), "")
        .await
        .unwrap();
    let calls = router.calls_for("prompts/get");
    assert_eq!(calls[0].params["name"], "greet");

    resources
        .read_resource(&token(), "echo.a", "")
        .await
        .unwrap();
    let calls = router.calls_for("resources/read");
    assert_eq!(calls[0].params["uri"], "file:///tmp/a.txt");
}

#[tokio::test]
async fn test_elicitation_error_surfaces_typed() {
    let router = MockRouter::new();
    let store = MemoryMetadataCache::new();
    let echo = spec("echo");
    router.serve_tools("echo", json!([tool_json("echo")]));
    router.set_reply(
        "echo",
        "tools/call",
        Reply::RpcError(
            CODE_URL_ELICITATION_REQUIRED,
            "visit the URL to continue".to_string(),
        ),
    );
    let index = tool_index(&router, &store, vec![echo], RuntimeConfig::default());
    index.refresh(&token()).await.unwrap();

    let err = index
        .call_tool(&token(), "echo.echo", json!({}), "")
        .await
        .unwrap_err();
    match err {
        ProcmuxError::Protocol { code, message, .. } => {
            assert_eq!(code, CODE_URL_ELICITATION_REQUIRED);
            assert!(message.contains("URL"));
        }
        other => panic!("expected protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pagination_collects_all_pages() {
    let router = MockRouter::new();
    let store = MemoryMetadataCache::new();
    let echo = spec("echo");
    // The mock keys replies by method only, so emulate pagination with a
    // single page carrying an empty nextCursor.
    router.set_reply(
        "echo",
        "tools/list",
        Reply::Result(json!({
            "tools": [tool_json("one"), tool_json("two")],
            "nextCursor": "",
        })),
    );
    let index = tool_index(&router, &store, vec![echo], RuntimeConfig::default());

    index.refresh(&token()).await.unwrap();
    assert_eq!(index.snapshot().len(), 2);
    assert_eq!(router.calls_for("tools/list").len(), 1);
}
