// tests/property/snapshot_test.rs

//! Property-based tests for snapshot merging and ETag computation: purity,
//! determinism, display-name uniqueness, and ordering.

use procmux::config::NamespaceStrategy;
use procmux::core::catalog::ToolDef;
use procmux::core::catalog::snapshot::{ServerCatalog, etag_for, merge_catalogs};
use procmux::core::types::SpecKey;
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashSet;

fn tool(name: &str, description: &str) -> ToolDef {
    ToolDef {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema: json!({ "type": "object" }),
        output_schema: None,
    }
}

fn catalogs_from(
    servers: Vec<(String, Vec<(String, String)>)>,
    namespace: NamespaceStrategy,
) -> Vec<ServerCatalog<ToolDef>> {
    let mut catalogs: Vec<ServerCatalog<ToolDef>> = servers
        .into_iter()
        .map(|(server, tools)| ServerCatalog {
            spec_key: SpecKey::new(format!("spec-{server}")),
            server_name: server,
            namespace,
            items: tools
                .into_iter()
                .map(|(name, desc)| (name.clone(), name.clone(), tool(&name, &desc)))
                .collect(),
        })
        .collect();
    catalogs.sort_by(|a, b| a.server_name.cmp(&b.server_name));
    catalogs.dedup_by(|a, b| a.server_name == b.server_name);
    catalogs
}

fn server_inputs() -> impl Strategy<Value = Vec<(String, Vec<(String, String)>)>> {
    prop::collection::vec(
        (
            "[a-z]{1,8}",
            prop::collection::vec(("[a-z_]{1,12}", "[a-zA-Z0-9 ]{0,24}"), 0..6),
        ),
        0..5,
    )
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_etag_is_pure_over_clones(
        tools in prop::collection::vec(("[a-z_]{1,12}", ".{0,64}"), 0..16)
    ) {
        let defs: Vec<ToolDef> = tools.iter().map(|(n, d)| tool(n, d)).collect();
        let cloned = defs.clone();
        prop_assert_eq!(etag_for(&defs), etag_for(&cloned));
    }

    #[test]
    fn test_merge_is_deterministic(
        servers in server_inputs(),
        flat in any::<bool>(),
    ) {
        let namespace = if flat { NamespaceStrategy::Flat } else { NamespaceStrategy::Prefix };
        let catalogs = catalogs_from(servers, namespace);
        let first = merge_catalogs(&catalogs);
        let second = merge_catalogs(&catalogs.clone());
        prop_assert_eq!(&first.etag, &second.etag);
        prop_assert_eq!(first.len(), second.len());
    }

    #[test]
    fn test_display_names_are_unique_and_sorted(
        servers in server_inputs(),
        flat in any::<bool>(),
    ) {
        let namespace = if flat { NamespaceStrategy::Flat } else { NamespaceStrategy::Prefix };
        let snapshot = merge_catalogs(&catalogs_from(servers, namespace));

        let names: Vec<&String> = snapshot.entries.iter().map(|e| &e.display_name).collect();
        let unique: HashSet<&String> = names.iter().copied().collect();
        prop_assert_eq!(unique.len(), names.len(), "display names must be unique");

        let mut sorted = names.clone();
        sorted.sort();
        prop_assert_eq!(&names, &sorted, "entries must be sorted by display name");
    }

    #[test]
    fn test_every_entry_resolves_to_its_server(
        servers in server_inputs(),
        flat in any::<bool>(),
    ) {
        let namespace = if flat { NamespaceStrategy::Flat } else { NamespaceStrategy::Prefix };
        let snapshot = merge_catalogs(&catalogs_from(servers, namespace));
        for entry in &snapshot.entries {
            let target = snapshot.resolve(&entry.display_name);
            prop_assert!(target.is_some());
            let target = target.unwrap();
            prop_assert_eq!(&target.server_type, &entry.server_name);
            prop_assert_eq!(&target.spec_key, &entry.spec_key);
        }
    }
}
