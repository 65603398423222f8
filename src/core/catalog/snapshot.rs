// src/core/catalog/snapshot.rs

//! Merged catalog snapshots: display-name resolution across servers,
//! deterministic ordering, and content-addressed ETags.

use crate::config::NamespaceStrategy;
use crate::core::types::SpecKey;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::warn;

/// Highest `_<server>_<n>` suffix tried before a flat-mode collision is
/// dropped.
const MAX_COLLISION_SUFFIX: u32 = 99;

/// Reverse-lookup entry: where a display name actually lives.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    pub server_type: String,
    pub spec_key: SpecKey,
    /// The raw call name (tools, prompts) or URI (resources) to put on the
    /// wire.
    pub raw_key: String,
}

/// One merged snapshot entry.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry<D> {
    pub display_name: String,
    pub server_name: String,
    pub spec_key: SpecKey,
    pub def: D,
}

/// An ordered, content-addressed snapshot of one catalog kind. All data is
/// owned, so `clone()` is a deep clone; snapshots handed out are immutable.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot<D> {
    /// Entries sorted by display name.
    pub entries: Vec<CatalogEntry<D>>,
    pub etag: String,
    targets: HashMap<String, Target>,
}

impl<D> Default for CatalogSnapshot<D> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            etag: String::new(),
            targets: HashMap::new(),
        }
    }
}

impl<D> CatalogSnapshot<D> {
    pub fn resolve(&self, display_name: &str) -> Option<&Target> {
        self.targets.get(display_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One server's contribution to a merge.
#[derive(Debug, Clone)]
pub struct ServerCatalog<D> {
    pub server_name: String,
    pub spec_key: SpecKey,
    pub namespace: NamespaceStrategy,
    /// `(raw_name, raw_key, def)` triples in the order the server listed
    /// them.
    pub items: Vec<(String, String, D)>,
}

/// Content-addressed tag over the canonical JSON serialization of an
/// ordered definition list.
pub fn etag_for<D: Serialize>(items: &[D]) -> String {
    let mut hasher = Sha256::new();
    for item in items {
        // Item-at-a-time hashing keeps the tag stable across list clones
        // without materializing one large buffer.
        let bytes = serde_json::to_vec(item).unwrap_or_default();
        hasher.update((bytes.len() as u64).to_be_bytes());
        hasher.update(&bytes);
    }
    hex::encode(hasher.finalize())
}

/// Merges per-server catalogs into one snapshot: display names assigned per
/// namespace strategy, conflicts resolved, entries sorted by display name,
/// ETag computed over the result.
///
/// Servers must be supplied in deterministic (sorted) order; "first binding
/// wins" on collisions depends on it.
pub fn merge_catalogs<D: Clone + Serialize>(servers: &[ServerCatalog<D>]) -> CatalogSnapshot<D> {
    let mut entries: Vec<CatalogEntry<D>> = Vec::new();
    let mut targets: HashMap<String, Target> = HashMap::new();

    for server in servers {
        for (raw_name, raw_key, def) in &server.items {
            let desired = match server.namespace {
                NamespaceStrategy::Prefix => format!("{}.{}", server.server_name, raw_name),
                NamespaceStrategy::Flat => raw_name.clone(),
            };
            let display = if !targets.contains_key(&desired) {
                desired
            } else {
                match server.namespace {
                    NamespaceStrategy::Prefix => {
                        // The prefix is expected to eliminate genuine
                        // collisions; a duplicate within one server is a
                        // child bug.
                        warn!(
                            server = %server.server_name,
                            name = %desired,
                            "Duplicate prefixed catalog name; skipping later entry."
                        );
                        continue;
                    }
                    NamespaceStrategy::Flat => {
                        match free_collision_slot(&targets, raw_name, &server.server_name) {
                            Some(slot) => slot,
                            None => {
                                warn!(
                                    server = %server.server_name,
                                    name = %raw_name,
                                    "No free collision suffix; skipping entry."
                                );
                                continue;
                            }
                        }
                    }
                }
            };
            targets.insert(
                display.clone(),
                Target {
                    server_type: server.server_name.clone(),
                    spec_key: server.spec_key.clone(),
                    raw_key: raw_key.clone(),
                },
            );
            entries.push(CatalogEntry {
                display_name: display,
                server_name: server.server_name.clone(),
                spec_key: server.spec_key.clone(),
                def: def.clone(),
            });
        }
    }

    entries.sort_by(|a, b| a.display_name.cmp(&b.display_name));
    let etag = etag_for(&entries);
    CatalogSnapshot {
        entries,
        etag,
        targets,
    }
}

/// First free `"<name>_<server>"` / `"<name>_<server>_<n>"` slot, if any.
fn free_collision_slot(
    targets: &HashMap<String, Target>,
    raw_name: &str,
    server_name: &str,
) -> Option<String> {
    let first = format!("{raw_name}_{server_name}");
    if !targets.contains_key(&first) {
        return Some(first);
    }
    (2..=MAX_COLLISION_SUFFIX)
        .map(|n| format!("{raw_name}_{server_name}_{n}"))
        .find(|candidate| !targets.contains_key(candidate))
}
