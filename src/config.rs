// src/config.rs

//! Value-type configuration for the scheduler and catalog indexes: per-server
//! specs, the dynamic runtime config, and the spec registry installed at
//! reconfiguration time.
//!
//! Nothing here touches the filesystem. The embedding front-end is expected
//! to deserialize these structs from wherever it keeps its configuration and
//! inject them as plain values.

use crate::core::types::SpecKey;
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use strum_macros::{Display, EnumString};

/// Placement strategy for a server's instance pool.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Strategy {
    /// Any ready instance may serve any request; pool grows on demand.
    #[default]
    Stateless,
    /// Requests carrying a routing key stick to the instance that first
    /// served that key until the binding expires.
    Stateful,
    /// At most one instance ever runs for this spec.
    Singleton,
    /// Instances are kept alive indefinitely; the idle reaper skips them.
    Persistent,
}

/// How tool display names are derived from raw names in the merged snapshot.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum NamespaceStrategy {
    /// Display name is `"<server>.<raw>"`.
    #[default]
    Prefix,
    /// Raw names are kept; collisions get `_<server>` suffixes.
    Flat,
}

/// Static per-server configuration. Two specs with equal fingerprints share
/// one pool.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerSpec {
    /// Display name; also the server type used in catalog namespacing.
    pub name: String,
    /// Executable the lifecycle driver launches for each instance.
    pub command: String,
    /// Arguments passed to `command`.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub strategy: Strategy,
    /// Per-instance concurrent-call ceiling.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    /// Static warm-pool floor. May be overridden at runtime via
    /// `Scheduler::set_desired_min_ready`.
    #[serde(default)]
    pub min_ready: usize,
    /// Idle age after which a ready instance above the floor is reaped.
    /// With `min_ready == 0` the reaper ignores this and reaps immediately.
    #[serde(default = "default_idle_seconds")]
    pub idle_seconds: u64,
    /// TTL for stateful sticky bindings. `0` disables stale-binding reaping.
    #[serde(default)]
    pub session_ttl_seconds: u64,
    /// How long a draining instance may finish in-flight work before it is
    /// stopped anyway.
    #[serde(default = "default_drain_timeout_seconds")]
    pub drain_timeout_seconds: u64,
    /// Optional allowlist of raw tool names this server may expose.
    #[serde(default)]
    pub expose_tools: Option<Vec<String>>,
    /// Per-server namespace override; falls back to the runtime config.
    #[serde(default)]
    pub tool_namespace: Option<NamespaceStrategy>,
}

fn default_max_concurrent() -> u32 {
    1
}
fn default_idle_seconds() -> u64 {
    300
}
fn default_drain_timeout_seconds() -> u64 {
    30
}

impl ServerSpec {
    /// Computes the stable fingerprint over the semantic fields of this spec.
    ///
    /// The fingerprint is a SHA-256 over a canonical `NUL`-separated field
    /// rendering, truncated to 16 hex chars. Everything that changes pool
    /// behavior is included, so a changed spec always lands in a fresh pool.
    pub fn spec_key(&self) -> SpecKey {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.command.as_bytes());
        for arg in &self.args {
            hasher.update(b"\0");
            hasher.update(arg.as_bytes());
        }
        hasher.update(format!(
            "\0{}\0{}\0{}\0{}\0{}\0{}",
            self.strategy,
            self.max_concurrent,
            self.min_ready,
            self.idle_seconds,
            self.session_ttl_seconds,
            self.drain_timeout_seconds,
        ));
        if let Some(expose) = &self.expose_tools {
            for name in expose {
                hasher.update(b"\0e:");
                hasher.update(name.as_bytes());
            }
        }
        if let Some(ns) = &self.tool_namespace {
            hasher.update(format!("\0ns:{ns}"));
        }
        let digest = hasher.finalize();
        SpecKey::new(hex::encode(&digest[..8]))
    }

    /// Checks the spec for values the scheduler cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("server spec requires a non-empty name");
        }
        if self.command.is_empty() {
            bail!("server spec '{}' requires a command", self.name);
        }
        if self.max_concurrent == 0 {
            bail!("server spec '{}': max_concurrent must be >= 1", self.name);
        }
        if self.strategy == Strategy::Singleton && self.min_ready > 1 {
            bail!(
                "server spec '{}': singleton pools cannot have min_ready > 1",
                self.name
            );
        }
        Ok(())
    }

    /// The namespace strategy in effect for this server, given the runtime
    /// default.
    pub fn namespace(&self, runtime_default: NamespaceStrategy) -> NamespaceStrategy {
        self.tool_namespace.unwrap_or(runtime_default)
    }
}

/// Dynamic system-wide configuration. Replaced wholesale via
/// `Index::apply_runtime_config`; the indexes react by restarting their
/// refresh tickers when the period changed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Master switch for exposing tools at all.
    #[serde(default = "default_expose_tools")]
    pub expose_tools: bool,
    /// Catalog refresh period.
    #[serde(default = "default_tool_refresh_seconds")]
    pub tool_refresh_seconds: u64,
    /// Fanout width for a single refresh pass.
    #[serde(default = "default_tool_refresh_concurrency")]
    pub tool_refresh_concurrency: usize,
    /// Per-fetch and per-call routing timeout.
    #[serde(default = "default_route_timeout_seconds")]
    pub route_timeout_seconds: u64,
    #[serde(default)]
    pub tool_namespace: NamespaceStrategy,
    /// Consecutive failures after which a server's catalog contribution is
    /// dropped and maintenance starts short-circuit.
    #[serde(default = "default_start_failure_threshold")]
    pub start_failure_threshold: u32,
    /// Liveness probe period. `0` disables the probe loop.
    #[serde(default)]
    pub probe_interval_seconds: u64,
}

fn default_expose_tools() -> bool {
    true
}
fn default_tool_refresh_seconds() -> u64 {
    300
}
fn default_tool_refresh_concurrency() -> usize {
    4
}
fn default_route_timeout_seconds() -> u64 {
    30
}
fn default_start_failure_threshold() -> u32 {
    3
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            expose_tools: default_expose_tools(),
            tool_refresh_seconds: default_tool_refresh_seconds(),
            tool_refresh_concurrency: default_tool_refresh_concurrency(),
            route_timeout_seconds: default_route_timeout_seconds(),
            tool_namespace: NamespaceStrategy::default(),
            start_failure_threshold: default_start_failure_threshold(),
            probe_interval_seconds: 0,
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tool_refresh_seconds == 0 {
            bail!("tool_refresh_seconds must be >= 1");
        }
        if self.tool_refresh_concurrency == 0 {
            bail!("tool_refresh_concurrency must be >= 1");
        }
        if self.route_timeout_seconds == 0 {
            bail!("route_timeout_seconds must be >= 1");
        }
        Ok(())
    }

    pub fn refresh_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tool_refresh_seconds)
    }

    pub fn route_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.route_timeout_seconds)
    }
}

/// The installed set of server specs, keyed by spec key. Immutable once
/// built; reconfiguration installs a fresh registry through
/// `Scheduler::apply_catalog_diff` / `Index::update_specs`.
#[derive(Debug, Clone, Default)]
pub struct SpecRegistry {
    specs: HashMap<SpecKey, ServerSpec>,
}

impl SpecRegistry {
    pub fn new(specs: impl IntoIterator<Item = ServerSpec>) -> Self {
        let specs = specs
            .into_iter()
            .map(|spec| (spec.spec_key(), spec))
            .collect();
        Self { specs }
    }

    pub fn get(&self, key: &SpecKey) -> Option<&ServerSpec> {
        self.specs.get(key)
    }

    /// Looks a spec up by its display name (server type).
    pub fn get_by_name(&self, name: &str) -> Option<(&SpecKey, &ServerSpec)> {
        self.specs.iter().find(|(_, spec)| spec.name == name)
    }

    pub fn contains(&self, key: &SpecKey) -> bool {
        self.specs.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SpecKey, &ServerSpec)> {
        self.specs.iter()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Server display names in deterministic order, for refresh fanout.
    pub fn sorted_server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.specs.values().map(|s| s.name.clone()).collect();
        names.sort();
        names
    }

    /// Computes the diff between `self` (old) and `next` (new): spec keys
    /// that disappeared, appeared, or whose server name survived with a
    /// changed fingerprint (a replacement requiring a restart).
    pub fn diff(&self, next: &SpecRegistry) -> CatalogDiff {
        let mut diff = CatalogDiff::default();
        for (key, spec) in &self.specs {
            if next.specs.contains_key(key) {
                continue;
            }
            if next.specs.values().any(|s| s.name == spec.name) {
                diff.replaced_spec_keys.push(key.clone());
            } else {
                diff.removed_spec_keys.push(key.clone());
            }
        }
        for key in next.specs.keys() {
            if !self.specs.contains_key(key) {
                diff.added_spec_keys.push(key.clone());
            }
        }
        diff
    }
}

/// The outcome of comparing two registries; consumed by
/// `Scheduler::apply_catalog_diff`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogDiff {
    pub added_spec_keys: Vec<SpecKey>,
    pub removed_spec_keys: Vec<SpecKey>,
    pub replaced_spec_keys: Vec<SpecKey>,
}

impl CatalogDiff {
    pub fn is_empty(&self) -> bool {
        self.added_spec_keys.is_empty()
            && self.removed_spec_keys.is_empty()
            && self.replaced_spec_keys.is_empty()
    }
}
