// src/core/events.rs

//! List-change event plumbing: the event type the catalog indexes react to,
//! and an in-process broadcast bus implementation for embeddings that host
//! the child drivers in the same process.

use crate::core::types::SpecKey;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::debug;

/// Capacity of each per-kind broadcast channel. Large enough for bursts of
/// notifications from many children without lagging receivers.
const CHANNEL_CAPACITY: usize = 256;

/// The three catalog kinds the aggregator maintains indexes for.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CatalogKindId {
    Tools,
    Prompts,
    Resources,
}

impl CatalogKindId {
    /// The JSON-RPC list method for this kind.
    pub fn list_method(self) -> &'static str {
        match self {
            CatalogKindId::Tools => "tools/list",
            CatalogKindId::Prompts => "prompts/list",
            CatalogKindId::Resources => "resources/list",
        }
    }
}

/// An asynchronous notification that a server's catalog of `kind` changed
/// and the corresponding index should refresh.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ListChangeEvent {
    pub server_type: String,
    pub spec_key: SpecKey,
    pub kind: CatalogKindId,
}

/// `ListChangeBus` is an in-process distribution hub for list-change
/// notifications, one broadcast channel per catalog kind. Publishing to a
/// kind nobody subscribed to is not an error.
#[derive(Debug, Default)]
pub struct ListChangeBus {
    channels: DashMap<CatalogKindId, Arc<Sender<ListChangeEvent>>>,
}

impl ListChangeBus {
    pub fn new() -> Self {
        Default::default()
    }

    /// Provides a new receiver for the given kind, creating the channel on
    /// first use.
    pub fn subscribe(&self, kind: CatalogKindId) -> Receiver<ListChangeEvent> {
        self.channels
            .entry(kind)
            .or_insert_with(|| Arc::new(broadcast::channel(CHANNEL_CAPACITY).0))
            .value()
            .subscribe()
    }

    /// Publishes an event to all subscribers of its kind. Returns the number
    /// of receivers the event reached.
    pub fn publish(&self, event: ListChangeEvent) -> usize {
        let Some(sender) = self.channels.get(&event.kind) else {
            debug!(
                kind = %event.kind,
                server = %event.server_type,
                "List-change event published with no active subscribers."
            );
            return 0;
        };
        sender.send(event).unwrap_or(0)
    }
}
