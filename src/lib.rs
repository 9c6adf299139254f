//! # Stitchgraph
//!
//! An incremental identity-resolution engine: stitches device cookies, hashed
//! emails and phones, external ids, ad-click cookies and session fingerprints
//! into one canonical identity per visitor.
//!
//! Each run processes one window of events, resolves connected components of
//! the device graph, merges them into the persistent identity graph with an
//! append-only audit log, refreshes cluster summaries and stamps canonical ids
//! back onto the events.

pub mod backfill;
pub mod canonical;
pub mod components;
pub mod config;
pub mod edges;
pub mod extract;
pub mod materialize;
pub mod merger;
pub mod model;
pub mod ordering;
pub mod persistence;
pub mod pipeline;
pub mod query;
pub mod store;
pub mod temporal;
pub mod test_support;
pub mod utils;

// Re-export main types for convenience
pub use components::Convergence;
pub use config::{ConfigOverrides, StitchConfig};
pub use materialize::ClusterSummary;
pub use model::{
    DeviceId, EventRecord, Identifier, IdentifierKind, IdentityLink, MatchSource, MatchType,
    MergeLogEntry, MergeReason,
};
pub use persistence::{PersistentGraphStore, PersistentOpenOptions};
pub use pipeline::{RunParams, RunSummary};
pub use query::{ClusterView, LinkedIdentifier};
pub use store::{GraphStats, GraphStore, MemoryGraphStore};
pub use temporal::Interval;

use anyhow::Result;
use std::path::Path;

/// Main API for identity resolution
pub struct IdentityResolver {
    store: Box<dyn GraphStore>,
}

impl IdentityResolver {
    /// Create a resolver over an empty in-memory graph
    pub fn new() -> Self {
        Self::with_store(MemoryGraphStore::new())
    }

    /// Create a resolver with a custom store implementation.
    pub fn with_store<S>(store: S) -> Self
    where
        S: GraphStore + 'static,
    {
        Self {
            store: Box::new(store),
        }
    }

    /// Open the store described by the storage configuration: RocksDB when a
    /// data directory is set, memory otherwise.
    pub fn open(storage: &config::StorageConfig) -> Result<Self> {
        match &storage.data_dir {
            Some(path) => {
                let options = PersistentOpenOptions {
                    repair: storage.repair,
                    cache_capacity: storage.cache_capacity,
                };
                Ok(Self::with_store(PersistentGraphStore::open_with_options(
                    path, options,
                )?))
            }
            None => Ok(Self::new()),
        }
    }

    pub fn store(&self) -> &dyn GraphStore {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn GraphStore {
        self.store.as_mut()
    }

    /// Process one window of events, stamping resolved canonical ids in place.
    pub fn run(&mut self, events: &mut [EventRecord], params: &RunParams) -> Result<RunSummary> {
        pipeline::run_pipeline(self.store.as_mut(), events, params)
    }

    /// Canonical id for an identifier.
    pub fn lookup(&self, value: &str, kind: IdentifierKind) -> Result<Option<DeviceId>> {
        query::lookup(self.store.as_ref(), value, kind)
    }

    /// Active links of a canonical identity.
    pub fn cluster(&self, canonical: &DeviceId) -> Result<Option<ClusterView>> {
        query::cluster(self.store.as_ref(), canonical)
    }

    /// Materialized summary of a canonical identity.
    pub fn summary(&self, canonical: &DeviceId) -> Result<Option<ClusterSummary>> {
        self.store.get_summary(canonical)
    }

    /// Merges in which an id was either side.
    pub fn merge_history(&self, canonical: &DeviceId) -> Result<Vec<MergeLogEntry>> {
        query::merge_history(self.store.as_ref(), canonical)
    }

    pub fn stats(&self) -> Result<GraphStats> {
        self.store.stats()
    }

    pub fn checkpoint(&self, path: &Path) -> Result<()> {
        self.store.checkpoint(path)
    }
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new()
    }
}
