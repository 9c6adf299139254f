//! # Store Module
//!
//! The identity-graph storage seam. [`GraphStore`] is what the merger,
//! materializer, backfiller and query layer talk to; [`MemoryGraphStore`] is
//! the in-process implementation and the RocksDB one lives in
//! [`crate::persistence`].

use crate::config::MAX_STORE_ATTEMPTS;
use crate::materialize::ClusterSummary;
use crate::model::{DeviceId, Identifier, IdentifierKind, IdentityLink, MergeLogEntry, MergeReason};
use crate::temporal::Instant;
use anyhow::{bail, Result};
use hashbrown::HashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::debug;

/// One canonical identity absorbed into another.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeRequest {
    pub loser: DeviceId,
    pub winner: DeviceId,
    pub reason: MergeReason,
    pub confidence: f64,
    pub triggered_by: String,
    pub merge_time: Instant,
}

/// Row counts across the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub active_links: usize,
    pub active_identities: usize,
    pub archived_links: usize,
    pub merges: usize,
    pub summaries: usize,
}

/// Storage backend for the identity graph.
///
/// At most one active link exists per `(linked_id, linked_kind)`. Replaced
/// rows are archived, never deleted, and the merge log is append-only.
pub trait GraphStore: Send {
    /// The active link for an identifier.
    fn get_link(&self, identifier: &Identifier) -> Result<Option<IdentityLink>>;

    /// Insert or replace the active link for `link.identifier()`. A previous
    /// active row under a different canonical id is archived.
    fn upsert_link(&mut self, link: IdentityLink) -> Result<()>;

    /// Active links under a canonical id, in identifier order.
    fn links_for_canonical(&self, canonical: &DeviceId) -> Result<Vec<IdentityLink>>;

    /// Re-point every active link of `request.loser` to `request.winner` and
    /// append the merge log entry in one atomic step. Returns `None` (and logs
    /// nothing) when the loser had no active links.
    fn transactional_merge(&mut self, request: &MergeRequest) -> Result<Option<MergeLogEntry>>;

    /// Every active device link as `(device, canonical)`.
    fn device_memberships(&self) -> Result<Vec<(DeviceId, DeviceId)>>;

    /// Canonical ids with at least one active link.
    fn canonical_ids(&self) -> Result<Vec<DeviceId>>;

    /// Archived rows for an identifier, oldest first.
    fn link_history(&self, identifier: &Identifier) -> Result<Vec<IdentityLink>>;

    /// The full merge log, in merge order.
    fn merge_log(&self) -> Result<Vec<MergeLogEntry>>;

    /// Merge log entries where `canonical` was either side.
    fn merges_involving(&self, canonical: &DeviceId) -> Result<Vec<MergeLogEntry>> {
        Ok(self
            .merge_log()?
            .into_iter()
            .filter(|entry| {
                &entry.source_canonical_id == canonical || &entry.target_canonical_id == canonical
            })
            .collect())
    }

    fn put_summary(&mut self, summary: &ClusterSummary) -> Result<()>;

    fn get_summary(&self, canonical: &DeviceId) -> Result<Option<ClusterSummary>>;

    fn delete_summary(&mut self, canonical: &DeviceId) -> Result<()>;

    fn stats(&self) -> Result<GraphStats>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn checkpoint(&self, _path: &Path) -> Result<()> {
        bail!("checkpoint not supported for this store")
    }
}

/// Run a store operation up to [`MAX_STORE_ATTEMPTS`] times.
pub(crate) fn with_retries<T>(what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt < MAX_STORE_ATTEMPTS => {
                debug!(attempt, error = %err, "{what} failed; retrying");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// In-memory identity graph.
#[derive(Debug, Clone, Default)]
pub struct MemoryGraphStore {
    links: HashMap<Identifier, IdentityLink>,
    by_canonical: BTreeMap<DeviceId, BTreeSet<Identifier>>,
    history: HashMap<Identifier, Vec<IdentityLink>>,
    archived: usize,
    merges: Vec<MergeLogEntry>,
    summaries: BTreeMap<DeviceId, ClusterSummary>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    fn archive(&mut self, mut row: IdentityLink, at: Instant) {
        row.is_active = false;
        row.updated_at = at;
        self.history.entry(row.identifier()).or_default().push(row);
        self.archived += 1;
    }

    fn unindex(&mut self, canonical: &DeviceId, identifier: &Identifier) {
        if let Some(members) = self.by_canonical.get_mut(canonical) {
            members.remove(identifier);
            if members.is_empty() {
                self.by_canonical.remove(canonical);
            }
        }
    }
}

impl GraphStore for MemoryGraphStore {
    fn get_link(&self, identifier: &Identifier) -> Result<Option<IdentityLink>> {
        Ok(self.links.get(identifier).cloned())
    }

    fn upsert_link(&mut self, link: IdentityLink) -> Result<()> {
        let identifier = link.identifier();
        if let Some(previous) = self.links.remove(&identifier) {
            if previous.canonical_id != link.canonical_id {
                self.unindex(&previous.canonical_id, &identifier);
                self.archive(previous, link.updated_at);
            }
        }
        self.by_canonical
            .entry(link.canonical_id.clone())
            .or_default()
            .insert(identifier.clone());
        self.links.insert(identifier, link);
        Ok(())
    }

    fn links_for_canonical(&self, canonical: &DeviceId) -> Result<Vec<IdentityLink>> {
        Ok(self
            .by_canonical
            .get(canonical)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|identifier| self.links.get(identifier).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn transactional_merge(&mut self, request: &MergeRequest) -> Result<Option<MergeLogEntry>> {
        if request.loser == request.winner {
            bail!("cannot merge {} into itself", request.loser);
        }
        let Some(members) = self.by_canonical.remove(&request.loser) else {
            return Ok(None);
        };

        let mut moved = 0u64;
        for identifier in members {
            let Some(link) = self.links.get_mut(&identifier) else {
                continue;
            };
            let previous = link.clone();
            link.canonical_id = request.winner.clone();
            link.updated_at = request.merge_time;
            self.archive(previous, request.merge_time);
            self.by_canonical
                .entry(request.winner.clone())
                .or_default()
                .insert(identifier);
            moved += 1;
        }
        if moved == 0 {
            return Ok(None);
        }

        let entry = MergeLogEntry {
            merge_id: self.merges.len() as u64 + 1,
            source_canonical_id: request.loser.clone(),
            target_canonical_id: request.winner.clone(),
            reason: request.reason,
            confidence: request.confidence,
            identifiers_moved: moved,
            triggered_by: request.triggered_by.clone(),
            merge_time: request.merge_time,
        };
        self.merges.push(entry.clone());
        Ok(Some(entry))
    }

    fn device_memberships(&self) -> Result<Vec<(DeviceId, DeviceId)>> {
        let mut memberships: Vec<(DeviceId, DeviceId)> = self
            .links
            .values()
            .filter(|link| link.linked_kind == IdentifierKind::DeviceId)
            .map(|link| (DeviceId::new(link.linked_id.clone()), link.canonical_id.clone()))
            .collect();
        memberships.sort();
        Ok(memberships)
    }

    fn canonical_ids(&self) -> Result<Vec<DeviceId>> {
        Ok(self.by_canonical.keys().cloned().collect())
    }

    fn link_history(&self, identifier: &Identifier) -> Result<Vec<IdentityLink>> {
        Ok(self.history.get(identifier).cloned().unwrap_or_default())
    }

    fn merge_log(&self) -> Result<Vec<MergeLogEntry>> {
        Ok(self.merges.clone())
    }

    fn put_summary(&mut self, summary: &ClusterSummary) -> Result<()> {
        self.summaries
            .insert(summary.canonical_id.clone(), summary.clone());
        Ok(())
    }

    fn get_summary(&self, canonical: &DeviceId) -> Result<Option<ClusterSummary>> {
        Ok(self.summaries.get(canonical).cloned())
    }

    fn delete_summary(&mut self, canonical: &DeviceId) -> Result<()> {
        self.summaries.remove(canonical);
        Ok(())
    }

    fn stats(&self) -> Result<GraphStats> {
        Ok(GraphStats {
            active_links: self.links.len(),
            active_identities: self.by_canonical.len(),
            archived_links: self.archived,
            merges: self.merges.len(),
            summaries: self.summaries.len(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{MatchSource, MatchType};

    pub(crate) fn link(canonical: &str, value: &str, kind: IdentifierKind) -> IdentityLink {
        let confidence = kind.confidence();
        IdentityLink {
            canonical_id: DeviceId::from(canonical),
            linked_id: value.to_string(),
            linked_kind: kind,
            match_confidence: confidence,
            match_type: MatchType::for_confidence(confidence),
            match_source: kind.match_source(),
            first_seen: 10,
            last_seen: 20,
            link_count: 1,
            is_active: true,
            created_at: 100,
            updated_at: 100,
            last_window: 0,
        }
    }

    fn merge(loser: &str, winner: &str) -> MergeRequest {
        MergeRequest {
            loser: DeviceId::from(loser),
            winner: DeviceId::from(winner),
            reason: MergeReason::NewEdge,
            confidence: 1.0,
            triggered_by: "daily:2024-03-01".to_string(),
            merge_time: 500,
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let mut store = MemoryGraphStore::new();
        store.upsert_link(link("d1", "d1", IdentifierKind::DeviceId)).unwrap();
        store.upsert_link(link("d1", "E1", IdentifierKind::EmailHash)).unwrap();

        let found = store
            .get_link(&Identifier::new("E1", IdentifierKind::EmailHash))
            .unwrap()
            .unwrap();
        assert_eq!(found.canonical_id, DeviceId::from("d1"));
        assert!(store
            .get_link(&Identifier::new("E1", IdentifierKind::PhoneHash))
            .unwrap()
            .is_none());
        assert_eq!(store.links_for_canonical(&"d1".into()).unwrap().len(), 2);
        assert_eq!(store.canonical_ids().unwrap(), vec![DeviceId::from("d1")]);
    }

    #[test]
    fn test_reassignment_archives_previous_row() {
        let mut store = MemoryGraphStore::new();
        store.upsert_link(link("d1", "fp", IdentifierKind::SessionFingerprint)).unwrap();
        let mut moved = link("d2", "fp", IdentifierKind::SessionFingerprint);
        moved.updated_at = 300;
        store.upsert_link(moved).unwrap();

        let identifier = Identifier::new("fp", IdentifierKind::SessionFingerprint);
        let history = store.link_history(&identifier).unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].is_active);
        assert_eq!(history[0].canonical_id, DeviceId::from("d1"));
        assert_eq!(history[0].updated_at, 300);
        assert!(store.links_for_canonical(&"d1".into()).unwrap().is_empty());
        assert_eq!(store.stats().unwrap().active_links, 1);
    }

    #[test]
    fn test_same_canonical_update_does_not_archive() {
        let mut store = MemoryGraphStore::new();
        store.upsert_link(link("d1", "E1", IdentifierKind::EmailHash)).unwrap();
        let mut updated = link("d1", "E1", IdentifierKind::EmailHash);
        updated.link_count = 7;
        store.upsert_link(updated).unwrap();
        assert_eq!(store.stats().unwrap().archived_links, 0);
        assert_eq!(
            store
                .get_link(&Identifier::new("E1", IdentifierKind::EmailHash))
                .unwrap()
                .unwrap()
                .link_count,
            7
        );
    }

    #[test]
    fn test_transactional_merge_moves_all_links_and_logs() {
        let mut store = MemoryGraphStore::new();
        store.upsert_link(link("d1", "d1", IdentifierKind::DeviceId)).unwrap();
        store.upsert_link(link("d2", "d2", IdentifierKind::DeviceId)).unwrap();
        store.upsert_link(link("d2", "P1", IdentifierKind::PhoneHash)).unwrap();

        let entry = store.transactional_merge(&merge("d2", "d1")).unwrap().unwrap();
        assert_eq!(entry.merge_id, 1);
        assert_eq!(entry.identifiers_moved, 2);
        assert_eq!(entry.reason, MergeReason::NewEdge);

        assert_eq!(store.links_for_canonical(&"d1".into()).unwrap().len(), 3);
        assert!(store.links_for_canonical(&"d2".into()).unwrap().is_empty());
        assert_eq!(
            store.device_memberships().unwrap(),
            vec![
                (DeviceId::from("d1"), DeviceId::from("d1")),
                (DeviceId::from("d2"), DeviceId::from("d1")),
            ]
        );
        let stats = store.stats().unwrap();
        assert_eq!(stats.archived_links, 2);
        assert_eq!(stats.active_identities, 1);
        assert_eq!(store.merges_involving(&"d2".into()).unwrap().len(), 1);
    }

    #[test]
    fn test_empty_merge_is_not_logged() {
        let mut store = MemoryGraphStore::new();
        store.upsert_link(link("d1", "d1", IdentifierKind::DeviceId)).unwrap();
        assert!(store.transactional_merge(&merge("d9", "d1")).unwrap().is_none());
        assert!(store.merge_log().unwrap().is_empty());
        assert!(store.transactional_merge(&merge("d1", "d1")).is_err());
    }
}
