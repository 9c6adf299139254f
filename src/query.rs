use crate::model::{
    DeviceId, Identifier, IdentifierKind, IdentityLink, MatchSource, MatchType, MergeLogEntry,
};
use crate::store::GraphStore;
use crate::temporal::Instant;
use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;

/// One active link as seen from its cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkedIdentifier {
    pub value: String,
    pub confidence: f64,
    pub match_type: MatchType,
    pub match_source: MatchSource,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub link_count: u64,
}

impl From<&IdentityLink> for LinkedIdentifier {
    fn from(link: &IdentityLink) -> Self {
        Self {
            value: link.linked_id.clone(),
            confidence: link.match_confidence,
            match_type: link.match_type,
            match_source: link.match_source,
            first_seen: link.first_seen,
            last_seen: link.last_seen,
            link_count: link.link_count,
        }
    }
}

/// Every active link of a canonical identity, grouped by kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterView {
    pub canonical_id: DeviceId,
    pub members: BTreeMap<IdentifierKind, Vec<LinkedIdentifier>>,
}

impl ClusterView {
    pub fn device_count(&self) -> usize {
        self.members
            .get(&IdentifierKind::DeviceId)
            .map_or(0, Vec::len)
    }

    pub fn total_links(&self) -> usize {
        self.members.values().map(Vec::len).sum()
    }
}

/// Canonical id for any identifier, or `None` when it is not in the graph.
pub fn lookup(store: &dyn GraphStore, value: &str, kind: IdentifierKind) -> Result<Option<DeviceId>> {
    Ok(store
        .get_link(&Identifier::new(value, kind))?
        .map(|link| link.canonical_id))
}

/// The cluster under a canonical id. `None` for ids that are not (or no
/// longer) canonical.
pub fn cluster(store: &dyn GraphStore, canonical: &DeviceId) -> Result<Option<ClusterView>> {
    let links = store.links_for_canonical(canonical)?;
    if links.is_empty() {
        return Ok(None);
    }
    let mut members: BTreeMap<IdentifierKind, Vec<LinkedIdentifier>> = BTreeMap::new();
    for link in &links {
        members
            .entry(link.linked_kind)
            .or_default()
            .push(LinkedIdentifier::from(link));
    }
    Ok(Some(ClusterView {
        canonical_id: canonical.clone(),
        members,
    }))
}

/// Merge log entries in which `canonical` was absorbed or absorbed another.
pub fn merge_history(store: &dyn GraphStore, canonical: &DeviceId) -> Result<Vec<MergeLogEntry>> {
    store.merges_involving(canonical)
}
