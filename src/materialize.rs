//! # Cluster Materializer
//!
//! Per-canonical summaries derived purely from the active links, so that
//! rebuilding the same graph always yields the same summary.

use crate::model::{DeviceId, IdentifierKind, IdentityLink};
use crate::store::GraphStore;
use crate::temporal::Instant;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Flattened view of one resolved identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub canonical_id: DeviceId,
    /// Number of device ids in the cluster.
    pub cluster_size: usize,
    /// Linked identifier values per kind, in canonical order.
    pub members: BTreeMap<IdentifierKind, Vec<String>>,
    pub has_email: bool,
    pub has_phone: bool,
    pub has_external_id: bool,
    pub has_deterministic_link: bool,
    pub deterministic_links: usize,
    pub probabilistic_links: usize,
    pub total_links: usize,
    pub avg_confidence: f64,
    pub min_confidence: f64,
    pub max_confidence: f64,
    pub total_observations: u64,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

impl ClusterSummary {
    /// Summarise a cluster's active links. `None` when there are none.
    pub fn from_links(canonical_id: &DeviceId, links: &[IdentityLink]) -> Option<Self> {
        let first = links.first()?;

        let mut members: BTreeMap<IdentifierKind, Vec<String>> = BTreeMap::new();
        let mut deterministic_links = 0;
        let mut confidence_sum = 0.0;
        let mut min_confidence = first.match_confidence;
        let mut max_confidence = first.match_confidence;
        let mut total_observations = 0;
        let mut span = first.span();

        for link in links {
            members
                .entry(link.linked_kind)
                .or_default()
                .push(link.linked_id.clone());
            if link.is_deterministic() {
                deterministic_links += 1;
            }
            confidence_sum += link.match_confidence;
            min_confidence = min_confidence.min(link.match_confidence);
            max_confidence = max_confidence.max(link.match_confidence);
            total_observations += link.link_count;
            span = span.merge(&link.span());
        }
        for values in members.values_mut() {
            values.sort_by(|a, b| crate::ordering::canonical_cmp(a, b));
            values.dedup();
        }

        let has = |kind: IdentifierKind| members.get(&kind).is_some_and(|values| !values.is_empty());
        let (has_email, has_phone, has_external_id) = (
            has(IdentifierKind::EmailHash),
            has(IdentifierKind::PhoneHash),
            has(IdentifierKind::ExternalId),
        );

        Some(Self {
            canonical_id: canonical_id.clone(),
            cluster_size: members.get(&IdentifierKind::DeviceId).map_or(0, Vec::len),
            has_email,
            has_phone,
            has_external_id,
            has_deterministic_link: deterministic_links > 0,
            deterministic_links,
            probabilistic_links: links.len() - deterministic_links,
            total_links: links.len(),
            avg_confidence: confidence_sum / links.len() as f64,
            min_confidence,
            max_confidence,
            total_observations,
            first_seen: span.first_seen,
            last_seen: span.last_seen,
            members,
        })
    }
}

/// Rebuild the summaries of every touched canonical id. Canonical ids left
/// without active links lose their summary. Returns the number written.
pub fn rebuild_summaries(
    store: &mut dyn GraphStore,
    touched: &BTreeSet<DeviceId>,
) -> Result<usize> {
    let mut written = 0;
    for canonical in touched {
        store.delete_summary(canonical)?;
        let links = store.links_for_canonical(canonical)?;
        if let Some(summary) = ClusterSummary::from_links(canonical, &links) {
            store.put_summary(&summary)?;
            written += 1;
        }
    }
    debug!(touched = touched.len(), written, "cluster summaries rebuilt");
    Ok(written)
}
