//! # Canonical Assignment
//!
//! Picks one canonical identity per component (its smallest device id) and
//! proposes the identity-graph links this run's observations imply.

use crate::components::ComponentLabels;
use crate::config::{CONFIDENCE_DETERMINISTIC, CONFIDENCE_OBSERVATION_ONLY};
use crate::extract::ExtractedBatch;
use crate::model::{DeviceId, Edge, Identifier, IdentifierKind, MatchSource};
use crate::temporal::Span;
use std::collections::{BTreeMap, BTreeSet};

/// A link the run wants to exist in the identity graph.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkProposal {
    pub canonical_id: DeviceId,
    pub identifier: Identifier,
    pub confidence: f64,
    pub match_source: MatchSource,
    pub span: Span,
    /// Observations counted this run.
    pub observations: u64,
}

/// Two canonical ids this run found joined through a shared deterministic
/// identifier that label propagation did not finish connecting.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeHint {
    pub target: DeviceId,
    pub source: DeviceId,
    pub confidence: f64,
    pub match_source: MatchSource,
}

#[derive(Debug, Clone, Default)]
pub struct CanonicalAssignment {
    /// Canonical id for every device that took part in resolution.
    pub canonical_of: BTreeMap<DeviceId, DeviceId>,
    pub proposals: Vec<LinkProposal>,
    pub merge_hints: Vec<MergeHint>,
}

impl CanonicalAssignment {
    pub fn canonical_for(&self, device: &DeviceId) -> Option<&DeviceId> {
        self.canonical_of.get(device)
    }

    /// Canonical ids with at least one proposal.
    pub fn touched_canonicals(&self) -> BTreeSet<DeviceId> {
        self.proposals
            .iter()
            .map(|proposal| proposal.canonical_id.clone())
            .collect()
    }
}

/// Assign canonical ids and build the run's link proposals.
pub fn assign_canonical(
    labels: &ComponentLabels,
    batch: &ExtractedBatch,
    edges: &[Edge],
) -> CanonicalAssignment {
    let mut canonical_of = BTreeMap::new();
    for members in labels.groups().into_values() {
        // Groups are filled in canonical order, so the first member is the minimum.
        let Some(canonical) = members.iter().min().map(|d| (*d).clone()) else {
            continue;
        };
        for member in members {
            canonical_of.insert(member.clone(), canonical.clone());
        }
    }

    let mut proposals = device_proposals(&canonical_of, batch, edges);
    let (secondary, merge_hints) = secondary_proposals(&canonical_of, batch);
    proposals.extend(secondary);

    CanonicalAssignment {
        canonical_of,
        proposals,
        merge_hints,
    }
}

fn device_proposals(
    canonical_of: &BTreeMap<DeviceId, DeviceId>,
    batch: &ExtractedBatch,
    edges: &[Edge],
) -> Vec<LinkProposal> {
    let mut strongest: BTreeMap<&DeviceId, (f64, IdentifierKind, Span)> = BTreeMap::new();
    for edge in edges {
        for device in [&edge.device_a, &edge.device_b] {
            strongest
                .entry(device)
                .and_modify(|(confidence, kind, span)| {
                    if edge.confidence > *confidence
                        || (edge.confidence == *confidence && edge.shared_kind < *kind)
                    {
                        *confidence = edge.confidence;
                        *kind = edge.shared_kind;
                    }
                    *span = span.merge(&edge.span());
                })
                .or_insert((edge.confidence, edge.shared_kind, edge.span()));
        }
    }

    let touched: BTreeSet<&DeviceId> = batch.devices.keys().chain(strongest.keys().copied()).collect();

    let mut proposals = Vec::with_capacity(touched.len());
    for device in touched {
        let Some(canonical) = canonical_of.get(device) else {
            continue;
        };
        let sighting = batch.devices.get(device);
        let edge = strongest.get(device);

        let (confidence, match_source) = if device == canonical {
            (CONFIDENCE_DETERMINISTIC, MatchSource::CanonicalSelf)
        } else if let Some((confidence, kind, _)) = edge {
            (*confidence, kind.match_source())
        } else {
            (CONFIDENCE_OBSERVATION_ONLY, MatchSource::DeviceObserved)
        };
        let span = match (sighting, edge) {
            (Some((span, _)), _) => *span,
            (None, Some((_, _, span))) => *span,
            (None, None) => continue,
        };

        proposals.push(LinkProposal {
            canonical_id: canonical.clone(),
            identifier: device.to_identifier(),
            confidence,
            match_source,
            span,
            observations: sighting.map(|(_, count)| *count).unwrap_or(0),
        });
    }
    proposals
}

#[derive(Default)]
struct Attachment {
    span: Option<Span>,
    observations: u64,
    confidence: f64,
    match_source: Option<MatchSource>,
}

impl Attachment {
    fn observe(&mut self, at: i64, confidence: f64, source: MatchSource) {
        self.span = Some(match self.span {
            Some(mut span) => {
                span.observe(at);
                span
            }
            None => Span::at(at),
        });
        self.observations += 1;
        if self.match_source.is_none() || confidence > self.confidence {
            self.confidence = confidence;
            self.match_source = Some(source);
        }
    }

    fn absorb(&mut self, other: &Attachment) {
        self.span = match (self.span, other.span) {
            (Some(a), Some(b)) => Some(a.merge(&b)),
            (a, b) => a.or(b),
        };
        self.observations += other.observations;
        if self.match_source.is_none() || other.confidence > self.confidence {
            self.confidence = other.confidence;
            self.match_source = other.match_source;
        }
    }
}

fn secondary_proposals(
    canonical_of: &BTreeMap<DeviceId, DeviceId>,
    batch: &ExtractedBatch,
) -> (Vec<LinkProposal>, Vec<MergeHint>) {
    let mut by_identifier: BTreeMap<&Identifier, BTreeMap<&DeviceId, Attachment>> = BTreeMap::new();
    for pair in &batch.pairs {
        let Some(canonical) = canonical_of.get(&pair.device_id) else {
            continue;
        };
        by_identifier
            .entry(&pair.identifier)
            .or_default()
            .entry(canonical)
            .or_default()
            .observe(pair.event_time, pair.confidence, pair.match_source);
    }

    let mut proposals = Vec::with_capacity(by_identifier.len());
    let mut hints = Vec::new();
    for (identifier, per_canonical) in by_identifier {
        let mut canonicals = per_canonical.into_iter();
        let Some((first_canonical, first)) = canonicals.next() else {
            continue;
        };
        let (canonical, attachment) = if identifier.kind.is_deterministic() {
            // Smallest canonical wins; the rest must merge into it.
            let mut merged = first;
            for (other, attachment) in canonicals {
                hints.push(MergeHint {
                    target: first_canonical.clone(),
                    source: other.clone(),
                    confidence: attachment.confidence,
                    match_source: attachment
                        .match_source
                        .unwrap_or_else(|| identifier.kind.match_source()),
                });
                merged.absorb(&attachment);
            }
            (first_canonical, merged)
        } else {
            // Latest holder keeps a windowed identifier; ties go to the smallest canonical.
            let mut best = (first_canonical, first);
            for (other, attachment) in canonicals {
                let other_last = attachment.span.map(|s| s.last_seen);
                let best_last = best.1.span.map(|s| s.last_seen);
                if other_last > best_last {
                    best = (other, attachment);
                }
            }
            best
        };

        let (Some(span), Some(match_source)) = (attachment.span, attachment.match_source) else {
            continue;
        };
        proposals.push(LinkProposal {
            canonical_id: canonical.clone(),
            identifier: identifier.clone(),
            confidence: attachment.confidence,
            match_source,
            span,
            observations: attachment.observations,
        });
    }
    (proposals, hints)
}
