//! # Graph Merger
//!
//! Applies a run's canonical assignment to the persistent identity graph:
//! detects merges against existing links, closes them transitively, applies
//! them through [`GraphStore::transactional_merge`], upserts every proposed
//! link, and finally repairs canonical ids left dangling by an interrupted
//! earlier run.
//!
//! The smaller canonical id always wins a merge.

use crate::canonical::{CanonicalAssignment, LinkProposal};
use crate::components::{propagate_labels, Convergence, DeviceGraph};
use crate::config::{CONFIDENCE_OBSERVATION_ONLY, MAX_CONVERGENCE_ITERATIONS};
use crate::model::{DeviceId, IdentifierKind, IdentityLink, MatchSource, MatchType, MergeReason};
use crate::ordering::ordered_pair;
use crate::store::{with_retries, GraphStore, MergeRequest};
use crate::temporal::Interval;
use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Per-run parameters the merger stamps onto what it writes.
#[derive(Debug, Clone)]
pub struct MergeContext {
    pub window: Interval,
    pub full_rebuild: bool,
    pub triggered_by: String,
}

impl MergeContext {
    /// Write time for rows touched by this run.
    pub fn processed_at(&self) -> i64 {
        self.window.end
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub merges_performed: usize,
    pub identifiers_moved: u64,
    pub links_inserted: usize,
    pub links_updated: usize,
    pub links_reassigned: usize,
    pub upsert_errors: usize,
    pub closure: Convergence,
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub stats: MergeStats,
    /// Canonical ids whose clusters changed this run, merged-away ones included.
    pub touched: BTreeSet<DeviceId>,
    /// Loser → winner for every merge closed this run.
    pub merge_map: BTreeMap<DeviceId, DeviceId>,
}

impl MergeOutcome {
    fn resolve(&self, canonical: &DeviceId) -> DeviceId {
        self.merge_map
            .get(canonical)
            .unwrap_or(canonical)
            .clone()
    }
}

/// Confidence and provenance of whatever joined two canonical ids.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Evidence {
    confidence: f64,
    source: MatchSource,
}

impl Evidence {
    const OBSERVED: Evidence = Evidence {
        confidence: CONFIDENCE_OBSERVATION_ONLY,
        source: MatchSource::DeviceObserved,
    };

    fn of_link(link: &IdentityLink) -> Self {
        Self {
            confidence: link.match_confidence,
            source: link.match_source,
        }
    }

    fn of_proposal(proposal: &LinkProposal) -> Self {
        Self {
            confidence: proposal.confidence,
            source: proposal.match_source,
        }
    }

    /// `CanonicalSelf` never describes a join.
    fn or_observed(self) -> Self {
        if self.source == MatchSource::CanonicalSelf {
            Self::OBSERVED
        } else {
            self
        }
    }
}

type MergePairs = BTreeMap<(DeviceId, DeviceId), Evidence>;

/// What phase 1 decided for one proposal.
enum Detected {
    Absent,
    Same,
    Merge,
    Reassign,
    Unreadable,
}

/// Merge an assignment into the store.
pub fn merge_assignment(
    store: &mut dyn GraphStore,
    assignment: &CanonicalAssignment,
    context: &MergeContext,
) -> Result<MergeOutcome> {
    let mut outcome = MergeOutcome::default();

    // Detect.
    let mut pairs = MergePairs::new();
    let mut detected = Vec::with_capacity(assignment.proposals.len());
    for proposal in &assignment.proposals {
        let existing = match with_retries("link read", || store.get_link(&proposal.identifier)) {
            Ok(existing) => existing,
            Err(err) => {
                warn!(identifier = %proposal.identifier, error = %err, "link read failed; skipping record");
                outcome.stats.upsert_errors += 1;
                detected.push(Detected::Unreadable);
                continue;
            }
        };
        let decision = match existing {
            None => Detected::Absent,
            Some(link) if link.canonical_id == proposal.canonical_id => Detected::Same,
            Some(link) => {
                let kind = proposal.identifier.kind;
                let joins = match kind.edge_window() {
                    None => true,
                    Some(window) => link.span().gap_to(&proposal.span) <= window,
                };
                if joins {
                    // A self proposal carries no join evidence; the stored link does.
                    let evidence = if proposal.match_source == MatchSource::CanonicalSelf {
                        Evidence::of_link(&link)
                    } else {
                        Evidence::of_proposal(proposal)
                    };
                    record_pair(&mut pairs, &link.canonical_id, &proposal.canonical_id, evidence);
                    Detected::Merge
                } else {
                    Detected::Reassign
                }
            }
        };
        detected.push(decision);
    }
    for hint in &assignment.merge_hints {
        let evidence = Evidence {
            confidence: hint.confidence,
            source: hint.match_source,
        };
        record_pair(&mut pairs, &hint.target, &hint.source, evidence);
    }

    // Close.
    outcome.merge_map = close_merges(pairs.keys());

    // Apply merges.
    let merge_map = outcome.merge_map.clone();
    for (loser, winner) in &merge_map {
        let key = ordered_pair(winner.clone(), loser.clone());
        let (reason, evidence) = match pairs.get(&key) {
            Some(evidence) => (MergeReason::NewEdge, *evidence),
            None => (
                MergeReason::TransitiveClosure,
                strongest_pair_for(&pairs, loser).unwrap_or(Evidence::OBSERVED),
            ),
        };
        let request = MergeRequest {
            loser: loser.clone(),
            winner: winner.clone(),
            reason,
            confidence: evidence.confidence,
            triggered_by: context.triggered_by.clone(),
            merge_time: context.processed_at(),
        };
        apply_merge(store, &request, evidence, &mut outcome);
    }

    // Upsert.
    for (proposal, decision) in assignment.proposals.iter().zip(detected) {
        if matches!(decision, Detected::Unreadable) {
            continue;
        }
        let canonical = outcome.resolve(&proposal.canonical_id);
        let member;
        let proposal = if is_demoted_self(proposal, &canonical) {
            // The device stopped being canonical this run; it is a member by
            // whatever evidence merged it.
            member = member_proposal(proposal, strongest_pair_for(&pairs, &proposal.canonical_id));
            &member
        } else {
            proposal
        };
        upsert_proposal(store, proposal, canonical, matches!(decision, Detected::Reassign), context, &mut outcome);
    }

    // Dangling closure.
    outcome.stats.closure = close_dangling(store, context, &mut outcome);

    info!(
        merges = outcome.stats.merges_performed,
        moved = outcome.stats.identifiers_moved,
        inserted = outcome.stats.links_inserted,
        updated = outcome.stats.links_updated,
        reassigned = outcome.stats.links_reassigned,
        errors = outcome.stats.upsert_errors,
        "identity graph merged"
    );
    Ok(outcome)
}

fn record_pair(pairs: &mut MergePairs, a: &DeviceId, b: &DeviceId, evidence: Evidence) {
    if a == b {
        return;
    }
    let key = ordered_pair(a.clone(), b.clone());
    let entry = pairs.entry(key).or_insert(evidence);
    if evidence.confidence > entry.confidence {
        *entry = evidence;
    }
}

fn strongest_pair_for(pairs: &MergePairs, device: &DeviceId) -> Option<Evidence> {
    pairs
        .iter()
        .filter(|((a, b), _)| a == device || b == device)
        .map(|(_, evidence)| *evidence)
        .fold(None, |best: Option<Evidence>, evidence| match best {
            Some(best) if best.confidence >= evidence.confidence => Some(best),
            _ => Some(evidence),
        })
}

/// A device proposed as its own canonical id that a merge mapped elsewhere.
fn is_demoted_self(proposal: &LinkProposal, canonical: &DeviceId) -> bool {
    proposal.match_source == MatchSource::CanonicalSelf
        && proposal.identifier.kind == IdentifierKind::DeviceId
        && proposal.identifier.value != canonical.as_str()
}

fn member_proposal(proposal: &LinkProposal, evidence: Option<Evidence>) -> LinkProposal {
    let evidence = evidence.unwrap_or(Evidence::OBSERVED).or_observed();
    LinkProposal {
        confidence: evidence.confidence,
        match_source: evidence.source,
        ..proposal.clone()
    }
}

/// Union merge pairs; each non-root member maps to the smallest id reachable.
fn close_merges<'a>(
    pairs: impl Iterator<Item = &'a (DeviceId, DeviceId)>,
) -> BTreeMap<DeviceId, DeviceId> {
    let mut builder = DeviceGraph::builder();
    for (a, b) in pairs {
        builder.add_link(a.clone(), b.clone());
    }
    let graph = builder.build();
    let (labels, convergence) = propagate_labels(&graph, MAX_CONVERGENCE_ITERATIONS);
    if !convergence.converged {
        warn!(
            iterations = convergence.iterations,
            still_changing = convergence.still_changing,
            "merge closure hit the iteration cap; remaining merges deferred"
        );
    }

    let nodes = graph.nodes();
    labels
        .into_iter()
        .enumerate()
        .filter(|(node, label)| node != label)
        .map(|(node, label)| (nodes[node].clone(), nodes[label].clone()))
        .collect()
}

fn apply_merge(
    store: &mut dyn GraphStore,
    request: &MergeRequest,
    evidence: Evidence,
    outcome: &mut MergeOutcome,
) {
    match with_retries("merge", || store.transactional_merge(request)) {
        Ok(Some(entry)) => {
            debug!(
                merge_id = entry.merge_id,
                source = %entry.source_canonical_id,
                target = %entry.target_canonical_id,
                reason = %entry.reason,
                moved = entry.identifiers_moved,
                "canonical ids merged"
            );
            outcome.stats.merges_performed += 1;
            outcome.stats.identifiers_moved += entry.identifiers_moved;
            outcome.touched.insert(request.loser.clone());
            outcome.touched.insert(request.winner.clone());
            demote_canonical_link(store, request, evidence, outcome);
        }
        Ok(None) => {}
        Err(err) => {
            warn!(
                source = %request.loser,
                target = %request.winner,
                error = %err,
                "merge failed; skipping"
            );
            outcome.stats.upsert_errors += 1;
        }
    }
}

/// Drop `CanonicalSelf` from the loser's own device link once it sits under
/// the winner. Confidence is kept; the source becomes the merge evidence when
/// that evidence is as strong, `DeviceObserved` otherwise.
fn demote_canonical_link(
    store: &mut dyn GraphStore,
    request: &MergeRequest,
    evidence: Evidence,
    outcome: &mut MergeOutcome,
) {
    let identifier = request.loser.to_identifier();
    let mut link = match with_retries("link read", || store.get_link(&identifier)) {
        Ok(Some(link)) => link,
        Ok(None) => return,
        Err(err) => {
            warn!(identifier = %identifier, error = %err, "link read failed; skipping record");
            outcome.stats.upsert_errors += 1;
            return;
        }
    };
    if link.match_source != MatchSource::CanonicalSelf || link.canonical_id == request.loser {
        return;
    }

    let evidence = evidence.or_observed();
    link.match_source = if evidence.confidence >= link.match_confidence {
        evidence.source
    } else {
        MatchSource::DeviceObserved
    };
    link.updated_at = request.merge_time;
    if let Err(err) = with_retries("link upsert", || store.upsert_link(link.clone())) {
        warn!(identifier = %identifier, error = %err, "link upsert failed; skipping record");
        outcome.stats.upsert_errors += 1;
    }
}

fn new_link(proposal: &LinkProposal, canonical: DeviceId, context: &MergeContext) -> IdentityLink {
    let now = context.processed_at();
    IdentityLink {
        canonical_id: canonical,
        linked_id: proposal.identifier.value.clone(),
        linked_kind: proposal.identifier.kind,
        match_confidence: proposal.confidence,
        match_type: MatchType::for_confidence(proposal.confidence),
        match_source: proposal.match_source,
        first_seen: proposal.span.first_seen,
        last_seen: proposal.span.last_seen,
        link_count: proposal.observations,
        is_active: true,
        created_at: now,
        updated_at: now,
        last_window: context.window.start,
    }
}

/// Fold a proposal into the active link it refers to.
fn refresh_link(existing: &mut IdentityLink, proposal: &LinkProposal, context: &MergeContext) {
    let span = existing.span().merge(&proposal.span);
    existing.first_seen = span.first_seen;
    existing.last_seen = span.last_seen;
    if context.full_rebuild {
        existing.link_count = proposal.observations;
    } else if existing.last_window != context.window.start {
        existing.link_count += proposal.observations;
    }
    existing.last_window = context.window.start;
    if proposal.confidence > existing.match_confidence {
        existing.match_confidence = proposal.confidence;
        existing.match_type = MatchType::for_confidence(proposal.confidence);
        existing.match_source = proposal.match_source;
    }
    existing.updated_at = context.processed_at();
}

fn upsert_proposal(
    store: &mut dyn GraphStore,
    proposal: &LinkProposal,
    canonical: DeviceId,
    reassign: bool,
    context: &MergeContext,
    outcome: &mut MergeOutcome,
) {
    let existing = match with_retries("link read", || store.get_link(&proposal.identifier)) {
        Ok(existing) => existing,
        Err(err) => {
            warn!(identifier = %proposal.identifier, error = %err, "link read failed; skipping record");
            outcome.stats.upsert_errors += 1;
            return;
        }
    };

    let (link, counter) = match existing {
        None => (new_link(proposal, canonical.clone(), context), &mut outcome.stats.links_inserted),
        Some(mut link) if link.canonical_id == canonical => {
            refresh_link(&mut link, proposal, context);
            (link, &mut outcome.stats.links_updated)
        }
        Some(previous) if reassign || is_reassignable(proposal.identifier.kind) => {
            // Latest holder takes a windowed identifier; the old row is archived.
            let mut link = new_link(proposal, canonical.clone(), context);
            if previous.match_confidence > link.match_confidence {
                link.match_confidence = previous.match_confidence;
                link.match_type = previous.match_type;
                link.match_source = previous.match_source;
            }
            outcome.touched.insert(previous.canonical_id);
            (link, &mut outcome.stats.links_reassigned)
        }
        Some(previous) => {
            // A deterministic identifier whose merge did not go through stays put.
            debug!(
                identifier = %proposal.identifier,
                held_by = %previous.canonical_id,
                proposed = %canonical,
                "deterministic link left with its current canonical id"
            );
            return;
        }
    };

    match with_retries("link upsert", || store.upsert_link(link.clone())) {
        Ok(()) => {
            *counter += 1;
            outcome.touched.insert(canonical);
        }
        Err(err) => {
            warn!(identifier = %proposal.identifier, error = %err, "link upsert failed; skipping record");
            outcome.stats.upsert_errors += 1;
        }
    }
}

/// Merge canonical ids whose own device link sits under another canonical id,
/// until none remain or the cap is reached.
fn close_dangling(
    store: &mut dyn GraphStore,
    context: &MergeContext,
    outcome: &mut MergeOutcome,
) -> Convergence {
    let mut convergence = Convergence::default();
    while convergence.iterations < MAX_CONVERGENCE_ITERATIONS {
        convergence.iterations += 1;
        let dangling = match find_dangling(store) {
            Ok(dangling) => dangling,
            Err(err) => {
                warn!(error = %err, "dangling-canonical scan failed");
                outcome.stats.upsert_errors += 1;
                return convergence;
            }
        };
        convergence.still_changing = dangling.len();
        if dangling.is_empty() {
            convergence.converged = true;
            return convergence;
        }

        let before = outcome.stats.merges_performed;
        for ((loser, winner), evidence) in dangling {
            let request = MergeRequest {
                loser,
                winner,
                reason: MergeReason::TransitiveClosure,
                confidence: evidence.confidence,
                triggered_by: context.triggered_by.clone(),
                merge_time: context.processed_at(),
            };
            apply_merge(store, &request, evidence, outcome);
        }
        if outcome.stats.merges_performed == before {
            // Nothing moved; another pass would see the same state.
            break;
        }
    }
    warn!(
        iterations = convergence.iterations,
        still_changing = convergence.still_changing,
        "dangling-canonical closure did not converge"
    );
    convergence
}

/// `(loser, winner)` for every canonical id whose device link points
/// elsewhere, with that device link as the evidence.
fn find_dangling(store: &dyn GraphStore) -> Result<MergePairs> {
    let memberships: BTreeMap<DeviceId, DeviceId> = with_retries("membership scan", || store.device_memberships())?
        .into_iter()
        .collect();
    let canonicals = with_retries("canonical scan", || store.canonical_ids())?;

    let mut pairs = MergePairs::new();
    for canonical in canonicals {
        let Some(holder) = memberships.get(&canonical) else {
            continue;
        };
        if holder == &canonical {
            continue;
        }
        let evidence = with_retries("link read", || store.get_link(&canonical.to_identifier()))?
            .map(|link| Evidence::of_link(&link))
            .unwrap_or(Evidence::OBSERVED);
        let (winner, loser) = ordered_pair(holder.clone(), canonical);
        let entry = pairs.entry((loser, winner)).or_insert(evidence);
        if evidence.confidence > entry.confidence {
            *entry = evidence;
        }
    }
    Ok(pairs)
}

/// Kinds whose links may legitimately move between canonical ids.
pub fn is_reassignable(kind: IdentifierKind) -> bool {
    kind.edge_window().is_some()
}
