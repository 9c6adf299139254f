//! # Edge Builder
//!
//! Derives undirected device-to-device edges from devices that share a
//! secondary identifier, honouring the per-kind time windows, and collapses
//! parallel edges to the strongest evidence.

use crate::extract::IdentifierPair;
use crate::model::{DeviceId, Edge, Identifier};
use crate::temporal::{Instant, Span};
use std::collections::BTreeMap;

/// Build the deduplicated edge set for a run.
///
/// The output is sorted by `(device_a, device_b)` and does not depend on the
/// order of `pairs`.
pub fn build_edges(pairs: &[IdentifierPair]) -> Vec<Edge> {
    let mut sightings: BTreeMap<&Identifier, BTreeMap<&DeviceId, Vec<Instant>>> = BTreeMap::new();
    for pair in pairs {
        sightings
            .entry(&pair.identifier)
            .or_default()
            .entry(&pair.device_id)
            .or_default()
            .push(pair.event_time);
    }

    let mut edges: BTreeMap<(DeviceId, DeviceId), Edge> = BTreeMap::new();
    for (identifier, devices) in sightings {
        if devices.len() < 2 {
            continue;
        }
        let mut devices: Vec<(&DeviceId, Vec<Instant>)> = devices.into_iter().collect();
        for (_, times) in devices.iter_mut() {
            times.sort_unstable();
        }

        for i in 0..devices.len() {
            for j in (i + 1)..devices.len() {
                let (device_a, times_a) = &devices[i];
                let (device_b, times_b) = &devices[j];
                let Some(span) = shared_span(identifier, times_a, times_b) else {
                    continue;
                };
                let candidate = Edge {
                    device_a: (*device_a).clone(),
                    device_b: (*device_b).clone(),
                    shared_kind: identifier.kind,
                    confidence: identifier.kind.confidence(),
                    first_seen: span.first_seen,
                    last_seen: span.last_seen,
                };
                collapse_into(&mut edges, candidate);
            }
        }
    }

    edges.into_values().collect()
}

/// Span of the sightings that qualify two devices for an edge on `identifier`,
/// or `None` when the kind's time window is never satisfied.
fn shared_span(identifier: &Identifier, times_a: &[Instant], times_b: &[Instant]) -> Option<Span> {
    let (first_a, last_a) = (*times_a.first()?, *times_a.last()?);
    let (first_b, last_b) = (*times_b.first()?, *times_b.last()?);

    let Some(window) = identifier.kind.edge_window() else {
        return Some(Span {
            first_seen: first_a.min(first_b),
            last_seen: last_a.max(last_b),
        });
    };

    let mut span: Option<Span> = None;
    for &a in times_a {
        let lo = times_b.partition_point(|&b| b < a - window);
        let hi = times_b.partition_point(|&b| b <= a + window);
        if lo >= hi {
            continue;
        }
        let matched = Span {
            first_seen: a.min(times_b[lo]),
            last_seen: a.max(times_b[hi - 1]),
        };
        span = Some(match span {
            Some(current) => current.merge(&matched),
            None => matched,
        });
    }
    span
}

fn collapse_into(edges: &mut BTreeMap<(DeviceId, DeviceId), Edge>, candidate: Edge) {
    let key = (candidate.device_a.clone(), candidate.device_b.clone());
    match edges.get_mut(&key) {
        None => {
            edges.insert(key, candidate);
        }
        Some(existing) => {
            let stronger = candidate.confidence > existing.confidence
                || (candidate.confidence == existing.confidence
                    && candidate.shared_kind < existing.shared_kind);
            if stronger {
                existing.confidence = candidate.confidence;
                existing.shared_kind = candidate.shared_kind;
            }
            let span = existing.span().merge(&candidate.span());
            existing.first_seen = span.first_seen;
            existing.last_seen = span.last_seen;
        }
    }
}
