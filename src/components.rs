//! # Component Resolver
//!
//! Connected components of the device graph by bounded minimum-label
//! propagation. Every node starts labelled with itself; each sweep lets a node
//! adopt the smallest label among itself and its neighbours, then shortcut
//! through its label's own label. Labels only ever decrease and are always a
//! member of the node's component, so the fixed point is the exact partition.
//! Sweeps alternate direction so a minimum travels the length of a path in
//! either orientation within one sweep.
//!
//! Sweeps are capped at [`MAX_CONVERGENCE_ITERATIONS`]. Hitting the cap is a
//! reportable condition, not an error: the caller gets the best labels found
//! so far together with a [`Convergence`] describing how far it got.

use crate::config::MAX_CONVERGENCE_ITERATIONS;
use crate::model::{DeviceId, Edge};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Outcome of a bounded fixed-point loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Convergence {
    /// Whether the last sweep changed nothing.
    pub converged: bool,
    /// Sweeps performed, including the final quiet one.
    pub iterations: usize,
    /// Nodes whose label changed in the last sweep.
    pub still_changing: usize,
}

/// An undirected graph over device ids, indexed in canonical order so that a
/// smaller index is a smaller device id.
#[derive(Debug, Clone, Default)]
pub struct DeviceGraph {
    nodes: Vec<DeviceId>,
    adjacency: Vec<Vec<usize>>,
}

impl DeviceGraph {
    pub fn builder() -> DeviceGraphBuilder {
        DeviceGraphBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[DeviceId] {
        &self.nodes
    }

    pub fn neighbors(&self, index: usize) -> &[usize] {
        &self.adjacency[index]
    }
}

/// Collects nodes and links before fixing the node order.
#[derive(Debug, Clone, Default)]
pub struct DeviceGraphBuilder {
    nodes: BTreeSet<DeviceId>,
    links: Vec<(DeviceId, DeviceId)>,
}

impl DeviceGraphBuilder {
    pub fn add_node(&mut self, device: DeviceId) -> &mut Self {
        self.nodes.insert(device);
        self
    }

    /// Add an undirected link; both endpoints become nodes. Self links only add the node.
    pub fn add_link(&mut self, a: DeviceId, b: DeviceId) -> &mut Self {
        if a != b {
            self.links.push((a.clone(), b.clone()));
        }
        self.nodes.insert(a);
        self.nodes.insert(b);
        self
    }

    pub fn build(self) -> DeviceGraph {
        let nodes: Vec<DeviceId> = self.nodes.into_iter().collect();
        let index: FxHashMap<&DeviceId, usize> =
            nodes.iter().enumerate().map(|(i, node)| (node, i)).collect();

        let mut adjacency = vec![Vec::new(); nodes.len()];
        for (a, b) in &self.links {
            let (ia, ib) = (index[a], index[b]);
            adjacency[ia].push(ib);
            adjacency[ib].push(ia);
        }
        for neighbors in adjacency.iter_mut() {
            neighbors.sort_unstable();
            neighbors.dedup();
        }

        DeviceGraph { nodes, adjacency }
    }
}

/// Run bounded minimum-label propagation, returning one label index per node.
pub fn propagate_labels(graph: &DeviceGraph, max_iterations: usize) -> (Vec<usize>, Convergence) {
    let mut labels: Vec<usize> = (0..graph.len()).collect();
    let mut convergence = Convergence::default();
    if graph.is_empty() {
        convergence.converged = true;
        return (labels, convergence);
    }

    while convergence.iterations < max_iterations {
        convergence.iterations += 1;
        let mut changed = 0;
        let ascending = convergence.iterations % 2 == 1;
        for step in 0..graph.len() {
            let node = if ascending { step } else { graph.len() - 1 - step };
            let mut best = labels[node];
            for &neighbor in graph.neighbors(node) {
                best = best.min(labels[neighbor]);
            }
            best = best.min(labels[best]);
            if best < labels[node] {
                labels[node] = best;
                changed += 1;
            }
        }
        convergence.still_changing = changed;
        if changed == 0 {
            convergence.converged = true;
            break;
        }
    }

    (labels, convergence)
}

/// Device → component label mapping for one run.
#[derive(Debug, Clone, Default)]
pub struct ComponentLabels {
    pub labels: BTreeMap<DeviceId, DeviceId>,
    pub convergence: Convergence,
}

impl ComponentLabels {
    pub fn label_of(&self, device: &DeviceId) -> Option<&DeviceId> {
        self.labels.get(device)
    }

    /// Members grouped by label, each group sorted in canonical order.
    pub fn groups(&self) -> BTreeMap<&DeviceId, Vec<&DeviceId>> {
        let mut groups: BTreeMap<&DeviceId, Vec<&DeviceId>> = BTreeMap::new();
        for (device, label) in &self.labels {
            groups.entry(label).or_default().push(device);
        }
        groups
    }
}

/// Resolve components over this run's edges, the devices sighted this run, and
/// the existing graph membership (`device → current canonical id`).
pub fn resolve_components<'a>(
    edges: &[Edge],
    sighted: impl IntoIterator<Item = &'a DeviceId>,
    memberships: &[(DeviceId, DeviceId)],
) -> ComponentLabels {
    let mut builder = DeviceGraph::builder();
    for device in sighted {
        builder.add_node(device.clone());
    }
    for (device, canonical) in memberships {
        builder.add_link(device.clone(), canonical.clone());
    }
    for edge in edges {
        builder.add_link(edge.device_a.clone(), edge.device_b.clone());
    }
    let graph = builder.build();

    let (labels, convergence) = propagate_labels(&graph, MAX_CONVERGENCE_ITERATIONS);
    if convergence.converged {
        debug!(
            nodes = graph.len(),
            iterations = convergence.iterations,
            "label propagation converged"
        );
    } else {
        warn!(
            nodes = graph.len(),
            iterations = convergence.iterations,
            still_changing = convergence.still_changing,
            "label propagation hit the iteration cap; continuing with partial labels"
        );
    }

    let nodes = graph.nodes();
    let labels = labels
        .into_iter()
        .enumerate()
        .map(|(node, label)| (nodes[node].clone(), nodes[label].clone()))
        .collect();

    ComponentLabels {
        labels,
        convergence,
    }
}
