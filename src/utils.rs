//! # Utilities Module
//!
//! Export helpers for inspecting the identity graph.

use crate::model::{DeviceId, MatchType};
use crate::store::GraphStore;
use anyhow::Result;

/// Export clusters to DOT format for visualization
pub fn export_to_dot(store: &dyn GraphStore, canonicals: &[DeviceId]) -> Result<String> {
    let mut dot = String::new();

    // DOT header
    dot.push_str("digraph IdentityGraph {\n");
    dot.push_str("  rankdir=LR;\n");
    dot.push_str("  node [shape=box, style=filled];\n");
    dot.push_str("  edge [fontsize=10];\n\n");

    for (index, canonical) in canonicals.iter().enumerate() {
        let links = store.links_for_canonical(canonical)?;
        if links.is_empty() {
            continue;
        }
        let root = node_id(canonical.as_str(), "canonical");

        dot.push_str(&format!("  subgraph cluster_{} {{\n", index));
        dot.push_str(&format!("    label=\"{}\";\n", escape(canonical.as_str())));
        dot.push_str("    style=filled;\n");
        dot.push_str("    color=lightgray;\n");
        dot.push_str(&format!(
            "    \"{}\" [label=\"{}\", fillcolor=gold, shape=doubleoctagon];\n",
            root,
            escape(canonical.as_str())
        ));

        for link in &links {
            let node = node_id(&link.linked_id, link.linked_kind.as_str());
            dot.push_str(&format!(
                "    \"{}\" [label=\"{}\\n{}\", fillcolor=lightblue];\n",
                node,
                link.linked_kind,
                escape(&short(&link.linked_id))
            ));
        }
        dot.push_str("  }\n");

        // LINKED_TO edges: green for deterministic, orange for probabilistic
        for link in &links {
            let node = node_id(&link.linked_id, link.linked_kind.as_str());
            let color = match link.match_type {
                MatchType::Deterministic => "green",
                MatchType::Probabilistic => "orange",
            };
            dot.push_str(&format!(
                "  \"{}\" -> \"{}\" [label=\"{} {:.2}\", color={}];\n",
                root, node, link.match_source, link.match_confidence, color
            ));
        }
        dot.push('\n');
    }

    dot.push_str("}\n");
    Ok(dot)
}

fn node_id(value: &str, kind: &str) -> String {
    format!("{}:{}", kind, escape(value))
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Long hashes are cut to their first 12 characters for labels.
fn short(value: &str) -> String {
    if value.chars().count() > 16 {
        let head: String = value.chars().take(12).collect();
        format!("{head}…")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::IdentifierKind;
    use crate::store::tests::link;
    use crate::store::MemoryGraphStore;

    #[test]
    fn test_export_to_dot() {
        let mut store = MemoryGraphStore::new();
        store.upsert_link(link("d1", "d1", IdentifierKind::DeviceId)).unwrap();
        store
            .upsert_link(link("d1", "0123456789abcdef0123", IdentifierKind::SessionFingerprint))
            .unwrap();

        let dot = export_to_dot(&store, &["d1".into(), "gone".into()]).unwrap();
        assert!(dot.starts_with("digraph IdentityGraph {"));
        assert!(dot.contains("subgraph cluster_0"));
        assert!(!dot.contains("cluster_1"));
        assert!(dot.contains("\"canonical:d1\" -> \"device_id:d1\""));
        assert!(dot.contains("color=orange"));
        assert!(dot.contains("0123456789ab…"));
        assert!(dot.trim_end().ends_with('}'));
    }

    #[test]
    fn test_escape_quotes() {
        assert_eq!(escape("a\"b"), "a\\\"b");
    }
}
