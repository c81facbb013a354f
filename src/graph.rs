//! Graphviz DOT output for clusters, paths and relationships.

use std::fmt::Write;

use crate::core::Edge;
use crate::engines::{JobResult, RelationshipResult};

fn push_edge(out: &mut String, indent: &str, edge: &Edge, extra: Option<&str>) {
    let _ = write!(
        out,
        "{indent}\"{}\" -> \"{}\" [ label = \"{}\"",
        edge.source.address, edge.target.address, edge.transaction.hash
    );
    if edge.is_change {
        out.push_str(", style = dashed");
    }
    if let Some(extra) = extra {
        let _ = write!(out, ", {extra}");
    }
    out.push_str(" ]\n");
}

/// One directed edge per line, labelled with the transaction hash.
pub fn render_edges(edges: &[Edge]) -> String {
    let mut out = String::from("digraph G {\n");
    for edge in edges {
        push_edge(&mut out, "  ", edge, None);
    }
    out.push('}');
    out
}

/// Both clusters as subgraphs with the cross edges drawn in red between them.
pub fn render_relationship(result: &RelationshipResult) -> String {
    let mut out = String::from("digraph G {\n");
    for (name, cluster) in [("left", &result.left_cluster), ("right", &result.right_cluster)] {
        let _ = writeln!(out, "  subgraph cluster_{name} {{");
        let _ = writeln!(out, "    label = \"{name}\"");
        for address in &cluster.addresses {
            let _ = writeln!(out, "    \"{}\"", address.address);
        }
        for edge in &cluster.edges {
            push_edge(&mut out, "    ", edge, None);
        }
        out.push_str("  }\n");
    }
    for edge in &result.cross_edges {
        push_edge(&mut out, "  ", edge, Some("color = red"));
    }
    out.push('}');
    out
}

/// DOT form of a job result, for kinds that have one.
pub fn render_result(result: &JobResult) -> Option<String> {
    match result {
        JobResult::Related(cluster) => Some(render_edges(&cluster.edges)),
        JobResult::Distance(path) => Some(render_edges(path.as_ref().map(|p| p.edges.as_slice()).unwrap_or(&[]))),
        JobResult::Relationship(rel) => Some(render_relationship(rel)),
        _ => None,
    }
}
