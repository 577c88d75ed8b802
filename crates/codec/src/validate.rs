//! Authoring-side graph integrity checks.

use std::collections::{HashMap, HashSet};

use wayfinder_core::error::GraphIntegrityError;
use wayfinder_core::types::{FlowDefinition, StepType};

const PRIMARY_EXIT: &str = "<primary>";

/// Checks ids, edge endpoints and the exit rules of every node.
///
/// - node and edge ids are unique, and every edge endpoint exists;
/// - a `branch` node has at least two outgoing edges, each with its own handle;
/// - an `abSwitch` node has at least one outgoing edge and no repeated handle;
/// - any other node has at most one edge per exit handle.
pub fn validate_graph(flow: &FlowDefinition) -> Result<(), GraphIntegrityError> {
    let mut node_ids = HashSet::new();
    for node in &flow.nodes {
        if !node_ids.insert(node.id.as_str()) {
            return Err(GraphIntegrityError::DuplicateNode(node.id.clone()));
        }
    }

    let mut edge_ids = HashSet::new();
    let mut exits: HashMap<&str, Vec<Option<&str>>> = HashMap::new();
    for edge in &flow.edges {
        if !edge_ids.insert(edge.id.as_str()) {
            return Err(GraphIntegrityError::DuplicateEdge(edge.id.clone()));
        }
        if !node_ids.contains(edge.source.as_str()) {
            return Err(GraphIntegrityError::DanglingSource {
                edge_id: edge.id.clone(),
                node_id: edge.source.clone(),
            });
        }
        if !node_ids.contains(edge.target.as_str()) {
            return Err(GraphIntegrityError::DanglingTarget {
                node_id: edge.source.clone(),
                target: edge.target.clone(),
            });
        }
        exits
            .entry(edge.source.as_str())
            .or_default()
            .push(edge.handle_id.as_deref());
    }

    for node in &flow.nodes {
        let handles = exits.get(node.id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
        match node.step_type() {
            StepType::Branch => {
                if handles.len() < 2 {
                    return Err(router_error(&node.id, "needs at least two outgoing edges"));
                }
                if handles.iter().any(Option::is_none) {
                    return Err(router_error(&node.id, "every outgoing edge needs a handle"));
                }
                ensure_distinct(&node.id, handles, true)?;
            }
            StepType::AbSwitch => {
                if handles.is_empty() {
                    return Err(router_error(&node.id, "needs at least one outgoing edge"));
                }
                ensure_distinct(&node.id, handles, true)?;
            }
            _ => ensure_distinct(&node.id, handles, false)?,
        }
    }

    Ok(())
}

fn ensure_distinct(
    node_id: &str,
    handles: &[Option<&str>],
    router: bool,
) -> Result<(), GraphIntegrityError> {
    let mut seen = HashSet::new();
    for handle in handles {
        let key = handle.unwrap_or(PRIMARY_EXIT);
        if !seen.insert(key) {
            return Err(if router {
                router_error(node_id, &format!("handle {key} is used twice"))
            } else {
                GraphIntegrityError::AmbiguousExit {
                    node_id: node_id.to_string(),
                    handle: key.to_string(),
                }
            });
        }
    }
    Ok(())
}

fn router_error(node_id: &str, reason: &str) -> GraphIntegrityError {
    GraphIntegrityError::RouterHandles {
        node_id: node_id.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayfinder_core::types::{Edge, NodeKind, StepNode};

    fn flow_with(nodes: &[(&str, NodeKind)], edges: Vec<Edge>) -> FlowDefinition {
        let mut flow = FlowDefinition::new("flow-1");
        flow.nodes = nodes
            .iter()
            .map(|(id, kind)| StepNode::new(*id, kind.clone()))
            .collect();
        flow.edges = edges;
        flow
    }

    #[test]
    fn test_valid_branch() {
        let flow = flow_with(
            &[
                ("q", NodeKind::Branch),
                ("a", NodeKind::Modal),
                ("b", NodeKind::Modal),
            ],
            vec![
                Edge::new("q", "a", Some("yes".into())).with_condition("answered=yes"),
                Edge::new("q", "b", Some("no".into())),
            ],
        );
        assert!(validate_graph(&flow).is_ok());
    }

    #[test]
    fn test_branch_needs_two_distinct_handles() {
        let single = flow_with(
            &[("q", NodeKind::Branch), ("a", NodeKind::Modal)],
            vec![Edge::new("q", "a", Some("yes".into()))],
        );
        assert!(matches!(
            validate_graph(&single),
            Err(GraphIntegrityError::RouterHandles { .. })
        ));

        let mut repeated = flow_with(
            &[
                ("q", NodeKind::Branch),
                ("a", NodeKind::Modal),
                ("b", NodeKind::Modal),
            ],
            vec![
                Edge::new("q", "a", Some("yes".into())),
                Edge::new("q", "b", Some("yes".into())),
            ],
        );
        assert!(validate_graph(&repeated).is_err());

        repeated.edges[1] = Edge::new("q", "b", None);
        assert!(validate_graph(&repeated).is_err());
    }

    #[test]
    fn test_non_router_single_primary_exit() {
        let mut flow = flow_with(
            &[
                ("a", NodeKind::Modal),
                ("b", NodeKind::Modal),
                ("c", NodeKind::Modal),
            ],
            vec![Edge::new("a", "b", None), Edge::new("a", "c", Some("skip".into()))],
        );
        assert!(validate_graph(&flow).is_ok());

        flow.edges.push(Edge {
            id: "e-extra".into(),
            ..Edge::new("a", "c", None)
        });
        assert!(matches!(
            validate_graph(&flow),
            Err(GraphIntegrityError::AmbiguousExit { .. })
        ));
    }

    #[test]
    fn test_dangling_and_duplicate_ids() {
        let dangling = flow_with(&[("a", NodeKind::Modal)], vec![Edge::new("a", "zz", None)]);
        assert!(matches!(
            validate_graph(&dangling),
            Err(GraphIntegrityError::DanglingTarget { .. })
        ));

        let duplicate = flow_with(&[("a", NodeKind::Modal), ("a", NodeKind::Hotspot)], vec![]);
        assert_eq!(
            validate_graph(&duplicate),
            Err(GraphIntegrityError::DuplicateNode("a".into()))
        );
    }
}
