//! Flow <-> row conversion.
//!
//! `deserialize(&serialize(flow)?)?.flow` is structurally equal to `flow`.
//! Integrity problems (dangling targets, duplicate ids) fail the whole decode;
//! a malformed payload section only costs that node the section, and is
//! reported through [`DecodedFlow::warnings`].

use std::collections::{HashMap, HashSet};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use wayfinder_core::error::{FlowResult, GraphIntegrityError, GraphParseError};
use wayfinder_core::types::{
    Edge, FlowDefinition, NodeKind, Position, StepNode, StepType, Styling, Targeting,
};
use wayfinder_segmentation::validate_allocation;

use crate::rows::{Connection, EncodedFlow, StepRow, VariantRow};
use crate::validate::validate_graph;

const POSITION_X: &str = "position_x";
const POSITION_Y: &str = "position_y";
const CONNECTIONS: &str = "connections";
const MILESTONES: &str = "milestones";
const ACTIONS: &str = "actions";
const NODE_DATA: &str = "node_data";
const BACKGROUND: &str = "background";
const BORDER: &str = "border";
const TEXT_COLOR: &str = "textColor";

/// Keys the codec owns inside `styling`; opaque styling may not use them.
const RESERVED_KEYS: [&str; 9] = [
    POSITION_X,
    POSITION_Y,
    CONNECTIONS,
    MILESTONES,
    ACTIONS,
    NODE_DATA,
    BACKGROUND,
    BORDER,
    TEXT_COLOR,
];

/// A decoded flow plus the node-level problems that were tolerated.
#[derive(Debug, Clone)]
pub struct DecodedFlow {
    pub flow: FlowDefinition,
    pub warnings: Vec<GraphParseError>,
}

/// Encodes a flow into step and variant rows.
pub fn serialize(flow: &FlowDefinition) -> FlowResult<EncodedFlow> {
    let node_ids: HashSet<&str> = flow.nodes.iter().map(|n| n.id.as_str()).collect();
    if node_ids.len() != flow.nodes.len() {
        let mut seen = HashSet::new();
        let duplicate = flow
            .nodes
            .iter()
            .find(|n| !seen.insert(n.id.as_str()))
            .map(|n| n.id.clone())
            .unwrap_or_default();
        return Err(GraphIntegrityError::DuplicateNode(duplicate).into());
    }

    let mut connections: HashMap<&str, Vec<Connection>> = HashMap::new();
    for edge in &flow.edges {
        if !node_ids.contains(edge.source.as_str()) {
            return Err(GraphIntegrityError::DanglingSource {
                edge_id: edge.id.clone(),
                node_id: edge.source.clone(),
            }
            .into());
        }
        if !node_ids.contains(edge.target.as_str()) {
            return Err(GraphIntegrityError::DanglingTarget {
                node_id: edge.source.clone(),
                target: edge.target.clone(),
            }
            .into());
        }
        connections
            .entry(edge.source.as_str())
            .or_default()
            .push(Connection {
                target: edge.target.clone(),
                handle_id: edge.handle_id.clone(),
                condition: edge.condition.clone(),
                id: Some(edge.id.clone()),
            });
    }

    let steps = flow
        .nodes
        .iter()
        .enumerate()
        .map(|(index, node)| {
            let outgoing = connections.remove(node.id.as_str()).unwrap_or_default();
            encode_step(&flow.id, index as u32, node, outgoing)
        })
        .collect::<FlowResult<Vec<_>>>()?;

    let variants = flow
        .variants
        .iter()
        .map(|v| VariantRow::from_variant(&flow.id, v))
        .collect();

    Ok(EncodedFlow {
        flow_id: flow.id.clone(),
        steps,
        variants,
    })
}

/// Validates a flow the way the authoring side must before persisting it.
pub fn prepare_save(flow: &FlowDefinition) -> FlowResult<EncodedFlow> {
    validate_graph(flow)?;
    validate_allocation(&flow.variants)?;
    serialize(flow)
}

fn encode_step(
    flow_id: &str,
    position: u32,
    node: &StepNode,
    connections: Vec<Connection>,
) -> FlowResult<StepRow> {
    if let Some(key) = node
        .styling
        .extra
        .keys()
        .find(|key| RESERVED_KEYS.contains(&key.as_str()))
    {
        return Err(
            GraphParseError::new(&node.id, format!("styling key {key:?} is reserved")).into(),
        );
    }
    let mut styling: Map<String, Value> = node.styling.extra.clone();
    if let Some(background) = &node.styling.background {
        styling.insert(BACKGROUND.into(), background.clone().into());
    }
    if let Some(border) = &node.styling.border {
        styling.insert(BORDER.into(), border.clone().into());
    }
    if let Some(text_color) = &node.styling.text_color {
        styling.insert(TEXT_COLOR.into(), text_color.clone().into());
    }
    styling.insert(POSITION_X.into(), node.position.x.into());
    styling.insert(POSITION_Y.into(), node.position.y.into());
    styling.insert(CONNECTIONS.into(), serde_json::to_value(connections)?);
    styling.insert(MILESTONES.into(), serde_json::to_value(&node.milestones)?);
    styling.insert(ACTIONS.into(), serde_json::to_value(&node.actions)?);
    if let Some(data) = node.kind.data() {
        styling.insert(NODE_DATA.into(), data);
    }

    Ok(StepRow {
        id: node.id.clone(),
        flow_id: flow_id.to_string(),
        title: node.label.clone(),
        content: node.content.clone(),
        step_type: node.step_type().as_str().to_string(),
        position,
        dom_selector: node.targeting.dom_selector.clone(),
        page_url: node.targeting.page_url.clone(),
        targeting_rules: Value::Object(node.targeting.rules.clone()),
        styling: Value::Object(styling),
    })
}

/// Decodes rows back into a flow.
pub fn deserialize(encoded: &EncodedFlow) -> FlowResult<DecodedFlow> {
    let mut warnings = Vec::new();
    let mut seen = HashSet::new();
    let mut decoded: Vec<(u32, StepNode, Vec<Connection>)> = Vec::with_capacity(encoded.steps.len());
    let mut unreadable: HashSet<&str> = HashSet::new();

    for row in &encoded.steps {
        if !seen.insert(row.id.as_str()) {
            return Err(GraphIntegrityError::DuplicateNode(row.id.clone()).into());
        }
        if row.flow_id != encoded.flow_id {
            debug!(
                node_id = %row.id,
                row_flow = %row.flow_id,
                flow_id = %encoded.flow_id,
                "Step row carries a different flow id"
            );
        }
        let Some(step_type) = StepType::parse(&row.step_type) else {
            warnings.push(GraphParseError::new(
                &row.id,
                format!("unknown step type {:?}, node dropped", row.step_type),
            ));
            unreadable.insert(row.id.as_str());
            continue;
        };
        let (node, connections) = decode_step(row, step_type, &mut warnings);
        decoded.push((row.position, node, connections));
    }

    // Stable sort: rows sharing a position keep their stored order.
    decoded.sort_by_key(|(position, _, _)| *position);

    let node_ids: HashSet<&str> = decoded.iter().map(|(_, n, _)| n.id.as_str()).collect();
    let mut edge_ids = HashSet::new();
    let mut edges = Vec::new();
    for (_, node, connections) in &decoded {
        for connection in connections {
            if unreadable.contains(connection.target.as_str()) {
                warnings.push(GraphParseError::new(
                    &node.id,
                    format!("edge to dropped node {} removed", connection.target),
                ));
                continue;
            }
            if !node_ids.contains(connection.target.as_str()) {
                return Err(GraphIntegrityError::DanglingTarget {
                    node_id: node.id.clone(),
                    target: connection.target.clone(),
                }
                .into());
            }
            let id = connection.id.clone().unwrap_or_else(|| {
                Edge::canonical_id(&node.id, &connection.target, connection.handle_id.as_deref())
            });
            if !edge_ids.insert(id.clone()) {
                return Err(GraphIntegrityError::DuplicateEdge(id).into());
            }
            edges.push(Edge {
                id,
                source: node.id.clone(),
                target: connection.target.clone(),
                handle_id: connection.handle_id.clone(),
                condition: connection.condition.clone(),
            });
        }
    }

    let nodes = decoded.into_iter().map(|(_, node, _)| node).collect();
    let variants = encoded
        .variants
        .iter()
        .cloned()
        .map(VariantRow::into_variant)
        .collect();

    if !warnings.is_empty() {
        warn!(
            flow_id = %encoded.flow_id,
            warnings = warnings.len(),
            "Flow decoded with dropped payload sections"
        );
    }

    Ok(DecodedFlow {
        flow: FlowDefinition {
            id: encoded.flow_id.clone(),
            nodes,
            edges,
            variants,
        },
        warnings,
    })
}

fn decode_step(
    row: &StepRow,
    step_type: StepType,
    warnings: &mut Vec<GraphParseError>,
) -> (StepNode, Vec<Connection>) {
    let mut payload = styling_object(row, warnings);

    let x = take_section::<f64>(&mut payload, POSITION_X, &row.id, warnings).unwrap_or_default();
    let y = take_section::<f64>(&mut payload, POSITION_Y, &row.id, warnings).unwrap_or_default();
    let connections =
        take_section::<Vec<Connection>>(&mut payload, CONNECTIONS, &row.id, warnings)
            .unwrap_or_default();
    let milestones =
        take_section(&mut payload, MILESTONES, &row.id, warnings).unwrap_or_default();
    let actions = take_section(&mut payload, ACTIONS, &row.id, warnings).unwrap_or_default();
    let background = take_section(&mut payload, BACKGROUND, &row.id, warnings);
    let border = take_section(&mut payload, BORDER, &row.id, warnings);
    let text_color = take_section(&mut payload, TEXT_COLOR, &row.id, warnings);

    let node_data = payload.remove(NODE_DATA);
    let kind = NodeKind::from_parts(step_type, node_data).unwrap_or_else(|e| {
        warnings.push(GraphParseError::new(
            &row.id,
            format!("{NODE_DATA}: {e}"),
        ));
        NodeKind::default_for(step_type)
    });

    let rules = match &row.targeting_rules {
        Value::Object(rules) => rules.clone(),
        Value::Null => Map::new(),
        other => {
            warnings.push(GraphParseError::new(
                &row.id,
                format!("targeting_rules is not an object: {other}"),
            ));
            Map::new()
        }
    };

    let node = StepNode {
        id: row.id.clone(),
        kind,
        position: Position { x, y },
        label: row.title.clone(),
        content: row.content.clone(),
        milestones,
        actions,
        targeting: Targeting {
            dom_selector: row.dom_selector.clone(),
            page_url: row.page_url.clone(),
            rules,
        },
        styling: Styling {
            background,
            border,
            text_color,
            extra: payload,
        },
    };
    (node, connections)
}

fn styling_object(row: &StepRow, warnings: &mut Vec<GraphParseError>) -> Map<String, Value> {
    match &row.styling {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        Value::String(raw) => match serde_json::from_str::<Map<String, Value>>(raw) {
            Ok(map) => map,
            Err(e) => {
                warnings.push(GraphParseError::new(
                    &row.id,
                    format!("styling payload is not valid JSON: {e}"),
                ));
                Map::new()
            }
        },
        other => {
            warnings.push(GraphParseError::new(
                &row.id,
                format!("styling payload is not an object: {other}"),
            ));
            Map::new()
        }
    }
}

/// Removes and parses one payload section. A malformed section becomes a
/// warning and `None`; an absent or null one is silently `None`.
fn take_section<T: DeserializeOwned>(
    payload: &mut Map<String, Value>,
    key: &str,
    node_id: &str,
    warnings: &mut Vec<GraphParseError>,
) -> Option<T> {
    match payload.remove(key)? {
        Value::Null => None,
        value => match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warnings.push(GraphParseError::new(node_id, format!("{key}: {e}")));
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wayfinder_core::error::FlowError;
    use wayfinder_core::types::{
        Action, ActionTrigger, ActionType, DelayData, Milestone, Variant,
    };

    fn sample_flow() -> FlowDefinition {
        let mut welcome = StepNode::new("welcome", NodeKind::Modal);
        welcome.label = "Welcome".into();
        welcome.position = Position { x: 10.0, y: 20.0 };
        welcome.milestones = vec![
            Milestone {
                id: "m0".into(),
                title: "Hello".into(),
                ..Default::default()
            },
            Milestone {
                id: "m1".into(),
                title: "Tell us about you".into(),
                ..Default::default()
            },
        ];
        welcome.actions = vec![Action::new("track", ActionType::Analytics, ActionTrigger::OnView)];
        welcome.styling.background = Some("#fff".into());
        welcome.styling.extra.insert("shadow".into(), json!("lg"));

        let wait = StepNode::new("wait", NodeKind::Delay(DelayData { duration_ms: 5000 }));
        let mut tip = StepNode::new("tip", NodeKind::Tooltip(Default::default()));
        tip.targeting.dom_selector = Some("#save".into());
        tip.targeting.rules.insert("device".into(), json!("desktop"));

        let mut flow = FlowDefinition::new("flow-1");
        flow.nodes = vec![welcome, wait, tip];
        flow.edges = vec![Edge::new("welcome", "wait", None), Edge::new("wait", "tip", None)];
        flow.variants = vec![Variant::new("A", "Control copy", 50.0)];
        flow
    }

    #[test]
    fn test_round_trip() {
        let flow = sample_flow();
        let encoded = serialize(&flow).unwrap();
        assert_eq!(encoded.steps.len(), 3);
        assert_eq!(encoded.variants[0].flow_id, "flow-1");

        let decoded = deserialize(&encoded).unwrap();
        assert!(decoded.warnings.is_empty());
        assert!(decoded.flow.structurally_eq(&flow));
        assert_eq!(decoded.flow, flow);
    }

    #[test]
    fn test_connections_embedded_in_styling() {
        let encoded = serialize(&sample_flow()).unwrap();
        let welcome = &encoded.steps[0];
        assert_eq!(welcome.step_type, "modal");
        assert_eq!(welcome.styling["connections"][0]["target"], "wait");
        assert_eq!(welcome.styling["position_x"], 10.0);
        assert_eq!(welcome.styling["shadow"], "lg");

        let wait = &encoded.steps[1];
        assert_eq!(wait.step_type, "delay");
        assert_eq!(wait.styling["node_data"]["durationMs"], 5000);
    }

    #[test]
    fn test_rows_out_of_order_are_sorted_by_position() {
        let flow = sample_flow();
        let mut encoded = serialize(&flow).unwrap();
        encoded.steps.reverse();
        let decoded = deserialize(&encoded).unwrap();
        let ids: Vec<_> = decoded.flow.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["welcome", "wait", "tip"]);
    }

    #[test]
    fn test_dangling_target_is_integrity_error() {
        let mut encoded = serialize(&sample_flow()).unwrap();
        encoded.steps[0].styling["connections"] = json!([{ "target": "ghost" }]);
        let err = deserialize(&encoded).unwrap_err();
        assert!(matches!(
            err,
            FlowError::GraphIntegrity(GraphIntegrityError::DanglingTarget { ref target, .. }) if target == "ghost"
        ));
    }

    #[test]
    fn test_duplicate_row_is_integrity_error() {
        let mut encoded = serialize(&sample_flow()).unwrap();
        let copy = encoded.steps[0].clone();
        encoded.steps.push(copy);
        assert!(matches!(
            deserialize(&encoded),
            Err(FlowError::GraphIntegrity(GraphIntegrityError::DuplicateNode(_)))
        ));
    }

    #[test]
    fn test_malformed_connections_drop_only_that_node() {
        let mut encoded = serialize(&sample_flow()).unwrap();
        encoded.steps[0].styling["connections"] = json!("not-a-list");

        let decoded = deserialize(&encoded).unwrap();
        assert_eq!(decoded.warnings.len(), 1);
        assert_eq!(decoded.warnings[0].node_id, "welcome");
        assert_eq!(decoded.flow.nodes.len(), 3);
        assert_eq!(decoded.flow.edges.len(), 1);
        assert_eq!(decoded.flow.edges[0].source, "wait");
        // Sections other than the broken one survive.
        assert_eq!(decoded.flow.nodes[0].milestones.len(), 2);
    }

    #[test]
    fn test_unparseable_styling_string() {
        let mut encoded = serialize(&sample_flow()).unwrap();
        encoded.steps[1].styling = json!("{not json");
        let decoded = deserialize(&encoded).unwrap();
        assert_eq!(decoded.warnings.len(), 1);
        assert_eq!(decoded.warnings[0].node_id, "wait");
        assert_eq!(decoded.flow.edges.len(), 1);
        assert_eq!(
            decoded.flow.nodes[1].kind,
            NodeKind::Delay(DelayData::default())
        );
    }

    #[test]
    fn test_styling_as_encoded_string() {
        let mut encoded = serialize(&sample_flow()).unwrap();
        let as_text = encoded.steps[0].styling.to_string();
        encoded.steps[0].styling = Value::String(as_text);
        let decoded = deserialize(&encoded).unwrap();
        assert!(decoded.warnings.is_empty());
        assert!(decoded.flow.structurally_eq(&sample_flow()));
    }

    #[test]
    fn test_unknown_step_type_drops_node_and_its_edges() {
        let mut encoded = serialize(&sample_flow()).unwrap();
        encoded.steps[2].step_type = "carousel".into();

        let decoded = deserialize(&encoded).unwrap();
        let ids: Vec<_> = decoded.flow.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, ["welcome", "wait"]);
        assert_eq!(decoded.flow.edges.len(), 1);
        assert_eq!(decoded.flow.edges[0].target, "wait");

        let warned: Vec<_> = decoded.warnings.iter().map(|w| w.node_id.as_str()).collect();
        assert_eq!(warned, ["tip", "wait"]);
    }

    #[test]
    fn test_reserved_styling_key_is_rejected() {
        for key in ["node_data", "background", "connections"] {
            let mut flow = sample_flow();
            flow.nodes[0].styling.extra.insert(key.into(), json!({ "k": 1 }));
            assert!(matches!(
                serialize(&flow),
                Err(FlowError::GraphParse(GraphParseError { ref node_id, ref message }))
                    if node_id == "welcome" && message.contains(key)
            ));
        }
    }

    #[test]
    fn test_missing_connection_id_gets_canonical_id() {
        let mut encoded = serialize(&sample_flow()).unwrap();
        encoded.steps[0].styling["connections"] = json!([{ "target": "wait", "handleId": "a" }]);
        let decoded = deserialize(&encoded).unwrap();
        assert!(decoded.flow.edges.iter().any(|e| e.id == "e-welcome-a-wait"));
    }

    #[test]
    fn test_serialize_rejects_dangling_edge() {
        let mut flow = sample_flow();
        flow.edges.push(Edge::new("tip", "nowhere", None));
        assert!(matches!(
            serialize(&flow),
            Err(FlowError::GraphIntegrity(GraphIntegrityError::DanglingTarget { .. }))
        ));
    }

    #[test]
    fn test_prepare_save_checks_allocation() {
        let mut flow = sample_flow();
        flow.variants.push(Variant::new("B", "Bold copy", 60.0));
        assert!(matches!(
            prepare_save(&flow),
            Err(FlowError::SegmentAssignment(_))
        ));

        flow.variants[1].traffic_percentage = 50.0;
        assert!(prepare_save(&flow).is_ok());
    }
}
