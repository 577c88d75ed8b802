//! Editor messages.
//!
//! The visual editor reports canvas gestures as discrete messages; a
//! [`FlowDraft`] folds them into a [`FlowDefinition`] so the engine never
//! depends on any particular UI event system.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use wayfinder_core::error::GraphIntegrityError;
use wayfinder_core::types::{Edge, FlowDefinition, NodeKind, Position, StepNode, StepType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum EditorMessage {
    NodeAdded {
        step_type: StepType,
        label: String,
        position: Position,
    },
    NodeRemoved {
        node_id: String,
    },
    NodeMoved {
        node_id: String,
        position: Position,
    },
    NodeRelabeled {
        node_id: String,
        label: String,
    },
    EdgeConnected {
        source: String,
        target: String,
        handle: Option<String>,
    },
    EdgeRemoved {
        edge_id: String,
    },
    EdgeConditionSet {
        edge_id: String,
        condition: Option<String>,
    },
}

/// What applying a message changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DraftChange {
    NodeCreated(String),
    NodeDeleted { node_id: String, edges_removed: usize },
    NodeUpdated(String),
    EdgeCreated(String),
    EdgeDeleted(String),
    EdgeUpdated(String),
}

/// A flow under edit.
#[derive(Debug, Clone)]
pub struct FlowDraft {
    flow: FlowDefinition,
}

impl FlowDraft {
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self {
            flow: FlowDefinition::new(flow_id),
        }
    }

    pub fn from_flow(flow: FlowDefinition) -> Self {
        Self { flow }
    }

    pub fn flow(&self) -> &FlowDefinition {
        &self.flow
    }

    pub fn into_flow(self) -> FlowDefinition {
        self.flow
    }

    pub fn apply(&mut self, message: EditorMessage) -> Result<DraftChange, GraphIntegrityError> {
        match message {
            EditorMessage::NodeAdded {
                step_type,
                label,
                position,
            } => {
                // Fresh v4 ids are never reused, even after a node is removed.
                let id = Uuid::new_v4().to_string();
                let mut node = StepNode::new(id.clone(), NodeKind::default_for(step_type));
                node.label = label;
                node.position = position;
                self.flow.nodes.push(node);
                debug!(flow_id = %self.flow.id, node_id = %id, %step_type, "Node added");
                Ok(DraftChange::NodeCreated(id))
            }
            EditorMessage::NodeRemoved { node_id } => {
                let index = self.node_index(&node_id)?;
                self.flow.nodes.remove(index);
                let before = self.flow.edges.len();
                self.flow
                    .edges
                    .retain(|e| e.source != node_id && e.target != node_id);
                Ok(DraftChange::NodeDeleted {
                    edges_removed: before - self.flow.edges.len(),
                    node_id,
                })
            }
            EditorMessage::NodeMoved { node_id, position } => {
                let index = self.node_index(&node_id)?;
                self.flow.nodes[index].position = position;
                Ok(DraftChange::NodeUpdated(node_id))
            }
            EditorMessage::NodeRelabeled { node_id, label } => {
                let index = self.node_index(&node_id)?;
                self.flow.nodes[index].label = label;
                Ok(DraftChange::NodeUpdated(node_id))
            }
            EditorMessage::EdgeConnected {
                source,
                target,
                handle,
            } => {
                self.node_index(&source)?;
                if !self.flow.contains_node(&target) {
                    return Err(GraphIntegrityError::DanglingTarget {
                        node_id: source,
                        target,
                    });
                }
                let edge = Edge::new(source, target, handle);
                if self.flow.edges.iter().any(|e| e.id == edge.id) {
                    return Err(GraphIntegrityError::DuplicateEdge(edge.id));
                }
                let id = edge.id.clone();
                self.flow.edges.push(edge);
                Ok(DraftChange::EdgeCreated(id))
            }
            EditorMessage::EdgeRemoved { edge_id } => {
                let index = self.edge_index(&edge_id)?;
                self.flow.edges.remove(index);
                Ok(DraftChange::EdgeDeleted(edge_id))
            }
            EditorMessage::EdgeConditionSet { edge_id, condition } => {
                let index = self.edge_index(&edge_id)?;
                self.flow.edges[index].condition = condition;
                Ok(DraftChange::EdgeUpdated(edge_id))
            }
        }
    }

    fn node_index(&self, node_id: &str) -> Result<usize, GraphIntegrityError> {
        self.flow
            .nodes
            .iter()
            .position(|n| n.id == node_id)
            .ok_or_else(|| GraphIntegrityError::UnknownNode(node_id.to_string()))
    }

    fn edge_index(&self, edge_id: &str) -> Result<usize, GraphIntegrityError> {
        self.flow
            .edges
            .iter()
            .position(|e| e.id == edge_id)
            .ok_or_else(|| GraphIntegrityError::UnknownEdge(edge_id.to_string()))
    }
}
