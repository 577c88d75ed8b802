//! Storage row shapes. These mirror the external store's tables exactly.

use serde::{Deserialize, Serialize};

use wayfinder_core::types::Variant;

/// One persisted step. Outgoing edges, milestones and actions travel inside
/// the `styling` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRow {
    pub id: String,
    pub flow_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub step_type: String,
    /// Authored order of the node within its flow.
    #[serde(default)]
    pub position: u32,
    #[serde(default)]
    pub dom_selector: Option<String>,
    #[serde(default)]
    pub page_url: Option<String>,
    #[serde(default)]
    pub targeting_rules: serde_json::Value,
    /// JSON object, or a JSON-encoded string of one.
    #[serde(default)]
    pub styling: serde_json::Value,
}

/// An outgoing edge as embedded in its source node's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub target: String,
    #[serde(rename = "handleId", default, skip_serializing_if = "Option::is_none")]
    pub handle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRow {
    pub id: String,
    pub flow_id: String,
    pub name: String,
    pub traffic_percentage: f64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl VariantRow {
    pub fn from_variant(flow_id: &str, variant: &Variant) -> Self {
        Self {
            id: variant.id.clone(),
            flow_id: flow_id.to_string(),
            name: variant.name.clone(),
            traffic_percentage: variant.traffic_percentage,
            is_active: variant.is_active,
        }
    }

    pub fn into_variant(self) -> Variant {
        Variant {
            id: self.id,
            name: self.name,
            traffic_percentage: self.traffic_percentage,
            is_active: self.is_active,
        }
    }
}

/// Every row that makes up one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedFlow {
    pub flow_id: String,
    pub steps: Vec<StepRow>,
    #[serde(default)]
    pub variants: Vec<VariantRow>,
}
