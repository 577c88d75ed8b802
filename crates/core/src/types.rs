use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Handle id reserved for a node's "skip" exit.
pub const SKIP_HANDLE: &str = "skip";

/// An authored onboarding flow: typed step nodes wired into a directed graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    pub nodes: Vec<StepNode>,
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub variants: Vec<Variant>,
}

impl FlowDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            variants: Vec::new(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&StepNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn contains_node(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    /// Outgoing edges of `node_id` in authored order.
    pub fn outgoing<'a: 'b, 'b>(
        &'a self,
        node_id: &'b str,
    ) -> impl Iterator<Item = &'a Edge> + 'b {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    /// The edge followed when a non-branch node completes: the first edge
    /// without a handle, else the first edge whose handle is not the skip exit.
    pub fn primary_edge(&self, node_id: &str) -> Option<&Edge> {
        self.outgoing(node_id)
            .find(|e| e.handle_id.is_none())
            .or_else(|| {
                self.outgoing(node_id)
                    .find(|e| e.handle_id.as_deref() != Some(SKIP_HANDLE))
            })
    }

    pub fn skip_edge(&self, node_id: &str) -> Option<&Edge> {
        self.outgoing(node_id)
            .find(|e| e.handle_id.as_deref() == Some(SKIP_HANDLE))
    }

    /// First node in authored order without incoming edges; falls back to the
    /// first node when every node has a predecessor.
    pub fn entry_node(&self) -> Option<&StepNode> {
        self.nodes
            .iter()
            .find(|n| !self.edges.iter().any(|e| e.target == n.id))
            .or_else(|| self.nodes.first())
    }

    pub fn variant(&self, id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == id)
    }

    /// Equality that ignores node and edge ordering.
    pub fn structurally_eq(&self, other: &FlowDefinition) -> bool {
        if self.id != other.id
            || self.nodes.len() != other.nodes.len()
            || self.edges.len() != other.edges.len()
            || self.variants != other.variants
        {
            return false;
        }
        let nodes: BTreeMap<&str, &StepNode> =
            self.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let edges: BTreeMap<&str, &Edge> = self.edges.iter().map(|e| (e.id.as_str(), e)).collect();
        other
            .nodes
            .iter()
            .all(|n| nodes.get(n.id.as_str()).is_some_and(|mine| *mine == n))
            && other
                .edges
                .iter()
                .all(|e| edges.get(e.id.as_str()).is_some_and(|mine| *mine == e))
    }
}

/// One typed unit in the flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepNode {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub targeting: Targeting,
    #[serde(default)]
    pub styling: Styling,
}

impl StepNode {
    /// A bare node of the given kind with no milestones, actions or targeting.
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            position: Position::default(),
            label: String::new(),
            content: String::new(),
            milestones: Vec::new(),
            actions: Vec::new(),
            targeting: Targeting::default(),
            styling: Styling::default(),
        }
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }
}

/// Layout coordinates from the editor canvas. Not semantic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Plain discriminant of [`NodeKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepType {
    Modal,
    Tooltip,
    Hotspot,
    Checklist,
    Branch,
    Delay,
    ApiTrigger,
    AbSwitch,
}

impl StepType {
    pub const ALL: [StepType; 8] = [
        StepType::Modal,
        StepType::Tooltip,
        StepType::Hotspot,
        StepType::Checklist,
        StepType::Branch,
        StepType::Delay,
        StepType::ApiTrigger,
        StepType::AbSwitch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Modal => "modal",
            StepType::Tooltip => "tooltip",
            StepType::Hotspot => "hotspot",
            StepType::Checklist => "checklist",
            StepType::Branch => "branch",
            StepType::Delay => "delay",
            StepType::ApiTrigger => "apiTrigger",
            StepType::AbSwitch => "abSwitch",
        }
    }

    pub fn parse(raw: &str) -> Option<StepType> {
        StepType::ALL.into_iter().find(|t| t.as_str() == raw)
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-type node data, keyed by `step_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step_type", content = "data", rename_all = "camelCase")]
pub enum NodeKind {
    Modal,
    Tooltip(TooltipData),
    Hotspot,
    Checklist,
    Branch,
    Delay(DelayData),
    ApiTrigger(ApiTriggerData),
    AbSwitch,
}

impl NodeKind {
    pub fn step_type(&self) -> StepType {
        match self {
            NodeKind::Modal => StepType::Modal,
            NodeKind::Tooltip(_) => StepType::Tooltip,
            NodeKind::Hotspot => StepType::Hotspot,
            NodeKind::Checklist => StepType::Checklist,
            NodeKind::Branch => StepType::Branch,
            NodeKind::Delay(_) => StepType::Delay,
            NodeKind::ApiTrigger(_) => StepType::ApiTrigger,
            NodeKind::AbSwitch => StepType::AbSwitch,
        }
    }

    /// Kind with default data for a freshly added node.
    pub fn default_for(step_type: StepType) -> NodeKind {
        match step_type {
            StepType::Modal => NodeKind::Modal,
            StepType::Tooltip => NodeKind::Tooltip(TooltipData::default()),
            StepType::Hotspot => NodeKind::Hotspot,
            StepType::Checklist => NodeKind::Checklist,
            StepType::Branch => NodeKind::Branch,
            StepType::Delay => NodeKind::Delay(DelayData::default()),
            StepType::ApiTrigger => NodeKind::ApiTrigger(ApiTriggerData::default()),
            StepType::AbSwitch => NodeKind::AbSwitch,
        }
    }

    /// Per-type data as a JSON value, `None` for kinds that carry none.
    pub fn data(&self) -> Option<serde_json::Value> {
        let value = match self {
            NodeKind::Tooltip(data) => serde_json::to_value(data),
            NodeKind::Delay(data) => serde_json::to_value(data),
            NodeKind::ApiTrigger(data) => serde_json::to_value(data),
            _ => return None,
        };
        value.ok()
    }

    /// Rebuilds a kind from its persisted `step_type` and optional data.
    pub fn from_parts(
        step_type: StepType,
        data: Option<serde_json::Value>,
    ) -> Result<NodeKind, serde_json::Error> {
        let default = NodeKind::default_for(step_type);
        if default.data().is_none() {
            return Ok(default);
        }
        match data {
            Some(data) if !data.is_null() => serde_json::from_value(serde_json::json!({
                "step_type": step_type.as_str(),
                "data": data,
            })),
            _ => Ok(default),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TooltipData {
    #[serde(default)]
    pub placement: Placement,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    #[default]
    Auto,
    Top,
    Bottom,
    Left,
    Right,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayData {
    #[serde(default)]
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTriggerData {
    /// Action dispatched on entry; defaults to the node's first `api_call`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Page gate for a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Targeting {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dom_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    /// Persisted `targeting_rules`, carried verbatim.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub rules: serde_json::Map<String, serde_json::Value>,
}

impl Targeting {
    pub fn is_unconstrained(&self) -> bool {
        self.dom_selector.as_deref().map_or(true, str::is_empty)
            && self.page_url.as_deref().map_or(true, str::is_empty)
    }
}

/// Visual styling. Opaque to the engine; unknown keys survive a round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Styling {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub border: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_color: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Edge {
    /// Edge with the canonical id for its endpoints and handle.
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        handle_id: Option<String>,
    ) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: Edge::canonical_id(&source, &target, handle_id.as_deref()),
            source,
            target,
            handle_id,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn canonical_id(source: &str, target: &str, handle: Option<&str>) -> String {
        match handle {
            Some(handle) => format!("e-{source}-{handle}-{target}"),
            None => format!("e-{source}-{target}"),
        }
    }
}

/// An ordered sub-stage within one step node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub form_fields: Vec<FormField>,
}

/// An input or button declared inside a milestone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormField {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(
        default,
        deserialize_with = "explicit_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub validation: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default)]
    pub is_button: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button_action: Option<ButtonAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button_api_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button_url: Option<String>,
    #[serde(default)]
    pub button_collect_metrics: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Text,
    Email,
    Number,
    Textarea,
    Richtext,
    Select,
    Checkbox,
    Button,
}

/// An absent key is `None`; an explicit `null` stays `Some(Value::Null)`.
fn explicit_value<'de, D>(deserializer: D) -> Result<Option<serde_json::Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    serde_json::Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonAction {
    Next,
    Previous,
    Skip,
    Complete,
    Api,
    Url,
}

/// A declared side effect tied to a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub trigger: ActionTrigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub button_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(
        default,
        deserialize_with = "explicit_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload: Option<serde_json::Value>,
    /// Blocking actions must succeed before traversal continues.
    #[serde(default)]
    pub blocking: bool,
}

impl Action {
    pub fn new(id: impl Into<String>, action_type: ActionType, trigger: ActionTrigger) -> Self {
        Self {
            id: id.into(),
            action_type,
            trigger,
            button_id: None,
            endpoint: None,
            method: None,
            headers: BTreeMap::new(),
            payload: None,
            blocking: false,
        }
    }

    pub fn for_button(mut self, button_id: impl Into<String>) -> Self {
        self.button_id = Some(button_id.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ApiCall,
    Analytics,
    Navigation,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTrigger {
    OnView,
    OnComplete,
    OnSkip,
    OnButtonClick,
}

/// One arm of an A/B test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub name: String,
    pub traffic_percentage: f64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl Variant {
    pub fn new(id: impl Into<String>, name: impl Into<String>, traffic_percentage: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            traffic_percentage,
            is_active: true,
        }
    }
}

/// Lifecycle analytics event, stored as one analytics row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub id: Uuid,
    pub event_type: EventType,
    pub flow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Runtime only: the milestone shown with a `view`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone_index: Option<usize>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    View,
    Complete,
    Skip,
    Click,
}

impl EventType {
    pub fn parse(raw: &str) -> Option<EventType> {
        match raw {
            "view" => Some(EventType::View),
            "complete" => Some(EventType::Complete),
            "skip" => Some(EventType::Skip),
            "click" => Some(EventType::Click),
            _ => None,
        }
    }
}

/// Where a visitor currently stands in a flow. Owned by the runtime player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitorPosition {
    pub flow_id: String,
    pub visitor_id: String,
    pub current_node_id: String,
    pub current_milestone_index: usize,
    pub assigned_variant_id: Option<String>,
    /// Presented nodes, oldest first; the last entry is the current node.
    #[serde(default)]
    pub history: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl VisitorPosition {
    pub fn new(
        flow_id: impl Into<String>,
        visitor_id: impl Into<String>,
        current_node_id: impl Into<String>,
        assigned_variant_id: Option<String>,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            visitor_id: visitor_id.into(),
            current_node_id: current_node_id.into(),
            current_milestone_index: 0,
            assigned_variant_id,
            history: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}
