use thiserror::Error;

pub type FlowResult<T> = Result<T, FlowError>;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Graph integrity error: {0}")]
    GraphIntegrity(#[from] GraphIntegrityError),

    #[error("Graph parse error: {0}")]
    GraphParse(#[from] GraphParseError),

    #[error("Segment assignment error: {0}")]
    SegmentAssignment(#[from] SegmentAssignmentError),

    #[error("Targeting timeout: {0}")]
    TargetingTimeout(#[from] TargetingTimeoutError),

    #[error("Action dispatch error: {0}")]
    ActionDispatch(#[from] ActionDispatchError),

    #[error("Branch resolution error: {0}")]
    BranchResolution(#[from] BranchResolutionError),

    #[error("Skip chain error: {0}")]
    DelayCycle(#[from] DelayCycleError),

    #[error("Invalid player transition from {from} via {trigger}")]
    InvalidTransition { from: String, trigger: String },

    #[error("Position store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphIntegrityError {
    #[error("duplicate node id {0}")]
    DuplicateNode(String),

    #[error("node {node_id} connects to unknown node {target}")]
    DanglingTarget { node_id: String, target: String },

    #[error("edge {edge_id} starts at unknown node {node_id}")]
    DanglingSource { edge_id: String, node_id: String },

    #[error("duplicate edge id {0}")]
    DuplicateEdge(String),

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("unknown edge {0}")]
    UnknownEdge(String),

    #[error("router node {node_id}: {reason}")]
    RouterHandles { node_id: String, reason: String },

    #[error("node {node_id} has more than one edge for exit {handle}")]
    AmbiguousExit { node_id: String, handle: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("node {node_id}: {message}")]
pub struct GraphParseError {
    pub node_id: String,
    pub message: String,
}

impl GraphParseError {
    pub fn new(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SegmentAssignmentError {
    #[error("variant {variant_id} has traffic percentage {value} outside 0-100")]
    OutOfRange { variant_id: String, value: f64 },

    #[error("variants allocate {total}% of traffic, more than 100%")]
    OverAllocated { total: f64 },

    #[error("duplicate variant id {0}")]
    DuplicateVariant(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("selector {selector:?} for node {node_id} did not resolve within {waited_ms}ms")]
pub struct TargetingTimeoutError {
    pub node_id: String,
    pub selector: String,
    pub waited_ms: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionDispatchError {
    #[error("action {action_id} timed out after {timeout_ms}ms")]
    Timeout { action_id: String, timeout_ms: u64 },

    #[error("action {action_id} transport failure: {message}")]
    Transport { action_id: String, message: String },

    #[error("action {action_id} failed with HTTP status {status}")]
    Status { action_id: String, status: u16 },

    #[error("action {action_id} has no endpoint")]
    MissingEndpoint { action_id: String },

    #[error("action {action_id} has invalid method {method}")]
    InvalidMethod { action_id: String, method: String },

    #[error("action {action_id} was aborted")]
    Aborted { action_id: String },
}

impl ActionDispatchError {
    pub fn action_id(&self) -> &str {
        match self {
            ActionDispatchError::Timeout { action_id, .. }
            | ActionDispatchError::Transport { action_id, .. }
            | ActionDispatchError::Status { action_id, .. }
            | ActionDispatchError::MissingEndpoint { action_id }
            | ActionDispatchError::InvalidMethod { action_id, .. }
            | ActionDispatchError::Aborted { action_id } => action_id,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no outgoing edge of node {node_id} resolved")]
pub struct BranchResolutionError {
    pub node_id: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("skipped {limit} nodes in a row starting at {node_id}")]
pub struct DelayCycleError {
    pub node_id: String,
    pub limit: usize,
}
