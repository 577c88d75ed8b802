//! Milestone navigation and trigger bookkeeping within a single node visit.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use wayfinder_core::types::{
    Action, ActionTrigger, ActionType, ButtonAction, FormField, StepNode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Next,
    Previous,
}

/// Result of moving within a node's milestones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MilestoneSignal {
    Moved(usize),
    /// Advanced past the last milestone.
    NodeComplete,
    /// Went back from milestone 0.
    ExitToPrevious,
}

/// Navigation a button asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Advance(Direction),
    Skip,
    Complete,
    Stay,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ButtonOutcome {
    pub button_id: String,
    pub intent: Intent,
    /// Side effects to dispatch before acting on the intent.
    pub actions: Vec<Action>,
    pub collect_metrics: bool,
}

/// Tracks the current milestone of one node visit and which triggers have
/// already fired during it.
#[derive(Debug, Clone, Default)]
pub struct MilestoneEngine {
    node_id: Option<String>,
    index: usize,
    fired: HashSet<ActionTrigger>,
}

impl MilestoneEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    pub fn current_index(&self) -> usize {
        self.index
    }

    /// Starts a visit at milestone 0 and returns the `on_view` actions.
    pub fn enter(&mut self, node: &StepNode) -> Vec<Action> {
        self.enter_at(node, 0)
    }

    /// Starts a visit at `index`, clamped to the node's last milestone.
    pub fn enter_at(&mut self, node: &StepNode, index: usize) -> Vec<Action> {
        self.node_id = Some(node.id.clone());
        self.index = index.min(node.milestones.len().saturating_sub(1));
        self.fired.clear();
        self.take_trigger(node, ActionTrigger::OnView)
    }

    pub fn advance(&mut self, node: &StepNode, direction: Direction) -> MilestoneSignal {
        let last = node.milestones.len().saturating_sub(1);
        match direction {
            Direction::Next if !node.milestones.is_empty() && self.index < last => {
                self.index += 1;
                MilestoneSignal::Moved(self.index)
            }
            Direction::Next => MilestoneSignal::NodeComplete,
            Direction::Previous if self.index > 0 => {
                self.index -= 1;
                MilestoneSignal::Moved(self.index)
            }
            Direction::Previous => MilestoneSignal::ExitToPrevious,
        }
    }

    /// Resolves a button click. `None` when the node declares no such button.
    pub fn handle_button(&mut self, node: &StepNode, button_id: &str) -> Option<ButtonOutcome> {
        let button = find_button(node, self.index, button_id)?;

        let mut actions: Vec<Action> = node
            .actions
            .iter()
            .filter(|a| {
                a.trigger == ActionTrigger::OnButtonClick
                    && a.button_id.as_deref() == Some(button_id)
            })
            .cloned()
            .collect();

        let intent = match button.button_action.unwrap_or(ButtonAction::Next) {
            ButtonAction::Next => Intent::Advance(Direction::Next),
            ButtonAction::Previous => Intent::Advance(Direction::Previous),
            ButtonAction::Skip => Intent::Skip,
            ButtonAction::Complete => Intent::Complete,
            ButtonAction::Api => {
                if let Some(endpoint) = button.button_api_endpoint.as_deref() {
                    if !actions.iter().any(|a| a.action_type == ActionType::ApiCall) {
                        let mut action = synthesized(button, ActionType::ApiCall, endpoint);
                        action.method = Some("POST".into());
                        actions.push(action);
                    }
                }
                Intent::Stay
            }
            ButtonAction::Url => {
                if let Some(url) = button.button_url.as_deref() {
                    if !actions.iter().any(|a| a.action_type == ActionType::Navigation) {
                        actions.push(synthesized(button, ActionType::Navigation, url));
                    }
                }
                Intent::Stay
            }
        };

        debug!(node_id = %node.id, button_id = %button_id, intent = ?intent, actions = actions.len(), "Button handled");
        Some(ButtonOutcome {
            button_id: button_id.to_string(),
            intent,
            actions,
            collect_metrics: button.button_collect_metrics,
        })
    }

    /// `on_complete` or `on_skip` actions, at most once per visit.
    pub fn exit_actions(&mut self, node: &StepNode, trigger: ActionTrigger) -> Vec<Action> {
        self.take_trigger(node, trigger)
    }

    /// Allows `trigger` to fire again, after its actions failed to run.
    pub fn rearm(&mut self, trigger: ActionTrigger) {
        self.fired.remove(&trigger);
    }

    pub fn leave(&mut self) {
        self.node_id = None;
        self.index = 0;
        self.fired.clear();
    }

    fn take_trigger(&mut self, node: &StepNode, trigger: ActionTrigger) -> Vec<Action> {
        if !self.fired.insert(trigger) {
            return Vec::new();
        }
        node.actions
            .iter()
            .filter(|a| a.trigger == trigger)
            .cloned()
            .collect()
    }
}

fn find_button<'n>(node: &'n StepNode, current: usize, button_id: &str) -> Option<&'n FormField> {
    let matches = |f: &&FormField| f.is_button && f.id == button_id;
    node.milestones
        .get(current)
        .and_then(|m| m.form_fields.iter().find(matches))
        .or_else(|| {
            node.milestones
                .iter()
                .flat_map(|m| m.form_fields.iter())
                .find(matches)
        })
}

fn synthesized(button: &FormField, action_type: ActionType, endpoint: &str) -> Action {
    Action::new(
        format!("button-{}", button.id),
        action_type,
        ActionTrigger::OnButtonClick,
    )
    .for_button(button.id.clone())
    .with_endpoint(endpoint)
}
