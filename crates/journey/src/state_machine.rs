use serde::{Deserialize, Serialize};

use wayfinder_core::error::{FlowError, FlowResult};

/// Runtime player state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PlayerState {
    Idle,
    Evaluating,
    Presenting {
        node_id: String,
        milestone_index: usize,
    },
    AwaitingDelay {
        node_id: String,
    },
    AwaitingApi {
        node_id: String,
    },
    Transitioning,
    Completed,
    Skipped,
    Error,
}

impl PlayerState {
    pub fn phase(&self) -> PlayerPhase {
        match self {
            PlayerState::Idle => PlayerPhase::Idle,
            PlayerState::Evaluating => PlayerPhase::Evaluating,
            PlayerState::Presenting { .. } => PlayerPhase::Presenting,
            PlayerState::AwaitingDelay { .. } => PlayerPhase::AwaitingDelay,
            PlayerState::AwaitingApi { .. } => PlayerPhase::AwaitingApi,
            PlayerState::Transitioning => PlayerPhase::Transitioning,
            PlayerState::Completed => PlayerPhase::Completed,
            PlayerState::Skipped => PlayerPhase::Skipped,
            PlayerState::Error => PlayerPhase::Error,
        }
    }

    /// Node the state refers to, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            PlayerState::Presenting { node_id, .. }
            | PlayerState::AwaitingDelay { node_id }
            | PlayerState::AwaitingApi { node_id } => Some(node_id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlayerState::Completed | PlayerState::Skipped | PlayerState::Error
        )
    }

    pub fn is_suspended(&self) -> bool {
        matches!(
            self,
            PlayerState::AwaitingDelay { .. } | PlayerState::AwaitingApi { .. }
        )
    }
}

/// Data-free discriminant of [`PlayerState`], used by the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerPhase {
    Idle,
    Evaluating,
    Presenting,
    AwaitingDelay,
    AwaitingApi,
    Transitioning,
    Completed,
    Skipped,
    Error,
}

/// Describes a single valid state transition for a player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: PlayerPhase,
    pub to: PlayerPhase,
    pub trigger: String,
}

/// Guards the player lifecycle by enforcing a finite set of valid
/// state transitions.
#[derive(Debug, Clone)]
pub struct PlayerStateMachine {
    pub state: PlayerState,
    pub transitions: Vec<StateTransition>,
}

impl PlayerStateMachine {
    /// Creates a new state machine starting in `Idle` with all valid
    /// transitions pre-configured.
    pub fn new() -> Self {
        use PlayerPhase::*;

        let mut table = vec![
            (Idle, Evaluating, "start"),
            (Evaluating, Presenting, "eligible"),
            (Evaluating, Transitioning, "route"),
            (Evaluating, AwaitingDelay, "delay"),
            (Evaluating, AwaitingApi, "api_trigger"),
            (Evaluating, Completed, "no_eligible_node"),
            (Presenting, Presenting, "milestone"),
            (Presenting, Transitioning, "exit"),
            (AwaitingDelay, Transitioning, "delay_elapsed"),
            (AwaitingApi, Transitioning, "api_settled"),
            (Transitioning, Evaluating, "next_node"),
            (Transitioning, Presenting, "previous_node"),
            (Transitioning, Completed, "flow_complete"),
            (Transitioning, Skipped, "flow_skipped"),
        ];
        for phase in [Evaluating, Presenting, AwaitingDelay, AwaitingApi, Transitioning] {
            table.push((phase, Error, "fatal_error"));
        }
        for phase in [
            Evaluating,
            Presenting,
            AwaitingDelay,
            AwaitingApi,
            Transitioning,
            Completed,
            Skipped,
            Error,
        ] {
            table.push((phase, Idle, "close"));
        }

        let transitions = table
            .into_iter()
            .map(|(from, to, trigger)| StateTransition {
                from,
                to,
                trigger: trigger.to_string(),
            })
            .collect();

        Self {
            state: PlayerState::Idle,
            transitions,
        }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: PlayerPhase, to: PlayerPhase) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.to == to)
    }

    /// Attempts to move the state machine to `to`. Returns an error if the
    /// transition is not permitted.
    pub fn transition(&mut self, to: PlayerState, trigger: &str) -> FlowResult<()> {
        if self.can_transition(self.state.phase(), to.phase()) {
            self.state = to;
            Ok(())
        } else {
            Err(FlowError::InvalidTransition {
                from: format!("{:?}", self.state.phase()),
                trigger: trigger.to_string(),
            })
        }
    }

    /// Fails with `InvalidTransition` unless the current phase is `expected`.
    pub fn require(&self, expected: PlayerPhase, trigger: &str) -> FlowResult<()> {
        if self.state.phase() == expected {
            Ok(())
        } else {
            Err(FlowError::InvalidTransition {
                from: format!("{:?}", self.state.phase()),
                trigger: trigger.to_string(),
            })
        }
    }
}

impl Default for PlayerStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
