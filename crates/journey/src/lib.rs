//! Runtime side of Wayfinder: targeting, routing, milestones, action
//! dispatch and the per-visitor flow player.
pub mod conditions;
pub mod dispatcher;
pub mod milestones;
pub mod player;
pub mod runner;
pub mod state_machine;
pub mod targeting;

pub use conditions::{AnswerOp, ConditionTable, EvalContext};
pub use dispatcher::{ActionDispatcher, ActionHooks, HttpTransport, ReqwestTransport};
pub use milestones::{Direction, MilestoneEngine};
pub use player::{FlowPlayer, Settlement};
pub use runner::{PlayerCommand, PlayerHandle};
pub use state_machine::{PlayerPhase, PlayerState, PlayerStateMachine};
pub use targeting::{PageContext, TargetingEvaluator};
