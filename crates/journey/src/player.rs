//! Runtime player: walks one visitor through one flow.
//!
//! The player owns the visitor's position and advances it in response to
//! host events. It suspends only on `delay` and `apiTrigger` nodes; the host
//! (or [`crate::runner::PlayerHandle`]) awaits [`FlowPlayer::wait_pending`]
//! and feeds the result back through [`FlowPlayer::apply_settlement`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use wayfinder_core::config::{PlayerConfig, WayfinderConfig};
use wayfinder_core::error::{
    ActionDispatchError, DelayCycleError, FlowError, FlowResult, GraphIntegrityError,
};
use wayfinder_core::event_bus::{make_event, noop_sink, EventSink};
use wayfinder_core::session::{InMemoryPositionStore, PositionStore, SessionContext};
use wayfinder_core::types::{
    Action, ActionTrigger, ActionType, ApiTriggerData, EventType, FlowDefinition, NodeKind,
    StepNode, VisitorPosition,
};
use wayfinder_segmentation::SegmentationResolver;

use crate::conditions::{resolve_ab_switch, resolve_branch, ConditionTable, EvalContext};
use crate::dispatcher::{ActionDispatcher, ActionOutcome, DispatchContext};
use crate::milestones::{Direction, Intent, MilestoneEngine, MilestoneSignal};
use crate::state_machine::{PlayerPhase, PlayerState, PlayerStateMachine};
use crate::targeting::{PageContext, TargetingEvaluator};

/// Host callback for errors that halt the flow.
pub type ErrorCallback = Arc<dyn Fn(&FlowError) + Send + Sync>;

/// A finished suspension, ready to be applied.
#[derive(Debug)]
pub enum Settlement {
    DelayElapsed {
        node_id: String,
    },
    ApiSettled {
        node_id: String,
        continue_on_error: bool,
        result: Result<ActionOutcome, ActionDispatchError>,
    },
}

enum Pending {
    Delay {
        node_id: String,
        deadline: Instant,
    },
    Api {
        node_id: String,
        action_id: String,
        continue_on_error: bool,
        task: JoinHandle<Result<ActionOutcome, ActionDispatchError>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeExit {
    Complete,
    Skip,
}

impl NodeExit {
    fn trigger(self) -> ActionTrigger {
        match self {
            NodeExit::Complete => ActionTrigger::OnComplete,
            NodeExit::Skip => ActionTrigger::OnSkip,
        }
    }

    fn event_type(self) -> EventType {
        match self {
            NodeExit::Complete => EventType::Complete,
            NodeExit::Skip => EventType::Skip,
        }
    }
}

pub struct FlowPlayer {
    flow: Arc<FlowDefinition>,
    session: SessionContext,
    config: PlayerConfig,
    resolver: SegmentationResolver,
    targeting: TargetingEvaluator,
    conditions: ConditionTable,
    dispatcher: ActionDispatcher,
    page: Arc<dyn PageContext>,
    store: Arc<dyn PositionStore>,
    event_sink: Arc<dyn EventSink>,
    on_error: Option<ErrorCallback>,
    machine: PlayerStateMachine,
    milestones: MilestoneEngine,
    position: Option<VisitorPosition>,
    pending: Option<Pending>,
    last_error: Option<FlowError>,
    dispatch_failures: Vec<ActionDispatchError>,
}

impl FlowPlayer {
    pub fn new(
        flow: impl Into<Arc<FlowDefinition>>,
        session: SessionContext,
        page: Arc<dyn PageContext>,
        config: &WayfinderConfig,
    ) -> Self {
        Self {
            flow: flow.into(),
            session,
            config: config.player.clone(),
            resolver: SegmentationResolver::new(),
            targeting: TargetingEvaluator::new(&config.targeting),
            conditions: ConditionTable::new(),
            dispatcher: ActionDispatcher::new(&config.dispatch),
            page,
            store: Arc::new(InMemoryPositionStore::new()),
            event_sink: noop_sink(),
            on_error: None,
            machine: PlayerStateMachine::new(),
            milestones: MilestoneEngine::new(),
            position: None,
            pending: None,
            last_error: None,
            dispatch_failures: Vec::new(),
        }
    }

    /// Attach an event sink for lifecycle analytics. Analytics actions
    /// without an endpoint are routed to the same sink.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.dispatcher = self.dispatcher.with_event_sink(sink.clone());
        self.event_sink = sink;
        self
    }

    pub fn with_position_store(mut self, store: Arc<dyn PositionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_conditions(mut self, conditions: ConditionTable) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: ActionDispatcher) -> Self {
        self.dispatcher = dispatcher.with_event_sink(self.event_sink.clone());
        self
    }

    pub fn with_error_callback(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    pub fn flow(&self) -> &FlowDefinition {
        &self.flow
    }

    pub fn state(&self) -> PlayerState {
        self.machine.state.clone()
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn position(&self) -> Option<&VisitorPosition> {
        self.position.as_ref()
    }

    /// The error that moved the player to `Error`, if any.
    pub fn last_error(&self) -> Option<&FlowError> {
        self.last_error.as_ref()
    }

    /// Non-fatal dispatch failures of `apiTrigger` nodes that continued.
    pub fn dispatch_failures(&self) -> &[ActionDispatchError] {
        &self.dispatch_failures
    }

    pub fn is_suspended(&self) -> bool {
        self.pending.is_some()
    }

    pub fn record_answer(&mut self, field: impl Into<String>, value: serde_json::Value) {
        self.session.record_answer(field, value);
    }

    /// Resumes the stored position, or assigns a variant and starts at the
    /// entry node.
    pub async fn start(&mut self) -> FlowResult<PlayerState> {
        self.machine.transition(PlayerState::Evaluating, "start")?;
        self.last_error = None;
        let result = self.begin().await;
        self.conclude(result)
    }

    pub async fn advance(&mut self, direction: Direction) -> FlowResult<PlayerState> {
        self.machine.require(PlayerPhase::Presenting, "advance")?;
        let node = self.current_node()?;
        match self.milestones.advance(&node, direction) {
            MilestoneSignal::Moved(index) => {
                self.machine.transition(
                    PlayerState::Presenting {
                        node_id: node.id.clone(),
                        milestone_index: index,
                    },
                    "advance",
                )?;
                if let Some(position) = self.position.as_mut() {
                    position.current_milestone_index = index;
                }
                let result = self.save_position();
                self.emit(EventType::View, &node.id, Some(index));
                self.conclude(result)
            }
            MilestoneSignal::NodeComplete => self.exit_node(node, NodeExit::Complete).await,
            MilestoneSignal::ExitToPrevious => {
                let result = self.present_previous().await;
                self.conclude(result)
            }
        }
    }

    pub async fn complete(&mut self) -> FlowResult<PlayerState> {
        self.machine.require(PlayerPhase::Presenting, "complete")?;
        let node = self.current_node()?;
        self.exit_node(node, NodeExit::Complete).await
    }

    pub async fn skip(&mut self) -> FlowResult<PlayerState> {
        self.machine.require(PlayerPhase::Presenting, "skip")?;
        let node = self.current_node()?;
        self.exit_node(node, NodeExit::Skip).await
    }

    /// Handles a click on a button declared in the current node.
    pub async fn click(&mut self, button_id: &str) -> FlowResult<PlayerState> {
        self.machine.require(PlayerPhase::Presenting, "click")?;
        let node = self.current_node()?;
        let Some(outcome) = self.milestones.handle_button(&node, button_id) else {
            warn!(flow_id = %self.flow.id, node_id = %node.id, button_id = %button_id, "Click on unknown button ignored");
            return Ok(self.state());
        };

        if outcome.collect_metrics {
            self.emit(EventType::Click, &node.id, Some(self.milestones.current_index()));
        }
        self.dispatch_actions(&node, outcome.actions).await?;

        match outcome.intent {
            Intent::Advance(direction) => self.advance(direction).await,
            Intent::Complete => self.exit_node(node, NodeExit::Complete).await,
            Intent::Skip => self.exit_node(node, NodeExit::Skip).await,
            Intent::Stay => Ok(self.state()),
        }
    }

    /// Cancels any suspension and returns to `Idle`. The stored position is
    /// kept so the next `start` resumes.
    pub fn close(&mut self) -> FlowResult<PlayerState> {
        if let Some(Pending::Api { task, node_id, .. }) = self.pending.take() {
            task.abort();
            debug!(flow_id = %self.flow.id, node_id = %node_id, "Aborted in-flight API trigger");
        }
        self.milestones.leave();
        self.position = None;
        if self.machine.state != PlayerState::Idle {
            self.machine.transition(PlayerState::Idle, "close")?;
            info!(flow_id = %self.flow.id, visitor_id = %self.session.visitor_id, "Player closed");
        }
        Ok(self.state())
    }

    /// Closes the player and forgets the visitor's position.
    pub fn reset(&mut self) -> FlowResult<PlayerState> {
        self.close()?;
        self.store.clear(&self.flow.id, &self.session.visitor_id)?;
        self.last_error = None;
        self.dispatch_failures.clear();
        Ok(self.state())
    }

    /// Waits for the pending suspension to finish. Returns `None` at once when
    /// nothing is pending. Cancel-safe: dropping the future leaves the
    /// suspension in place.
    pub async fn wait_pending(&mut self) -> Option<Settlement> {
        let settlement = match self.pending.as_mut()? {
            Pending::Delay { node_id, deadline } => {
                tokio::time::sleep_until(*deadline).await;
                Settlement::DelayElapsed {
                    node_id: node_id.clone(),
                }
            }
            Pending::Api {
                node_id,
                action_id,
                continue_on_error,
                task,
            } => {
                let result = match task.await {
                    Ok(result) => result,
                    Err(join_error) => {
                        debug!(action_id = %action_id, error = %join_error, "API trigger task did not finish");
                        Err(ActionDispatchError::Aborted {
                            action_id: action_id.clone(),
                        })
                    }
                };
                Settlement::ApiSettled {
                    node_id: node_id.clone(),
                    continue_on_error: *continue_on_error,
                    result,
                }
            }
        };
        self.pending = None;
        Some(settlement)
    }

    /// Moves past a settled `delay` or `apiTrigger` node. Settlements that no
    /// longer match the current state are ignored.
    pub async fn apply_settlement(&mut self, settlement: Settlement) -> FlowResult<PlayerState> {
        let result = match settlement {
            Settlement::DelayElapsed { node_id } => {
                if self.machine.state
                    != (PlayerState::AwaitingDelay {
                        node_id: node_id.clone(),
                    })
                {
                    debug!(node_id = %node_id, "Stale delay settlement ignored");
                    return Ok(self.state());
                }
                self.emit(EventType::Complete, &node_id, None);
                self.follow_primary(&node_id, "delay_elapsed").await
            }
            Settlement::ApiSettled {
                node_id,
                continue_on_error,
                result,
            } => {
                if self.machine.state
                    != (PlayerState::AwaitingApi {
                        node_id: node_id.clone(),
                    })
                {
                    debug!(node_id = %node_id, "Stale API settlement ignored");
                    return Ok(self.state());
                }
                match result {
                    Ok(_) => {
                        self.emit(EventType::Complete, &node_id, None);
                        self.follow_primary(&node_id, "api_settled").await
                    }
                    Err(dispatch_error) if continue_on_error => {
                        warn!(
                            flow_id = %self.flow.id,
                            node_id = %node_id,
                            error = %dispatch_error,
                            "API trigger failed, continuing"
                        );
                        self.dispatch_failures.push(dispatch_error);
                        self.emit(EventType::Complete, &node_id, None);
                        self.follow_primary(&node_id, "api_settled").await
                    }
                    Err(dispatch_error) => Err(dispatch_error.into()),
                }
            }
        };
        self.conclude(result)
    }

    /// `wait_pending` followed by `apply_settlement`.
    pub async fn settle(&mut self) -> FlowResult<PlayerState> {
        match self.wait_pending().await {
            Some(settlement) => self.apply_settlement(settlement).await,
            None => Ok(self.state()),
        }
    }

    async fn begin(&mut self) -> FlowResult<()> {
        let flow_id = self.flow.id.clone();
        let visitor_id = self.session.visitor_id.clone();

        match self.store.load(&flow_id, &visitor_id)? {
            Some(mut position) => {
                if let Some(variant_id) = position.assigned_variant_id.clone() {
                    if self.flow.variant(&variant_id).is_none() {
                        let reassigned =
                            self.resolver
                                .assign(&flow_id, &visitor_id, &self.flow.variants);
                        info!(
                            flow_id = %flow_id,
                            visitor_id = %visitor_id,
                            removed = %variant_id,
                            reassigned = ?reassigned,
                            "Stored variant no longer exists, reassigned"
                        );
                        position.assigned_variant_id = reassigned;
                    }
                }
                let node_id = position.current_node_id.clone();
                let milestone_index = position.current_milestone_index;
                info!(flow_id = %flow_id, visitor_id = %visitor_id, node_id = %node_id, "Resuming flow");
                self.position = Some(position);
                self.run_from(node_id, milestone_index).await
            }
            None => {
                let variant = self
                    .resolver
                    .assign(&flow_id, &visitor_id, &self.flow.variants);
                let Some(entry) = self.flow.entry_node().map(|n| n.id.clone()) else {
                    info!(flow_id = %flow_id, "Flow has no nodes");
                    return self.finish(PlayerState::Completed, "no_eligible_node");
                };
                info!(flow_id = %flow_id, visitor_id = %visitor_id, variant = ?variant, "Starting flow");
                self.position = Some(VisitorPosition::new(
                    flow_id.as_str(),
                    visitor_id.as_str(),
                    entry.as_str(),
                    variant,
                ));
                self.run_from(entry, 0).await
            }
        }
    }

    /// Evaluates nodes starting at `node_id` until one is presented, a
    /// suspension begins or the flow ends. Expects the `Evaluating` state.
    async fn run_from(&mut self, node_id: String, resume_at: usize) -> FlowResult<()> {
        let flow = Arc::clone(&self.flow);
        let chain_start = node_id.clone();
        let mut current = node_id;
        let mut milestone_index = resume_at;
        let mut hops = 0usize;

        loop {
            let node = flow
                .node(&current)
                .ok_or_else(|| GraphIntegrityError::UnknownNode(current.clone()))?;

            let next = match &node.kind {
                NodeKind::Branch => {
                    let ctx = EvalContext {
                        flow_id: &flow.id,
                        visitor_id: &self.session.visitor_id,
                        variant_id: self.variant_id(),
                        session: &self.session,
                    };
                    resolve_branch(&flow, &node.id, &self.conditions, &ctx)?
                        .target
                        .clone()
                }
                NodeKind::AbSwitch => resolve_ab_switch(&flow, &node.id, self.variant_id())?
                    .target
                    .clone(),
                NodeKind::Delay(data) => {
                    self.move_to(&node.id, 0)?;
                    self.machine.transition(
                        PlayerState::AwaitingDelay {
                            node_id: node.id.clone(),
                        },
                        "delay",
                    )?;
                    debug!(flow_id = %flow.id, node_id = %node.id, duration_ms = data.duration_ms, "Delay started");
                    self.pending = Some(Pending::Delay {
                        node_id: node.id.clone(),
                        deadline: Instant::now() + Duration::from_millis(data.duration_ms),
                    });
                    return Ok(());
                }
                NodeKind::ApiTrigger(data) => {
                    self.move_to(&node.id, 0)?;
                    match self.spawn_api_trigger(node, data) {
                        Some(pending) => {
                            self.machine.transition(
                                PlayerState::AwaitingApi {
                                    node_id: node.id.clone(),
                                },
                                "api_trigger",
                            )?;
                            self.pending = Some(pending);
                            return Ok(());
                        }
                        None => {
                            warn!(flow_id = %flow.id, node_id = %node.id, "API trigger has no api_call action, passing through");
                            self.emit(EventType::Complete, &node.id, None);
                            match flow.primary_edge(&node.id) {
                                Some(edge) => edge.target.clone(),
                                None => {
                                    return self.finish(PlayerState::Completed, "no_eligible_node")
                                }
                            }
                        }
                    }
                }
                _ => {
                    if self.targeting.is_eligible(node, self.page.as_ref()).await {
                        return self.present(node, milestone_index).await;
                    }
                    debug!(flow_id = %flow.id, node_id = %node.id, "Node not eligible, skipping");
                    match flow.primary_edge(&node.id) {
                        Some(edge) => edge.target.clone(),
                        None => return self.finish(PlayerState::Completed, "no_eligible_node"),
                    }
                }
            };

            hops += 1;
            if hops > self.config.max_skip_chain {
                return Err(DelayCycleError {
                    node_id: chain_start,
                    limit: self.config.max_skip_chain,
                }
                .into());
            }
            self.machine.transition(PlayerState::Transitioning, "route")?;
            self.machine.transition(PlayerState::Evaluating, "next_node")?;
            current = next;
            milestone_index = 0;
        }
    }

    async fn present(&mut self, node: &StepNode, milestone_index: usize) -> FlowResult<()> {
        let on_view = self.milestones.enter_at(node, milestone_index);
        let index = self.milestones.current_index();
        self.machine.transition(
            PlayerState::Presenting {
                node_id: node.id.clone(),
                milestone_index: index,
            },
            "eligible",
        )?;
        self.show(node, index, on_view).await
    }

    async fn present_previous(&mut self) -> FlowResult<()> {
        let previous = self.position.as_ref().and_then(|p| {
            let len = p.history.len();
            (len >= 2).then(|| p.history[len - 2].clone())
        });
        let Some(previous_id) = previous else {
            debug!(flow_id = %self.flow.id, "No previous node to return to");
            return Ok(());
        };

        let flow = Arc::clone(&self.flow);
        let node = flow
            .node(&previous_id)
            .ok_or_else(|| GraphIntegrityError::UnknownNode(previous_id.clone()))?;
        if let Some(position) = self.position.as_mut() {
            position.history.pop();
        }
        let last = node.milestones.len().saturating_sub(1);
        let on_view = self.milestones.enter_at(node, last);
        self.machine.transition(PlayerState::Transitioning, "exit")?;
        self.machine.transition(
            PlayerState::Presenting {
                node_id: node.id.clone(),
                milestone_index: last,
            },
            "previous_node",
        )?;
        self.show(node, last, on_view).await
    }

    async fn show(&mut self, node: &StepNode, index: usize, on_view: Vec<Action>) -> FlowResult<()> {
        self.move_to(&node.id, index)?;
        if let Some(position) = self.position.as_mut() {
            if position.history.last() != Some(&node.id) {
                position.history.push(node.id.clone());
            }
        }
        self.save_position()?;

        let milestone = (!node.milestones.is_empty()).then_some(index);
        self.emit(EventType::View, &node.id, milestone);
        info!(flow_id = %self.flow.id, node_id = %node.id, milestone = index, "Presenting node");

        if let Err(dispatch_error) = self.dispatch_actions(node, on_view).await {
            warn!(node_id = %node.id, error = %dispatch_error, "Blocking on_view action failed");
        }
        Ok(())
    }

    /// Fires exit actions, emits the exit event and follows the matching
    /// edge. A failed blocking action keeps the node presented.
    async fn exit_node(&mut self, node: StepNode, exit: NodeExit) -> FlowResult<PlayerState> {
        let actions = self.milestones.exit_actions(&node, exit.trigger());
        if let Err(error) = self.dispatch_actions(&node, actions).await {
            self.milestones.rearm(exit.trigger());
            return Err(error);
        }

        self.emit(exit.event_type(), &node.id, None);
        let result = self.leave_node(&node, exit).await;
        self.conclude(result)
    }

    async fn leave_node(&mut self, node: &StepNode, exit: NodeExit) -> FlowResult<()> {
        self.machine.transition(PlayerState::Transitioning, "exit")?;
        self.milestones.leave();
        let edge = match exit {
            NodeExit::Complete => self.flow.primary_edge(&node.id),
            NodeExit::Skip => self.flow.skip_edge(&node.id),
        };
        match edge.map(|e| e.target.clone()) {
            Some(target) => {
                self.machine.transition(PlayerState::Evaluating, "next_node")?;
                self.run_from(target, 0).await
            }
            None => match exit {
                NodeExit::Complete => self.finish(PlayerState::Completed, "flow_complete"),
                NodeExit::Skip => self.finish(PlayerState::Skipped, "flow_skipped"),
            },
        }
    }

    async fn follow_primary(&mut self, node_id: &str, trigger: &str) -> FlowResult<()> {
        self.machine.transition(PlayerState::Transitioning, trigger)?;
        match self.flow.primary_edge(node_id).map(|e| e.target.clone()) {
            Some(target) => {
                self.machine.transition(PlayerState::Evaluating, "next_node")?;
                self.run_from(target, 0).await
            }
            None => self.finish(PlayerState::Completed, "flow_complete"),
        }
    }

    fn finish(&mut self, terminal: PlayerState, trigger: &str) -> FlowResult<()> {
        self.machine.transition(terminal.clone(), trigger)?;
        self.milestones.leave();
        self.position = None;
        self.store.clear(&self.flow.id, &self.session.visitor_id)?;
        info!(flow_id = %self.flow.id, visitor_id = %self.session.visitor_id, outcome = ?terminal, "Flow finished");
        Ok(())
    }

    /// Turns a fatal error into the `Error` state. The last saved position is
    /// left in the store.
    fn conclude(&mut self, result: FlowResult<()>) -> FlowResult<PlayerState> {
        let Err(flow_error) = result else {
            return Ok(self.state());
        };

        error!(
            flow_id = %self.flow.id,
            visitor_id = %self.session.visitor_id,
            error = %flow_error,
            "Flow halted"
        );
        if let Some(callback) = &self.on_error {
            callback(&flow_error);
        }
        if let Some(Pending::Api { task, .. }) = self.pending.take() {
            task.abort();
        }
        self.milestones.leave();
        self.last_error = Some(flow_error);
        if self.machine.state.phase() != PlayerPhase::Error {
            // Every non-idle, non-terminal phase may fail.
            if self.machine.transition(PlayerState::Error, "fatal_error").is_err() {
                self.machine.state = PlayerState::Error;
            }
        }
        Ok(self.state())
    }

    fn spawn_api_trigger(&self, node: &StepNode, data: &ApiTriggerData) -> Option<Pending> {
        let action = match data.action_id.as_deref() {
            Some(action_id) => node.actions.iter().find(|a| a.id == action_id),
            None => node
                .actions
                .iter()
                .find(|a| a.action_type == ActionType::ApiCall),
        }?
        .clone();

        let dispatcher = self.dispatcher.clone();
        let context = self.dispatch_context(&node.id);
        let timeout_ms = data.timeout_ms;
        let action_id = action.id.clone();
        let task = tokio::spawn(async move {
            match timeout_ms {
                Some(limit) => tokio::time::timeout(
                    Duration::from_millis(limit),
                    dispatcher.dispatch(&action, &context),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(ActionDispatchError::Timeout {
                        action_id: action.id.clone(),
                        timeout_ms: limit,
                    })
                }),
                None => dispatcher.dispatch(&action, &context).await,
            }
        });

        Some(Pending::Api {
            node_id: node.id.clone(),
            action_id,
            continue_on_error: data.continue_on_error,
            task,
        })
    }

    /// Blocking actions are awaited in order; the rest run detached.
    async fn dispatch_actions(&self, node: &StepNode, actions: Vec<Action>) -> FlowResult<()> {
        for action in actions {
            let context = self.dispatch_context(&node.id);
            if action.blocking {
                self.dispatcher.dispatch(&action, &context).await?;
            } else {
                self.dispatcher.dispatch_detached(action, context);
            }
        }
        Ok(())
    }

    fn dispatch_context(&self, node_id: &str) -> DispatchContext {
        DispatchContext {
            flow_id: self.flow.id.clone(),
            step_id: Some(node_id.to_string()),
            visitor_id: self.session.visitor_id.clone(),
            variant_id: self.variant_id().map(str::to_string),
        }
    }

    fn variant_id(&self) -> Option<&str> {
        self.position
            .as_ref()
            .and_then(|p| p.assigned_variant_id.as_deref())
    }

    fn current_node(&self) -> FlowResult<StepNode> {
        let node_id = self
            .machine
            .state
            .node_id()
            .ok_or_else(|| GraphIntegrityError::UnknownNode(String::new()))?;
        self.flow
            .node(node_id)
            .cloned()
            .ok_or_else(|| GraphIntegrityError::UnknownNode(node_id.to_string()).into())
    }

    fn move_to(&mut self, node_id: &str, milestone_index: usize) -> FlowResult<()> {
        if let Some(position) = self.position.as_mut() {
            position.current_node_id = node_id.to_string();
            position.current_milestone_index = milestone_index;
        }
        self.save_position()
    }

    fn save_position(&mut self) -> FlowResult<()> {
        match self.position.as_mut() {
            Some(position) => {
                position.updated_at = chrono::Utc::now();
                self.store.save(position)
            }
            None => Ok(()),
        }
    }

    fn emit(&self, event_type: EventType, step_id: &str, milestone_index: Option<usize>) {
        let mut event = make_event(
            event_type,
            self.flow.id.clone(),
            Some(step_id.to_string()),
            self.variant_id().map(str::to_string),
            Some(self.session.visitor_id.clone()),
        );
        event.milestone_index = milestone_index;
        self.event_sink.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wayfinder_core::event_bus::capture_sink;
    use wayfinder_core::types::{Edge, Milestone, SKIP_HANDLE};

    struct Page(&'static str);

    impl PageContext for Page {
        fn current_url(&self) -> String {
            self.0.to_string()
        }

        fn count_matches(&self, _selector: &str) -> usize {
            0
        }
    }

    fn modal(id: &str, milestones: usize) -> StepNode {
        let mut node = StepNode::new(id, NodeKind::Modal);
        node.milestones = (0..milestones)
            .map(|i| Milestone {
                id: format!("{id}-m{i}"),
                ..Default::default()
            })
            .collect();
        node
    }

    fn gated(id: &str) -> StepNode {
        let mut node = modal(id, 0);
        node.targeting.page_url = Some("/admin/*".into());
        node
    }

    fn player(flow: FlowDefinition) -> (FlowPlayer, Arc<wayfinder_core::event_bus::CaptureSink>) {
        let sink = capture_sink();
        let player = FlowPlayer::new(
            flow,
            SessionContext::new("app-1", "visitor-1"),
            Arc::new(Page("https://app.example.com/home")),
            &WayfinderConfig::default(),
        )
        .with_event_sink(sink.clone());
        (player, sink)
    }

    fn linear() -> FlowDefinition {
        let mut flow = FlowDefinition::new("flow-1");
        flow.nodes = vec![modal("a", 2), modal("b", 0), modal("c", 0)];
        flow.edges = vec![
            Edge::new("a", "b", None),
            Edge::new("b", "c", None),
            Edge::new("a", "c", Some(SKIP_HANDLE.into())),
        ];
        flow
    }

    #[tokio::test]
    async fn test_operations_before_start_are_rejected() {
        let (mut player, _) = player(linear());
        assert!(matches!(
            player.advance(Direction::Next).await,
            Err(FlowError::InvalidTransition { .. })
        ));
        assert!(matches!(
            player.complete().await,
            Err(FlowError::InvalidTransition { .. })
        ));
        player.start().await.unwrap();
        assert!(matches!(
            player.start().await,
            Err(FlowError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_walks_to_completion() {
        let (mut player, sink) = player(linear());
        assert_eq!(
            player.start().await.unwrap(),
            PlayerState::Presenting {
                node_id: "a".into(),
                milestone_index: 0
            }
        );
        player.advance(Direction::Next).await.unwrap();
        player.complete().await.unwrap();
        player.complete().await.unwrap();
        let state = player.complete().await.unwrap();
        assert_eq!(state, PlayerState::Completed);
        assert!(player.position().is_none());

        let timeline = sink.timeline();
        assert_eq!(
            timeline,
            vec![
                (EventType::View, Some("a".into()), Some(0)),
                (EventType::View, Some("a".into()), Some(1)),
                (EventType::Complete, Some("a".into()), None),
                (EventType::View, Some("b".into()), None),
                (EventType::Complete, Some("b".into()), None),
                (EventType::View, Some("c".into()), None),
                (EventType::Complete, Some("c".into()), None),
            ]
        );
    }

    #[tokio::test]
    async fn test_skip_follows_skip_exit_or_ends() {
        let (mut player, sink) = player(linear());
        player.start().await.unwrap();
        let state = player.skip().await.unwrap();
        assert_eq!(state.node_id(), Some("c"));
        assert_eq!(sink.count_type(EventType::Skip), 1);

        assert_eq!(player.skip().await.unwrap(), PlayerState::Skipped);
    }

    #[tokio::test]
    async fn test_previous_returns_to_last_milestone() {
        let (mut player, sink) = player(linear());
        player.start().await.unwrap();

        // At milestone 0 of the first node there is nowhere to go back to.
        let state = player.advance(Direction::Previous).await.unwrap();
        assert_eq!(state.node_id(), Some("a"));

        player.complete().await.unwrap();
        let state = player.advance(Direction::Previous).await.unwrap();
        assert_eq!(
            state,
            PlayerState::Presenting {
                node_id: "a".into(),
                milestone_index: 1
            }
        );
        assert_eq!(player.position().unwrap().history, vec!["a".to_string()]);
        assert_eq!(
            sink.timeline().last().cloned(),
            Some((EventType::View, Some("a".into()), Some(1)))
        );
    }

    #[tokio::test]
    async fn test_ineligible_nodes_are_skipped_silently() {
        let mut flow = FlowDefinition::new("flow-1");
        flow.nodes = vec![gated("a"), gated("b"), modal("c", 0)];
        flow.edges = vec![Edge::new("a", "b", None), Edge::new("b", "c", None)];
        let (mut player, sink) = player(flow);

        let state = player.start().await.unwrap();
        assert_eq!(state.node_id(), Some("c"));
        assert_eq!(sink.timeline(), vec![(EventType::View, Some("c".into()), None)]);
    }

    #[tokio::test]
    async fn test_ineligible_without_exit_completes() {
        let mut flow = FlowDefinition::new("flow-1");
        flow.nodes = vec![gated("a")];
        let (mut player, sink) = player(flow);
        assert_eq!(player.start().await.unwrap(), PlayerState::Completed);
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test]
    async fn test_skip_chain_is_bounded() {
        let mut flow = FlowDefinition::new("flow-1");
        flow.nodes = vec![gated("a"), gated("b")];
        flow.edges = vec![Edge::new("a", "b", None), Edge::new("b", "a", None)];

        let reported = Arc::new(AtomicUsize::new(0));
        let counter = reported.clone();
        let (player, _) = player(flow);
        let mut player = player.with_error_callback(Arc::new(move |_: &FlowError| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(player.start().await.unwrap(), PlayerState::Error);
        assert!(matches!(player.last_error(), Some(FlowError::DelayCycle(_))));
        assert_eq!(reported.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resume_from_stored_position() {
        let store = Arc::new(InMemoryPositionStore::new());
        let mut stored = VisitorPosition::new("flow-1", "visitor-1", "b", Some("gone".into()));
        stored.history = vec!["a".into(), "b".into()];
        store.save(&stored).unwrap();

        let (player, sink) = player(linear());
        let mut player = player.with_position_store(store.clone());
        let state = player.start().await.unwrap();
        assert_eq!(state.node_id(), Some("b"));
        // The removed variant is reassigned; with no variants that is control.
        assert_eq!(player.position().unwrap().assigned_variant_id, None);
        assert_eq!(sink.timeline(), vec![(EventType::View, Some("b".into()), None)]);
    }

    #[tokio::test]
    async fn test_close_keeps_position_and_reset_clears_it() {
        let store = Arc::new(InMemoryPositionStore::new());
        let (player, _) = player(linear());
        let mut player = player.with_position_store(store.clone());

        player.start().await.unwrap();
        player.advance(Direction::Next).await.unwrap();
        assert_eq!(player.close().unwrap(), PlayerState::Idle);
        let saved = store.load("flow-1", "visitor-1").unwrap().unwrap();
        assert_eq!(saved.current_milestone_index, 1);

        let state = player.start().await.unwrap();
        assert_eq!(
            state,
            PlayerState::Presenting {
                node_id: "a".into(),
                milestone_index: 1
            }
        );

        player.reset().unwrap();
        assert!(store.is_empty());
    }
}
