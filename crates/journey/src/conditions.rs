//! Routing for `branch` and `abSwitch` nodes.
//!
//! Edge conditions are opaque names. The embedding host registers a predicate
//! for each name in a [`ConditionTable`]; a name with no predicate evaluates to
//! false.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use wayfinder_core::error::BranchResolutionError;
use wayfinder_core::session::SessionContext;
use wayfinder_core::types::{Edge, FlowDefinition};

/// What a condition predicate may look at.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub flow_id: &'a str,
    pub visitor_id: &'a str,
    pub variant_id: Option<&'a str>,
    pub session: &'a SessionContext,
}

pub type Predicate = Arc<dyn Fn(&EvalContext<'_>) -> bool + Send + Sync>;

/// Comparison applied by [`ConditionTable::register_answer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerOp {
    Equals,
    NotEquals,
    /// String answer contains the expected string, or array answer contains
    /// the expected element.
    Contains,
    Present,
    Absent,
}

impl AnswerOp {
    pub fn test(&self, answer: Option<&Value>, expected: &Value) -> bool {
        match self {
            AnswerOp::Equals => answer == Some(expected),
            AnswerOp::NotEquals => answer != Some(expected),
            AnswerOp::Contains => match (answer, expected) {
                (Some(Value::String(text)), Value::String(needle)) => text.contains(needle.as_str()),
                (Some(Value::Array(items)), _) => items.contains(expected),
                _ => false,
            },
            AnswerOp::Present => answer.is_some_and(|v| !v.is_null()),
            AnswerOp::Absent => answer.map_or(true, Value::is_null),
        }
    }
}

#[derive(Clone, Default)]
pub struct ConditionTable {
    predicates: HashMap<String, Predicate>,
}

impl fmt::Debug for ConditionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.predicates.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("ConditionTable").field("names", &names).finish()
    }
}

impl ConditionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, predicate: F) -> &mut Self
    where
        F: Fn(&EvalContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(predicate));
        self
    }

    /// Registers `name` as a comparison against a recorded session answer.
    pub fn register_answer(
        &mut self,
        name: impl Into<String>,
        field: impl Into<String>,
        op: AnswerOp,
        expected: Value,
    ) -> &mut Self {
        let field = field.into();
        self.register(name, move |ctx| op.test(ctx.session.answer(&field), &expected))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.predicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn evaluate(&self, name: &str, ctx: &EvalContext<'_>) -> bool {
        match self.predicates.get(name) {
            Some(predicate) => predicate(ctx),
            None => {
                warn!(flow_id = %ctx.flow_id, condition = %name, "Unknown branch condition, treating as false");
                false
            }
        }
    }
}

/// First outgoing edge, in authored order, whose condition holds or is absent.
pub fn resolve_branch<'f>(
    flow: &'f FlowDefinition,
    node_id: &str,
    conditions: &ConditionTable,
    ctx: &EvalContext<'_>,
) -> Result<&'f Edge, BranchResolutionError> {
    let chosen = flow.outgoing(node_id).find(|edge| {
        match edge.condition.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(name) => conditions.evaluate(name, ctx),
        }
    });
    match chosen {
        Some(edge) => {
            debug!(flow_id = %flow.id, node_id = %node_id, edge_id = %edge.id, "Branch resolved");
            Ok(edge)
        }
        None => Err(BranchResolutionError {
            node_id: node_id.to_string(),
        }),
    }
}

/// The edge whose handle names the visitor's variant, else the edge without a
/// handle (the control path).
pub fn resolve_ab_switch<'f>(
    flow: &'f FlowDefinition,
    node_id: &str,
    variant_id: Option<&str>,
) -> Result<&'f Edge, BranchResolutionError> {
    let by_variant = variant_id.and_then(|variant| {
        flow.outgoing(node_id)
            .find(|e| e.handle_id.as_deref() == Some(variant))
    });
    by_variant
        .or_else(|| flow.outgoing(node_id).find(|e| e.handle_id.is_none()))
        .ok_or_else(|| BranchResolutionError {
            node_id: node_id.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wayfinder_core::types::{NodeKind, StepNode};

    fn question_flow() -> FlowDefinition {
        let mut flow = FlowDefinition::new("flow-1");
        for (id, kind) in [
            ("q", NodeKind::Branch),
            ("a", NodeKind::Modal),
            ("b", NodeKind::Modal),
        ] {
            flow.nodes.push(StepNode::new(id, kind));
        }
        flow.edges
            .push(Edge::new("q", "a", Some("yes".into())).with_condition("answered=yes"));
        flow.edges.push(Edge::new("q", "b", Some("no".into())));
        flow
    }

    fn ctx(session: &SessionContext) -> EvalContext<'_> {
        EvalContext {
            flow_id: "flow-1",
            visitor_id: &session.visitor_id,
            variant_id: None,
            session,
        }
    }

    #[test]
    fn test_first_true_condition_wins() {
        let flow = question_flow();
        let mut table = ConditionTable::new();
        table.register_answer("answered=yes", "answered", AnswerOp::Equals, json!("yes"));

        let mut session = SessionContext::new("app", "visitor-1");
        session.record_answer("answered", json!("yes"));
        assert_eq!(resolve_branch(&flow, "q", &table, &ctx(&session)).unwrap().target, "a");

        session.record_answer("answered", json!("no"));
        assert_eq!(resolve_branch(&flow, "q", &table, &ctx(&session)).unwrap().target, "b");
    }

    #[test]
    fn test_unknown_condition_is_false() {
        let mut flow = question_flow();
        flow.edges[1].condition = Some("never-registered".into());
        let session = SessionContext::new("app", "visitor-1");
        let err = resolve_branch(&flow, "q", &ConditionTable::new(), &ctx(&session)).unwrap_err();
        assert_eq!(err.node_id, "q");
    }

    #[test]
    fn test_answer_ops() {
        assert!(AnswerOp::Contains.test(Some(&json!("power user")), &json!("power")));
        assert!(AnswerOp::Contains.test(Some(&json!(["a", "b"])), &json!("b")));
        assert!(AnswerOp::Absent.test(None, &Value::Null));
        assert!(AnswerOp::Present.test(Some(&json!(0)), &Value::Null));
        assert!(AnswerOp::NotEquals.test(None, &json!("yes")));
    }

    #[test]
    fn test_ab_switch_routes_on_variant() {
        let mut flow = FlowDefinition::new("flow-1");
        flow.nodes.push(StepNode::new("split", NodeKind::AbSwitch));
        flow.nodes.push(StepNode::new("control", NodeKind::Modal));
        flow.nodes.push(StepNode::new("treatment", NodeKind::Modal));
        flow.edges.push(Edge::new("split", "control", None));
        flow.edges
            .push(Edge::new("split", "treatment", Some("variant-b".into())));

        assert_eq!(
            resolve_ab_switch(&flow, "split", Some("variant-b")).unwrap().target,
            "treatment"
        );
        assert_eq!(
            resolve_ab_switch(&flow, "split", Some("variant-a")).unwrap().target,
            "control"
        );
        assert_eq!(resolve_ab_switch(&flow, "split", None).unwrap().target, "control");

        flow.edges.remove(0);
        assert!(resolve_ab_switch(&flow, "split", None).is_err());
    }

    mod totality {
        use super::*;
        use proptest::prelude::*;

        /// A branch whose edges carry `conditions` (by name index), with an
        /// optional trailing unconditioned edge.
        fn branch_flow(conditions: &[Option<usize>], with_else: bool) -> FlowDefinition {
            let mut flow = FlowDefinition::new("flow-1");
            flow.nodes.push(StepNode::new("q", NodeKind::Branch));
            let mut targets = conditions.to_vec();
            if with_else {
                targets.push(None);
            }
            for (i, condition) in targets.into_iter().enumerate() {
                let target = format!("t{i}");
                flow.nodes.push(StepNode::new(target.as_str(), NodeKind::Modal));
                let mut edge = Edge::new("q", target, Some(format!("h{i}")));
                edge.condition = condition.map(|n| format!("c{n}"));
                flow.edges.push(edge);
            }
            flow
        }

        fn table(truths: &[Option<bool>]) -> ConditionTable {
            let mut table = ConditionTable::new();
            for (n, truth) in truths.iter().enumerate() {
                // `None` leaves the name unregistered.
                if let Some(truth) = *truth {
                    table.register(format!("c{n}"), move |_| truth);
                }
            }
            table
        }

        fn expected_target(
            conditions: &[Option<usize>],
            truths: &[Option<bool>],
            with_else: bool,
        ) -> Option<String> {
            conditions
                .iter()
                .position(|c| match c {
                    None => true,
                    Some(n) => truths[*n] == Some(true),
                })
                .or(with_else.then_some(conditions.len()))
                .map(|i| format!("t{i}"))
        }

        proptest! {
            #[test]
            fn prop_branch_with_else_selects_exactly_one_edge(
                conditions in proptest::collection::vec(proptest::option::of(0usize..5), 1..6),
                truths in proptest::collection::vec(proptest::option::of(any::<bool>()), 5),
                answer in proptest::option::of("[a-z]{1,3}"),
            ) {
                let flow = branch_flow(&conditions, true);
                let table = table(&truths);
                let mut session = SessionContext::new("app", "visitor-1");
                if let Some(answer) = answer {
                    session.record_answer("answered", json!(answer));
                }

                let first = resolve_branch(&flow, "q", &table, &ctx(&session)).unwrap();
                let again = resolve_branch(&flow, "q", &table, &ctx(&session)).unwrap();
                prop_assert_eq!(&first.id, &again.id);
                prop_assert_eq!(
                    Some(first.target.clone()),
                    expected_target(&conditions, &truths, true)
                );
            }

            #[test]
            fn prop_branch_without_else_fails_only_when_nothing_holds(
                conditions in proptest::collection::vec(0usize..5, 1..6),
                truths in proptest::collection::vec(proptest::option::of(any::<bool>()), 5),
            ) {
                let conditions: Vec<Option<usize>> = conditions.into_iter().map(Some).collect();
                let flow = branch_flow(&conditions, false);
                let table = table(&truths);
                let session = SessionContext::new("app", "visitor-1");

                let resolved = resolve_branch(&flow, "q", &table, &ctx(&session))
                    .ok()
                    .map(|edge| edge.target.clone());
                prop_assert_eq!(resolved, expected_target(&conditions, &truths, false));
            }
        }
    }
}
