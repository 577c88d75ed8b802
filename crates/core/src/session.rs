//! Per-visitor session state, passed explicitly to the runtime player.
//!
//! Lifecycle:
//! - **init**: the embedding host builds a [`SessionContext`] from its
//!   `data-app-id` and a stable visitor identifier before starting a player.
//! - **read**: conditions and dispatch read answers and theme overrides through
//!   the accessors; nothing reads ambient global state.
//! - **write**: only the player that owns the session records answers.
//! - **teardown**: [`SessionContext::teardown`] drops collected answers when the
//!   widget is closed for good; the visitor position lives in a
//!   [`PositionStore`] and is cleared separately by the player.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::FlowResult;
use crate::types::VisitorPosition;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub app_id: String,
    pub visitor_id: String,
    answers: BTreeMap<String, serde_json::Value>,
    theme: BTreeMap<String, String>,
}

impl SessionContext {
    pub fn new(app_id: impl Into<String>, visitor_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            visitor_id: visitor_id.into(),
            answers: BTreeMap::new(),
            theme: BTreeMap::new(),
        }
    }

    pub fn answer(&self, field: &str) -> Option<&serde_json::Value> {
        self.answers.get(field)
    }

    pub fn answers(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.answers
    }

    pub fn record_answer(&mut self, field: impl Into<String>, value: serde_json::Value) {
        self.answers.insert(field.into(), value);
    }

    pub fn theme(&self, key: &str) -> Option<&str> {
        self.theme.get(key).map(String::as_str)
    }

    pub fn set_theme(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.theme.insert(key.into(), value.into());
    }

    pub fn teardown(&mut self) {
        self.answers.clear();
        self.theme.clear();
    }
}

/// Durable home of visitor positions. Writes are last-write-wins.
pub trait PositionStore: Send + Sync {
    fn load(&self, flow_id: &str, visitor_id: &str) -> FlowResult<Option<VisitorPosition>>;
    fn save(&self, position: &VisitorPosition) -> FlowResult<()>;
    fn clear(&self, flow_id: &str, visitor_id: &str) -> FlowResult<()>;
}

/// Position store backed by a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryPositionStore {
    positions: DashMap<(String, String), VisitorPosition>,
}

impl InMemoryPositionStore {
    pub fn new() -> Self {
        Self {
            positions: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

impl PositionStore for InMemoryPositionStore {
    fn load(&self, flow_id: &str, visitor_id: &str) -> FlowResult<Option<VisitorPosition>> {
        Ok(self
            .positions
            .get(&(flow_id.to_string(), visitor_id.to_string()))
            .map(|p| p.clone()))
    }

    fn save(&self, position: &VisitorPosition) -> FlowResult<()> {
        self.positions.insert(
            (position.flow_id.clone(), position.visitor_id.clone()),
            position.clone(),
        );
        Ok(())
    }

    fn clear(&self, flow_id: &str, visitor_id: &str) -> FlowResult<()> {
        self.positions
            .remove(&(flow_id.to_string(), visitor_id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_answers_and_teardown() {
        let mut session = SessionContext::new("app-1", "visitor-1");
        session.record_answer("answered", serde_json::json!("yes"));
        session.set_theme("accent", "#ff6600");
        assert_eq!(session.answer("answered"), Some(&serde_json::json!("yes")));
        assert_eq!(session.theme("accent"), Some("#ff6600"));

        session.teardown();
        assert!(session.answers().is_empty());
        assert_eq!(session.theme("accent"), None);
        assert_eq!(session.visitor_id, "visitor-1");
    }

    #[test]
    fn test_store_last_write_wins() {
        let store = InMemoryPositionStore::new();
        let mut position = VisitorPosition::new("flow-1", "visitor-1", "welcome", None);
        store.save(&position).unwrap();

        position.current_node_id = "tour".into();
        store.save(&position).unwrap();

        let loaded = store.load("flow-1", "visitor-1").unwrap().unwrap();
        assert_eq!(loaded.current_node_id, "tour");
        assert_eq!(store.len(), 1);

        store.clear("flow-1", "visitor-1").unwrap();
        assert!(store.load("flow-1", "visitor-1").unwrap().is_none());
    }
}
