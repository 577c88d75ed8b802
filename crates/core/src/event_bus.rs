//! Event bus: the trait every component emits lifecycle analytics through.
//!
//! The runtime player and action dispatcher accept an `Arc<dyn EventSink>`;
//! the analytics crate provides the batching implementation that writes rows
//! to the external store.

use crate::types::{AnalyticsEvent, EventType};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Sink for analytics events. Implementations must not block the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AnalyticsEvent);
}

/// No-op sink for callers that don't collect analytics.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: AnalyticsEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<AnalyticsEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// `(event_type, step_id, milestone_index)` triples in emission order.
    pub fn timeline(&self) -> Vec<(EventType, Option<String>, Option<usize>)> {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .map(|e| (e.event_type, e.step_id.clone(), e.milestone_index))
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus mutex poisoned").clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: AnalyticsEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Convenience builder for an `AnalyticsEvent` stamped now.
pub fn make_event(
    event_type: EventType,
    flow_id: impl Into<String>,
    step_id: Option<String>,
    variation_id: Option<String>,
    user_id: Option<String>,
) -> AnalyticsEvent {
    AnalyticsEvent {
        id: Uuid::new_v4(),
        event_type,
        flow_id: flow_id.into(),
        step_id,
        variation_id,
        user_id,
        milestone_index: None,
        created_at: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
