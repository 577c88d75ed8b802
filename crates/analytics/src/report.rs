//! Per-step flow statistics computed from analytics rows.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use wayfinder_core::types::{AnalyticsEvent, EventType};

use crate::store::AnalyticsRow;

/// Visitors without a variation are reported under this key.
pub const CONTROL_VARIANT: &str = "control";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStats {
    pub step_id: String,
    pub views: u64,
    /// Distinct visitors that saw the step at least once.
    pub viewers: u64,
    pub completes: u64,
    pub skips: u64,
    pub clicks: u64,
    /// `completes / viewers`, 0 when nobody saw the step.
    pub completion_rate: f64,
    pub skip_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStats {
    pub flow_id: String,
    pub visitors: u64,
    pub events: u64,
    /// Steps in order of first appearance.
    pub steps: Vec<StepStats>,
    /// Distinct visitors per variation.
    pub variants: BTreeMap<String, u64>,
}

#[derive(Default)]
struct StepTally {
    views: u64,
    viewers: HashSet<String>,
    completes: u64,
    skips: u64,
    clicks: u64,
}

impl FlowStats {
    /// Aggregates the rows belonging to `flow_id`; other flows are ignored.
    pub fn from_rows(flow_id: &str, rows: &[AnalyticsRow]) -> Self {
        let mut order: Vec<String> = Vec::new();
        let mut tallies: HashMap<String, StepTally> = HashMap::new();
        let mut visitors: HashSet<&str> = HashSet::new();
        let mut variants: HashMap<String, HashSet<&str>> = HashMap::new();
        let mut events: u64 = 0;

        for row in rows.iter().filter(|r| r.flow_id == flow_id) {
            events += 1;
            if let Some(user) = row.user_id.as_deref() {
                visitors.insert(user);
                let variant = row
                    .variation_id
                    .clone()
                    .unwrap_or_else(|| CONTROL_VARIANT.to_string());
                variants.entry(variant).or_default().insert(user);
            }

            let Some(step_id) = row.step_id.as_ref() else {
                continue;
            };
            let tally = tallies.entry(step_id.clone()).or_insert_with(|| {
                order.push(step_id.clone());
                StepTally::default()
            });
            match row.event_type {
                EventType::View => {
                    tally.views += 1;
                    if let Some(user) = &row.user_id {
                        tally.viewers.insert(user.clone());
                    }
                }
                EventType::Complete => tally.completes += 1,
                EventType::Skip => tally.skips += 1,
                EventType::Click => tally.clicks += 1,
            }
        }

        let steps = order
            .into_iter()
            .filter_map(|step_id| {
                let tally = tallies.remove(&step_id)?;
                let viewers = tally.viewers.len() as u64;
                Some(StepStats {
                    step_id,
                    views: tally.views,
                    viewers,
                    completes: tally.completes,
                    skips: tally.skips,
                    clicks: tally.clicks,
                    completion_rate: rate(tally.completes, viewers),
                    skip_rate: rate(tally.skips, viewers),
                })
            })
            .collect();

        Self {
            flow_id: flow_id.to_string(),
            visitors: visitors.len() as u64,
            events,
            steps,
            variants: variants
                .into_iter()
                .map(|(variant, users)| (variant, users.len() as u64))
                .collect(),
        }
    }

    pub fn from_events(flow_id: &str, events: &[AnalyticsEvent]) -> Self {
        let rows: Vec<AnalyticsRow> = events.iter().map(AnalyticsRow::from).collect();
        Self::from_rows(flow_id, &rows)
    }

    /// One report per flow found in `rows`, sorted by flow id.
    pub fn group(rows: &[AnalyticsRow]) -> Vec<FlowStats> {
        let mut flow_ids: Vec<&str> = rows.iter().map(|r| r.flow_id.as_str()).collect();
        flow_ids.sort_unstable();
        flow_ids.dedup();
        flow_ids
            .into_iter()
            .map(|flow_id| Self::from_rows(flow_id, rows))
            .collect()
    }

    pub fn step(&self, step_id: &str) -> Option<&StepStats> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

fn rate(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayfinder_core::event_bus::make_event;

    fn ev(event_type: EventType, step: &str, visitor: &str, variant: Option<&str>) -> AnalyticsEvent {
        make_event(
            event_type,
            "tour",
            Some(step.into()),
            variant.map(String::from),
            Some(visitor.into()),
        )
    }

    #[test]
    fn test_step_counts_and_rates() {
        let events = vec![
            ev(EventType::View, "welcome", "v1", Some("A")),
            ev(EventType::View, "welcome", "v1", Some("A")),
            ev(EventType::Complete, "welcome", "v1", Some("A")),
            ev(EventType::View, "welcome", "v2", Some("B")),
            ev(EventType::Click, "welcome", "v2", Some("B")),
            ev(EventType::Skip, "welcome", "v2", Some("B")),
            ev(EventType::View, "path-a", "v1", Some("A")),
        ];
        let stats = FlowStats::from_events("tour", &events);

        assert_eq!(stats.visitors, 2);
        assert_eq!(stats.events, 7);
        let ids: Vec<_> = stats.steps.iter().map(|s| s.step_id.as_str()).collect();
        assert_eq!(ids, ["welcome", "path-a"]);

        let welcome = stats.step("welcome").unwrap();
        assert_eq!(welcome.views, 3);
        assert_eq!(welcome.viewers, 2);
        assert_eq!(welcome.completes, 1);
        assert_eq!(welcome.skips, 1);
        assert_eq!(welcome.clicks, 1);
        assert!((welcome.completion_rate - 0.5).abs() < f64::EPSILON);
        assert!((welcome.skip_rate - 0.5).abs() < f64::EPSILON);

        assert_eq!(stats.variants.get("A"), Some(&1));
        assert_eq!(stats.variants.get("B"), Some(&1));
    }

    #[test]
    fn test_missing_variation_counts_as_control() {
        let events = vec![ev(EventType::View, "welcome", "v1", None)];
        let stats = FlowStats::from_events("tour", &events);
        assert_eq!(stats.variants.get(CONTROL_VARIANT), Some(&1));
    }

    #[test]
    fn test_completion_without_view_has_zero_rate() {
        let events = vec![ev(EventType::Complete, "api", "v1", None)];
        let stats = FlowStats::from_events("tour", &events);
        let api = stats.step("api").unwrap();
        assert_eq!(api.completes, 1);
        assert_eq!(api.completion_rate, 0.0);
    }

    #[test]
    fn test_group_splits_by_flow() {
        let mut other = ev(EventType::View, "intro", "v9", None);
        other.flow_id = "another".into();
        let rows: Vec<AnalyticsRow> = [ev(EventType::View, "welcome", "v1", None), other]
            .iter()
            .map(AnalyticsRow::from)
            .collect();

        let grouped = FlowStats::group(&rows);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].flow_id, "another");
        assert_eq!(grouped[1].flow_id, "tour");
        assert_eq!(grouped[1].events, 1);
    }
}
