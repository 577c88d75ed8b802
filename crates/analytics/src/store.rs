//! Destinations for flushed analytics batches.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use wayfinder_core::types::{AnalyticsEvent, EventType};

/// One stored analytics row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsRow {
    pub id: Uuid,
    pub flow_id: String,
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub variation_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    pub event_type: EventType,
    pub created_at: DateTime<Utc>,
}

impl From<&AnalyticsEvent> for AnalyticsRow {
    fn from(event: &AnalyticsEvent) -> Self {
        Self {
            id: event.id,
            flow_id: event.flow_id.clone(),
            step_id: event.step_id.clone(),
            variation_id: event.variation_id.clone(),
            user_id: event.user_id.clone(),
            event_type: event.event_type,
            created_at: event.created_at,
        }
    }
}

#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    async fn write_batch(&self, rows: &[AnalyticsRow]) -> anyhow::Result<()>;
}

/// Keeps rows in memory. Used by tests and the CLI.
#[derive(Default)]
pub struct MemoryAnalyticsStore {
    rows: Mutex<Vec<AnalyticsRow>>,
    batches: Mutex<Vec<usize>>,
}

impl MemoryAnalyticsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<AnalyticsRow> {
        self.rows.lock().expect("analytics store mutex poisoned").clone()
    }

    /// Size of every batch written, in order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches
            .lock()
            .expect("analytics store mutex poisoned")
            .clone()
    }
}

#[async_trait]
impl AnalyticsStore for MemoryAnalyticsStore {
    async fn write_batch(&self, rows: &[AnalyticsRow]) -> anyhow::Result<()> {
        self.rows
            .lock()
            .expect("analytics store mutex poisoned")
            .extend_from_slice(rows);
        self.batches
            .lock()
            .expect("analytics store mutex poisoned")
            .push(rows.len());
        Ok(())
    }
}

/// Appends rows to a newline-delimited JSON file.
#[derive(Debug, Clone)]
pub struct JsonLinesStore {
    path: PathBuf,
}

impl JsonLinesStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every row back. Blank lines are skipped.
    pub async fn read_all(&self) -> anyhow::Result<Vec<AnalyticsRow>> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        parse_rows(&text)
    }
}

#[async_trait]
impl AnalyticsStore for JsonLinesStore {
    async fn write_batch(&self, rows: &[AnalyticsRow]) -> anyhow::Result<()> {
        let mut buf = String::new();
        for row in rows {
            buf.push_str(&serde_json::to_string(row)?);
            buf.push('\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Parses NDJSON analytics rows.
pub fn parse_rows(text: &str) -> anyhow::Result<Vec<AnalyticsRow>> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            serde_json::from_str(line)
                .map_err(|e| anyhow::anyhow!("line {}: {}", number + 1, e))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayfinder_core::event_bus::make_event;

    fn row(event_type: EventType, step: &str) -> AnalyticsRow {
        AnalyticsRow::from(&make_event(
            event_type,
            "flow-1",
            Some(step.into()),
            Some("B".into()),
            Some("visitor-1".into()),
        ))
    }

    #[test]
    fn test_row_drops_runtime_fields() {
        let mut event = make_event(EventType::View, "flow-1", Some("welcome".into()), None, None);
        event.milestone_index = Some(1);
        let json = serde_json::to_value(AnalyticsRow::from(&event)).unwrap();
        assert!(json.get("milestone_index").is_none());
        assert_eq!(json["event_type"], "view");
    }

    #[test]
    fn test_parse_rows_reports_line() {
        let good = serde_json::to_string(&row(EventType::View, "a")).unwrap();
        let text = format!("{good}\n\n{{not json}}\n");
        let err = parse_rows(&text).unwrap_err();
        assert!(err.to_string().starts_with("line 3:"));
        assert_eq!(parse_rows(&format!("{good}\n\n")).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_json_lines_store_appends() {
        let path = std::env::temp_dir().join(format!("wayfinder-rows-{}.ndjson", Uuid::new_v4()));
        let store = JsonLinesStore::new(&path);

        store
            .write_batch(&[row(EventType::View, "a"), row(EventType::Complete, "a")])
            .await
            .unwrap();
        store.write_batch(&[row(EventType::Skip, "b")]).await.unwrap();

        let rows = store.read_all().await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].event_type, EventType::Skip);
        assert_eq!(rows[0].variation_id.as_deref(), Some("B"));

        tokio::fs::remove_file(&path).await.unwrap();
    }
}
