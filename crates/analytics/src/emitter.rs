//! Asynchronous analytics emitter that batches events and writes them to an
//! [`AnalyticsStore`]. Submission never blocks the player: events go through a
//! bounded channel and are dropped, with a counter, when it is full.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use wayfinder_core::config::AnalyticsConfig;
use wayfinder_core::event_bus::EventSink;
use wayfinder_core::types::AnalyticsEvent;

use crate::store::{AnalyticsRow, AnalyticsStore};

/// What the background writer did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterSummary {
    pub flushed: u64,
    pub batches: u64,
    pub failed_batches: u64,
}

/// Event sink with a background batch writer.
#[derive(Clone)]
pub struct AnalyticsEmitter {
    sender: mpsc::Sender<AnalyticsEvent>,
}

impl AnalyticsEmitter {
    /// Creates the emitter and spawns its writer. The writer flushes what is
    /// left and stops once every clone of the emitter has been dropped.
    pub fn spawn(
        config: &AnalyticsConfig,
        store: Arc<dyn AnalyticsStore>,
    ) -> (Self, JoinHandle<WriterSummary>) {
        let (sender, receiver) = mpsc::channel::<AnalyticsEvent>(config.channel_capacity.max(1));
        let writer = BatchWriter {
            store,
            batch_size: config.batch_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
        };
        let handle = tokio::spawn(writer.run(receiver));

        info!(
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval_ms,
            "Analytics emitter started"
        );
        (Self { sender }, handle)
    }
}

impl EventSink for AnalyticsEmitter {
    fn emit(&self, event: AnalyticsEvent) {
        if let Err(e) = self.sender.try_send(event) {
            metrics::counter!("analytics.dropped").increment(1);
            warn!("Analytics event dropped: {}", e);
        } else {
            metrics::counter!("analytics.queued").increment(1);
        }
    }
}

struct BatchWriter {
    store: Arc<dyn AnalyticsStore>,
    batch_size: usize,
    flush_interval: Duration,
}

impl BatchWriter {
    async fn run(self, mut receiver: mpsc::Receiver<AnalyticsEvent>) -> WriterSummary {
        let mut summary = WriterSummary::default();
        let mut buffer: Vec<AnalyticsEvent> = Vec::with_capacity(self.batch_size);
        let mut interval = tokio::time::interval(self.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = receiver.recv() => match received {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= self.batch_size {
                            self.flush(&mut buffer, &mut summary).await;
                        }
                    }
                    None => {
                        if !buffer.is_empty() {
                            self.flush(&mut buffer, &mut summary).await;
                        }
                        break;
                    }
                },
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer, &mut summary).await;
                    }
                }
            }
        }

        info!(flushed = summary.flushed, failed_batches = summary.failed_batches, "Analytics writer stopped");
        summary
    }

    async fn flush(&self, buffer: &mut Vec<AnalyticsEvent>, summary: &mut WriterSummary) {
        let rows: Vec<AnalyticsRow> = buffer.drain(..).map(|e| AnalyticsRow::from(&e)).collect();
        let count = rows.len();
        debug!(count = count, "Flushing analytics batch");

        summary.batches += 1;
        match self.store.write_batch(&rows).await {
            Ok(()) => {
                metrics::counter!("analytics.flushed").increment(count as u64);
                summary.flushed += count as u64;
            }
            Err(e) => {
                metrics::counter!("analytics.flush_errors").increment(1);
                summary.failed_batches += 1;
                error!(error = %e, count = count, "Failed to flush analytics batch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryAnalyticsStore;
    use async_trait::async_trait;
    use wayfinder_core::event_bus::make_event;
    use wayfinder_core::types::EventType;

    fn event(step: &str) -> AnalyticsEvent {
        make_event(
            EventType::View,
            "flow-1",
            Some(step.into()),
            None,
            Some("visitor-1".into()),
        )
    }

    fn config(batch_size: usize, flush_interval_ms: u64, channel_capacity: usize) -> AnalyticsConfig {
        AnalyticsConfig {
            batch_size,
            flush_interval_ms,
            channel_capacity,
        }
    }

    struct FailingStore;

    #[async_trait]
    impl AnalyticsStore for FailingStore {
        async fn write_batch(&self, _rows: &[AnalyticsRow]) -> anyhow::Result<()> {
            anyhow::bail!("store unavailable")
        }
    }

    #[tokio::test]
    async fn test_full_batches_and_final_flush() {
        let store = Arc::new(MemoryAnalyticsStore::new());
        let (emitter, writer) = AnalyticsEmitter::spawn(&config(2, 60_000, 16), store.clone());

        for step in ["a", "b", "c", "d", "e"] {
            emitter.emit(event(step));
        }
        drop(emitter);

        let summary = writer.await.unwrap();
        assert_eq!(summary.flushed, 5);
        assert_eq!(store.batch_sizes(), vec![2, 2, 1]);
        let steps: Vec<_> = store
            .rows()
            .into_iter()
            .filter_map(|r| r.step_id)
            .collect();
        assert_eq!(steps, ["a", "b", "c", "d", "e"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flushes_partial_batch() {
        let store = Arc::new(MemoryAnalyticsStore::new());
        let (emitter, _writer) = AnalyticsEmitter::spawn(&config(100, 1000, 16), store.clone());

        emitter.emit(event("a"));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let store = Arc::new(MemoryAnalyticsStore::new());
        let (emitter, writer) = AnalyticsEmitter::spawn(&config(100, 60_000, 2), store.clone());

        // The writer has not run yet, so only two events fit.
        for step in ["a", "b", "c", "d"] {
            emitter.emit(event(step));
        }
        drop(emitter);

        assert_eq!(writer.await.unwrap().flushed, 2);
    }

    #[tokio::test]
    async fn test_failed_batches_are_counted() {
        let (emitter, writer) = AnalyticsEmitter::spawn(&config(1, 60_000, 16), Arc::new(FailingStore));
        emitter.emit(event("a"));
        emitter.emit(event("b"));
        drop(emitter);

        let summary = writer.await.unwrap();
        assert_eq!(summary.flushed, 0);
        assert_eq!(summary.failed_batches, 2);
    }
}
