//! Analytics for Wayfinder flows: a batching event sink and per-step
//! aggregation of the stored rows.
pub mod emitter;
pub mod report;
pub mod store;

pub use emitter::{AnalyticsEmitter, WriterSummary};
pub use report::{FlowStats, StepStats};
pub use store::{AnalyticsRow, AnalyticsStore, JsonLinesStore, MemoryAnalyticsStore};
