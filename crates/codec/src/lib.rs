//! Graph codec: converts flows to and from the row shape kept by the
//! external store, validates graph integrity, and applies editor messages.

pub mod codec;
pub mod messages;
pub mod rows;
pub mod validate;

pub use codec::{deserialize, prepare_save, serialize, DecodedFlow};
pub use messages::{DraftChange, EditorMessage, FlowDraft};
pub use rows::{Connection, EncodedFlow, StepRow, VariantRow};
pub use validate::validate_graph;
