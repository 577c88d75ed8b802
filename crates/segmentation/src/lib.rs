//! Traffic segmentation: deterministic assignment of visitors to A/B
//! variants and validation of a flow's traffic allocation.

pub mod resolver;

pub use resolver::{
    assign_bucket, bucket, validate_allocation, AllocationSummary, SegmentationResolver,
};
