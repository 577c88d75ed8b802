//! Deterministic variant assignment.
//!
//! A visitor's bucket is a pure function of `(flow_id, visitor_id)`, so the
//! same visitor lands in the same variant on every page load and across
//! process restarts for as long as the variant list is unchanged.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use wayfinder_core::error::SegmentAssignmentError;
use wayfinder_core::types::Variant;

/// Bucket resolution: 10 000 slots, i.e. two decimals of a percentage.
const BUCKET_SLOTS: u64 = 10_000;

/// Hashes `(flow_id, visitor_id)` to a value in `[0, 100)`.
pub fn bucket(flow_id: &str, visitor_id: &str) -> f64 {
    let mut hasher = Sha256::new();
    // Length prefixes keep ("ab", "c") and ("a", "bc") apart.
    hasher.update((flow_id.len() as u64).to_be_bytes());
    hasher.update(flow_id.as_bytes());
    hasher.update((visitor_id.len() as u64).to_be_bytes());
    hasher.update(visitor_id.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let slot = u64::from_be_bytes(prefix) % BUCKET_SLOTS;
    slot as f64 / 100.0
}

/// Walks active variants in authored order; the first cumulative boundary
/// above `bucket` wins. `None` is the implicit control.
pub fn assign_bucket(bucket: f64, variants: &[Variant]) -> Option<&Variant> {
    let mut boundary = 0.0;
    for variant in variants.iter().filter(|v| v.is_active) {
        boundary += variant.traffic_percentage;
        if bucket < boundary {
            return Some(variant);
        }
    }
    None
}

/// Assigns visitors to variants of a flow.
#[derive(Debug, Clone, Default)]
pub struct SegmentationResolver;

impl SegmentationResolver {
    pub fn new() -> Self {
        Self
    }

    /// Variant id for the visitor, or `None` for the control path.
    pub fn assign(&self, flow_id: &str, visitor_id: &str, variants: &[Variant]) -> Option<String> {
        let bucket = bucket(flow_id, visitor_id);
        let assigned = assign_bucket(bucket, variants).map(|v| v.id.clone());
        debug!(
            flow_id = %flow_id,
            visitor_id = %visitor_id,
            bucket = bucket,
            variant = ?assigned,
            "Resolved traffic variant"
        );
        assigned
    }
}

/// How a flow's traffic splits between variants and control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationSummary {
    pub allocated: f64,
    pub control_share: f64,
    pub active_variants: usize,
}

/// Checks a variant list before it is saved.
pub fn validate_allocation(
    variants: &[Variant],
) -> Result<AllocationSummary, SegmentAssignmentError> {
    let mut seen = HashSet::new();
    let mut allocated = 0.0;
    let mut active_variants = 0;

    for variant in variants {
        if !seen.insert(variant.id.as_str()) {
            return Err(SegmentAssignmentError::DuplicateVariant(variant.id.clone()));
        }
        let value = variant.traffic_percentage;
        if !value.is_finite() || !(0.0..=100.0).contains(&value) {
            return Err(SegmentAssignmentError::OutOfRange {
                variant_id: variant.id.clone(),
                value,
            });
        }
        if variant.is_active {
            allocated += value;
            active_variants += 1;
        }
    }

    // Tolerate float noise from percentages like 33.33 + 33.33 + 33.34.
    if allocated > 100.0 + 1e-9 {
        return Err(SegmentAssignmentError::OverAllocated { total: allocated });
    }

    Ok(AllocationSummary {
        allocated,
        control_share: (100.0 - allocated).max(0.0),
        active_variants,
    })
}
