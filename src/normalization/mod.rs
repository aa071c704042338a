//! Turning untrusted API payloads into storage rows.

pub mod record;
pub mod sanitize;
pub mod timestamp;

pub use record::{
    BatchNormalizer, MapKey, NormalizedBatch, NormalizedRecord, NormalizedRow, PlayerCandidate,
    RejectReason, ServerCandidate,
};
