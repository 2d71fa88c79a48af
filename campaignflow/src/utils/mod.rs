//! Utility functions for ids, timestamps and input hashing.

mod hashing;
pub mod timestamps;

pub use hashing::{hash_input, idempotency_key};
pub use timestamps::{format_iso8601, iso_timestamp, now_utc, Timestamp};

use uuid::Uuid;

/// Generates a random (v4) id, used for campaigns and artifacts.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Generates a time-ordered (v7) id, used for derivation requests.
#[must_use]
pub fn generate_request_id() -> Uuid {
    Uuid::now_v7()
}
