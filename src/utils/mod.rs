//! Utility functions and helpers
//!
//! Timestamps, id generation and atomic file writes.

pub mod atomic;
pub mod ids;
pub mod time;

pub use atomic::{atomic_write_with, cleanup_temp_files};
pub use ids::generate_id;
pub use time::{format_timestamp, now_seconds};
