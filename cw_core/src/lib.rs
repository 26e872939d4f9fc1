//! ABOUTME: Core types, errors, IDs, and tracing utilities
//! ABOUTME: Foundation crate used by all other camwatch components

pub mod error;
pub mod id;
pub mod telemetry;
pub mod time;

pub use error::{Error, PoolKind, Result};
pub use id::{CameraId, Id};
pub use time::{to_rfc3339, utc_now};
