//! Thin indirection over the `tracing` macros.
//!
//! All runtime diagnostics go through this module rather than naming
//! `tracing` directly, so the logging backend can be swapped (or compiled
//! out) in one place.

pub use tracing::{debug, error, info, trace, warn};
