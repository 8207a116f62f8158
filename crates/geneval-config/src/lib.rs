//! Runtime configuration shared by the geneval crates.
//!
//! [`determinism`] decides how random number generators are seeded and
//! [`init_tracing`] installs the process-wide tracing subscriber.

pub mod determinism;
mod tracing;

pub use determinism::{rng_from_label, rng_from_optional, DeterminismConfig};
pub use tracing::{flush_chrome_trace, init_tracing, InitError, CHROME_TRACE_ENV};
