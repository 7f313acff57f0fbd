//! netlab library
//!
//! Orchestrates transport experiments across a sink, a source and an optional
//! in-path impairment controller. It provides an impairment policy engine
//! over `tc`, a supervisor for background capture processes, route
//! resolution and the phase sequencer that ties them together.

// Use mimalloc as the global allocator for tests (non-Windows only)
#[cfg(not(windows))]
#[cfg(test)]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod capture;
pub mod config;
pub mod error;
pub mod exec;
pub mod impairment;
pub mod interrupt;
pub mod mode;
pub mod report;
pub mod route;
pub mod sequencer;
pub mod sink;
pub mod traffic;

// Test helpers module - available when test-internals feature is enabled
#[cfg(any(test, feature = "test-internals"))]
pub mod test_helpers;

#[cfg(test)]
pub mod tests;

// Re-export commonly used items
pub use error::{ExperimentError, Result};
pub use impairment::{ImpairmentController, ImpairmentMode, ImpairmentPolicy, PolicyEngine};
pub use mode::ExperimentMode;
pub use sequencer::Sequencer;
