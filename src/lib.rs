//! Postmux - download post-processing
//!
//! This library crate exposes the orchestrator and configuration for the
//! binary and for integration testing.

pub mod config;
pub mod postprocessing;
