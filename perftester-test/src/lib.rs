//! Test utilities for the perftester workspace.
//!
//! See the modules for all available utilities.

pub mod tracing;
