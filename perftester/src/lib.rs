//! Benchmarks object storage endpoints against each other.
//!
//! A run is configured with a set of *file tests* and a set of *endpoints*. A file test describes a
//! workload: `parallelism` objects of `size` bytes each, filled with pseudo-random data derived
//! from a seed. For every pair of file test and endpoint, the [`Runner`] uploads all objects
//! concurrently, downloads and verifies them against their SHA-256 digest, and deletes them again.
//! Each of the three operations is timed as a whole.
//!
//! Results are collected by a [`Reporter`]. The [`TextReporter`] renders them as one table per file
//! test, with throughput in Mbps for uploads and downloads and the elapsed time for deletes:
//!
//! ```text
//! *********
//! File: ft1
//! *********
//!
//! Operation     end1           end2
//! ---------------------------------------
//! Upload        16.00 Mbps     10.00 Mbps
//! Download      -              10.00 Mbps
//! ```
//!
//! Endpoints are reached through the [`Client`](client::Client) trait, with implementations for
//! process memory, the local filesystem and S3-compatible services.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cli;
pub mod client;
pub mod config;
pub mod datamodel;
pub mod endpoint;
pub mod observability;
pub mod payload;
pub mod report;
pub mod runner;

pub use crate::datamodel::{FileTest, Id, Operation, OperationResult};
pub use crate::endpoint::Endpoint;
pub use crate::report::{Reporter, TextReporter};
pub use crate::runner::Runner;
