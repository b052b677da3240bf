//! Collects operation results and renders them as a comparison table.
//!
//! Results are submitted through the [`Reporter`] trait, possibly from many tasks at once. The
//! [`TextReporter`] keeps them in a single flat map keyed by file test, operation and endpoint.
//! Rendering works on an immutable [`Snapshot`] and does not depend on submission order.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::datamodel::{Id, Operation, OperationResult};

mod format;
mod table;

pub use format::format_report;
pub use table::make_table;

/// Errors raised while aggregating or rendering results.
#[derive(Debug, Error)]
pub enum ReportError {
    /// A result was submitted with malformed identifiers.
    #[error("invalid result submission: {0}")]
    InvalidSubmission(String),

    /// A result exists for a file test whose size is not configured.
    #[error("unknown file test size for {file_test}")]
    UnknownSize {
        /// The file test lacking a size.
        file_test: Id,
    },

    /// A table row does not have as many columns as the header.
    #[error("mismatched column numbers: row {row} has {found} columns, expected {expected}")]
    MismatchedColumns {
        /// Index of the offending row.
        row: usize,
        /// Number of columns in the first row.
        expected: usize,
        /// Number of columns in the offending row.
        found: usize,
    },
}

/// Accepts results as operations finish.
pub trait Reporter: Send + Sync {
    /// Records the result of `operation` for the given file test and endpoint.
    ///
    /// An error from this method aborts the whole benchmark run.
    fn report(
        &self,
        operation: Operation,
        file_test: &Id,
        endpoint: &Id,
        result: OperationResult,
    ) -> Result<(), ReportError>;
}

/// Composite key of the result store.
///
/// The field order defines the iteration order of the store.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResultKey {
    /// The file test the result belongs to.
    pub file_test: Id,
    /// The operation that was timed.
    pub operation: Operation,
    /// The endpoint the operation ran against.
    pub endpoint: Id,
}

type ResultStore = BTreeMap<ResultKey, OperationResult>;

/// A consistent, immutable view of all results submitted so far.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    results: ResultStore,
}

impl Snapshot {
    /// Returns the result for the given triple, if one was submitted.
    pub fn get(
        &self,
        operation: Operation,
        file_test: &Id,
        endpoint: &Id,
    ) -> Option<&OperationResult> {
        self.results.get(&ResultKey {
            file_test: file_test.clone(),
            operation,
            endpoint: endpoint.clone(),
        })
    }

    /// Iterates all results in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&ResultKey, &OperationResult)> {
        self.results.iter()
    }

    /// Iterates all failed results in key order.
    pub fn failures(&self) -> impl Iterator<Item = (&ResultKey, &str)> {
        self.results
            .iter()
            .filter_map(|(key, result)| Some((key, result.error.as_deref()?)))
    }

    /// Returns the number of results.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns `true` if no results were submitted.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

impl FromIterator<(ResultKey, OperationResult)> for Snapshot {
    fn from_iter<T: IntoIterator<Item = (ResultKey, OperationResult)>>(iter: T) -> Self {
        Self {
            results: iter.into_iter().collect(),
        }
    }
}

/// A thread-safe [`Reporter`] that renders a text report.
#[derive(Debug, Default)]
pub struct TextReporter {
    sizes: BTreeMap<Id, u64>,
    store: Mutex<ResultStore>,
}

impl TextReporter {
    /// Creates a reporter with the configured payload size of every file test.
    pub fn new(sizes: BTreeMap<Id, u64>) -> Self {
        Self {
            sizes,
            store: Mutex::default(),
        }
    }

    fn store(&self) -> MutexGuard<'_, ResultStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a snapshot of all results submitted so far.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            results: self.store().clone(),
        }
    }

    /// Renders all results submitted so far.
    pub fn format_results(&self) -> Result<String, ReportError> {
        format_report(&self.sizes, &self.snapshot())
    }
}

impl Reporter for TextReporter {
    fn report(
        &self,
        operation: Operation,
        file_test: &Id,
        endpoint: &Id,
        result: OperationResult,
    ) -> Result<(), ReportError> {
        if file_test.is_empty() {
            return Err(ReportError::InvalidSubmission(
                "empty file test identifier".into(),
            ));
        }
        if endpoint.is_empty() {
            return Err(ReportError::InvalidSubmission(
                "empty endpoint identifier".into(),
            ));
        }

        let key = ResultKey {
            file_test: file_test.clone(),
            operation,
            endpoint: endpoint.clone(),
        };
        self.store().insert(key, result);
        Ok(())
    }
}
