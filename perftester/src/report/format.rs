use std::collections::{BTreeMap, BTreeSet};

use super::{ReportError, Snapshot, make_table};
use crate::datamodel::{Id, Operation, OperationResult};

const FILE_PREFIX: &str = "File: ";
const HEADER_SEPARATOR: &str = "-";

/// Renders a snapshot into one table per file test.
///
/// Sections are emitted for every file test that has results or a configured size, in ascending
/// order. Columns are the endpoints and rows the operations found anywhere in the snapshot. Every
/// file test with at least one result needs a non-zero size, otherwise the whole report fails with
/// [`ReportError::UnknownSize`].
pub fn format_report(
    sizes: &BTreeMap<Id, u64>,
    snapshot: &Snapshot,
) -> Result<String, ReportError> {
    let mut file_tests: BTreeSet<&Id> = sizes.keys().collect();
    let mut measured = BTreeSet::new();
    let mut endpoints = BTreeSet::new();
    let mut operations = BTreeSet::new();
    for (key, _) in snapshot.iter() {
        file_tests.insert(&key.file_test);
        measured.insert(&key.file_test);
        endpoints.insert(&key.endpoint);
        operations.insert(key.operation);
    }

    for file_test in &measured {
        if !sizes.get(*file_test).is_some_and(|size| *size > 0) {
            return Err(ReportError::UnknownSize {
                file_test: (*file_test).clone(),
            });
        }
    }

    let mut report = String::new();
    for file_test in file_tests {
        let size = sizes.get(file_test).copied().unwrap_or_default();

        let mut rows = Vec::with_capacity(operations.len() + 1);
        let mut header = vec!["Operation".to_owned()];
        header.extend(endpoints.iter().map(|endpoint| endpoint.to_string()));
        rows.push(header);

        for &operation in &operations {
            let mut row = vec![operation.to_string()];
            for endpoint in &endpoints {
                let result = snapshot.get(operation, file_test, endpoint);
                row.push(format_cell(operation, size, result));
            }
            rows.push(row);
        }

        let title = format!("{FILE_PREFIX}{file_test}");
        let stars = "*".repeat(title.chars().count());
        report.push_str(&stars);
        report.push('\n');
        report.push_str(&title);
        report.push('\n');
        report.push_str(&stars);
        report.push_str("\n\n");
        report.push_str(&make_table(&rows, HEADER_SEPARATOR)?);
        report.push('\n');
    }

    Ok(report)
}

fn format_cell(operation: Operation, size: u64, result: Option<&OperationResult>) -> String {
    let Some(result) = result else {
        return "-".to_owned();
    };

    if result.error.is_some() {
        return "ERR".to_owned();
    }

    if operation == Operation::Delete {
        return format!("{:?}", result.duration);
    }

    // too fast to measure
    if result.duration.is_zero() {
        return "inf Mbps".to_owned();
    }

    let megabits = size as f64 * 8.0 / 1000.0 / 1000.0;
    let seconds = result.duration.as_secs_f64();
    format!("{:.2} Mbps", megabits / seconds)
}
