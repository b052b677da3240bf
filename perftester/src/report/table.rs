use super::ReportError;

/// Number of spaces between two columns.
const PADDING: usize = 5;

/// Renders rows into a left-aligned text table.
///
/// The first row is the header. If `separator` is not empty, it is repeated across the full table
/// width on the line below the header. Every row must have the same number of columns.
pub fn make_table<S: AsRef<str>>(rows: &[Vec<S>], separator: &str) -> Result<String, ReportError> {
    let Some(header) = rows.first() else {
        return Ok(String::new());
    };
    let num_columns = header.len();

    let mut widths = vec![0; num_columns];
    for (index, row) in rows.iter().enumerate() {
        if row.len() != num_columns {
            return Err(ReportError::MismatchedColumns {
                row: index,
                expected: num_columns,
                found: row.len(),
            });
        }
        for (width, item) in widths.iter_mut().zip(row) {
            *width = (*width).max(item.as_ref().chars().count());
        }
    }

    let mut table = String::new();
    for (index, row) in rows.iter().enumerate() {
        for (column, item) in row.iter().enumerate() {
            let item = item.as_ref();
            table.push_str(item);
            if column + 1 < num_columns {
                let fill = widths[column] - item.chars().count() + PADDING;
                table.extend(std::iter::repeat_n(' ', fill));
            }
        }
        table.push('\n');

        if index == 0 && !separator.is_empty() {
            let total = widths.iter().sum::<usize>() + num_columns.saturating_sub(1) * PADDING;
            table.push_str(&separator.repeat(total));
            table.push('\n');
        }
    }

    Ok(table)
}
