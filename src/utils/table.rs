// src/utils/table.rs: tab-separated table shape checks

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use csv::ReaderBuilder;

use crate::config::defs::PipelineError;

/// Row count, first-row width and how many rows have each width.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableShape {
    pub rows: usize,
    pub columns: usize,
    pub distribution: BTreeMap<usize, usize>,
}

impl TableShape {
    pub fn is_consistent(&self) -> bool {
        self.distribution.len() <= 1
    }

    /// Summary lines as printed by the check-tab module.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Total rows: {}", self.rows);
        if self.is_consistent() {
            let _ = writeln!(out, "Columns: {} (consistent)", self.columns);
        } else {
            let _ = writeln!(out, "Column count distribution:");
            for (width, count) in &self.distribution {
                let percentage = *count as f64 / self.rows as f64 * 100.0;
                let _ = writeln!(out, "  {} columns: {} rows ({:.1}%)", width, count, percentage);
            }
        }
        out
    }
}


/// Measures a tab-separated file.
///
/// # Arguments
///
/// * `path` - Table to read; blank lines are not rows.
/// * `strict` - Fail at the first row whose width differs from the first row.
///
/// # Returns
/// The table shape, or a Format error naming the offending row.
pub fn check_table(path: &Path, strict: bool) -> Result<TableShape, PipelineError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| PipelineError::Format(format!("Cannot open {}: {}", path.display(), e)))?;

    let mut shape = TableShape::default();
    for (index, result) in reader.records().enumerate() {
        let row = result.map_err(|e| PipelineError::Format(format!("{}: {}", path.display(), e)))?;
        let width = row.len();
        *shape.distribution.entry(width).or_insert(0) += 1;
        if shape.rows == 0 {
            shape.columns = width;
        } else if strict && width != shape.columns {
            return Err(PipelineError::Format(format!(
                "{}: inconsistent column count at row {}: expected {}, got {}",
                path.display(),
                index + 1,
                shape.columns,
                width
            )));
        }
        shape.rows += 1;
    }
    Ok(shape)
}
