// src/utils/dada2.rs: DADA2 sequence table to ASV FASTA plus id-keyed table

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, WriterBuilder};
use log::debug;

use crate::config::defs::{PipelineError, ASV_PREFIX, FASTA_TAG, TSV_EXT};

/// One validated table row: the sequence and its per-sample counts as written.
#[derive(Debug, Clone, PartialEq)]
pub struct AsvRow {
    pub sequence: String,
    pub counts: Vec<String>,
}

impl AsvRow {
    /// Empty cells count as zero.
    pub fn total(&self) -> u64 {
        self.counts.iter().filter_map(|c| c.parse::<u64>().ok()).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dada2Table {
    pub headers: Vec<String>,
    pub rows: Vec<AsvRow>,
}

impl Dada2Table {
    pub fn sample_count(&self) -> usize {
        self.headers.len().saturating_sub(1)
    }
}

fn valid_sequence(sequence: &str) -> bool {
    !sequence.is_empty()
        && sequence
            .bytes()
            .all(|b| matches!(b.to_ascii_uppercase(), b'A' | b'C' | b'G' | b'T' | b'N'))
}


/// Reads and validates a DADA2 sequence table: a header row with at least two
/// columns, then one row per sequence with a nucleotide first cell and
/// unsigned integer (or empty) counts. Blank lines are skipped.
pub fn read_dada2_table(path: &Path) -> Result<Dada2Table, PipelineError> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| PipelineError::Format(format!("Cannot open {}: {}", path.display(), e)))?;
    let mut records = reader.records();

    let headers: Vec<String> = match records.next() {
        Some(row) => row
            .map_err(|e| PipelineError::Format(format!("{}: {}", path.display(), e)))?
            .iter()
            .map(str::to_string)
            .collect(),
        None => return Err(PipelineError::Format(format!("{}: input file is empty", path.display()))),
    };
    if headers.len() < 2 {
        return Err(PipelineError::Format(format!(
            "{}: a DADA2 table needs a sequence column and at least one sample column",
            path.display()
        )));
    }

    let mut rows = Vec::new();
    for result in records {
        let row = result.map_err(|e| PipelineError::Format(format!("{}: {}", path.display(), e)))?;
        let line = row.position().map(|p| p.line()).unwrap_or(0);
        if row.len() != headers.len() {
            return Err(PipelineError::Format(format!(
                "{} line {}: {} fields, expected {}",
                path.display(),
                line,
                row.len(),
                headers.len()
            )));
        }

        let sequence = row.get(0).unwrap_or("");
        if !valid_sequence(sequence) {
            let shown: String = sequence.chars().take(50).collect();
            return Err(PipelineError::Format(format!(
                "{} line {}: invalid sequence '{}'",
                path.display(),
                line,
                shown
            )));
        }

        let mut counts = Vec::with_capacity(headers.len() - 1);
        for (column, count) in row.iter().enumerate().skip(1) {
            if !count.is_empty() && (!count.bytes().all(|b| b.is_ascii_digit()) || count.parse::<u64>().is_err()) {
                return Err(PipelineError::Format(format!(
                    "{} line {}: invalid count '{}' in column {}",
                    path.display(),
                    line,
                    count,
                    headers[column]
                )));
            }
            counts.push(count.to_string());
        }
        rows.push(AsvRow {
            sequence: sequence.to_string(),
            counts,
        });
    }

    if rows.is_empty() {
        return Err(PipelineError::Format(format!("{}: no sequences found", path.display())));
    }
    Ok(Dada2Table { headers, rows })
}


/// `<base>.fasta` and `<base>.tsv`; an extension already on `base` is replaced.
pub fn split_output_paths(base: &Path) -> (PathBuf, PathBuf) {
    (base.with_extension(FASTA_TAG), base.with_extension(TSV_EXT))
}

/// Writes `>ASV<n> counts=<total>` records (one line per sequence) and the
/// table with each sequence replaced by its ASV id, in input row order.
///
/// # Arguments
///
/// * `table` - Validated table from read_dada2_table.
/// * `base` - Output basename.
///
/// # Returns
/// (FASTA path, TSV path)
pub fn write_dada2_split(table: &Dada2Table, base: &Path) -> Result<(PathBuf, PathBuf), PipelineError> {
    let (fasta_path, tsv_path) = split_output_paths(base);

    let mut fasta = BufWriter::new(File::create(&fasta_path)?);
    for (index, row) in table.rows.iter().enumerate() {
        writeln!(fasta, ">{}{} counts={}", ASV_PREFIX, index + 1, row.total())?;
        writeln!(fasta, "{}", row.sequence)?;
    }
    fasta.flush()?;

    let map_csv = |e: csv::Error| PipelineError::Format(format!("{}: {}", tsv_path.display(), e));
    let mut writer = WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(&tsv_path)
        .map_err(map_csv)?;
    writer.write_record(&table.headers).map_err(map_csv)?;
    for (index, row) in table.rows.iter().enumerate() {
        let id = format!("{}{}", ASV_PREFIX, index + 1);
        writer
            .write_record(std::iter::once(id.as_str()).chain(row.counts.iter().map(String::as_str)))
            .map_err(map_csv)?;
    }
    writer.flush()?;

    debug!("Wrote {} ASVs to {} and {}", table.rows.len(), fasta_path.display(), tsv_path.display());
    Ok((fasta_path, tsv_path))
}
