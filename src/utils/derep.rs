// src/utils/derep.rs: merging per-sample dereplicated FASTA into one abundance-ranked set

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use fxhash::FxHashMap;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;

use crate::config::defs::{PipelineError, SIZE_TAG};
use crate::utils::fastx::{fasta_reader, write_fasta_record, FastaRecord};

lazy_static! {
    static ref SIZE_RE: Regex = Regex::new(&format!("{}([0-9]+)", regex::escape(SIZE_TAG)))
        .expect("static size pattern");
}

/// One distinct sequence and its total abundance.
#[derive(Debug, Clone, PartialEq)]
pub struct UniqueSequence {
    pub seq: Vec<u8>,
    pub size: u64,
}

/// Reads the `;size=N` abundance annotation out of a FASTA header id.
pub fn parse_size(id: &str) -> Option<u64> {
    SIZE_RE
        .captures(id)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Groups identical sequences across all inputs, summing their abundances.
/// Missing inputs are skipped with a warning. Returned in descending abundance,
/// ties kept in first-encounter order.
pub fn collect_uniques(inputs: &[PathBuf]) -> Result<Vec<UniqueSequence>, PipelineError> {
    let mut index: FxHashMap<Vec<u8>, usize> = FxHashMap::default();
    let mut uniques: Vec<UniqueSequence> = Vec::new();

    for path in inputs {
        if !path.exists() {
            warn!("Skipping missing dereplicated file {}", path.display());
            continue;
        }
        let reader = fasta_reader(path)?;
        let mut records = 0usize;
        for result in reader.into_records() {
            let record: FastaRecord = result
                .map_err(|e| PipelineError::Format(format!("{}: {}", path.display(), e)))?
                .into();
            let size = parse_size(&record.id).ok_or_else(|| {
                PipelineError::Format(format!(
                    "{}: sequence '{}' has no {}<int> abundance annotation",
                    path.display(),
                    record.id,
                    SIZE_TAG
                ))
            })?;
            let seq: Vec<u8> = record.seq.into_iter().filter(|b| !b.is_ascii_whitespace()).collect();
            match index.get(&seq) {
                Some(&i) => uniques[i].size += size,
                None => {
                    index.insert(seq.clone(), uniques.len());
                    uniques.push(UniqueSequence { seq, size });
                }
            }
            records += 1;
        }
        debug!("{}: {} records", path.display(), records);
    }

    // sort_by is stable: equal sizes keep encounter order
    uniques.sort_by(|a, b| b.size.cmp(&a.size));
    Ok(uniques)
}

/// Writes the combined uniques of `inputs` to `output`, renamed `seq1..seqN` by rank.
///
/// # Returns
/// Number of distinct sequences written.
pub fn combine_uniques(output: &Path, inputs: &[PathBuf]) -> Result<usize, PipelineError> {
    let uniques = collect_uniques(inputs)?;
    let mut writer = BufWriter::new(File::create(output)?);
    for (rank, unique) in uniques.iter().enumerate() {
        let id = format!("seq{}{}{}", rank + 1, SIZE_TAG, unique.size);
        write_fasta_record(&mut writer, &id, None, &unique.seq)?;
    }
    writer.flush()?;
    info!("Combined {} input files into {} unique sequences", inputs.len(), uniques.len());
    Ok(uniques.len())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn headers(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|l| l.starts_with('>'))
            .map(|l| l.to_string())
            .collect()
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("uniq1;size=12"), Some(12));
        assert_eq!(parse_size("S1.3;size=7;"), Some(7));
        assert_eq!(parse_size("uniq1"), None);
        assert_eq!(parse_size("uniq1;size=abc"), None);
    }

    #[test]
    fn test_sums_across_files() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let a = dir.path().join("a.fasta");
        let b = dir.path().join("b.fasta");
        fs::write(&a, ">x;size=3\nAAA\n")?;
        fs::write(&b, ">y;size=5\nAAA\n")?;
        let out = dir.path().join("uniques.fasta");

        let written = combine_uniques(&out, &[a, b])?;
        assert_eq!(written, 1);
        assert_eq!(fs::read_to_string(&out)?, ">seq1;size=8\nAAA\n");
        Ok(())
    }

    #[test]
    fn test_descending_rank_names() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("derep.fasta");
        fs::write(&input, ">a;size=5\nCCCC\n>b;size=8\nGGGG\n>c;size=1\nTTTT\n")?;
        let out = dir.path().join("uniques.fasta");

        combine_uniques(&out, &[input])?;
        let text = fs::read_to_string(&out)?;
        assert_eq!(text, ">seq1;size=8\nGGGG\n>seq2;size=5\nCCCC\n>seq3;size=1\nTTTT\n");
        Ok(())
    }

    #[test]
    fn test_ties_keep_encounter_order() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let a = dir.path().join("a.fasta");
        let b = dir.path().join("b.fasta");
        fs::write(&a, ">a1;size=2\nTTTT\n>a2;size=1\nCCCC\n")?;
        fs::write(&b, ">b1;size=2\nAAAA\n>b2;size=1\nCCCC\n")?;

        let uniques = collect_uniques(&[a, b])?;
        let seqs: Vec<&[u8]> = uniques.iter().map(|u| u.seq.as_slice()).collect();
        // all three sum to 2; CCCC was seen before AAAA
        assert_eq!(seqs, vec![&b"TTTT"[..], &b"CCCC"[..], &b"AAAA"[..]]);
        assert!(uniques.iter().all(|u| u.size == 2));
        Ok(())
    }

    #[test]
    fn test_missing_input_skipped() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let a = dir.path().join("a.fasta");
        fs::write(&a, ">x;size=2\nACGT\n")?;
        let missing = dir.path().join("missing.fasta");
        let out = dir.path().join("uniques.fasta");

        assert_eq!(combine_uniques(&out, &[missing, a])?, 1);
        assert_eq!(headers(&out), vec![">seq1;size=2"]);
        Ok(())
    }

    #[test]
    fn test_missing_size_is_format_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let a = dir.path().join("a.fasta");
        fs::write(&a, ">x;size=2\nACGT\n>nosize\nTTTT\n")?;
        let out = dir.path().join("uniques.fasta");

        match combine_uniques(&out, &[a]) {
            Err(PipelineError::Format(msg)) => assert!(msg.contains("nosize")),
            other => panic!("expected format error, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_multiline_sequences_grouped() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let a = dir.path().join("a.fasta");
        fs::write(&a, ">x;size=1\nACGT\nACGT\n>y;size=4\nACGTACGT\n")?;
        let uniques = collect_uniques(&[a])?;
        assert_eq!(uniques.len(), 1);
        assert_eq!(uniques[0].size, 5);
        Ok(())
    }
}
