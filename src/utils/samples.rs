// src/utils/samples.rs: metadata loading, read-file binding and the import manifest

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::cli::Arguments;
use crate::config::defs::{
    PipelineError, DEFAULT_FOR_TAG, DEFAULT_REV_TAG, HEADER_MARKER, MANIFEST_HEADER, SAMPLE_ID_SENTINEL,
    TOKEN_DELIMITERS, TYPES_SENTINEL,
};
use crate::utils::fastx::record_counter;

/// One metadata row plus the read files bound to it.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub sample_id: String,
    /// Column header -> value, in column order. The id column itself is not repeated here.
    pub attributes: Vec<(String, String)>,
    pub forward_path: Option<PathBuf>,
    pub reverse_path: Option<PathBuf>,
    pub read_count: Option<u64>,
}

impl SampleRecord {
    fn new(sample_id: String, attributes: Vec<(String, String)>) -> Self {
        SampleRecord {
            sample_id,
            attributes,
            forward_path: None,
            reverse_path: None,
            read_count: None,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_paired(&self) -> bool {
        self.forward_path.is_some() && self.reverse_path.is_some()
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    Forward,
    Reverse,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Reverse => write!(f, "reverse"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub sample_id: String,
    pub path: PathBuf,
    pub direction: Direction,
}

/// Sample id -> absolute read path -> direction, in binding order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn push(&mut self, sample_id: &str, path: PathBuf, direction: Direction) {
        self.entries.push(ManifestEntry {
            sample_id: sample_id.to_string(),
            path,
            direction,
        });
    }

    pub fn to_csv_string(&self) -> Result<String, PipelineError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(MANIFEST_HEADER)
            .map_err(|e| PipelineError::IOError(e.to_string()))?;
        for entry in &self.entries {
            let path = entry.path.to_string_lossy();
            let direction = entry.direction.to_string();
            writer
                .write_record([entry.sample_id.as_str(), path.as_ref(), direction.as_str()])
                .map_err(|e| PipelineError::IOError(e.to_string()))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| PipelineError::IOError(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| PipelineError::IOError(e.to_string()))
    }

    pub fn write(&self, path: &Path) -> Result<(), PipelineError> {
        fs::write(path, self.to_csv_string()?)?;
        Ok(())
    }
}


/// How sample ids are located inside file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// Id appears anywhere in the name. `S1` also matches `S10_R1.fastq.gz`.
    #[default]
    Substring,
    /// Id must be bounded by the start or end of the name or one of `_ . -`.
    Token,
}

#[derive(Debug, Clone)]
pub struct BindOptions {
    pub forward_tag: String,
    pub reverse_tag: String,
    pub mode: MatchMode,
}

impl Default for BindOptions {
    fn default() -> Self {
        BindOptions {
            forward_tag: DEFAULT_FOR_TAG.to_string(),
            reverse_tag: DEFAULT_REV_TAG.to_string(),
            mode: MatchMode::Substring,
        }
    }
}

impl BindOptions {
    pub fn from_args(args: &Arguments) -> Self {
        BindOptions {
            forward_tag: args.for_tag.clone(),
            reverse_tag: args.rev_tag.clone(),
            mode: if args.strict_sample_match {
                MatchMode::Token
            } else {
                MatchMode::Substring
            },
        }
    }

    fn matches(&self, file_name: &str, sample_id: &str) -> bool {
        match self.mode {
            MatchMode::Substring => file_name.contains(sample_id),
            MatchMode::Token => token_match(file_name, sample_id),
        }
    }

    fn direction(&self, file_name: &str) -> Option<Direction> {
        if file_name.contains(&self.forward_tag) {
            Some(Direction::Forward)
        } else if file_name.contains(&self.reverse_tag) {
            Some(Direction::Reverse)
        } else {
            None
        }
    }
}

fn token_match(file_name: &str, sample_id: &str) -> bool {
    if sample_id.is_empty() || sample_id.len() > file_name.len() {
        return false;
    }
    let is_boundary = |c: Option<char>| c.is_none_or(|c| TOKEN_DELIMITERS.contains(&c));
    (0..=file_name.len() - sample_id.len())
        .filter(|&start| file_name.is_char_boundary(start) && file_name[start..].starts_with(sample_id))
        .any(|start| {
            let end = start + sample_id.len();
            is_boundary(file_name[..start].chars().next_back()) && is_boundary(file_name[end..].chars().next())
        })
}


/// Samples keyed by id, loaded from a QIIME 2 style metadata table.
#[derive(Debug, Clone, Default)]
pub struct SampleRegistry {
    columns: Vec<String>,
    samples: BTreeMap<String, SampleRecord>,
    unmatched_files: Vec<String>,
}

impl SampleRegistry {
    /// Loads a tab-separated metadata table.
    ///
    /// Row 1 is the header (`SampleID` or `#SampleID` first), row 2 the `#q2:types`
    /// declaration, the rest data. Rows with an empty first cell are skipped.
    pub fn load_metadata(path: &Path) -> Result<Self, PipelineError> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .quoting(false)
            .from_path(path)
            .map_err(|e| {
                PipelineError::Format(format!("Cannot open metadata file {}: {}", path.display(), e))
            })?;

        let mut rows = reader.records();
        let mut next_row = |what: &str| -> Result<csv::StringRecord, PipelineError> {
            match rows.next() {
                Some(Ok(row)) => Ok(row),
                Some(Err(e)) => Err(PipelineError::Format(format!("{}: {}", path.display(), e))),
                None => Err(PipelineError::Format(format!("{}: missing {} row", path.display(), what))),
            }
        };

        let header = next_row("header")?;
        let first = header.get(0).unwrap_or("").trim();
        let id_column = first.strip_prefix(HEADER_MARKER).unwrap_or(first);
        if id_column != SAMPLE_ID_SENTINEL {
            return Err(PipelineError::Format(format!(
                "{}: first column must be '{}' (optionally '{}{}'), found '{}'",
                path.display(),
                SAMPLE_ID_SENTINEL,
                HEADER_MARKER,
                SAMPLE_ID_SENTINEL,
                first
            )));
        }

        let mut seen = HashSet::new();
        let mut columns = Vec::with_capacity(header.len());
        for (i, cell) in header.iter().enumerate() {
            let name = if i == 0 { id_column } else { cell.trim() };
            if !seen.insert(name.to_string()) {
                return Err(PipelineError::Format(format!(
                    "{}: duplicate column header '{}'",
                    path.display(),
                    name
                )));
            }
            columns.push(name.to_string());
        }

        let types = next_row("#q2:types")?;
        if !types.get(0).unwrap_or("").contains(TYPES_SENTINEL) {
            return Err(PipelineError::Format(format!(
                "{}: first cell of the second row must contain '{}'",
                path.display(),
                TYPES_SENTINEL
            )));
        }

        let mut samples = BTreeMap::new();
        for result in rows {
            let row = result.map_err(|e| PipelineError::Format(format!("{}: {}", path.display(), e)))?;
            let line = row.position().map(|p| p.line()).unwrap_or(0);
            let sample_id = row.get(0).unwrap_or("").trim();
            if sample_id.is_empty() {
                continue;
            }
            if row.len() > columns.len() {
                return Err(PipelineError::Format(format!(
                    "{} line {}: {} fields but only {} columns",
                    path.display(),
                    line,
                    row.len(),
                    columns.len()
                )));
            }
            if sample_id.chars().any(char::is_whitespace) {
                return Err(PipelineError::Format(format!(
                    "{} line {}: sample id '{}' contains whitespace",
                    path.display(),
                    line,
                    sample_id
                )));
            }
            if samples.contains_key(sample_id) {
                return Err(PipelineError::Format(format!(
                    "{} line {}: duplicate sample id '{}'",
                    path.display(),
                    line,
                    sample_id
                )));
            }

            let attributes = columns
                .iter()
                .zip(row.iter())
                .skip(1)
                .map(|(k, v)| (k.clone(), v.trim().to_string()))
                .collect();
            samples.insert(sample_id.to_string(), SampleRecord::new(sample_id.to_string(), attributes));
        }

        info!("Loaded {} samples from {}", samples.len(), path.display());
        Ok(SampleRegistry {
            columns,
            samples,
            unmatched_files: Vec::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Attribute columns, id column excluded.
    pub fn attribute_names(&self) -> &[String] {
        self.columns.get(1..).unwrap_or(&[])
    }

    pub fn get(&self, sample_id: &str) -> Option<&SampleRecord> {
        self.samples.get(sample_id)
    }

    /// Samples in id order.
    pub fn samples(&self) -> impl Iterator<Item = &SampleRecord> {
        self.samples.values()
    }

    /// `(sample id, value)` for one column; fails if the column does not exist.
    pub fn attribute_values(&self, name: &str) -> Result<Vec<(&str, Option<&str>)>, PipelineError> {
        if !self.attribute_names().iter().any(|c| c == name) {
            return Err(PipelineError::InvalidConfig(format!(
                "Unknown attribute '{}'. Available: {}",
                name,
                self.attribute_names().join(", ")
            )));
        }
        Ok(self
            .samples
            .values()
            .map(|s| (s.sample_id.as_str(), s.attr(name)))
            .collect())
    }

    /// Ids of samples whose `name` attribute equals `value`.
    pub fn samples_by_attr(&self, name: &str, value: &str) -> Vec<&str> {
        self.samples
            .values()
            .filter(|s| s.attr(name) == Some(value))
            .map(|s| s.sample_id.as_str())
            .collect()
    }

    /// Directory entries from the last `bind_reads` that no sample claimed.
    pub fn unmatched_files(&self) -> &[String] {
        &self.unmatched_files
    }

    /// Binds forward/reverse read files in `input_dir` to every sample.
    ///
    /// # Arguments
    ///
    /// * `input_dir` - Directory holding the read files (not searched recursively).
    /// * `options` - Direction tags and id matching mode.
    ///
    /// # Returns
    /// The manifest, in sample id order. Forward read counts are filled in before returning.
    pub async fn bind_reads(&mut self, input_dir: &Path, options: &BindOptions) -> Result<Manifest, PipelineError> {
        let dir = std::path::absolute(input_dir).map_err(|e| {
            PipelineError::FileBinding(format!("Cannot resolve {}: {}", input_dir.display(), e))
        })?;
        let entries = fs::read_dir(&dir).map_err(|e| {
            PipelineError::FileBinding(format!("Cannot read directory {}: {}", dir.display(), e))
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => files.push(name.to_string()),
                None => warn!("Skipping non UTF-8 file name {}", path.display()),
            }
        }
        files.sort();
        debug!("{} files in {}", files.len(), dir.display());

        let mut manifest = Manifest::default();
        let mut used: HashSet<&str> = HashSet::new();
        let mut counters: Vec<(String, JoinHandle<std::io::Result<u64>>)> = Vec::new();

        for sample in self.samples.values_mut() {
            sample.forward_path = None;
            sample.reverse_path = None;
            sample.read_count = None;

            let matched: Vec<&String> = files
                .iter()
                .filter(|name| options.matches(name, &sample.sample_id))
                .collect();
            if matched.is_empty() {
                return Err(PipelineError::FileBinding(format!(
                    "Sample {} has no files in directory {}",
                    sample.sample_id,
                    dir.display()
                )));
            }
            if matched.len() > 2 {
                return Err(PipelineError::FileBinding(format!(
                    "More than one file matches sample {} per direction: {}",
                    sample.sample_id,
                    matched.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                )));
            }

            for name in matched {
                let direction = options.direction(name).ok_or_else(|| {
                    PipelineError::FileBinding(format!(
                        "File {} matches sample {} but contains neither {} nor {}",
                        name, sample.sample_id, options.forward_tag, options.reverse_tag
                    ))
                })?;
                let path = dir.join(name);
                let slot = match direction {
                    Direction::Forward => &mut sample.forward_path,
                    Direction::Reverse => &mut sample.reverse_path,
                };
                if let Some(existing) = slot {
                    return Err(PipelineError::FileBinding(format!(
                        "Sample {} has more than one {} file: {} and {}",
                        sample.sample_id,
                        direction,
                        existing.display(),
                        path.display()
                    )));
                }
                *slot = Some(path.clone());
                used.insert(name.as_str());
                manifest.push(&sample.sample_id, path.clone(), direction);

                if direction == Direction::Forward {
                    let handle = tokio::task::spawn_blocking(move || record_counter(&path));
                    counters.push((sample.sample_id.clone(), handle));
                }
            }

            if sample.forward_path.is_none() {
                debug!("Sample {} has only a reverse read file", sample.sample_id);
            }
        }

        for (sample_id, handle) in counters {
            let count = match handle.await {
                Ok(Ok(count)) => Some(count),
                Ok(Err(e)) => {
                    warn!("Could not count reads for {}: {}", sample_id, e);
                    None
                }
                Err(e) => {
                    warn!("Read count task for {} failed: {}", sample_id, e);
                    None
                }
            };
            if let Some(sample) = self.samples.get_mut(&sample_id) {
                sample.read_count = count;
            }
        }

        self.unmatched_files = files
            .iter()
            .filter(|name| !used.contains(name.as_str()))
            .cloned()
            .collect();
        if !self.unmatched_files.is_empty() {
            warn!(
                "{} unexpected files in {} matched no sample",
                self.unmatched_files.len(),
                dir.display()
            );
        }

        info!("Bound {} read files for {} samples", manifest.len(), self.samples.len());
        Ok(manifest)
    }

    /// `sample_id<TAB>read_count` per sample in id order; unknown counts are left empty.
    pub fn sample_counts(&self) -> String {
        let mut out = String::new();
        for sample in self.samples.values() {
            out.push_str(&sample.sample_id);
            out.push('\t');
            if let Some(count) = sample.read_count {
                out.push_str(&count.to_string());
            }
            out.push('\n');
        }
        out
    }
}
