use std::path::PathBuf;
use std::time::Duration;
use crate::cli::Arguments;
use crate::config::settings::Settings;
use lazy_static::lazy_static;
use log::LevelFilter;
use std::collections::HashMap;
use thiserror::Error;

// External software
pub const GZIP_EXT: &str = "gz";
pub const VSEARCH_TAG: &str = "vsearch";
pub const QIIME_TAG: &str = "qiime";
pub const BIOM_TAG: &str = "biom";

// Dependency lookup, relative to the running executable
pub const TOOLS_SUBDIR: &str = "tools";
pub const BIN_SUBDIR: &str = "bin";
pub const BINARY_PLACEHOLDER: &str = "{binary}";

lazy_static! {
    /// name -> (version test template, substring expected in its output)
    pub static ref DEPENDENCY_CHECKS: HashMap<&'static str, (&'static str, &'static str)> = {
        let mut m = HashMap::new();
        m.insert(VSEARCH_TAG, ("{binary} --version", "vsearch"));
        m.insert(QIIME_TAG, ("{binary} --version", "q2cli"));
        m.insert(BIOM_TAG, ("{binary} --version", "biom"));
        m
    };
}

// Metadata table
pub const SAMPLE_ID_SENTINEL: &str = "SampleID";
pub const HEADER_MARKER: char = '#';
pub const TYPES_SENTINEL: &str = "#q2:types";

// Read binding
pub const DEFAULT_FOR_TAG: &str = "_R1";
pub const DEFAULT_REV_TAG: &str = "_R2";
pub const MANIFEST_HEADER: [&str; 3] = ["sample-id", "absolute-filepath", "direction"];
pub const TOKEN_DELIMITERS: &[char] = &['_', '.', '-'];

// Dereplicated FASTA abundance annotation
pub const SIZE_TAG: &str = ";size=";
pub const ASV_PREFIX: &str = "ASV";

// Command execution
pub const DEFAULT_THREADS: usize = 8;
pub const DEFAULT_TIMEOUT_SECS: u64 = 2 * 24 * 60 * 60;
pub const MAX_CAPTURE_BYTES: usize = 1_048_576;
pub const HEARTBEAT_AFTER_SECS: u64 = 10;
pub const HEARTBEAT_EVERY_SECS: u64 = 30;

// Static Filenames
pub const RUN_LOG: &str = "run.log";
pub const RUN_MARKDOWN: &str = "run.md";
pub const METADATA_COPY: &str = "metadata.tsv";
pub const MANIFEST_FILE: &str = "manifest.csv";
pub const SAMPLE_COUNTS_FILE: &str = "sample_counts.tsv";
pub const ALL_READS_FASTA: &str = "all_reads.fasta";
pub const UNIQUES_FASTA: &str = "uniques.fasta";
pub const DENOISED_FASTA: &str = "denoised.fasta";
pub const ASV_FASTA: &str = "asv.fasta";
pub const FEATURE_TABLE: &str = "feature-table.tsv";
pub const MERGED_DIR: &str = "merged";
pub const FILTERED_DIR: &str = "filtered";
pub const DEREP_DIR: &str = "derep";
pub const QIIME_DIR: &str = "qiime";
pub const REPORTS_DIR: &str = "reports";
pub const REPORT_INDEX: &str = "index.html";

// Artifacts
pub const ARTIFACT_METADATA: &str = "metadata.yaml";
pub const ARTIFACT_DATA_DIR: &str = "data";
pub const VISUALIZATION_EXT: &str = "qzv";

pub const FASTA_TAG : &str = "fasta";
pub const FASTQ_TAG : &str = "fastq";
pub const TSV_EXT: &str = "tsv";
pub const FASTA_EXTS: &[&'static str] = &["fasta", "fa", "fna", "faa", "ffn", "frn"];
pub const FASTQ_EXTS: &[&'static str] = &["fastq", "fq"];


#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Format error: {0}")]
    Format(String),

    #[error("File binding error: {0}")]
    FileBinding(String),

    #[error("[{title}] command failed ({reason}): {command}")]
    Execution {
        title: String,
        command: String,
        reason: String,
    },

    #[error("[{title}] command timed out after {seconds:.1}s: {command}")]
    Timeout {
        title: String,
        command: String,
        seconds: f64,
    },

    #[error("Missing dependency {name}: expected binary {binary}")]
    Dependency {
        name: String,
        binary: String,
    },

    #[error("[{title}] required input file missing or empty: {}", path.display())]
    MissingInput {
        title: String,
        path: PathBuf,
    },

    #[error("[{title}] expected output file was not created: {}", path.display())]
    MissingOutput {
        title: String,
        path: PathBuf,
    },

    #[error("I/O error: {0}")]
    IOError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}


pub struct RunConfig  {
    pub cwd: PathBuf,
    pub out_dir: PathBuf,
    pub args: Arguments,
    pub settings: Settings,
    pub max_cores: usize,
    pub cpu_load: f32,
    pub timeout: Duration,
    pub log_level: LevelFilter,
}

impl RunConfig {
    pub fn out_path(&self, name: &str) -> PathBuf {
        self.out_dir.join(name)
    }
}
