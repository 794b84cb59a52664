use clap::{Parser, ValueEnum};
use crate::config::defs::{DEFAULT_FOR_TAG, DEFAULT_REV_TAG};

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq)]
pub enum Module {
    #[default]
    Amplicon,
    Manifest,
    ShowSamples,
    CombineUniques,
    CheckTab,
    Dada2Split,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "amplicon-pipelines", version, about = "16S amplicon pipeline driver")]
pub struct Arguments {

    #[arg(long, value_enum, default_value = "amplicon")]
    pub module: Module,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(long, action, help = "Trace-level logging, including captured tool output")]
    pub debug: bool,

    #[arg(short = 'm', long = "metadata", help = "Tab-separated metadata table (#SampleID header, #q2:types second row)")]
    pub metadata: Option<String>,

    #[arg(short = 'i', long = "input-dir", help = "Directory containing the paired FASTQ files")]
    pub input_dir: Option<String>,

    #[arg(short = 'o', long = "out", help = "Output directory for all generated files. If not specified, a directory named '<metadata_stem>_YYYYMMDD' will be created in the current working directory.")]
    pub out_dir: Option<String>,

    #[arg(short = '1', long = "for-tag", default_value = DEFAULT_FOR_TAG)]
    pub for_tag: String,

    #[arg(short = '2', long = "rev-tag", default_value = DEFAULT_REV_TAG)]
    pub rev_tag: String,

    #[arg(long, default_value_t = false, help = "Match sample IDs only as delimiter-bounded tokens of the file name (S1 no longer matches S10_R1.fastq.gz)")]
    pub strict_sample_match: bool,

    #[arg(long, help = "Maximum threads; defaults to the settings file, then 8")]
    pub threads: Option<usize>,

    #[arg(long, default_value_t = 1000, help = "Minimum rarefaction depth for diversity analysis")]
    pub min_depth: u64,

    #[arg(long, default_value_t = 1.0)]
    pub max_ee: f64,

    #[arg(long, default_value_t = 100)]
    pub min_len: usize,

    #[arg(long, default_value_t = 8)]
    pub min_unoise_size: usize,

    #[arg(long, default_value_t = 0.97)]
    pub otu_identity: f64,

    #[arg(long, help = "Pre-trained QIIME 2 naive Bayes classifier (.qza)")]
    pub classifier: Option<String>,

    #[arg(long, default_value_t = false)]
    pub skip_taxonomy: bool,

    #[arg(long, default_value_t = false)]
    pub skip_diversity: bool,

    #[arg(long, default_value_t = false)]
    pub skip_reports: bool,

    #[arg(long, help = "Per-command wall clock ceiling in seconds (default: two days)")]
    pub timeout_secs: Option<u64>,

    #[arg(long, help = "TOML settings file; defaults to ~/.config/amplicon-pipelines.toml when present")]
    pub config: Option<String>,

    #[arg(long, default_value_t = false, help = "Remove an existing output directory before running")]
    pub force: bool,

    #[arg(long, help = "show-samples: print only this attribute for every sample")]
    pub attr: Option<String>,

    #[arg(long, num_args = 1.., help = "combine-uniques: dereplicated FASTA inputs")]
    pub uniques: Vec<String>,

    #[arg(long, help = "combine-uniques: output FASTA; dada2-split: output basename for .fasta and .tsv")]
    pub out_file: Option<String>,

    #[arg(long, num_args = 1.., help = "check-tab: tables to measure; dada2-split: the DADA2 sequence table")]
    pub tables: Vec<String>,

    #[arg(long, default_value_t = false, help = "check-tab: fail on the first row with a different column count")]
    pub strict: bool,
}

impl Arguments {
    pub fn any_qiime_stage(&self) -> bool {
        self.taxonomy_enabled() || !self.skip_diversity
    }

    pub fn taxonomy_enabled(&self) -> bool {
        !self.skip_taxonomy && self.classifier.is_some()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Arguments::try_parse_from(["amplicon-pipelines", "-m", "meta.tsv", "-i", "reads"]).unwrap();
        assert_eq!(args.module, Module::Amplicon);
        assert_eq!(args.for_tag, "_R1");
        assert_eq!(args.rev_tag, "_R2");
        assert!(!args.strict_sample_match);
        assert!(!args.taxonomy_enabled());
        assert!(args.any_qiime_stage());
    }

    #[test]
    fn test_module_and_overrides() {
        let args = Arguments::try_parse_from([
            "amplicon-pipelines", "--module", "combine-uniques",
            "--uniques", "a.fasta", "b.fasta", "--out-file", "all.fasta",
            "-1", "_1", "-2", "_2", "--skip-diversity",
        ]).unwrap();
        assert_eq!(args.module, Module::CombineUniques);
        assert_eq!(args.uniques, vec!["a.fasta", "b.fasta"]);
        assert_eq!(args.for_tag, "_1");
        assert!(!args.any_qiime_stage());
    }

    #[test]
    fn test_table_modules() {
        let args = Arguments::try_parse_from([
            "amplicon-pipelines", "--module", "check-tab", "--tables", "a.tsv", "b.tsv", "--strict",
        ]).unwrap();
        assert_eq!(args.module, Module::CheckTab);
        assert_eq!(args.tables.len(), 2);
        assert!(args.strict);

        let args = Arguments::try_parse_from([
            "amplicon-pipelines", "--module", "dada2-split", "--tables", "seqtab.tsv", "--out-file", "asv",
        ]).unwrap();
        assert_eq!(args.module, Module::Dada2Split);
        assert_eq!(args.out_file.as_deref(), Some("asv"));
    }
}
