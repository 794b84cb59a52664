// src/pipelines/samples.rs: sample-sheet modules (manifest, show-samples, combine-uniques)

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};

use crate::config::defs::{PipelineError, RunConfig, MANIFEST_FILE, METADATA_COPY, SAMPLE_COUNTS_FILE};
use crate::utils::derep::combine_uniques;
use crate::utils::file::absolute_path;
use crate::utils::samples::{BindOptions, Manifest, SampleRegistry};

fn required_path(value: &Option<String>, flag: &str, cwd: &Path) -> Result<PathBuf, PipelineError> {
    value
        .as_deref()
        .map(|v| absolute_path(Path::new(v), cwd))
        .ok_or_else(|| PipelineError::InvalidConfig(format!("{} is required for this module", flag)))
}

/// Loads the metadata table named by `-m`.
pub fn load_registry(config: &RunConfig) -> Result<(SampleRegistry, PathBuf), PipelineError> {
    let metadata_path = required_path(&config.args.metadata, "--metadata", &config.cwd)?;
    let registry = SampleRegistry::load_metadata(&metadata_path)?;
    if registry.is_empty() {
        return Err(PipelineError::Format(format!(
            "{}: no samples with a non-empty id",
            metadata_path.display()
        )));
    }
    Ok((registry, metadata_path))
}

/// Loads metadata and binds reads, writing `metadata.tsv`, `manifest.csv` and
/// `sample_counts.tsv` into the output directory.
///
/// # Arguments
///
/// * `config` - RunConfig struct from main.
///
/// # Returns
/// The bound registry and its manifest.
pub async fn prepare_samples(config: &RunConfig) -> Result<(SampleRegistry, Manifest), PipelineError> {
    let (mut registry, metadata_path) = load_registry(config)?;
    let input_dir = required_path(&config.args.input_dir, "--input-dir", &config.cwd)?;

    let metadata_copy = config.out_path(METADATA_COPY);
    if metadata_copy != metadata_path {
        fs::copy(&metadata_path, &metadata_copy)?;
    }

    let manifest = registry
        .bind_reads(&input_dir, &BindOptions::from_args(&config.args))
        .await?;
    manifest.write(&config.out_path(MANIFEST_FILE))?;
    fs::write(config.out_path(SAMPLE_COUNTS_FILE), registry.sample_counts())?;

    for sample in registry.samples().filter(|s| s.read_count == Some(0)) {
        warn!("Sample {} has no reads in {:?}", sample.sample_id, sample.forward_path);
    }
    Ok((registry, manifest))
}

pub async fn manifest_run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    info!("\n-------------\n Manifest\n-------------\n");
    let (registry, manifest) = prepare_samples(&config).await?;
    info!(
        "Wrote {} with {} rows for {} samples",
        config.out_path(MANIFEST_FILE).display(),
        manifest.len(),
        registry.len()
    );
    Ok(())
}


/// Human-readable sample listing, or `sample<TAB>value` lines for a single attribute.
pub fn format_samples(registry: &SampleRegistry, attr: Option<&str>) -> Result<String, PipelineError> {
    let mut out = String::new();
    if let Some(attr) = attr {
        for (sample_id, value) in registry.attribute_values(attr)? {
            let _ = writeln!(out, "{}\t{}", sample_id, value.unwrap_or(""));
        }
        return Ok(out);
    }

    let _ = writeln!(out, "Samples: {}", registry.len());
    let _ = writeln!(out, "Attributes: {}", registry.attribute_names().join(", "));
    for sample in registry.samples() {
        let _ = writeln!(out, "\n{}", sample.sample_id);
        for (key, value) in &sample.attributes {
            let _ = writeln!(out, "  {}: {}", key, value);
        }
    }
    Ok(out)
}

pub async fn show_samples_run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    let (registry, _) = load_registry(&config)?;
    print!("{}", format_samples(&registry, config.args.attr.as_deref())?);
    Ok(())
}


pub async fn combine_uniques_run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    if config.args.uniques.is_empty() {
        return Err(PipelineError::InvalidConfig("--uniques needs at least one FASTA file".to_string()));
    }
    let output = required_path(&config.args.out_file, "--out-file", &config.cwd)?;
    let inputs: Vec<PathBuf> = config
        .args
        .uniques
        .iter()
        .map(|p| absolute_path(Path::new(p), &config.cwd))
        .collect();
    let written = combine_uniques(&output, &inputs)?;
    info!("Wrote {} unique sequences to {}", written, output.display());
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Arguments;
    use crate::config::settings::Settings;
    use log::LevelFilter;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config(cwd: &Path, args: Arguments) -> RunConfig {
        RunConfig {
            cwd: cwd.to_path_buf(),
            out_dir: cwd.join("out"),
            args,
            settings: Settings::default(),
            max_cores: 1,
            cpu_load: 0.0,
            timeout: Duration::from_secs(60),
            log_level: LevelFilter::Info,
        }
    }

    fn write_inputs(root: &Path) {
        fs::write(
            root.join("meta.tsv"),
            "#SampleID\tsite\n#q2:types\tcategorical\nS1\tgut\nS2\tskin\n",
        )
        .unwrap();
        fs::create_dir(root.join("reads")).unwrap();
        for name in ["S1_R1.fastq", "S1_R2.fastq", "S2_R1.fastq", "S2_R2.fastq"] {
            fs::write(root.join("reads").join(name), "@r\nACGT\n+\nIIII\n").unwrap();
        }
        fs::create_dir(root.join("out")).unwrap();
    }

    #[tokio::test]
    async fn test_prepare_samples_writes_files() -> anyhow::Result<()> {
        let dir = tempdir()?;
        write_inputs(dir.path());
        let args = Arguments {
            metadata: Some("meta.tsv".to_string()),
            input_dir: Some("reads".to_string()),
            for_tag: "_R1".to_string(),
            rev_tag: "_R2".to_string(),
            ..Default::default()
        };
        let config = config(dir.path(), args);

        let (registry, manifest) = prepare_samples(&config).await?;
        assert_eq!(registry.len(), 2);
        assert_eq!(manifest.len(), 4);
        let out = dir.path().join("out");
        assert!(out.join(METADATA_COPY).exists());
        assert_eq!(fs::read_to_string(out.join(MANIFEST_FILE))?.lines().count(), 5);
        assert_eq!(fs::read_to_string(out.join(SAMPLE_COUNTS_FILE))?, "S1\t1\nS2\t1\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_prepare_samples_requires_input_dir() -> anyhow::Result<()> {
        let dir = tempdir()?;
        write_inputs(dir.path());
        let args = Arguments {
            metadata: Some("meta.tsv".to_string()),
            ..Default::default()
        };
        let result = prepare_samples(&config(dir.path(), args)).await;
        assert!(matches!(result, Err(PipelineError::InvalidConfig(_))));
        Ok(())
    }

    #[test]
    fn test_format_samples() -> anyhow::Result<()> {
        let dir = tempdir()?;
        write_inputs(dir.path());
        let registry = SampleRegistry::load_metadata(&dir.path().join("meta.tsv"))?;

        let listing = format_samples(&registry, None)?;
        assert!(listing.starts_with("Samples: 2\nAttributes: site\n"));
        assert!(listing.contains("\nS2\n  site: skin\n"));

        assert_eq!(format_samples(&registry, Some("site"))?, "S1\tgut\nS2\tskin\n");
        assert!(format_samples(&registry, Some("ph")).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_combine_uniques_module() -> anyhow::Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("a.fasta"), ">a;size=2\nACGT\n")?;
        fs::write(dir.path().join("b.fasta"), ">b;size=3\nACGT\n>c;size=1\nTTTT\n")?;
        let args = Arguments {
            uniques: vec!["a.fasta".to_string(), "b.fasta".to_string()],
            out_file: Some("all.fasta".to_string()),
            ..Default::default()
        };
        combine_uniques_run(Arc::new(config(dir.path(), args))).await?;
        assert_eq!(
            fs::read_to_string(dir.path().join("all.fasta"))?,
            ">seq1;size=5\nACGT\n>seq2;size=1\nTTTT\n"
        );
        Ok(())
    }
}
