// src/pipelines/amplicon.rs: paired-end 16S amplicon run, reads to reports

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use log::{debug, info, warn};

use crate::config::defs::{
    PipelineError, RunConfig, ALL_READS_FASTA, ARTIFACT_DATA_DIR, ASV_FASTA, BIOM_TAG, DENOISED_FASTA, DEREP_DIR,
    FEATURE_TABLE, FILTERED_DIR, MERGED_DIR, METADATA_COPY, QIIME_DIR, QIIME_TAG, REPORTS_DIR, UNIQUES_FASTA,
    VISUALIZATION_EXT, VSEARCH_TAG,
};
use crate::pipelines::samples::prepare_samples;
use crate::utils::artifact::{extract_artifact_dir, read_artifact_metadata};
use crate::utils::command::{biom, check_dependencies, qiime, vsearch, Dependency, ToolLocations, Toolbox};
use crate::utils::derep::combine_uniques;
use crate::utils::file::{absolute_path, is_non_empty_file};
use crate::utils::report::{write_report_index, ReportEntry};
use crate::utils::runlog::RunLog;
use crate::utils::runner::{CommandRunner, CommandSpec, RunResult};
use crate::utils::samples::{Direction, SampleRegistry};
use crate::utils::system::compute_sample_workers;

/// Paired reads for one sample, ready for merging.
#[derive(Debug, Clone)]
struct SampleJob {
    sample_id: String,
    forward: PathBuf,
    reverse: PathBuf,
}

/// Per-sample products of the merge, filter and derep chain.
#[derive(Debug)]
struct SampleOutput {
    sample_id: String,
    filtered: PathBuf,
    derep: PathBuf,
    results: Vec<RunResult>,
}

/// Settings shared by every per-sample worker.
struct SampleParams<'a> {
    vsearch: String,
    out_dir: &'a Path,
    max_ee: f64,
    min_len: usize,
    threads: usize,
}


/// Runs a stage unless all of its declared outputs are already there.
async fn run_stage(runner: &CommandRunner, spec: CommandSpec) -> Result<Option<RunResult>, PipelineError> {
    if spec.outputs_present() {
        info!("[{}] outputs present, skipping", spec.display_title());
        return Ok(None);
    }
    runner.execute(&spec).await.map(Some)
}

/// Dependencies this run needs, given the enabled stages.
fn required_dependencies(config: &RunConfig) -> Result<Vec<Dependency>, PipelineError> {
    let mut names = vec![VSEARCH_TAG];
    if config.args.any_qiime_stage() {
        names.push(QIIME_TAG);
    }
    if !config.args.skip_diversity {
        names.push(BIOM_TAG);
    }
    names.into_iter().map(Dependency::known).collect()
}

/// Every sample must have both reads before merging.
fn sample_jobs(registry: &SampleRegistry) -> Result<Vec<SampleJob>, PipelineError> {
    registry
        .samples()
        .map(|sample| match (&sample.forward_path, &sample.reverse_path) {
            (Some(forward), Some(reverse)) => Ok(SampleJob {
                sample_id: sample.sample_id.clone(),
                forward: forward.clone(),
                reverse: reverse.clone(),
            }),
            (forward, _) => Err(PipelineError::FileBinding(format!(
                "Sample {} has no {} read file; paired reads are required for merging",
                sample.sample_id,
                if forward.is_some() { Direction::Reverse } else { Direction::Forward }
            ))),
        })
        .collect()
}


/// Merge, quality filter and dereplicate one sample.
///
/// # Arguments
///
/// * `job` - Sample id and its read pair.
/// * `runner` - Shared command runner.
/// * `params` - vsearch binary, thresholds and thread count.
///
/// # Returns
/// Paths of the filtered FASTA and dereplicated FASTA plus the commands that ran.
async fn process_sample(
    job: SampleJob,
    runner: &CommandRunner,
    params: &SampleParams<'_>,
) -> Result<SampleOutput, PipelineError> {
    let merged = params.out_dir.join(MERGED_DIR).join(format!("{}.fastq", job.sample_id));
    let filtered = params.out_dir.join(FILTERED_DIR).join(format!("{}.fasta", job.sample_id));
    let derep = params.out_dir.join(DEREP_DIR).join(format!("{}.fasta", job.sample_id));
    let mut results = Vec::new();

    let merge = CommandSpec::new(
        params.vsearch.as_str(),
        vsearch::merge_pairs_args(&job.forward, &job.reverse, &merged, &job.sample_id, params.threads),
    )
    .with_title(format!("merge {}", job.sample_id))
    .requires(&job.forward)
    .requires(&job.reverse)
    .produces(&merged);
    results.extend(run_stage(runner, merge).await?);

    let filter = CommandSpec::new(
        params.vsearch.as_str(),
        vsearch::filter_args(&merged, &filtered, params.max_ee, params.min_len),
    )
    .with_title(format!("filter {}", job.sample_id))
    .requires(&merged)
    .produces(&filtered);
    results.extend(run_stage(runner, filter).await?);

    if !is_non_empty_file(&filtered) {
        warn!("Sample {} has no reads left after filtering", job.sample_id);
    } else {
        let dereplicate = CommandSpec::new(params.vsearch.as_str(), vsearch::derep_args(&filtered, &derep, &job.sample_id))
            .with_title(format!("derep {}", job.sample_id))
            .requires(&filtered)
            .produces(&derep);
        results.extend(run_stage(runner, dereplicate).await?);
    }

    Ok(SampleOutput {
        sample_id: job.sample_id,
        filtered,
        derep,
        results,
    })
}


/// Concatenates `inputs` in order into `output`. Missing inputs are skipped.
fn concat_files(inputs: &[PathBuf], output: &Path) -> Result<(), PipelineError> {
    let mut writer = BufWriter::new(File::create(output)?);
    for input in inputs {
        if !input.exists() {
            debug!("Skipping missing {}", input.display());
            continue;
        }
        let mut reader = File::open(input)?;
        io::copy(&mut reader, &mut writer)?;
    }
    writer.flush()?;
    Ok(())
}


/// Sampling depth for diversity: the larger of `min_depth` and the smallest
/// per-sample total of the feature table.
///
/// # Arguments
///
/// * `table` - Tab-separated OTU table (`#OTU ID` header, one column per sample).
/// * `min_depth` - User supplied floor.
pub fn rarefaction_depth(table: &Path, min_depth: u64) -> Result<u64, PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .quoting(false)
        .from_path(table)
        .map_err(|e| PipelineError::Format(format!("{}: {}", table.display(), e)))?;
    let samples = reader
        .headers()
        .map_err(|e| PipelineError::Format(format!("{}: {}", table.display(), e)))?
        .len()
        .saturating_sub(1);
    let mut totals = vec![0u64; samples];

    for result in reader.records() {
        let row = result.map_err(|e| PipelineError::Format(format!("{}: {}", table.display(), e)))?;
        for (total, cell) in totals.iter_mut().zip(row.iter().skip(1)) {
            let value: f64 = cell.trim().parse().map_err(|_| {
                PipelineError::Format(format!(
                    "{}: non-numeric count '{}' for {}",
                    table.display(),
                    cell,
                    row.get(0).unwrap_or("")
                ))
            })?;
            *total += value.round() as u64;
        }
    }

    let smallest = totals.iter().copied().min().unwrap_or(0);
    debug!("Smallest sample total in {}: {}", table.display(), smallest);
    Ok(smallest.max(min_depth))
}


/// Every file with extension `ext` below `dir`, sorted.
fn find_files_with_ext(dir: &Path, ext: &str) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    if !dir.is_dir() {
        return Ok(found);
    }
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|e| e == ext) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

/// Report directory name for a visualization: its path below `root`, extension dropped,
/// separators replaced by `_`.
fn report_name(visualization: &Path, root: &Path) -> String {
    let rel = visualization.strip_prefix(root).unwrap_or(visualization);
    rel.with_extension("")
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("_")
}

/// Extracts every visualization under `qiime_dir` and writes the report index.
fn build_reports(qiime_dir: &Path, reports_dir: &Path) -> Result<usize, PipelineError> {
    fs::create_dir_all(reports_dir)?;
    let mut entries = Vec::new();
    for visualization in find_files_with_ext(qiime_dir, VISUALIZATION_EXT)? {
        let metadata = read_artifact_metadata(&visualization)?;
        let name = report_name(&visualization, qiime_dir);
        let dest = reports_dir.join(&name);
        if dest.exists() {
            debug!("Report {} already extracted", name);
        } else {
            extract_artifact_dir(&visualization, ARTIFACT_DATA_DIR, &dest)?;
        }
        entries.push(ReportEntry {
            name,
            kind: metadata.kind,
            uuid: metadata.uuid,
        });
    }
    let index = write_report_index(reports_dir, &entries)?;
    info!("Report index with {} entries: {}", entries.len(), index.display());
    Ok(entries.len())
}


/// Runs the amplicon pipeline.
///
/// # Arguments
///
/// * `config` - RunConfig struct from main.
///
/// # Returns
/// Ok once every enabled stage finished or was already complete.
pub async fn run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    info!("\n-------------\n Amplicon\n-------------\n");
    let args = &config.args;
    let out_dir = config.out_dir.as_path();

    let run_log = Arc::new(RunLog::in_dir(out_dir));
    let runner = CommandRunner::new(config.timeout).with_run_log(run_log.clone());
    let mut results: Vec<RunResult> = Vec::new();

    // Dependencies
    run_log.section("Dependencies").await?;
    let locations = ToolLocations::from_settings(&config.settings);
    let toolbox = Toolbox::new(check_dependencies(&runner, required_dependencies(&config)?, &locations).await?);

    // Samples
    let (registry, manifest) = prepare_samples(&config).await?;
    info!("{} samples, {} read files", registry.len(), manifest.len());
    let jobs = sample_jobs(&registry)?;

    // Per-sample merge, filter, derep
    run_log.section("Per-sample processing").await?;
    for dir in [MERGED_DIR, FILTERED_DIR, DEREP_DIR] {
        fs::create_dir_all(out_dir.join(dir))?;
    }
    let (workers, job_threads) = compute_sample_workers(config.max_cores, config.cpu_load, jobs.len());
    info!("Processing {} samples with {} workers, {} threads each", jobs.len(), workers, job_threads);
    let params = SampleParams {
        vsearch: toolbox.binary(VSEARCH_TAG)?,
        out_dir,
        max_ee: args.max_ee,
        min_len: args.min_len,
        threads: job_threads,
    };
    let mut sample_outputs: Vec<SampleOutput> = stream::iter(jobs)
        .map(|job| process_sample(job, &runner, &params))
        .buffer_unordered(workers)
        .try_collect()
        .await?;
    sample_outputs.sort_by(|a, b| a.sample_id.cmp(&b.sample_id));
    for output in sample_outputs.iter_mut() {
        results.append(&mut output.results);
    }

    // Pooled reads and uniques
    run_log.section("Clustering").await?;
    let all_reads = config.out_path(ALL_READS_FASTA);
    if is_non_empty_file(&all_reads) {
        info!("{} present, skipping", all_reads.display());
    } else {
        let filtered: Vec<PathBuf> = sample_outputs.iter().map(|o| o.filtered.clone()).collect();
        concat_files(&filtered, &all_reads)?;
    }
    let uniques = config.out_path(UNIQUES_FASTA);
    if is_non_empty_file(&uniques) {
        info!("{} present, skipping", uniques.display());
    } else {
        let dereps: Vec<PathBuf> = sample_outputs.iter().map(|o| o.derep.clone()).collect();
        combine_uniques(&uniques, &dereps)?;
    }

    let vsearch_bin = toolbox.binary(VSEARCH_TAG)?;
    let threads = config.max_cores;
    let denoised = config.out_path(DENOISED_FASTA);
    let asv = config.out_path(ASV_FASTA);
    let feature_table = config.out_path(FEATURE_TABLE);

    let unoise = CommandSpec::new(
        vsearch_bin.as_str(),
        vsearch::unoise_args(&uniques, &denoised, args.min_unoise_size, threads),
    )
    .with_title("unoise")
    .requires(&uniques)
    .produces(&denoised);
    results.extend(run_stage(&runner, unoise).await?);

    let uchime = CommandSpec::new(vsearch_bin.as_str(), vsearch::uchime_args(&denoised, &asv))
        .with_title("uchime3 denovo")
        .requires(&denoised)
        .produces(&asv);
    results.extend(run_stage(&runner, uchime).await?);

    let otutab = CommandSpec::new(
        vsearch_bin.as_str(),
        vsearch::otutab_args(&all_reads, &asv, &feature_table, args.otu_identity, threads),
    )
    .with_title("feature table")
    .requires(&all_reads)
    .requires(&asv)
    .produces(&feature_table);
    results.extend(run_stage(&runner, otutab).await?);

    // QIIME 2
    let qiime_dir = config.out_path(QIIME_DIR);
    let metadata = config.out_path(METADATA_COPY);
    if args.any_qiime_stage() {
        fs::create_dir_all(&qiime_dir)?;
    }

    if args.taxonomy_enabled() {
        run_log.section("Taxonomy").await?;
        let qiime_bin = toolbox.binary(QIIME_TAG)?;
        let classifier = args
            .classifier
            .as_deref()
            .map(|c| absolute_path(Path::new(c), &config.cwd))
            .ok_or_else(|| PipelineError::InvalidConfig("--classifier is required for taxonomy".to_string()))?;
        let rep_seqs = qiime_dir.join("rep-seqs.qza");
        let taxonomy = qiime_dir.join("taxonomy.qza");
        let taxonomy_viz = qiime_dir.join("taxonomy.qzv");

        let import = CommandSpec::new(qiime_bin.as_str(), qiime::import_args("FeatureData[Sequence]", &asv, &rep_seqs, None))
            .with_title("import representative sequences")
            .requires(&asv)
            .produces(&rep_seqs);
        results.extend(run_stage(&runner, import).await?);

        let classify = CommandSpec::new(qiime_bin.as_str(), qiime::classify_args(&classifier, &rep_seqs, &taxonomy, threads))
            .with_title("classify")
            .requires(&classifier)
            .requires(&rep_seqs)
            .produces(&taxonomy);
        results.extend(run_stage(&runner, classify).await?);

        let tabulate = CommandSpec::new(qiime_bin.as_str(), qiime::tabulate_args(&taxonomy, &taxonomy_viz))
            .with_title("tabulate taxonomy")
            .requires(&taxonomy)
            .produces(&taxonomy_viz);
        results.extend(run_stage(&runner, tabulate).await?);
    } else if !args.skip_taxonomy {
        warn!("No --classifier given, skipping taxonomy");
    }

    if !args.skip_diversity {
        run_log.section("Diversity").await?;
        let qiime_bin = toolbox.binary(QIIME_TAG)?;
        let biom_table = qiime_dir.join("feature-table.biom");
        let table = qiime_dir.join("table.qza");
        let table_viz = qiime_dir.join("table.qzv");
        let core_metrics = qiime_dir.join("core-metrics");

        let convert = CommandSpec::new(toolbox.binary(BIOM_TAG)?, biom::convert_args(&feature_table, &biom_table))
            .with_title("biom convert")
            .requires(&feature_table)
            .produces(&biom_table);
        results.extend(run_stage(&runner, convert).await?);

        let import = CommandSpec::new(
            qiime_bin.as_str(),
            qiime::import_args("FeatureTable[Frequency]", &biom_table, &table, Some("BIOMV210Format")),
        )
        .with_title("import feature table")
        .requires(&biom_table)
        .produces(&table);
        results.extend(run_stage(&runner, import).await?);

        let summarize = CommandSpec::new(qiime_bin.as_str(), qiime::summarize_args(&table, &metadata, &table_viz))
            .with_title("summarize feature table")
            .requires(&table)
            .requires(&metadata)
            .produces(&table_viz);
        results.extend(run_stage(&runner, summarize).await?);

        let depth = rarefaction_depth(&feature_table, args.min_depth)?;
        info!("Rarefaction depth {}", depth);
        let diversity = CommandSpec::new(
            qiime_bin.as_str(),
            qiime::core_metrics_args(&table, &metadata, depth, &core_metrics, threads),
        )
        .with_title("core diversity metrics")
        .requires(&table)
        .requires(&metadata)
        .produces(&core_metrics);
        results.extend(run_stage(&runner, diversity).await?);
    }

    // Reports
    if !args.skip_reports {
        run_log.section("Reports").await?;
        build_reports(&qiime_dir, &config.out_path(REPORTS_DIR))?;
    }

    let command_seconds: f64 = results.iter().map(|r| r.elapsed_seconds).sum();
    info!(
        "{} commands run in {:.1}s; run log at {}",
        results.len(),
        command_seconds,
        run_log.log_path().display()
    );
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
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn config(args: Arguments) -> RunConfig {
        RunConfig {
            cwd: PathBuf::from("/"),
            out_dir: PathBuf::from("/"),
            args,
            settings: Settings::default(),
            max_cores: 1,
            cpu_load: 0.0,
            timeout: Duration::from_secs(60),
            log_level: LevelFilter::Info,
        }
    }

    #[test]
    fn test_required_dependencies() {
        let names = |args: Arguments| -> Vec<String> {
            required_dependencies(&config(args))
                .unwrap()
                .into_iter()
                .map(|d| d.name)
                .collect()
        };
        assert_eq!(names(Arguments::default()), vec!["vsearch", "qiime", "biom"]);
        let vsearch_only = Arguments {
            skip_diversity: true,
            ..Default::default()
        };
        assert_eq!(names(vsearch_only), vec!["vsearch"]);
        let taxonomy_only = Arguments {
            skip_diversity: true,
            classifier: Some("c.qza".to_string()),
            ..Default::default()
        };
        assert_eq!(names(taxonomy_only), vec!["vsearch", "qiime"]);
    }

    #[tokio::test]
    async fn test_unpaired_sample_rejected() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let meta = dir.path().join("meta.tsv");
        fs::write(&meta, "#SampleID\n#q2:types\nS1\nS2\n")?;
        fs::write(dir.path().join("S1_R1.fastq"), "@r\nA\n+\nI\n")?;
        fs::write(dir.path().join("S1_R2.fastq"), "@r\nA\n+\nI\n")?;
        fs::write(dir.path().join("S2_R1.fastq"), "@r\nA\n+\nI\n")?;

        let mut registry = SampleRegistry::load_metadata(&meta)?;
        registry.bind_reads(dir.path(), &Default::default()).await?;
        match sample_jobs(&registry) {
            Err(PipelineError::FileBinding(msg)) => assert!(msg.contains("S2 has no reverse")),
            other => panic!("expected binding error, got {:?}", other),
        }

        fs::write(&meta, "#SampleID\n#q2:types\nS1\nS3\n")?;
        fs::remove_file(dir.path().join("S2_R1.fastq"))?;
        fs::write(dir.path().join("S3_R2.fastq"), "@r\nA\n+\nI\n")?;
        let mut registry = SampleRegistry::load_metadata(&meta)?;
        registry.bind_reads(dir.path(), &Default::default()).await?;
        match sample_jobs(&registry) {
            Err(PipelineError::FileBinding(msg)) => assert!(msg.contains("S3 has no forward")),
            other => panic!("expected binding error, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_rarefaction_depth() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let table = dir.path().join("feature-table.tsv");
        fs::write(&table, "#OTU ID\tS1\tS2\tS3\nASV1\t1500\t200\t900\nASV2\t100\t1300\t900\n")?;
        assert_eq!(rarefaction_depth(&table, 1000)?, 1500);
        assert_eq!(rarefaction_depth(&table, 2000)?, 2000);

        fs::write(&table, "#OTU ID\tS1\nASV1\tmany\n")?;
        assert!(matches!(rarefaction_depth(&table, 10), Err(PipelineError::Format(_))));
        Ok(())
    }

    #[test]
    fn test_concat_files_in_order() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let a = dir.path().join("a.fasta");
        let b = dir.path().join("b.fasta");
        fs::write(&a, ">S1.1\nACGT\n")?;
        fs::write(&b, ">S2.1\nTTTT\n")?;
        let out = dir.path().join("all.fasta");
        concat_files(&[a, dir.path().join("missing.fasta"), b], &out)?;
        assert_eq!(fs::read_to_string(out)?, ">S1.1\nACGT\n>S2.1\nTTTT\n");
        Ok(())
    }

    #[test]
    fn test_report_names() {
        let root = Path::new("/out/qiime");
        assert_eq!(report_name(Path::new("/out/qiime/table.qzv"), root), "table");
        assert_eq!(
            report_name(Path::new("/out/qiime/core-metrics/jaccard_emperor.qzv"), root),
            "core-metrics_jaccard_emperor"
        );
    }

    #[test]
    fn test_build_reports() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let qiime_dir = dir.path().join("qiime");
        fs::create_dir_all(qiime_dir.join("core-metrics"))?;
        for (rel, uuid) in [("table.qzv", "u-1"), ("core-metrics/shannon.qzv", "u-2"), ("rep-seqs.qza", "u-3")] {
            let mut zip = ZipWriter::new(File::create(qiime_dir.join(rel))?);
            zip.start_file(format!("{}/metadata.yaml", uuid), FileOptions::default())?;
            zip.write_all(format!("uuid: {}\ntype: Visualization\n", uuid).as_bytes())?;
            zip.start_file(format!("{}/data/index.html", uuid), FileOptions::default())?;
            zip.write_all(b"<html></html>")?;
            zip.finish()?;
        }

        let reports = dir.path().join("reports");
        assert_eq!(build_reports(&qiime_dir, &reports)?, 2);
        assert!(reports.join("table/index.html").exists());
        assert!(reports.join("core-metrics_shannon/index.html").exists());
        let index = fs::read_to_string(reports.join("index.html"))?;
        assert!(index.contains("core-metrics_shannon/index.html"));
        assert!(!index.contains("rep-seqs"));

        // re-running keeps the extracted reports
        assert_eq!(build_reports(&qiime_dir, &reports)?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_stage_skips_when_outputs_exist() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let out = dir.path().join("asv.fasta");
        fs::write(&out, ">ASV1\nACGT\n")?;
        let marker = dir.path().join("ran");
        let spec = CommandSpec::new("sh", vec!["-c".to_string(), format!("touch {}", marker.display())]).produces(&out);
        assert!(run_stage(&CommandRunner::default(), spec.clone()).await?.is_none());
        assert!(!marker.exists());

        fs::remove_file(&out)?;
        let spec = CommandSpec::new("sh", vec!["-c".to_string(), format!("touch {} {}", marker.display(), out.display())]).produces(&out);
        assert!(run_stage(&CommandRunner::default(), spec).await?.is_some());
        assert!(marker.exists());
        Ok(())
    }
}
