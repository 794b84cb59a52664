use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::Local;
use env_logger::Builder;
use log::{debug, error, info, LevelFilter};

use amplicon_pipelines::cli::{self, Arguments, Module};
use amplicon_pipelines::config::defs::{PipelineError, RunConfig, DEFAULT_THREADS, DEFAULT_TIMEOUT_SECS};
use amplicon_pipelines::config::settings::load_settings;
use amplicon_pipelines::pipelines::{amplicon, samples, tables};
use amplicon_pipelines::utils::file::absolute_path;
use amplicon_pipelines::utils::system::detect_cores_and_load;


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = cli::parse();

    let log_level = if args.debug {
        LevelFilter::Trace
    } else if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    let module = args.module;
    let run_config = match setup(args, log_level).await {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Setup failed: {:#} at {} milliseconds.", e, run_start.elapsed().as_millis());
            std::process::exit(1);
        }
    };

    if let Err(e) = match module {
        Module::Amplicon => amplicon_run(run_config).await,
        Module::Manifest => samples::manifest_run(run_config).await,
        Module::ShowSamples => samples::show_samples_run(run_config).await,
        Module::CombineUniques => samples::combine_uniques_run(run_config).await,
        Module::CheckTab => tables::check_tab_run(run_config).await,
        Module::Dada2Split => tables::dada2_split_run(run_config).await,
    } {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }

    info!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


async fn amplicon_run(run_config: Arc<RunConfig>) -> Result<(), PipelineError> {
    amplicon::run(run_config).await
}


/// Resolves settings, cores and the output directory into a RunConfig.
/// Command-line values win over the settings file, which wins over built-in defaults.
async fn setup(args: Arguments, log_level: LevelFilter) -> Result<RunConfig> {
    let cwd = env::current_dir()?;
    debug!("The current directory is {:?}", cwd);

    let settings = load_settings(args.config.as_deref())?;
    let threads = args.threads.or(settings.threads).unwrap_or(DEFAULT_THREADS);
    let timeout = Duration::from_secs(
        args.timeout_secs
            .or(settings.timeout_secs)
            .unwrap_or(DEFAULT_TIMEOUT_SECS),
    );
    if timeout.is_zero() {
        return Err(anyhow!("Timeout must be at least one second"));
    }

    let (max_cores, cpu_load) = detect_cores_and_load(threads).await;
    debug!("Using up to {} cores; CPU load {:.1}%", max_cores, cpu_load);

    let out_dir = match args.module {
        Module::Amplicon | Module::Manifest => setup_output_dir(&args, &cwd)?,
        Module::ShowSamples | Module::CombineUniques | Module::CheckTab | Module::Dada2Split => cwd.clone(),
    };

    Ok(RunConfig {
        cwd,
        out_dir,
        args,
        settings,
        max_cores,
        cpu_load,
        timeout,
        log_level,
    })
}


/// Sets up output directory
/// If `out_dir` is specified from args, uses it;
/// otherwise, creates a directory named `<metadata_stem>_YYYYMMDD`.
/// With `--force` an existing directory is removed first.
///
/// # Arguments
/// * `args` - The parsed command-line arguments.
/// * `cwd` - The current working directory.
/// # Returns
/// path to the output directory.
fn setup_output_dir(args: &Arguments, cwd: &Path) -> Result<PathBuf> {
    let out_dir = match &args.out_dir {
        Some(out) => absolute_path(Path::new(out), cwd),
        None => {
            let metadata = args
                .metadata
                .as_ref()
                .ok_or_else(|| anyhow!("Metadata file (-m) required"))?;
            let stem = Path::new(metadata)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "amplicon".to_string());
            cwd.join(format!("{}_{}", stem, Local::now().format("%Y%m%d")))
        }
    };

    if out_dir.exists() && args.force {
        if cwd.starts_with(&out_dir) {
            return Err(anyhow!(
                "Refusing to remove {}: it contains the working directory",
                out_dir.display()
            ));
        }
        info!("Removing existing output directory {}", out_dir.display());
        fs::remove_dir_all(&out_dir)?;
    } else if out_dir.exists() {
        info!("Reusing output directory {}; completed stages are skipped", out_dir.display());
    }
    fs::create_dir_all(&out_dir)?;
    Ok(out_dir)
}
