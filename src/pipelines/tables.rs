// src/pipelines/tables.rs: check-tab and dada2-split modules

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;

use crate::config::defs::{PipelineError, RunConfig};
use crate::utils::dada2::{read_dada2_table, write_dada2_split};
use crate::utils::file::absolute_path;
use crate::utils::table::check_table;

fn table_paths(config: &RunConfig) -> Vec<PathBuf> {
    config
        .args
        .tables
        .iter()
        .map(|t| absolute_path(Path::new(t), &config.cwd))
        .collect()
}

/// Per-file report for check-tab. The first unreadable file, or in strict mode
/// the first inconsistent one, stops the module.
pub fn check_tables(paths: &[PathBuf], strict: bool) -> Result<String, PipelineError> {
    let mut out = String::new();
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        out.push_str(&format!("\nAnalyzing {}:\n", name));
        out.push_str(&check_table(path, strict)?.summary());
    }
    Ok(out)
}

pub async fn check_tab_run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    let paths = table_paths(&config);
    if paths.is_empty() {
        return Err(PipelineError::InvalidConfig("--tables needs at least one file".to_string()));
    }
    let strict = config.args.strict || config.settings.strict_tables.unwrap_or(false);
    print!("{}", check_tables(&paths, strict)?);
    Ok(())
}


pub async fn dada2_split_run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    let input = match table_paths(&config).as_slice() {
        [single] => single.clone(),
        _ => {
            return Err(PipelineError::InvalidConfig(
                "dada2-split takes exactly one --tables input".to_string(),
            ))
        }
    };
    let base = config
        .args
        .out_file
        .as_deref()
        .map(|o| absolute_path(Path::new(o), &config.cwd))
        .ok_or_else(|| PipelineError::InvalidConfig("--out-file is required for this module".to_string()))?;

    info!("Processing {}", input.display());
    let table = read_dada2_table(&input)?;
    info!(
        "Found {} unique sequences across {} samples",
        table.rows.len(),
        table.sample_count()
    );
    let (fasta, tsv) = write_dada2_split(&table, &base)?;
    info!("Wrote {} and {}", fasta.display(), tsv.display());
    Ok(())
}
