/// Functions and structs for resolving external tools and creating their command-line arguments

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, error, info};

use crate::config::defs::{PipelineError, ASV_PREFIX, BINARY_PLACEHOLDER, BIN_SUBDIR, DEPENDENCY_CHECKS, TOOLS_SUBDIR};
use crate::config::settings::Settings;
use crate::utils::runner::{CommandRunner, CommandSpec};

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}


pub mod vsearch {
    use std::path::Path;
    use super::{path_arg, ASV_PREFIX};

    pub fn merge_pairs_args(forward: &Path, reverse: &Path, out: &Path, sample_id: &str, threads: usize) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("--fastq_mergepairs".to_string());
        args_vec.push(path_arg(forward));
        args_vec.push("--reverse".to_string());
        args_vec.push(path_arg(reverse));
        args_vec.push("--fastqout".to_string());
        args_vec.push(path_arg(out));
        args_vec.push("--relabel".to_string());
        args_vec.push(format!("{}.", sample_id));
        args_vec.push("--threads".to_string());
        args_vec.push(threads.to_string());
        args_vec
    }

    pub fn filter_args(input: &Path, out: &Path, max_ee: f64, min_len: usize) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("--fastq_filter".to_string());
        args_vec.push(path_arg(input));
        args_vec.push("--fastq_maxee".to_string());
        args_vec.push(max_ee.to_string());
        args_vec.push("--fastq_minlen".to_string());
        args_vec.push(min_len.to_string());
        args_vec.push("--fastaout".to_string());
        args_vec.push(path_arg(out));
        args_vec
    }

    pub fn derep_args(input: &Path, out: &Path, sample_id: &str) -> Vec<String> {
        vec![
            "--derep_fulllength".to_string(),
            path_arg(input),
            "--sizeout".to_string(),
            "--relabel".to_string(),
            format!("{}.uniq", sample_id),
            "--output".to_string(),
            path_arg(out),
        ]
    }

    pub fn unoise_args(uniques: &Path, out: &Path, min_size: usize, threads: usize) -> Vec<String> {
        vec![
            "--cluster_unoise".to_string(),
            path_arg(uniques),
            "--minsize".to_string(),
            min_size.to_string(),
            "--sizein".to_string(),
            "--sizeout".to_string(),
            "--centroids".to_string(),
            path_arg(out),
            "--threads".to_string(),
            threads.to_string(),
        ]
    }

    pub fn uchime_args(denoised: &Path, out: &Path) -> Vec<String> {
        vec![
            "--uchime3_denovo".to_string(),
            path_arg(denoised),
            "--sizein".to_string(),
            "--nonchimeras".to_string(),
            path_arg(out),
            "--relabel".to_string(),
            ASV_PREFIX.to_string(),
        ]
    }

    /// Maps every read back to the ASVs; read labels `<sample>.<n>` give the table columns.
    pub fn otutab_args(reads: &Path, db: &Path, table: &Path, identity: f64, threads: usize) -> Vec<String> {
        vec![
            "--usearch_global".to_string(),
            path_arg(reads),
            "--db".to_string(),
            path_arg(db),
            "--id".to_string(),
            identity.to_string(),
            "--otutabout".to_string(),
            path_arg(table),
            "--threads".to_string(),
            threads.to_string(),
        ]
    }
}

pub mod qiime {
    use std::path::Path;
    use super::path_arg;

    pub fn import_args(semantic_type: &str, input: &Path, output: &Path, input_format: Option<&str>) -> Vec<String> {
        let mut args_vec: Vec<String> = vec![
            "tools".to_string(),
            "import".to_string(),
            "--type".to_string(),
            semantic_type.to_string(),
            "--input-path".to_string(),
            path_arg(input),
            "--output-path".to_string(),
            path_arg(output),
        ];
        if let Some(format) = input_format {
            args_vec.push("--input-format".to_string());
            args_vec.push(format.to_string());
        }
        args_vec
    }

    pub fn classify_args(classifier: &Path, reads: &Path, out: &Path, threads: usize) -> Vec<String> {
        vec![
            "feature-classifier".to_string(),
            "classify-sklearn".to_string(),
            "--i-classifier".to_string(),
            path_arg(classifier),
            "--i-reads".to_string(),
            path_arg(reads),
            "--o-classification".to_string(),
            path_arg(out),
            "--p-n-jobs".to_string(),
            threads.to_string(),
        ]
    }

    pub fn tabulate_args(input: &Path, out: &Path) -> Vec<String> {
        vec![
            "metadata".to_string(),
            "tabulate".to_string(),
            "--m-input-file".to_string(),
            path_arg(input),
            "--o-visualization".to_string(),
            path_arg(out),
        ]
    }

    pub fn summarize_args(table: &Path, metadata: &Path, out: &Path) -> Vec<String> {
        vec![
            "feature-table".to_string(),
            "summarize".to_string(),
            "--i-table".to_string(),
            path_arg(table),
            "--m-sample-metadata-file".to_string(),
            path_arg(metadata),
            "--o-visualization".to_string(),
            path_arg(out),
        ]
    }

    pub fn core_metrics_args(table: &Path, metadata: &Path, depth: u64, out_dir: &Path, threads: usize) -> Vec<String> {
        vec![
            "diversity".to_string(),
            "core-metrics".to_string(),
            "--i-table".to_string(),
            path_arg(table),
            "--p-sampling-depth".to_string(),
            depth.to_string(),
            "--m-metadata-file".to_string(),
            path_arg(metadata),
            "--output-dir".to_string(),
            path_arg(out_dir),
            "--p-n-jobs".to_string(),
            threads.to_string(),
        ]
    }
}

pub mod biom {
    use std::path::Path;
    use super::path_arg;

    pub fn convert_args(table: &Path, out: &Path) -> Vec<String> {
        vec![
            "convert".to_string(),
            "-i".to_string(),
            path_arg(table),
            "-o".to_string(),
            path_arg(out),
            "--table-type".to_string(),
            "OTU table".to_string(),
            "--to-hdf5".to_string(),
        ]
    }
}


/// An external program the pipeline needs, and how to prove it works.
#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    pub name: String,
    pub binary_path: PathBuf,
    /// Version command; `{binary}` is replaced by `binary_path`.
    pub version_test: String,
    pub expected_substring: String,
}

impl Dependency {
    pub fn new(name: &str, version_test: &str, expected_substring: &str) -> Self {
        Dependency {
            name: name.to_string(),
            binary_path: PathBuf::from(name),
            version_test: version_test.to_string(),
            expected_substring: expected_substring.to_string(),
        }
    }

    /// Dependency with the built-in version check for a known tool tag.
    pub fn known(name: &str) -> Result<Self, PipelineError> {
        DEPENDENCY_CHECKS
            .get(name)
            .map(|(test, expected)| Dependency::new(name, test, expected))
            .ok_or_else(|| PipelineError::InvalidConfig(format!("No version check defined for {}", name)))
    }

    pub fn binary(&self) -> String {
        self.binary_path.to_string_lossy().to_string()
    }

    fn version_spec(&self) -> CommandSpec {
        let binary = self.binary();
        let mut words = self
            .version_test
            .split_whitespace()
            .map(|w| w.replace(BINARY_PLACEHOLDER, &binary));
        let program = words.next().unwrap_or_else(|| binary.clone());
        CommandSpec::new(program, words)
            .with_title(format!("check {}", self.name))
            .quiet()
    }
}


/// Directories searched for bundled tools before the PATH.
#[derive(Debug, Clone)]
pub struct ToolLocations {
    pub tools_dir: PathBuf,
    pub bin_dir: PathBuf,
}

impl ToolLocations {
    /// Settings win; otherwise `tools/` and `bin/` beside the running executable.
    pub fn from_settings(settings: &Settings) -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        ToolLocations {
            tools_dir: settings.tools_dir.clone().unwrap_or_else(|| exe_dir.join(TOOLS_SUBDIR)),
            bin_dir: settings.bin_dir.clone().unwrap_or_else(|| exe_dir.join(BIN_SUBDIR)),
        }
    }

    fn candidate(dir: &Path, name: &str) -> PathBuf {
        let bundled = dir.join(name);
        if bundled.exists() {
            bundled
        } else {
            PathBuf::from(name)
        }
    }
}


/// Resolves each dependency to a working binary, in name order.
///
/// # Arguments
///
/// * `runner` - Runner used for the version probes.
/// * `dependencies` - Tools to resolve.
/// * `locations` - Bundled tools and fallback bin directories.
///
/// # Returns
/// The dependencies with `binary_path` rewritten to the candidate that passed.
pub async fn check_dependencies(
    runner: &CommandRunner,
    dependencies: Vec<Dependency>,
    locations: &ToolLocations,
) -> Result<Vec<Dependency>, PipelineError> {
    let mut resolved = dependencies;
    resolved.sort_by(|a, b| a.name.cmp(&b.name));

    for dep in resolved.iter_mut() {
        dep.binary_path = ToolLocations::candidate(&locations.tools_dir, &dep.name);
        let probe = runner.execute(&dep.version_spec().tolerate_failure()).await?;
        if probe.succeeded() && probe.mentions(&dep.expected_substring) {
            info!("Found {} at {}", dep.name, dep.binary_path.display());
            continue;
        }
        debug!("{} check failed at {}, trying fallback", dep.name, dep.binary_path.display());

        dep.binary_path = ToolLocations::candidate(&locations.bin_dir, &dep.name);
        let missing = || PipelineError::Dependency {
            name: dep.name.clone(),
            binary: dep.binary(),
        };
        let probe = match runner.execute(&dep.version_spec()).await {
            Ok(probe) => probe,
            Err(e @ (PipelineError::Execution { .. } | PipelineError::Timeout { .. })) => {
                error!("{}", e);
                return Err(missing());
            }
            Err(e) => return Err(e),
        };
        if !probe.mentions(&dep.expected_substring) {
            return Err(missing());
        }
        info!("Found {} at {}", dep.name, dep.binary_path.display());
    }
    Ok(resolved)
}


/// Resolved dependencies by name.
#[derive(Debug, Clone, Default)]
pub struct Toolbox {
    tools: BTreeMap<String, Dependency>,
}

impl Toolbox {
    pub fn new(resolved: Vec<Dependency>) -> Self {
        Toolbox {
            tools: resolved.into_iter().map(|d| (d.name.clone(), d)).collect(),
        }
    }

    pub fn binary(&self, name: &str) -> Result<String, PipelineError> {
        self.tools
            .get(name)
            .map(Dependency::binary)
            .ok_or_else(|| PipelineError::Dependency {
                name: name.to_string(),
                binary: name.to_string(),
            })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    fn system_binary(name: &str) -> Option<PathBuf> {
        ["/bin", "/usr/bin"]
            .iter()
            .map(|d| Path::new(d).join(name))
            .find(|p| p.exists())
    }

    fn locations(root: &Path) -> ToolLocations {
        let tools_dir = root.join("tools");
        let bin_dir = root.join("bin");
        std::fs::create_dir_all(&tools_dir).unwrap();
        std::fs::create_dir_all(&bin_dir).unwrap();
        ToolLocations { tools_dir, bin_dir }
    }

    #[test]
    fn test_known_dependencies() {
        let vsearch = Dependency::known("vsearch").unwrap();
        assert_eq!(vsearch.version_test, "{binary} --version");
        assert_eq!(vsearch.expected_substring, "vsearch");
        assert!(Dependency::known("blastn").is_err());
    }

    #[test]
    fn test_version_spec_substitutes_binary() {
        let mut dep = Dependency::new("qiime", "{binary} --version", "q2cli");
        dep.binary_path = PathBuf::from("/opt/tools/qiime");
        let spec = dep.version_spec();
        assert_eq!(spec.program, "/opt/tools/qiime");
        assert_eq!(spec.args, vec!["--version"]);
        assert!(spec.silent);
    }

    #[tokio::test]
    async fn test_path_fallback_resolves() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let deps = vec![
            Dependency::new("echo", "{binary} echo-probe 2.1", "echo-probe"),
            Dependency::new("cat", "{binary} --version", "cat"),
        ];
        let resolved = check_dependencies(&CommandRunner::default(), deps, &locations(dir.path())).await?;
        let names: Vec<&str> = resolved.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["cat", "echo"]);
        assert_eq!(resolved[1].binary_path, PathBuf::from("echo"));
        Ok(())
    }

    #[tokio::test]
    async fn test_bundled_tool_preferred() -> anyhow::Result<()> {
        let Some(echo) = system_binary("echo") else { return Ok(()) };
        let dir = tempdir()?;
        let locs = locations(dir.path());
        symlink(&echo, locs.tools_dir.join("mytool"))?;

        let deps = vec![Dependency::new("mytool", "{binary} mytool 1.0", "mytool")];
        let resolved = check_dependencies(&CommandRunner::default(), deps, &locs).await?;
        assert_eq!(resolved[0].binary_path, locs.tools_dir.join("mytool"));
        Ok(())
    }

    #[tokio::test]
    async fn test_falls_back_to_bin_dir() -> anyhow::Result<()> {
        let (Some(echo), Some(falsy)) = (system_binary("echo"), system_binary("false")) else {
            return Ok(());
        };
        let dir = tempdir()?;
        let locs = locations(dir.path());
        symlink(&falsy, locs.tools_dir.join("mytool"))?;
        symlink(&echo, locs.bin_dir.join("mytool"))?;

        let deps = vec![Dependency::new("mytool", "{binary} mytool 1.0", "mytool")];
        let resolved = check_dependencies(&CommandRunner::default(), deps, &locs).await?;
        assert_eq!(resolved[0].binary_path, locs.bin_dir.join("mytool"));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_tool_is_dependency_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let deps = vec![Dependency::new("amplicon-missing-tool", "{binary} --version", "missing")];
        match check_dependencies(&CommandRunner::default(), deps, &locations(dir.path())).await {
            Err(PipelineError::Dependency { name, binary }) => {
                assert_eq!(name, "amplicon-missing-tool");
                assert_eq!(binary, "amplicon-missing-tool");
            }
            other => panic!("expected dependency error, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_wrong_version_output_is_dependency_error() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let deps = vec![Dependency::new("echo", "{binary} something-else", "vsearch")];
        let result = check_dependencies(&CommandRunner::default(), deps, &locations(dir.path())).await;
        assert!(matches!(result, Err(PipelineError::Dependency { .. })));
        Ok(())
    }

    #[test]
    fn test_toolbox_lookup() {
        let mut dep = Dependency::new("vsearch", "{binary} --version", "vsearch");
        dep.binary_path = PathBuf::from("/opt/bin/vsearch");
        let toolbox = Toolbox::new(vec![dep]);
        assert_eq!(toolbox.binary("vsearch").unwrap(), "/opt/bin/vsearch");
        assert!(matches!(toolbox.binary("qiime"), Err(PipelineError::Dependency { .. })));
    }

    #[test]
    fn test_argument_builders() {
        let args = vsearch::merge_pairs_args(
            Path::new("/r/S1_R1.fastq.gz"),
            Path::new("/r/S1_R2.fastq.gz"),
            Path::new("/o/merged/S1.fastq"),
            "S1",
            4,
        );
        assert_eq!(args[0], "--fastq_mergepairs");
        assert!(args.windows(2).any(|w| w[0] == "--relabel" && w[1] == "S1."));

        let args = qiime::import_args("FeatureData[Sequence]", Path::new("asv.fasta"), Path::new("rep.qza"), None);
        assert_eq!(&args[..4], &["tools", "import", "--type", "FeatureData[Sequence]"]);
        assert!(!args.contains(&"--input-format".to_string()));

        let args = biom::convert_args(Path::new("t.tsv"), Path::new("t.biom"));
        assert!(args.contains(&"OTU table".to_string()));
    }
}
