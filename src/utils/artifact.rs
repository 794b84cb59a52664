// src/utils/artifact.rs: reading QIIME 2 archive artifacts (.qza / .qzv)

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use log::debug;
use serde::Deserialize;
use zip::ZipArchive;

use crate::config::defs::{PipelineError, ARTIFACT_METADATA};

/// Contents of `<uuid>/metadata.yaml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ArtifactMetadata {
    pub uuid: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub format: Option<String>,
}

fn open_archive(path: &Path) -> Result<ZipArchive<File>, PipelineError> {
    let file = File::open(path)?;
    ZipArchive::new(file).map_err(|e| PipelineError::Format(format!("{}: not an artifact archive: {}", path.display(), e)))
}

fn entry_names(archive: &mut ZipArchive<File>, path: &Path) -> Result<Vec<String>, PipelineError> {
    (0..archive.len())
        .map(|i| {
            archive
                .by_index(i)
                .map(|f| f.name().to_string())
                .map_err(|e| PipelineError::Format(format!("{}: {}", path.display(), e)))
        })
        .collect()
}

/// Reads and validates the artifact's metadata.
///
/// Exactly one top-level `<uuid>/metadata.yaml` must exist and its `uuid` must
/// equal the directory name.
pub fn read_artifact_metadata(path: &Path) -> Result<ArtifactMetadata, PipelineError> {
    let mut archive = open_archive(path)?;
    let names = entry_names(&mut archive, path)?;

    let candidates: Vec<&String> = names
        .iter()
        .filter(|name| {
            let parts: Vec<&str> = name.split('/').collect();
            parts.len() == 2 && !parts[0].is_empty() && parts[1] == ARTIFACT_METADATA
        })
        .collect();
    let entry = match candidates.as_slice() {
        [single] => single.to_string(),
        [] => {
            return Err(PipelineError::Format(format!(
                "{}: no <uuid>/{} entry",
                path.display(),
                ARTIFACT_METADATA
            )));
        }
        many => {
            return Err(PipelineError::Format(format!(
                "{}: {} {} entries found, expected one",
                path.display(),
                many.len(),
                ARTIFACT_METADATA
            )));
        }
    };
    let root = entry.split('/').next().unwrap_or_default().to_string();

    let mut file = archive
        .by_name(&entry)
        .map_err(|e| PipelineError::Format(format!("{}: {}", path.display(), e)))?;
    let mut text = String::new();
    io::Read::read_to_string(&mut file, &mut text)
        .map_err(|e| PipelineError::Format(format!("{}: {}: {}", path.display(), entry, e)))?;

    let metadata: ArtifactMetadata = serde_yml::from_str(&text)
        .map_err(|e| PipelineError::Format(format!("{}: {}: {}", path.display(), entry, e)))?;
    if metadata.uuid != root {
        return Err(PipelineError::Format(format!(
            "{}: metadata uuid {} does not match directory {}",
            path.display(),
            metadata.uuid,
            root
        )));
    }
    Ok(metadata)
}

/// Extracts `<uuid>/<internal>/...` of the artifact into `dest`.
///
/// `dest` must not exist yet and its parent must. Returns the number of files written.
pub fn extract_artifact_dir(path: &Path, internal: &str, dest: &Path) -> Result<usize, PipelineError> {
    let metadata = read_artifact_metadata(path)?;

    let parent = dest.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    if !parent.is_dir() {
        return Err(PipelineError::IOError(format!(
            "Parent directory of {} does not exist",
            dest.display()
        )));
    }
    if dest.exists() {
        return Err(PipelineError::IOError(format!("{} already exists", dest.display())));
    }

    let mut archive = open_archive(path)?;
    let names = entry_names(&mut archive, path)?;
    let prefix = format!("{}/{}/", metadata.uuid, internal.trim_matches('/'));

    // Validate everything before touching the filesystem
    let mut selected: Vec<(usize, PathBuf, bool)> = Vec::new();
    for (index, name) in names.iter().enumerate() {
        let Some(rel) = name.strip_prefix(&prefix) else { continue };
        if rel.is_empty() {
            continue;
        }
        let rel_path = PathBuf::from(rel);
        if !rel_path.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(PipelineError::Format(format!(
                "{}: entry {} escapes the extraction directory",
                path.display(),
                name
            )));
        }
        selected.push((index, rel_path, name.ends_with('/')));
    }
    if selected.is_empty() {
        return Err(PipelineError::Format(format!(
            "{}: no {} directory in artifact",
            path.display(),
            prefix
        )));
    }

    fs::create_dir(dest)?;
    let mut written = 0;
    for (index, rel, is_dir) in selected {
        let target = dest.join(&rel);
        if is_dir {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut entry = archive
            .by_index(index)
            .map_err(|e| PipelineError::Format(format!("{}: {}", path.display(), e)))?;
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        written += 1;
    }
    debug!("Extracted {} files from {} into {}", written, path.display(), dest.display());
    Ok(written)
}
