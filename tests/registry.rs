use std::collections::HashSet;
use std::fs;
use std::path::Path;

use amplicon_pipelines::config::defs::PipelineError;
use amplicon_pipelines::utils::derep::combine_uniques;
use amplicon_pipelines::utils::samples::{BindOptions, Direction, MatchMode, SampleRegistry};
use anyhow::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use tempfile::tempdir;

fn write_gz_fastq(path: &Path, reads: usize) -> Result<()> {
    let mut encoder = GzEncoder::new(fs::File::create(path)?, Compression::default());
    for i in 0..reads {
        write!(encoder, "@read{}\nACGTACGT\n+\nIIIIIIII\n", i)?;
    }
    encoder.finish()?;
    Ok(())
}


#[tokio::test]
async fn test_metadata_to_manifest_and_counts() -> Result<()> {
    let dir = tempdir()?;
    let metadata = dir.path().join("mapping.tsv");
    fs::write(
        &metadata,
        "#SampleID\tBodySite\tSubject\n\
         #q2:types\tcategorical\tcategorical\n\
         gut-1\tgut\tA\n\
         \tcomment row\t\n\
         gut-10\tgut\tB\n\
         palm-2\tpalm\tA\n",
    )?;

    let reads = dir.path().join("reads");
    fs::create_dir(&reads)?;
    let layout = [("gut-1", 3), ("gut-10", 5), ("palm-2", 2)];
    for (id, n) in layout {
        write_gz_fastq(&reads.join(format!("{}_S1_L001_R1_001.fastq.gz", id)), n)?;
        write_gz_fastq(&reads.join(format!("{}_S1_L001_R2_001.fastq.gz", id)), n)?;
    }
    fs::write(reads.join("README.txt"), "run notes")?;

    let mut registry = SampleRegistry::load_metadata(&metadata)?;
    assert_eq!(registry.len(), 3);
    assert_eq!(registry.samples_by_attr("Subject", "A"), vec!["gut-1", "palm-2"]);

    // gut-1 is a prefix of gut-10, so plain substring matching is ambiguous
    let loose = registry.bind_reads(&reads, &BindOptions::default()).await;
    assert!(matches!(loose, Err(PipelineError::FileBinding(_))));

    let options = BindOptions {
        mode: MatchMode::Token,
        ..BindOptions::default()
    };
    let manifest = registry.bind_reads(&reads, &options).await?;
    assert_eq!(manifest.len(), 6);

    let keys: HashSet<(String, Direction)> = manifest
        .entries()
        .iter()
        .map(|e| (e.sample_id.clone(), e.direction))
        .collect();
    assert_eq!(keys.len(), 6);

    let out = dir.path().join("manifest.csv");
    manifest.write(&out)?;
    let text = fs::read_to_string(&out)?;
    assert!(text.starts_with("sample-id,absolute-filepath,direction\n"));
    assert_eq!(text.lines().filter(|l| l.ends_with(",reverse")).count(), 3);

    assert_eq!(registry.sample_counts(), "gut-1\t3\ngut-10\t5\npalm-2\t2\n");
    assert_eq!(registry.unmatched_files(), &["README.txt".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_custom_tags() -> Result<()> {
    let dir = tempdir()?;
    let metadata = dir.path().join("mapping.tsv");
    fs::write(&metadata, "SampleID\n#q2:types\nA\n")?;
    write_gz_fastq(&dir.path().join("A_1.fq.gz"), 1)?;
    write_gz_fastq(&dir.path().join("A_2.fq.gz"), 1)?;

    let mut registry = SampleRegistry::load_metadata(&metadata)?;
    let options = BindOptions {
        forward_tag: "_1".to_string(),
        reverse_tag: "_2".to_string(),
        mode: MatchMode::Substring,
    };
    let manifest = registry.bind_reads(dir.path(), &options).await?;
    assert_eq!(manifest.len(), 2);
    assert!(registry.get("A").unwrap().is_paired());
    Ok(())
}

#[test]
fn test_combine_uniques_across_samples() -> Result<()> {
    let dir = tempdir()?;
    let s1 = dir.path().join("S1.fasta");
    let s2 = dir.path().join("S2.fasta");
    fs::write(&s1, ">S1.uniq1;size=10\nACGTACGT\n>S1.uniq2;size=2\nGGGGCCCC\n")?;
    fs::write(&s2, ">S2.uniq1;size=4\nGGGGCCCC\n>S2.uniq2;size=9\nTTTTAAAA\n")?;

    let out = dir.path().join("uniques.fasta");
    assert_eq!(combine_uniques(&out, &[s1, s2])?, 3);
    assert_eq!(
        fs::read_to_string(&out)?,
        ">seq1;size=10\nACGTACGT\n>seq2;size=9\nTTTTAAAA\n>seq3;size=6\nGGGGCCCC\n"
    );
    Ok(())
}

#[test]
fn test_combine_uniques_reads_concatenated_gzip() -> Result<()> {
    let dir = tempdir()?;
    let joined = dir.path().join("joined.fasta.gz");
    let mut file = fs::File::create(&joined)?;
    for member in [">a;size=3\nACGTACGT\n", ">b;size=1\nTTTTAAAA\n>c;size=2\nACGTACGT\n"] {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(member.as_bytes())?;
        file.write_all(&encoder.finish()?)?;
    }
    drop(file);

    let out = dir.path().join("uniques.fasta");
    assert_eq!(combine_uniques(&out, &[joined])?, 2);
    assert_eq!(
        fs::read_to_string(&out)?,
        ">seq1;size=5\nACGTACGT\n>seq2;size=1\nTTTTAAAA\n"
    );
    Ok(())
}
