// src/utils/runlog.rs: append-only record of every external command

use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::defs::{RUN_LOG, RUN_MARKDOWN};
use crate::utils::runner::RunResult;

/// Plain-text run log plus its markdown twin. All writes go through one lock so
/// entries from concurrent sample workers never interleave.
#[derive(Debug)]
pub struct RunLog {
    log_path: PathBuf,
    markdown_path: PathBuf,
    lock: Mutex<()>,
}

impl RunLog {
    /// Run log in `dir` (`run.log`, `run.md`). Existing logs are appended to.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(RUN_LOG), dir.join(RUN_MARKDOWN))
    }

    pub fn new(log_path: PathBuf, markdown_path: PathBuf) -> Self {
        RunLog {
            log_path,
            markdown_path,
            lock: Mutex::new(()),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn markdown_path(&self) -> &Path {
        &self.markdown_path
    }

    /// Section heading, e.g. a pipeline stage.
    pub async fn section(&self, heading: &str) -> std::io::Result<()> {
        let text = format!("\n## {}\n", heading);
        let markdown = format!("\n## {}\n\n", heading);
        self.append(&text, &markdown).await
    }

    /// Entry written right before a command is launched.
    pub async fn command_started(&self, title: &str, command: &str) -> std::io::Result<()> {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let text = format!("[{}] {}\n```\n{}\n```\n", timestamp, title, command);
        let markdown = format!("### {}\n\n*{}*\n\n```bash\n{}\n```\n\n", title, timestamp, command);
        self.append(&text, &markdown).await
    }

    /// Outcome line written once the command finished or was killed.
    pub async fn command_finished(&self, result: &RunResult) -> std::io::Result<()> {
        let code = result
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let text = format!(
            "[{}] {}: {} (exit {}, {:.2}s)\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            result.title,
            result.status,
            code,
            result.elapsed_seconds
        );
        let markdown = format!(
            "> **{}** exit {} in {:.2}s\n\n",
            result.status, code, result.elapsed_seconds
        );
        self.append(&text, &markdown).await
    }

    async fn append(&self, text: &str, markdown: &str) -> std::io::Result<()> {
        let _guard = self.lock.lock().await;
        for (path, content) in [(&self.log_path, text), (&self.markdown_path, markdown)] {
            let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::runner::RunStatus;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_entries_in_both_streams() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let log = RunLog::in_dir(dir.path());
        log.section("merge").await?;
        log.command_started("merge S1", "vsearch --fastq_mergepairs S1_R1.fastq").await?;
        let result = RunResult {
            command: "vsearch --fastq_mergepairs S1_R1.fastq".to_string(),
            title: "merge S1".to_string(),
            status: RunStatus::Success,
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            elapsed_seconds: 1.5,
        };
        log.command_finished(&result).await?;

        let text = std::fs::read_to_string(log.log_path())?;
        assert!(text.contains("merge S1\n```\nvsearch --fastq_mergepairs S1_R1.fastq\n```"));
        assert!(text.contains("merge S1: success (exit 0, 1.50s)"));

        let markdown = std::fs::read_to_string(log.markdown_path())?;
        assert!(markdown.contains("## merge"));
        assert!(markdown.contains("### merge S1"));
        assert!(markdown.contains("```bash\nvsearch"));
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_entries_do_not_interleave() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let log = Arc::new(RunLog::in_dir(dir.path()));
        let mut handles = Vec::new();
        for i in 0..8 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.command_started(&format!("task {}", i), &format!("echo {}", i)).await
            }));
        }
        for handle in handles {
            handle.await??;
        }
        let text = std::fs::read_to_string(log.log_path())?;
        for i in 0..8 {
            assert!(text.contains(&format!("task {}\n```\necho {}\n```", i, i)));
        }
        Ok(())
    }
}
