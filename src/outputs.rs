//! Append-only CSV sink files, one per queue.

use anyhow::{Context, Result};
use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
};

/// Appends processed messages as delimited rows. Never truncates and never
/// reads the file back.
#[derive(Debug, Clone)]
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `text` as one row, splitting it into fields on `,`.
    ///
    /// The file is opened, written and flushed per row so that a row is on
    /// disk before the message is acknowledged.
    pub fn append_line(&self, text: &str) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open sink file: {}", self.path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .delimiter(b',')
            .has_headers(false)
            .flexible(true)
            .from_writer(file);
        writer
            .write_record(text.split(','))
            .with_context(|| format!("Failed to write to sink file: {}", self.path.display()))?;
        writer
            .flush()
            .with_context(|| format!("Failed to flush sink file: {}", self.path.display()))?;
        Ok(())
    }

    /// Same as `append_line`, run on the blocking thread pool.
    pub async fn append_line_async(&self, text: String) -> Result<()> {
        let sink = self.clone();
        tokio::task::spawn_blocking(move || sink.append_line(&text))
            .await
            .context("Sink write task failed")?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_rows_are_appended() {
        let dir = tempdir().unwrap();
        let sink = CsvSink::new(dir.path().join("out.csv"));

        sink.append_line("NAME: ACME, TYPE: MICRO").unwrap();
        sink.append_line("NAME: HILL, TYPE: BREWPUB").unwrap();

        let contents = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(contents, "NAME: ACME, TYPE: MICRO\nNAME: HILL, TYPE: BREWPUB\n");
    }

    #[test]
    fn test_existing_contents_are_kept() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        std::fs::write(&path, "earlier,row\n").unwrap();

        CsvSink::new(&path).append_line("NAME: ACME").unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "earlier,row\nNAME: ACME\n");
    }

    #[test]
    fn test_unwritable_path_is_an_error() {
        let dir = tempdir().unwrap();
        let sink = CsvSink::new(dir.path().join("missing").join("out.csv"));
        assert!(sink.append_line("NAME: ACME").is_err());
    }

    #[tokio::test]
    async fn test_async_append() {
        let dir = tempdir().unwrap();
        let sink = CsvSink::new(dir.path().join("out.csv"));
        sink.append_line_async("A, B".to_string()).await.unwrap();
        let contents = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(contents, "A, B\n");
    }
}
