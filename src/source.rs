//! Reads brewery records from a comma-delimited dataset.
//!
//! The header row is skipped and fields are mapped by position, so a file
//! whose header names differ from ours still loads as long as the column
//! order matches.

use crate::{core::SourceRecord, error::PipelineError};
use std::{fs::File, io::Read, path::Path};
use tracing::info;

/// Number of positional fields in a source row.
pub const FIELD_COUNT: usize = 14;

pub struct CsvSource<R: Read> {
    reader: csv::Reader<R>,
}

impl CsvSource<File> {
    /// Opens the dataset at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        info!("Reading source records from {:?}", path.as_ref());
        let file = File::open(path.as_ref()).map_err(|e| {
            PipelineError::Source(format!("cannot open {}: {}", path.as_ref().display(), e))
        })?;
        Ok(Self::from_reader(file))
    }
}

impl<R: Read> CsvSource<R> {
    pub fn from_reader(reader: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        Self { reader }
    }

    /// Yields each data row as a `SourceRecord`, in file order.
    ///
    /// Rows with the wrong number of fields are reported with their line
    /// number instead of being skipped.
    pub fn records(&mut self) -> impl Iterator<Item = Result<SourceRecord, PipelineError>> + '_ {
        self.reader.records().map(|row| {
            let row = row?;
            if row.len() != FIELD_COUNT {
                let line = row.position().map(|p| p.line()).unwrap_or_default();
                return Err(PipelineError::Source(format!(
                    "line {}: expected {} fields, found {}",
                    line,
                    FIELD_COUNT,
                    row.len()
                )));
            }
            row.deserialize::<SourceRecord>(None).map_err(PipelineError::from)
        })
    }
}
