use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use thiserror::Error;
use tidal_core::cancellation::CancellationToken;
use tidal_core::pagination::{
    ColumnMetadata, FetchOutcome, PaginationError, PaginationIterator, QueryRow,
};
use tracing::info;

use crate::NULL_TEXT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    /// Picks the format from the file extension, defaulting to CSV.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|extension| extension.to_str()) {
            Some(extension) if extension.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Csv,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub rows: u64,
    pub pages: u64,
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write export file at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize JSON export: {0}")]
    Json(#[from] serde_json::Error),
    #[error("export fetch failed: {0}")]
    Fetch(#[from] PaginationError),
    #[error("export writer task failed: {0}")]
    Writer(#[from] tokio::task::JoinError),
}

/// Streams every page of `iterator` into `path`, holding one page in memory
/// at a time. The iterator is closed exactly once whether or not the export
/// succeeds.
pub async fn export_iterator(
    mut iterator: Box<dyn PaginationIterator>,
    format: ExportFormat,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<ExportSummary, ExportError> {
    let result = write_pages(iterator.as_mut(), format, path, cancel).await;
    iterator.close().await;
    let summary = result?;
    info!(
        path = %path.display(),
        rows = summary.rows,
        pages = summary.pages,
        "export finished"
    );
    Ok(summary)
}

async fn write_pages(
    iterator: &mut dyn PaginationIterator,
    format: ExportFormat,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<ExportSummary, ExportError> {
    let file_path = path.to_path_buf();
    let mut writer = on_blocking_pool(move || PageWriter::create(file_path, format)).await?;
    let mut pages = 0;

    let fetched = loop {
        match iterator.fetch_next(cancel).await {
            Ok(FetchOutcome::Page(page)) => {
                let first = pages == 0;
                pages += 1;
                writer = on_blocking_pool(move || {
                    if first {
                        writer.begin(&page.columns)?;
                    }
                    for row in &page.rows {
                        writer.row(row)?;
                    }
                    Ok(writer)
                })
                .await?;
            }
            Ok(FetchOutcome::EndOfData | FetchOutcome::Unsupported) => break Ok(()),
            Err(error) => break Err(error),
        }
    };
    if let Err(error) = fetched {
        // Dropping the writer flushes its buffer.
        on_blocking_pool(move || {
            drop(writer);
            Ok(())
        })
        .await?;
        return Err(error.into());
    }

    let header = (pages == 0).then(|| iterator.columns().to_vec());
    let rows = on_blocking_pool(move || {
        if let Some(columns) = header {
            writer.begin(&columns)?;
        }
        writer.finish()
    })
    .await?;
    Ok(ExportSummary { rows, pages })
}

/// File IO blocks, so it runs off the async workers.
async fn on_blocking_pool<T, F>(work: F) -> Result<T, ExportError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ExportError> + Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

struct PageWriter {
    out: BufWriter<File>,
    path: PathBuf,
    format: ExportFormat,
    headers: Vec<String>,
    rows: u64,
}

impl PageWriter {
    fn create(path: PathBuf, format: ExportFormat) -> Result<Self, ExportError> {
        let file = File::create(&path).map_err(|source| io_error(&path, source))?;
        Ok(Self {
            out: BufWriter::new(file),
            path,
            format,
            headers: Vec::new(),
            rows: 0,
        })
    }

    fn begin(&mut self, columns: &[ColumnMetadata]) -> Result<(), ExportError> {
        self.headers = columns.iter().map(|column| column.name.clone()).collect();
        match self.format {
            ExportFormat::Csv => {
                let header = self
                    .headers
                    .iter()
                    .map(|header| csv_escape(header))
                    .collect::<Vec<_>>()
                    .join(",");
                self.write(format!("{header}\n").as_bytes())
            }
            ExportFormat::Json => self.write(b"["),
        }
    }

    fn row(&mut self, row: &QueryRow) -> Result<(), ExportError> {
        match self.format {
            ExportFormat::Csv => {
                let line = (0..self.headers.len())
                    .map(|index| csv_escape(row.values.get(index).map_or("", String::as_str)))
                    .collect::<Vec<_>>()
                    .join(",");
                self.write(format!("{line}\n").as_bytes())?;
            }
            ExportFormat::Json => {
                let mut object = Map::with_capacity(self.headers.len());
                for (index, header) in self.headers.iter().enumerate() {
                    let value = match row.values.get(index) {
                        Some(value) if value != NULL_TEXT => Value::String(value.clone()),
                        _ => Value::Null,
                    };
                    object.insert(header.clone(), value);
                }
                let record = serde_json::to_string(&Value::Object(object))?;
                let separator = if self.rows == 0 { "\n  " } else { ",\n  " };
                self.write(separator.as_bytes())?;
                self.write(record.as_bytes())?;
            }
        }
        self.rows += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<u64, ExportError> {
        if self.format == ExportFormat::Json {
            let closing: &[u8] = if self.rows == 0 { b"]\n" } else { b"\n]\n" };
            self.write(closing)?;
        }
        let path = self.path.clone();
        self.out.flush().map_err(|source| io_error(&path, source))?;
        Ok(self.rows)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ExportError> {
        let path = &self.path;
        self.out
            .write_all(bytes)
            .map_err(|source| io_error(path, source))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ExportError {
    ExportError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
