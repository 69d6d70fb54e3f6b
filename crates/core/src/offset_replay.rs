use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::cancellation::CancellationToken;
use crate::pagination::{
    guarded_fetch, ColumnMetadata, DriverError, FetchDirection, FetchOutcome, PaginationError,
    PaginationIterator, QueryRow, ResultPage, RowBatch,
};

const DESCRIBE_ALIAS: &str = "tidal_describe";
const PAGE_ALIAS: &str = "tidal_page";

/// Executes a complete statement and returns every row it produces.
///
/// Implementations are expected to be backed by a pool that is safe for
/// concurrent use; the iterator never holds a connection between calls.
#[async_trait]
pub trait ReplayDriver: Send + Sync {
    async fn query(&self, sql: &str) -> Result<RowBatch, DriverError>;
}

#[must_use]
pub fn trim_statement(sql: &str) -> &str {
    sql.trim().trim_end_matches(';').trim_end()
}

#[must_use]
pub fn describe_sql(sql: &str) -> String {
    format!(
        "SELECT * FROM ({}) AS {DESCRIBE_ALIAS} LIMIT 0",
        trim_statement(sql)
    )
}

#[must_use]
pub fn window_sql(sql: &str, limit: usize, offset: u64) -> String {
    format!(
        "SELECT * FROM ({}) AS {PAGE_ALIAS} LIMIT {limit} OFFSET {offset}",
        trim_statement(sql)
    )
}

/// Emulates paging by re-running the original statement inside a row window.
///
/// `offset` is the offset of the next forward window, so moving back one
/// page from the current position means stepping back two windows.
#[derive(Debug)]
pub struct OffsetReplayIterator<D: ReplayDriver> {
    driver: D,
    sql: String,
    columns: Arc<[ColumnMetadata]>,
    page_size: usize,
    fetch_timeout: Duration,
    offset: u64,
    exhausted: bool,
    closed: bool,
}

impl<D: ReplayDriver> OffsetReplayIterator<D> {
    /// Reads column metadata with a zero-row window. No data is fetched.
    pub async fn open(
        driver: D,
        sql: &str,
        page_size: usize,
        fetch_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self, PaginationError> {
        assert!(page_size > 0, "page size must be greater than 0");
        let sql = trim_statement(sql).to_string();
        let describe = describe_sql(&sql);
        let batch = guarded_fetch(cancel, fetch_timeout, driver.query(&describe))
            .await
            .map_err(|error| with_context(error, "describe columns", &sql))?;
        debug!(columns = batch.columns.len(), "offset replay iterator opened");

        Ok(Self {
            driver,
            sql,
            columns: batch.columns.into(),
            page_size,
            fetch_timeout,
            offset: 0,
            exhausted: false,
            closed: false,
        })
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    async fn fetch_window(
        &mut self,
        offset: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<QueryRow>, PaginationError> {
        let sql = window_sql(&self.sql, self.page_size, offset);
        trace!(offset, page_size = self.page_size, "replaying windowed statement");
        let result = guarded_fetch(cancel, self.fetch_timeout, self.driver.query(&sql)).await;
        match result {
            Ok(batch) => Ok(batch.rows),
            Err(error) => {
                let error = with_context(error, "fetch page", &self.sql);
                if error.is_connection_lost() {
                    self.close().await;
                }
                Err(error)
            }
        }
    }

    fn page(&self, rows: Vec<QueryRow>, direction: FetchDirection) -> FetchOutcome {
        FetchOutcome::Page(ResultPage {
            columns: Arc::clone(&self.columns),
            rows,
            direction,
        })
    }
}

fn with_context(error: PaginationError, operation: &str, sql: &str) -> PaginationError {
    match error {
        PaginationError::Driver(driver) => {
            PaginationError::Driver(driver.with_context(operation, sql))
        }
        other => other,
    }
}

#[async_trait]
impl<D: ReplayDriver> PaginationIterator for OffsetReplayIterator<D> {
    fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    async fn fetch_next(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, PaginationError> {
        if self.closed {
            return Err(PaginationError::Closed);
        }
        if self.exhausted {
            return Ok(FetchOutcome::EndOfData);
        }

        let rows = self.fetch_window(self.offset, cancel).await?;
        if rows.is_empty() {
            self.exhausted = true;
            return Ok(FetchOutcome::EndOfData);
        }
        if rows.len() < self.page_size {
            self.exhausted = true;
        }
        self.offset += rows.len() as u64;
        Ok(self.page(rows, FetchDirection::Forward))
    }

    async fn fetch_prev(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, PaginationError> {
        if self.closed {
            return Err(PaginationError::Closed);
        }
        let page_size = self.page_size as u64;
        // The current window already starts at row 0.
        if self.offset <= page_size {
            return Ok(FetchOutcome::Unsupported);
        }

        let new_offset = self.offset.saturating_sub(2 * page_size);
        let rows = self.fetch_window(new_offset, cancel).await?;
        if rows.is_empty() {
            return Ok(FetchOutcome::EndOfData);
        }
        self.offset = new_offset + rows.len() as u64;
        self.exhausted = false;
        Ok(self.page(rows, FetchDirection::Backward))
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) {
        if !self.closed {
            debug!(offset = self.offset, "offset replay iterator closed");
        }
        self.closed = true;
    }
}
