use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cancellation::CancellationToken;
use crate::pagination::{
    guarded_fetch, ColumnMetadata, DriverError, FetchDirection, FetchOutcome, PaginationError,
    PaginationIterator, QueryRow, ResultPage, RowBatch,
};

/// A declared server-side scrollable cursor on a dedicated connection.
///
/// The session is owned by exactly one iterator for its whole lifetime.
#[async_trait]
pub trait CursorSession: Send {
    /// Fetches up to `count` rows after the current cursor position.
    async fn fetch_forward(&mut self, count: usize) -> Result<RowBatch, DriverError>;

    /// Moves the cursor to absolute `position` (0 = before the first row),
    /// then fetches up to `count` rows forward.
    async fn fetch_from(&mut self, position: u64, count: usize) -> Result<RowBatch, DriverError>;

    /// Closes the cursor, rolls back its transaction and releases the connection.
    async fn close(&mut self) -> Result<(), DriverError>;
}

#[derive(Debug)]
pub struct ScrollCursorIterator<S: CursorSession> {
    session: Option<S>,
    columns: Arc<[ColumnMetadata]>,
    page_size: usize,
    fetch_timeout: Duration,
    prefetched: Option<Vec<QueryRow>>,
    // Rows consumed from the cursor; equals the cursor's absolute position.
    position: u64,
    // Offset of the first row of the page most recently handed out.
    window_start: Option<u64>,
    exhausted: bool,
    // Set when a fetch failed or was abandoned. The server may have moved the
    // cursor, so the next forward fetch repositions to `position` first.
    resync: bool,
}

impl<S: CursorSession> ScrollCursorIterator<S> {
    /// Fetches the first page during setup so column metadata is known
    /// before the iterator is handed to the caller.
    pub async fn open(
        mut session: S,
        page_size: usize,
        fetch_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self, PaginationError> {
        assert!(page_size > 0, "page size must be greater than 0");
        let first = guarded_fetch(cancel, fetch_timeout, session.fetch_forward(page_size)).await;
        let batch = match first {
            Ok(batch) => batch,
            Err(error) => {
                if let Err(close_error) = session.close().await {
                    warn!(error = %close_error, "failed to release cursor after setup error");
                }
                return Err(error);
            }
        };

        let fetched = batch.rows.len();
        debug!(
            columns = batch.columns.len(),
            first_page_rows = fetched,
            "scroll cursor iterator opened"
        );
        Ok(Self {
            session: Some(session),
            columns: batch.columns.into(),
            page_size,
            fetch_timeout,
            prefetched: Some(batch.rows),
            position: fetched as u64,
            window_start: None,
            exhausted: fetched < page_size,
            resync: false,
        })
    }

    fn page(&self, rows: Vec<QueryRow>, direction: FetchDirection) -> FetchOutcome {
        FetchOutcome::Page(ResultPage {
            columns: Arc::clone(&self.columns),
            rows,
            direction,
        })
    }

    async fn on_fetch_error(&mut self, error: PaginationError) -> PaginationError {
        if error.is_connection_lost() {
            self.close().await;
        } else {
            self.resync = true;
            debug!(position = self.position, %error, "cursor position unknown after failed fetch");
        }
        error
    }
}

#[async_trait]
impl<S: CursorSession> PaginationIterator for ScrollCursorIterator<S> {
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
        if self.session.is_none() {
            return Err(PaginationError::Closed);
        }

        if let Some(rows) = self.prefetched.take() {
            if rows.is_empty() {
                return Ok(FetchOutcome::EndOfData);
            }
            self.window_start = Some(0);
            return Ok(self.page(rows, FetchDirection::Forward));
        }
        if self.exhausted {
            return Ok(FetchOutcome::EndOfData);
        }

        let page_size = self.page_size;
        let timeout = self.fetch_timeout;
        let start = self.position;
        let resync = self.resync;
        let Some(session) = self.session.as_mut() else {
            return Err(PaginationError::Closed);
        };
        let result = if resync {
            guarded_fetch(cancel, timeout, session.fetch_from(start, page_size)).await
        } else {
            guarded_fetch(cancel, timeout, session.fetch_forward(page_size)).await
        };
        let batch = match result {
            Ok(batch) => batch,
            Err(error) => return Err(self.on_fetch_error(error).await),
        };
        self.resync = false;

        let fetched = batch.rows.len();
        self.position += fetched as u64;
        if fetched < page_size {
            self.exhausted = true;
        }
        if fetched == 0 {
            return Ok(FetchOutcome::EndOfData);
        }
        self.window_start = Some(start);
        Ok(self.page(batch.rows, FetchDirection::Forward))
    }

    async fn fetch_prev(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, PaginationError> {
        if self.session.is_none() {
            return Err(PaginationError::Closed);
        }
        let current_start = match self.window_start {
            Some(start) if start > 0 => start,
            _ => return Ok(FetchOutcome::Unsupported),
        };

        let page_size = self.page_size;
        let timeout = self.fetch_timeout;
        let target = current_start.saturating_sub(page_size as u64);
        let Some(session) = self.session.as_mut() else {
            return Err(PaginationError::Closed);
        };
        let result = guarded_fetch(cancel, timeout, session.fetch_from(target, page_size)).await;
        let batch = match result {
            Ok(batch) => batch,
            Err(error) => return Err(self.on_fetch_error(error).await),
        };

        if batch.rows.is_empty() {
            return Ok(FetchOutcome::EndOfData);
        }
        self.resync = false;
        self.position = target + batch.rows.len() as u64;
        self.window_start = Some(target);
        self.exhausted = false;
        Ok(self.page(batch.rows, FetchDirection::Backward))
    }

    fn is_closed(&self) -> bool {
        self.session.is_none()
    }

    async fn close(&mut self) {
        self.prefetched = None;
        let Some(mut session) = self.session.take() else {
            return;
        };
        match session.close().await {
            Ok(()) => debug!(position = self.position, "scroll cursor closed"),
            Err(error) => warn!(%error, "failed to close scroll cursor cleanly"),
        }
    }
}
