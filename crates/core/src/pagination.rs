use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::cancellation::CancellationToken;

pub const DEFAULT_PAGE_SIZE: usize = 1_000;
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Returned by [`PaginationIterator::total_row_count`] while the total is unknown.
pub const UNKNOWN_ROW_COUNT: i64 = -1;

const CONTEXT_SQL_EXCERPT_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub type_name: Option<String>,
}

impl ColumnMetadata {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: None,
        }
    }

    #[must_use]
    pub fn with_type(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRow {
    pub values: Vec<String>,
}

impl QueryRow {
    #[must_use]
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }
}

/// Rows and column metadata as returned by a single driver call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowBatch {
    pub columns: Vec<ColumnMetadata>,
    pub rows: Vec<QueryRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDirection {
    Forward,
    Backward,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPage {
    pub columns: Arc<[ColumnMetadata]>,
    pub rows: Vec<QueryRow>,
    pub direction: FetchDirection,
}

impl ResultPage {
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Page(ResultPage),
    EndOfData,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DriverError {
    message: String,
    connection_lost: bool,
}

impl DriverError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            connection_lost: false,
        }
    }

    #[must_use]
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            connection_lost: true,
        }
    }

    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        self.connection_lost
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Prefixes the message with the failed operation and an excerpt of the statement.
    #[must_use]
    pub fn with_context(self, operation: &str, sql: &str) -> Self {
        let excerpt = sql_excerpt(sql);
        Self {
            message: format!("{operation} `{excerpt}`: {}", self.message),
            connection_lost: self.connection_lost,
        }
    }
}

fn sql_excerpt(sql: &str) -> String {
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= CONTEXT_SQL_EXCERPT_CHARS {
        return collapsed;
    }
    let mut excerpt = collapsed
        .chars()
        .take(CONTEXT_SQL_EXCERPT_CHARS)
        .collect::<String>();
    excerpt.push_str("...");
    excerpt
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PaginationError {
    #[error("fetch cancelled")]
    Cancelled,
    #[error("fetch timed out after {0:?}")]
    TimedOut(Duration),
    #[error("result iterator is closed")]
    Closed,
    #[error("{0}")]
    Driver(#[from] DriverError),
}

impl PaginationError {
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Driver(error) if error.is_connection_lost())
    }
}

/// Runs one driver call bounded by `timeout` and interruptible through `cancel`.
///
/// A timed-out call is reported as an error and never retried.
pub async fn guarded_fetch<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    fetch: F,
) -> Result<T, PaginationError>
where
    F: Future<Output = Result<T, DriverError>>,
{
    if cancel.is_cancelled() {
        return Err(PaginationError::Cancelled);
    }

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(PaginationError::Cancelled),
        result = tokio::time::timeout(timeout, fetch) => match result {
            Ok(fetched) => fetched.map_err(PaginationError::Driver),
            Err(_) => Err(PaginationError::TimedOut(timeout)),
        },
    }
}

/// Page-at-a-time access to the result of one row-producing statement.
#[async_trait]
pub trait PaginationIterator: Send {
    /// Column metadata, stable once the first fetch has completed.
    fn columns(&self) -> &[ColumnMetadata];

    fn page_size(&self) -> usize;

    async fn fetch_next(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, PaginationError>;

    async fn fetch_prev(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, PaginationError>;

    fn total_row_count(&self) -> i64 {
        UNKNOWN_ROW_COUNT
    }

    fn is_closed(&self) -> bool;

    /// Releases the underlying cursor/connection. Safe to call repeatedly.
    async fn close(&mut self);
}

type InFlightSlot = Arc<Mutex<Option<CancellationToken>>>;

/// A [`PaginationIterator`] shared between the session loop and fetch tasks.
///
/// Fetches are serialized through an async lock. `cancel_fetch` and `close`
/// interrupt a fetch that is currently waiting on the backend.
#[derive(Clone)]
pub struct SharedIterator {
    columns: Arc<[ColumnMetadata]>,
    page_size: usize,
    inner: Arc<AsyncMutex<Box<dyn PaginationIterator>>>,
    in_flight: InFlightSlot,
}

impl SharedIterator {
    #[must_use]
    pub fn new(iterator: Box<dyn PaginationIterator>) -> Self {
        Self {
            columns: iterator.columns().to_vec().into(),
            page_size: iterator.page_size(),
            inner: Arc::new(AsyncMutex::new(iterator)),
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether both handles refer to the same underlying iterator.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub async fn fetch(&self, direction: FetchDirection) -> Result<FetchOutcome, PaginationError> {
        let token = CancellationToken::new();
        let _in_flight = InFlightGuard::install(&self.in_flight, token.clone());

        let mut iterator = tokio::select! {
            biased;
            () = token.cancelled() => return Err(PaginationError::Cancelled),
            iterator = self.inner.lock() => iterator,
        };

        match direction {
            FetchDirection::Forward => iterator.fetch_next(&token).await,
            FetchDirection::Backward => iterator.fetch_prev(&token).await,
        }
    }

    pub fn cancel_fetch(&self) {
        let slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(token) = slot.as_ref() {
            token.cancel();
        }
    }

    pub async fn close(&self) {
        self.cancel_fetch();
        self.inner.lock().await.close().await;
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.is_closed()
    }
}

impl fmt::Debug for SharedIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedIterator")
            .field("columns", &self.columns)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

struct InFlightGuard {
    slot: InFlightSlot,
}

impl InFlightGuard {
    fn install(slot: &InFlightSlot, token: CancellationToken) -> Self {
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
        Self {
            slot: Arc::clone(slot),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
