use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::cancellation::CancellationToken;
use crate::pagination::{
    ColumnMetadata, DriverError, PaginationError, PaginationIterator, QueryRow, SharedIterator,
    DEFAULT_FETCH_TIMEOUT, DEFAULT_PAGE_SIZE,
};

/// First keywords of statements that are expected to return a result set.
pub const ROW_PRODUCING_KEYWORDS: [&str; 9] = [
    "SELECT", "WITH", "VALUES", "TABLE", "SHOW", "EXPLAIN", "DESCRIBE", "DESC", "PRAGMA",
];

pub const MAX_BUFFERED_ROWS: usize = 5_000;
pub const BUFFERED_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Strips leading whitespace, `--` line comments and `/* */` block comments.
#[must_use]
pub fn strip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(comment) = rest.strip_prefix("--") {
            rest = match comment.find('\n') {
                Some(end) => comment[end + 1..].trim_start(),
                None => "",
            };
        } else if let Some(comment) = rest.strip_prefix("/*") {
            rest = match comment.find("*/") {
                Some(end) => comment[end + 2..].trim_start(),
                None => "",
            };
        } else {
            return rest;
        }
    }
}

#[must_use]
pub fn is_row_producing(sql: &str) -> bool {
    let statement = strip_leading_comments(sql);
    let keyword = statement
        .split(|ch: char| !ch.is_ascii_alphabetic())
        .next()
        .unwrap_or_default();
    ROW_PRODUCING_KEYWORDS
        .iter()
        .any(|candidate| keyword.eq_ignore_ascii_case(candidate))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub page_size: usize,
    pub max_buffered_rows: usize,
    pub buffered_timeout: Duration,
    pub fetch_timeout: Duration,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_buffered_rows: MAX_BUFFERED_ROWS,
            buffered_timeout: BUFFERED_TIMEOUT,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

/// How an engine pages through a streamed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingStrategy {
    ScrollCursor,
    OffsetReplay,
}

impl PagingStrategy {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::ScrollCursor => "scroll cursor",
            Self::OffsetReplay => "offset replay",
        }
    }
}

/// A fully materialized statement result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferedResult {
    pub columns: Vec<ColumnMetadata>,
    pub rows: Vec<QueryRow>,
    /// Set for statements that report affected rows instead of a result set.
    pub rows_affected: Option<u64>,
    /// More rows were available than the buffered cap allowed.
    pub truncated: bool,
    pub elapsed: Duration,
}

impl BufferedResult {
    #[must_use]
    pub fn rows(columns: Vec<ColumnMetadata>, rows: Vec<QueryRow>, truncated: bool) -> Self {
        Self {
            columns,
            rows,
            truncated,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected: Some(rows_affected),
            ..Self::default()
        }
    }
}

/// Engine-native cancellation issued outside the connection running the statement.
#[async_trait]
pub trait BackendCancel: Send + Sync {
    async fn cancel(&self) -> Result<(), DriverError>;
}

struct RegisteredCancel {
    canceller: Arc<dyn BackendCancel>,
    runtime: Handle,
}

/// Cancellation handle for one execution.
///
/// Backends register an out-of-band canceller while their statement runs.
/// `cancel` always unblocks the local wait; the backend cancel is best effort.
#[derive(Default)]
pub struct ExecutionHandle {
    token: CancellationToken,
    backend_cancel: Mutex<Option<RegisteredCancel>>,
}

impl ExecutionHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Registers the canceller for the statement currently running.
    ///
    /// Must be called from within a tokio runtime; the canceller is later
    /// spawned on that runtime. If the handle is already cancelled the
    /// canceller fires immediately.
    pub fn register_backend_cancel(&self, canceller: Arc<dyn BackendCancel>) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("no runtime available; backend cancel not registered");
            return;
        };
        *self.lock_cancel() = Some(RegisteredCancel { canceller, runtime });
        if self.is_cancelled() {
            self.fire_backend_cancel();
        }
    }

    pub fn clear_backend_cancel(&self) {
        self.lock_cancel().take();
    }

    pub fn cancel(&self) {
        self.token.cancel();
        self.fire_backend_cancel();
    }

    fn fire_backend_cancel(&self) {
        let Some(registered) = self.lock_cancel().take() else {
            return;
        };
        let RegisteredCancel { canceller, runtime } = registered;
        runtime.spawn(async move {
            match canceller.cancel().await {
                Ok(()) => debug!("backend cancel delivered"),
                Err(error) => warn!(%error, "backend cancel failed"),
            }
        });
    }

    fn lock_cancel(&self) -> std::sync::MutexGuard<'_, Option<RegisteredCancel>> {
        self.backend_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("cancelled", &self.is_cancelled())
            .field("backend_cancel", &self.lock_cancel().is_some())
            .finish()
    }
}

#[async_trait]
pub trait QueryBackend: Send + Sync {
    fn adapter_name(&self) -> &str;

    fn paging_strategy(&self) -> PagingStrategy;

    /// Opens a pagination iterator for a row-producing statement.
    async fn open_iterator(
        &self,
        sql: &str,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn PaginationIterator>, PaginationError>;

    /// Runs `sql` to completion, keeping at most `max_rows` rows.
    async fn run_buffered(
        &self,
        sql: &str,
        max_rows: usize,
        handle: &ExecutionHandle,
    ) -> Result<BufferedResult, DriverError>;
}

#[derive(Debug)]
pub enum ExecutionOutcome {
    Streaming(SharedIterator),
    Buffered(BufferedResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Cancelled,
    TimedOut,
    Failed,
}

impl ErrorKind {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed out",
            Self::Failed => "failed",
        }
    }
}

impl From<&PaginationError> for ErrorKind {
    fn from(error: &PaginationError) -> Self {
        match error {
            PaginationError::Cancelled => Self::Cancelled,
            PaginationError::TimedOut(_) => Self::TimedOut,
            PaginationError::Closed | PaginationError::Driver(_) => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryRunnerError {
    #[error("query cancelled")]
    Cancelled,
    #[error("query timed out after {0:?}")]
    TimedOut(Duration),
    #[error("query failed: {0}")]
    Backend(#[source] DriverError),
}

impl QueryRunnerError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled => ErrorKind::Cancelled,
            Self::TimedOut(_) => ErrorKind::TimedOut,
            Self::Backend(_) => ErrorKind::Failed,
        }
    }
}

type ActiveExecutions = Mutex<Vec<Arc<ExecutionHandle>>>;

/// Single entry point for running a statement against one backend.
pub struct QueryRunner {
    backend: Arc<dyn QueryBackend>,
    limits: ExecutionLimits,
    active: ActiveExecutions,
}

impl QueryRunner {
    #[must_use]
    pub fn new(backend: Arc<dyn QueryBackend>) -> Self {
        Self::with_limits(backend, ExecutionLimits::default())
    }

    #[must_use]
    pub fn with_limits(backend: Arc<dyn QueryBackend>, limits: ExecutionLimits) -> Self {
        Self {
            backend,
            limits,
            active: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    #[must_use]
    pub fn adapter_name(&self) -> &str {
        self.backend.adapter_name()
    }

    #[must_use]
    pub fn paging_strategy(&self) -> PagingStrategy {
        self.backend.paging_strategy()
    }

    #[must_use]
    pub fn active_executions(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Cancels every execution currently in progress.
    pub fn cancel_all(&self) {
        let active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handle in active {
            handle.cancel();
        }
    }

    /// Opens a fresh iterator with this runner's limits, bypassing the
    /// buffered fallback. Used by consumers that must stream every row.
    pub async fn open_iterator(
        &self,
        sql: &str,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn PaginationIterator>, PaginationError> {
        self.backend.open_iterator(sql, &self.limits, cancel).await
    }

    pub async fn execute(
        &self,
        sql: &str,
        handle: Arc<ExecutionHandle>,
    ) -> Result<ExecutionOutcome, QueryRunnerError> {
        let started_at = Instant::now();
        let _active = ActiveExecution::track(&self.active, &handle);
        if handle.is_cancelled() {
            return Err(QueryRunnerError::Cancelled);
        }

        if is_row_producing(sql) {
            match self
                .backend
                .open_iterator(sql, &self.limits, handle.token())
                .await
            {
                Ok(iterator) => {
                    let iterator = SharedIterator::new(iterator);
                    if handle.is_cancelled() {
                        iterator.close().await;
                        return Err(QueryRunnerError::Cancelled);
                    }
                    info!(
                        adapter = self.backend.adapter_name(),
                        strategy = self.backend.paging_strategy().label(),
                        columns = iterator.columns().len(),
                        "streaming result opened"
                    );
                    return Ok(ExecutionOutcome::Streaming(iterator));
                }
                Err(PaginationError::Cancelled) => return Err(QueryRunnerError::Cancelled),
                Err(error) => {
                    warn!(%error, "streaming setup failed, falling back to buffered execution");
                }
            }
        }

        self.execute_buffered(sql, &handle, started_at).await
    }

    async fn execute_buffered(
        &self,
        sql: &str,
        handle: &ExecutionHandle,
        started_at: Instant,
    ) -> Result<ExecutionOutcome, QueryRunnerError> {
        let timeout = self.limits.buffered_timeout;
        let run = self
            .backend
            .run_buffered(sql, self.limits.max_buffered_rows, handle);

        let result = tokio::select! {
            biased;
            () = handle.token().cancelled() => Err(QueryRunnerError::Cancelled),
            result = tokio::time::timeout(timeout, run) => match result {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(_)) if handle.is_cancelled() => Err(QueryRunnerError::Cancelled),
                Ok(Err(error)) => Err(QueryRunnerError::Backend(error)),
                Err(_) => {
                    handle.cancel();
                    Err(QueryRunnerError::TimedOut(timeout))
                }
            },
        };

        let mut result = result?;
        result.elapsed = started_at.elapsed();
        info!(
            adapter = self.backend.adapter_name(),
            rows = result.rows.len(),
            rows_affected = result.rows_affected,
            truncated = result.truncated,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "buffered execution finished"
        );
        Ok(ExecutionOutcome::Buffered(result))
    }
}

impl fmt::Debug for QueryRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRunner")
            .field("adapter", &self.backend.adapter_name())
            .field("limits", &self.limits)
            .field("active", &self.active_executions())
            .finish()
    }
}

struct ActiveExecution<'a> {
    registry: &'a ActiveExecutions,
    handle: Arc<ExecutionHandle>,
}

impl<'a> ActiveExecution<'a> {
    fn track(registry: &'a ActiveExecutions, handle: &Arc<ExecutionHandle>) -> Self {
        registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(handle));
        Self {
            registry,
            handle: Arc::clone(handle),
        }
    }
}

impl Drop for ActiveExecution<'_> {
    fn drop(&mut self) {
        self.handle.clear_backend_cancel();
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|active| !Arc::ptr_eq(active, &self.handle));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{
        is_row_producing, strip_leading_comments, BackendCancel, BufferedResult, ErrorKind,
        ExecutionHandle, ExecutionLimits, ExecutionOutcome, PagingStrategy, QueryBackend,
        QueryRunner, QueryRunnerError,
    };
    use crate::cancellation::CancellationToken;
    use crate::offset_replay::OffsetReplayIterator;
    use crate::pagination::{
        DriverError, FetchDirection, PaginationError, PaginationIterator, QueryRow,
    };
    use crate::testing::{id_columns, numbered_rows, page_ids, MemoryReplayDriver};

    #[derive(Debug, Default)]
    struct CountingCancel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BackendCancel for CountingCancel {
        async fn cancel(&self) -> Result<(), DriverError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DriverError::new("kill connection refused"))
        }
    }

    #[derive(Debug)]
    struct FakeBackend {
        driver: MemoryReplayDriver,
        setup_error: Option<PaginationError>,
        buffered_error: Option<DriverError>,
        buffered_delay: Option<Duration>,
        buffered_calls: AtomicUsize,
        canceller: Arc<CountingCancel>,
    }

    impl FakeBackend {
        fn new(rows: u64) -> Self {
            Self {
                driver: MemoryReplayDriver::new(numbered_rows(rows)),
                setup_error: None,
                buffered_error: None,
                buffered_delay: None,
                buffered_calls: AtomicUsize::new(0),
                canceller: Arc::new(CountingCancel::default()),
            }
        }
    }

    #[async_trait]
    impl QueryBackend for FakeBackend {
        fn adapter_name(&self) -> &str {
            "fake"
        }

        fn paging_strategy(&self) -> PagingStrategy {
            PagingStrategy::OffsetReplay
        }

        async fn open_iterator(
            &self,
            sql: &str,
            limits: &ExecutionLimits,
            cancel: &CancellationToken,
        ) -> Result<Box<dyn PaginationIterator>, PaginationError> {
            if let Some(error) = self.setup_error.clone() {
                return Err(error);
            }
            let iterator = OffsetReplayIterator::open(
                self.driver.clone(),
                sql,
                limits.page_size,
                limits.fetch_timeout,
                cancel,
            )
            .await?;
            Ok(Box::new(iterator))
        }

        async fn run_buffered(
            &self,
            sql: &str,
            max_rows: usize,
            handle: &ExecutionHandle,
        ) -> Result<BufferedResult, DriverError> {
            self.buffered_calls.fetch_add(1, Ordering::SeqCst);
            handle.register_backend_cancel(Arc::clone(&self.canceller) as Arc<dyn BackendCancel>);
            if let Some(delay) = self.buffered_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(error) = self.buffered_error.clone() {
                return Err(error);
            }
            if !is_row_producing(sql) {
                return Ok(BufferedResult::affected(1));
            }
            let rows = numbered_rows(max_rows as u64 + 1);
            let truncated = rows.len() > max_rows;
            let rows = rows.into_iter().take(max_rows).collect::<Vec<QueryRow>>();
            Ok(BufferedResult::rows(id_columns(), rows, truncated))
        }
    }

    fn limits() -> ExecutionLimits {
        ExecutionLimits {
            page_size: 10,
            max_buffered_rows: 5,
            buffered_timeout: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(1),
        }
    }

    async fn wait_for_calls(counter: &AtomicUsize) -> usize {
        for _ in 0..100 {
            let calls = counter.load(Ordering::SeqCst);
            if calls > 0 {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        counter.load(Ordering::SeqCst)
    }

    #[test]
    fn classifies_row_producing_statements() {
        assert!(is_row_producing("-- c\nSELECT 1"));
        assert!(!is_row_producing("INSERT INTO t VALUES (1)"));
        assert!(!is_row_producing(""));
        assert!(is_row_producing("/* hint */ with x as (select 1) select * from x"));
        assert!(is_row_producing("desc users"));
        assert!(is_row_producing("  pragma table_info(t)"));
        assert!(!is_row_producing("SELECTED"));
        assert!(!is_row_producing("-- only a comment"));
    }

    #[test]
    fn strips_nested_sequences_of_comments() {
        assert_eq!(
            strip_leading_comments("  -- one\n/* two */\n  -- three\nSHOW TABLES"),
            "SHOW TABLES"
        );
        assert_eq!(strip_leading_comments("/* unterminated"), "");
    }

    #[tokio::test]
    async fn row_producing_statement_streams_through_an_iterator() {
        let runner = QueryRunner::with_limits(Arc::new(FakeBackend::new(25)), limits());
        let outcome = runner
            .execute("SELECT id FROM t", Arc::new(ExecutionHandle::new()))
            .await
            .expect("execution should succeed");

        let ExecutionOutcome::Streaming(iterator) = outcome else {
            panic!("expected streaming outcome");
        };
        assert_eq!(iterator.page_size(), 10);
        let page = iterator
            .fetch(FetchDirection::Forward)
            .await
            .expect("first page");
        assert_eq!(page_ids(&page), (1..=10).collect::<Vec<_>>());
        assert_eq!(runner.active_executions(), 0);
    }

    #[tokio::test]
    async fn setup_failure_falls_back_to_buffered_execution() {
        let mut backend = FakeBackend::new(25);
        backend.setup_error = Some(PaginationError::Driver(DriverError::new(
            "cannot declare cursor",
        )));
        let backend = Arc::new(backend);
        let runner = QueryRunner::with_limits(Arc::clone(&backend) as Arc<dyn QueryBackend>, limits());

        let outcome = runner
            .execute("SELECT id FROM t", Arc::new(ExecutionHandle::new()))
            .await
            .expect("fallback should succeed");

        let ExecutionOutcome::Buffered(result) = outcome else {
            panic!("expected buffered outcome");
        };
        assert_eq!(result.rows.len(), 5);
        assert!(result.truncated);
        assert_eq!(backend.buffered_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fallback_surfaces_backend_error() {
        let mut backend = FakeBackend::new(1);
        backend.setup_error = Some(PaginationError::Driver(DriverError::new("no cursor")));
        backend.buffered_error = Some(DriverError::new("syntax error near FROM"));
        let runner = QueryRunner::with_limits(Arc::new(backend), limits());

        let error = runner
            .execute("SELECT FROM", Arc::new(ExecutionHandle::new()))
            .await
            .expect_err("execution should fail");

        assert_eq!(error.kind(), ErrorKind::Failed);
        assert!(error.to_string().contains("syntax error"));
    }

    #[tokio::test]
    async fn cancelled_setup_does_not_fall_back() {
        let mut backend = FakeBackend::new(1);
        backend.setup_error = Some(PaginationError::Cancelled);
        let backend = Arc::new(backend);
        let runner = QueryRunner::with_limits(Arc::clone(&backend) as Arc<dyn QueryBackend>, limits());

        let error = runner
            .execute("SELECT 1", Arc::new(ExecutionHandle::new()))
            .await
            .expect_err("execution should be cancelled");

        assert_eq!(error, QueryRunnerError::Cancelled);
        assert_eq!(backend.buffered_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn statements_without_rows_report_affected_count() {
        let runner = QueryRunner::with_limits(Arc::new(FakeBackend::new(0)), limits());
        let outcome = runner
            .execute("UPDATE t SET a = 1", Arc::new(ExecutionHandle::new()))
            .await
            .expect("update should succeed");

        let ExecutionOutcome::Buffered(result) = outcome else {
            panic!("expected buffered outcome");
        };
        assert_eq!(result.rows_affected, Some(1));
        assert!(result.rows.is_empty());
    }

    #[tokio::test]
    async fn cancel_interrupts_buffered_wait_and_fires_backend_cancel() {
        let mut backend = FakeBackend::new(0);
        backend.buffered_delay = Some(Duration::from_secs(30));
        let canceller = Arc::clone(&backend.canceller);
        let runner = Arc::new(QueryRunner::with_limits(Arc::new(backend), limits()));
        let handle = Arc::new(ExecutionHandle::new());

        let task = {
            let runner = Arc::clone(&runner);
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { runner.execute("DELETE FROM t", handle).await })
        };
        while runner.active_executions() == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("execution should stop promptly")
            .expect("task should not panic");
        assert_eq!(result.expect_err("cancelled"), QueryRunnerError::Cancelled);
        assert_eq!(wait_for_calls(&canceller.calls).await, 1);
        assert_eq!(runner.active_executions(), 0);
    }

    #[tokio::test]
    async fn buffered_timeout_cancels_backend_and_reports_timeout() {
        let mut backend = FakeBackend::new(0);
        backend.buffered_delay = Some(Duration::from_secs(30));
        let canceller = Arc::clone(&backend.canceller);
        let mut limits = limits();
        limits.buffered_timeout = Duration::from_millis(20);
        let runner = QueryRunner::with_limits(Arc::new(backend), limits);

        let error = runner
            .execute("DELETE FROM t", Arc::new(ExecutionHandle::new()))
            .await
            .expect_err("execution should time out");

        assert_eq!(error, QueryRunnerError::TimedOut(Duration::from_millis(20)));
        assert_eq!(error.kind(), ErrorKind::TimedOut);
        assert_eq!(wait_for_calls(&canceller.calls).await, 1);
    }

    #[tokio::test]
    async fn cancel_all_reaches_every_active_execution() {
        let mut backend = FakeBackend::new(0);
        backend.buffered_delay = Some(Duration::from_secs(30));
        let runner = Arc::new(QueryRunner::with_limits(Arc::new(backend), limits()));

        let tasks = (0..3)
            .map(|_| {
                let runner = Arc::clone(&runner);
                tokio::spawn(async move {
                    runner
                        .execute("DELETE FROM t", Arc::new(ExecutionHandle::new()))
                        .await
                })
            })
            .collect::<Vec<_>>();
        while runner.active_executions() < 3 {
            tokio::task::yield_now().await;
        }

        runner.cancel_all();
        for task in tasks {
            let result = task.await.expect("task should not panic");
            assert_eq!(result.expect_err("cancelled").kind(), ErrorKind::Cancelled);
        }
        assert_eq!(runner.active_executions(), 0);
    }

    #[tokio::test]
    async fn already_cancelled_handle_never_reaches_backend() {
        let backend = Arc::new(FakeBackend::new(3));
        let runner = QueryRunner::with_limits(Arc::clone(&backend) as Arc<dyn QueryBackend>, limits());
        let handle = Arc::new(ExecutionHandle::new());
        handle.cancel();

        let error = runner
            .execute("UPDATE t SET a = 1", handle)
            .await
            .expect_err("execution should be cancelled");

        assert_eq!(error, QueryRunnerError::Cancelled);
        assert_eq!(backend.buffered_calls.load(Ordering::SeqCst), 0);
    }
}
