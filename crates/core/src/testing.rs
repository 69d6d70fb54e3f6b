//! In-memory drivers shared by the unit tests of this crate.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use async_trait::async_trait;

use crate::cancellation::CancellationToken;
use crate::connection_manager::{Connection, Connector};
use crate::offset_replay::{window_sql, OffsetReplayIterator, ReplayDriver};
use crate::pagination::{
    ColumnMetadata, DriverError, FetchOutcome, PaginationError, PaginationIterator, QueryRow,
    RowBatch,
};
use crate::profiles::ConnectionProfile;
use crate::query_runner::{
    is_row_producing, BufferedResult, ExecutionHandle, ExecutionLimits, PagingStrategy,
    QueryBackend,
};
use crate::schema_cache::{DatabaseSchema, SchemaBackendError, SchemaCatalog, TableSchema};
use crate::scroll_cursor::CursorSession;

pub(crate) fn numbered_rows(count: u64) -> Vec<QueryRow> {
    (1..=count)
        .map(|id| QueryRow::new(vec![id.to_string()]))
        .collect()
}

pub(crate) fn id_columns() -> Vec<ColumnMetadata> {
    vec![ColumnMetadata::new("id").with_type("BIGINT")]
}

pub(crate) fn row_ids<'a>(rows: impl IntoIterator<Item = &'a QueryRow>) -> Vec<u64> {
    rows.into_iter()
        .map(|row| row.values[0].parse::<u64>().expect("numeric id"))
        .collect()
}

pub(crate) fn page_ids(outcome: &FetchOutcome) -> Vec<u64> {
    match outcome {
        FetchOutcome::Page(page) => row_ids(&page.rows),
        other => panic!("expected a page, got {other:?}"),
    }
}

#[derive(Debug, Default)]
struct ReplayState {
    executed: Vec<String>,
    fail_next: Option<DriverError>,
    fail_describe: Option<DriverError>,
    delay: Option<Duration>,
}

/// Answers the describe and window statements built by the offset replay iterator.
#[derive(Debug, Clone)]
pub(crate) struct MemoryReplayDriver {
    rows: Arc<Vec<QueryRow>>,
    state: Arc<Mutex<ReplayState>>,
}

impl MemoryReplayDriver {
    pub(crate) fn new(rows: Vec<QueryRow>) -> Self {
        Self {
            rows: Arc::new(rows),
            state: Arc::new(Mutex::new(ReplayState::default())),
        }
    }

    pub(crate) fn failing_describe(self, error: DriverError) -> Self {
        self.state.lock().expect("state lock").fail_describe = Some(error);
        self
    }

    pub(crate) fn fail_next(&self, error: DriverError) {
        self.state.lock().expect("state lock").fail_next = Some(error);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        self.state.lock().expect("state lock").delay = Some(delay);
    }

    pub(crate) fn executed(&self) -> Vec<String> {
        self.state.lock().expect("state lock").executed.clone()
    }
}

fn parse_window(sql: &str) -> (usize, u64) {
    let tokens = sql.split_whitespace().collect::<Vec<_>>();
    let limit_at = tokens
        .iter()
        .rposition(|token| *token == "LIMIT")
        .expect("windowed statement has LIMIT");
    let limit = tokens[limit_at + 1].parse::<usize>().expect("numeric limit");
    let offset = match tokens.get(limit_at + 2) {
        Some(&"OFFSET") => tokens[limit_at + 3].parse::<u64>().expect("numeric offset"),
        _ => 0,
    };
    (limit, offset)
}

#[async_trait]
impl ReplayDriver for MemoryReplayDriver {
    async fn query(&self, sql: &str) -> Result<RowBatch, DriverError> {
        let (delay, failure) = {
            let mut state = self.state.lock().expect("state lock");
            state.executed.push(sql.to_string());
            let failure = if sql.contains("tidal_describe") {
                state.fail_describe.clone()
            } else {
                state.fail_next.take()
            };
            (state.delay, failure)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }

        let (limit, offset) = parse_window(sql);
        let start = usize::try_from(offset).expect("offset fits usize").min(self.rows.len());
        let end = (start + limit).min(self.rows.len());
        Ok(RowBatch {
            columns: id_columns(),
            rows: self.rows[start..end].to_vec(),
        })
    }
}

/// Cursor over a fixed row set. Counts `close` calls.
#[derive(Debug)]
pub(crate) struct MemoryCursorSession {
    rows: Vec<QueryRow>,
    position: usize,
    pub(crate) close_calls: Arc<AtomicUsize>,
    pub(crate) fail_next: Arc<Mutex<Option<DriverError>>>,
    /// The next fetch moves the cursor, then stalls this long before replying.
    pub(crate) stall_next: Arc<Mutex<Option<Duration>>>,
}

impl MemoryCursorSession {
    pub(crate) fn new(rows: Vec<QueryRow>) -> Self {
        Self {
            rows,
            position: 0,
            close_calls: Arc::new(AtomicUsize::new(0)),
            fail_next: Arc::new(Mutex::new(None)),
            stall_next: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn close_count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CursorSession for MemoryCursorSession {
    async fn fetch_forward(&mut self, count: usize) -> Result<RowBatch, DriverError> {
        if let Some(error) = self.fail_next.lock().expect("fail lock").take() {
            return Err(error);
        }
        let start = self.position.min(self.rows.len());
        let end = (start + count).min(self.rows.len());
        self.position = end;
        let stall = self.stall_next.lock().expect("stall lock").take();
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
        Ok(RowBatch {
            columns: id_columns(),
            rows: self.rows[start..end].to_vec(),
        })
    }

    async fn fetch_from(&mut self, position: u64, count: usize) -> Result<RowBatch, DriverError> {
        self.position = usize::try_from(position).expect("position fits usize");
        self.fetch_forward(count).await
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Offset-replay backend over [`MemoryReplayDriver`].
#[derive(Debug)]
pub(crate) struct MemoryQueryBackend {
    pub(crate) driver: MemoryReplayDriver,
    pub(crate) buffered_delay: Mutex<Option<Duration>>,
}

impl MemoryQueryBackend {
    pub(crate) fn new(rows: u64) -> Self {
        Self {
            driver: MemoryReplayDriver::new(numbered_rows(rows)),
            buffered_delay: Mutex::new(None),
        }
    }
}

#[async_trait]
impl QueryBackend for MemoryQueryBackend {
    fn adapter_name(&self) -> &str {
        "memory"
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
        _handle: &ExecutionHandle,
    ) -> Result<BufferedResult, DriverError> {
        let delay = *self.buffered_delay.lock().expect("delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !is_row_producing(sql) {
            return Ok(BufferedResult::affected(1));
        }
        let batch = self.driver.query(&window_sql(sql, max_rows + 1, 0)).await?;
        let truncated = batch.rows.len() > max_rows;
        let rows = batch.rows.into_iter().take(max_rows).collect();
        Ok(BufferedResult::rows(batch.columns, rows, truncated))
    }
}

#[derive(Debug)]
pub(crate) struct MemoryConnection {
    pub(crate) backend: Arc<MemoryQueryBackend>,
    pub(crate) ping_calls: AtomicUsize,
    pub(crate) disconnect_calls: AtomicUsize,
    pub(crate) fail_ping: Mutex<Option<DriverError>>,
}

impl MemoryConnection {
    pub(crate) fn new(rows: u64) -> Self {
        Self {
            backend: Arc::new(MemoryQueryBackend::new(rows)),
            ping_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            fail_ping: Mutex::new(None),
        }
    }
}

pub(crate) fn fixture_schema() -> SchemaCatalog {
    SchemaCatalog {
        databases: vec![DatabaseSchema {
            name: "fixtures".to_string(),
            tables: vec![TableSchema {
                name: "numbers".to_string(),
                columns: Vec::new(),
            }],
        }],
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn adapter_name(&self) -> &str {
        "memory"
    }

    fn database_name(&self) -> Option<&str> {
        Some("fixtures")
    }

    fn query_backend(&self) -> Arc<dyn QueryBackend> {
        Arc::clone(&self.backend) as Arc<dyn QueryBackend>
    }

    async fn ping(&self) -> Result<(), DriverError> {
        self.ping_calls.fetch_add(1, Ordering::SeqCst);
        match self.fail_ping.lock().expect("ping lock").take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn fetch_schema(&self) -> Result<SchemaCatalog, SchemaBackendError> {
        Ok(fixture_schema())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out a fresh [`MemoryConnection`] per connect and remembers each one.
#[derive(Debug, Default)]
pub(crate) struct MemoryConnector {
    rows: u64,
    created: Mutex<Vec<Arc<MemoryConnection>>>,
    fail_next: Mutex<Option<DriverError>>,
    fail_next_ping: Mutex<Option<DriverError>>,
}

impl MemoryConnector {
    pub(crate) fn new(rows: u64) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    pub(crate) fn fail_next(&self, error: DriverError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    pub(crate) fn fail_next_ping(&self, error: DriverError) {
        *self.fail_next_ping.lock().expect("fail lock") = Some(error);
    }

    pub(crate) fn connections(&self) -> Vec<Arc<MemoryConnection>> {
        self.created.lock().expect("created lock").clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        _profile: &ConnectionProfile,
    ) -> Result<Arc<dyn Connection>, DriverError> {
        if let Some(error) = self.fail_next.lock().expect("fail lock").take() {
            return Err(error);
        }
        let connection = MemoryConnection::new(self.rows);
        *connection.fail_ping.lock().expect("ping lock") =
            self.fail_next_ping.lock().expect("fail lock").take();
        let connection = Arc::new(connection);
        self.created
            .lock()
            .expect("created lock")
            .push(Arc::clone(&connection));
        Ok(connection as Arc<dyn Connection>)
    }
}
