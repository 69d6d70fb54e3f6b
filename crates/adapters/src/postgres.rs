use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{pin_mut, StreamExt};
use tidal_core::cancellation::CancellationToken;
use tidal_core::connection_manager::{Connection, Connector};
use tidal_core::offset_replay::trim_statement;
use tidal_core::pagination::{
    guarded_fetch, ColumnMetadata, DriverError, PaginationError, PaginationIterator, QueryRow,
    RowBatch,
};
use tidal_core::profiles::{ConnectionProfile, TlsMode};
use tidal_core::query_runner::{
    is_row_producing, BackendCancel, BufferedResult, ExecutionHandle, ExecutionLimits,
    PagingStrategy, QueryBackend,
};
use tidal_core::schema_cache::{SchemaBackendError, SchemaCatalog};
use tidal_core::scroll_cursor::{CursorSession, ScrollCursorIterator};
use tokio::task::JoinHandle;
use tokio_postgres::config::SslMode;
use tokio_postgres::{CancelToken, Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use tracing::{debug, info, warn};

use crate::credentials::{non_empty, resolve_password};
use crate::schema::{catalog_from_listing, ColumnListing};
use crate::NULL_TEXT;

const ADAPTER_NAME: &str = "postgres";
const APPLICATION_NAME: &str = "tidal";
const CURSOR_NAME: &str = "tidal_cursor";

const SCHEMA_LISTING_SQL: &str = "SELECT table_schema::text, table_name::text, column_name::text, \
     data_type::text, is_nullable::text \
     FROM information_schema.columns \
     WHERE table_schema NOT IN ('pg_catalog', 'information_schema') \
     ORDER BY table_schema, table_name, ordinal_position";

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresConnector;

#[async_trait]
impl Connector for PostgresConnector {
    async fn connect(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<Arc<dyn Connection>, DriverError> {
        let config = config_from_profile(profile)?;
        let (client, task) = open_client(&config).await?;
        info!(target = %profile.display_target(), "postgres connection opened");
        let client = Arc::new(client);
        Ok(Arc::new(PostgresConnection {
            client: Arc::clone(&client),
            task,
            database: profile.database.clone(),
            backend: Arc::new(PostgresQueryBackend { client, config }),
        }))
    }
}

/// The shared session used for schema loading and buffered statements.
/// Cursors never run here; each one gets its own connection.
pub struct PostgresConnection {
    client: Arc<Client>,
    task: JoinHandle<()>,
    database: Option<String>,
    backend: Arc<PostgresQueryBackend>,
}

#[async_trait]
impl Connection for PostgresConnection {
    fn adapter_name(&self) -> &str {
        ADAPTER_NAME
    }

    fn database_name(&self) -> Option<&str> {
        self.database.as_deref()
    }

    fn query_backend(&self) -> Arc<dyn QueryBackend> {
        Arc::clone(&self.backend) as Arc<dyn QueryBackend>
    }

    async fn ping(&self) -> Result<(), DriverError> {
        self.client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(to_driver_error)
    }

    async fn fetch_schema(&self) -> Result<SchemaCatalog, SchemaBackendError> {
        let rows = self
            .client
            .query(SCHEMA_LISTING_SQL, &[])
            .await
            .map_err(|error| SchemaBackendError::new(error.to_string()))?;
        let listing = rows
            .iter()
            .map(|row| ColumnListing {
                database: row.get(0),
                table: row.get(1),
                column: row.get(2),
                data_type: row.get(3),
                nullable: row.get::<_, String>(4).eq_ignore_ascii_case("YES"),
            })
            .collect();
        Ok(catalog_from_listing(listing))
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        self.task.abort();
        Ok(())
    }
}

pub struct PostgresQueryBackend {
    client: Arc<Client>,
    config: Config,
}

#[async_trait]
impl QueryBackend for PostgresQueryBackend {
    fn adapter_name(&self) -> &str {
        ADAPTER_NAME
    }

    fn paging_strategy(&self) -> PagingStrategy {
        PagingStrategy::ScrollCursor
    }

    async fn open_iterator(
        &self,
        sql: &str,
        limits: &ExecutionLimits,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn PaginationIterator>, PaginationError> {
        let session = guarded_fetch(
            cancel,
            limits.fetch_timeout,
            PostgresCursorSession::declare(&self.config, sql),
        )
        .await?;
        let iterator =
            ScrollCursorIterator::open(session, limits.page_size, limits.fetch_timeout, cancel)
                .await?;
        Ok(Box::new(iterator))
    }

    async fn run_buffered(
        &self,
        sql: &str,
        max_rows: usize,
        handle: &ExecutionHandle,
    ) -> Result<BufferedResult, DriverError> {
        let cancel = PostgresCancel {
            token: self.client.cancel_token(),
        };
        handle.register_backend_cancel(Arc::new(PostgresCancel {
            token: self.client.cancel_token(),
        }));
        let context =
            |error: tokio_postgres::Error| to_driver_error(error).with_context("execute", sql);
        let stream = self.client.simple_query_raw(sql).await.map_err(context)?;
        pin_mut!(stream);

        let mut collector = BufferedCollector::new(max_rows);
        while let Some(message) = stream.next().await {
            let message = match message {
                Ok(message) => message,
                // The cancel sent on truncation usually ends the reply with an error.
                Err(error) if collector.truncated => {
                    debug!(%error, "truncated statement ended");
                    break;
                }
                Err(error) => return Err(context(error)),
            };
            match message {
                SimpleQueryMessage::RowDescription(columns) => {
                    collector.describe(columns.iter().map(|column| column.name()));
                }
                SimpleQueryMessage::Row(row) => {
                    if !collector.is_full() {
                        collector.rows.push(simple_row(&row));
                    } else if collector.mark_truncated() {
                        // Stop the server from producing rows nobody will read.
                        if let Err(error) = cancel.cancel().await {
                            debug!(%error, "could not stop truncated statement");
                        }
                    }
                }
                SimpleQueryMessage::CommandComplete(count) => collector.affected = Some(count),
                _ => {}
            }
        }

        Ok(collector.finish(is_row_producing(sql)))
    }
}

/// Holds a simple-protocol reply, keeping at most `max_rows` rows.
#[derive(Debug)]
struct BufferedCollector {
    max_rows: usize,
    columns: Option<Vec<ColumnMetadata>>,
    rows: Vec<QueryRow>,
    truncated: bool,
    affected: Option<u64>,
}

impl BufferedCollector {
    fn new(max_rows: usize) -> Self {
        Self {
            max_rows,
            columns: None,
            rows: Vec::new(),
            truncated: false,
            affected: None,
        }
    }

    /// Only the first result set's header is kept.
    fn describe<'a>(&mut self, names: impl Iterator<Item = &'a str>) {
        if self.columns.is_none() {
            self.columns = Some(names.map(ColumnMetadata::new).collect());
        }
    }

    fn is_full(&self) -> bool {
        self.rows.len() >= self.max_rows
    }

    /// Returns true the first time only.
    fn mark_truncated(&mut self) -> bool {
        !std::mem::replace(&mut self.truncated, true)
    }

    fn finish(self, row_producing: bool) -> BufferedResult {
        match self.columns {
            Some(columns) => BufferedResult::rows(columns, self.rows, self.truncated),
            None if row_producing || !self.rows.is_empty() => {
                BufferedResult::rows(Vec::new(), self.rows, self.truncated)
            }
            None => BufferedResult::affected(self.affected.unwrap_or(0)),
        }
    }
}

/// Out-of-band cancel request sent on a fresh socket.
struct PostgresCancel {
    token: CancelToken,
}

#[async_trait]
impl BackendCancel for PostgresCancel {
    async fn cancel(&self) -> Result<(), DriverError> {
        self.token.cancel_query(NoTls).await.map_err(to_driver_error)
    }
}

/// A scrollable cursor inside a read-only transaction on its own connection.
pub struct PostgresCursorSession {
    client: Client,
    task: JoinHandle<()>,
    columns: Vec<ColumnMetadata>,
    closed: bool,
}

impl PostgresCursorSession {
    /// Opens a dedicated connection and declares the cursor on it. The
    /// connection is released again if any setup step fails.
    pub async fn declare(config: &Config, sql: &str) -> Result<Self, DriverError> {
        let (client, task) = open_client(config).await?;
        let mut session = Self {
            client,
            task,
            columns: Vec::new(),
            closed: false,
        };
        if let Err(error) = session.begin(sql).await {
            if let Err(close_error) = session.close().await {
                debug!(error = %close_error, "cursor release after setup failure");
            }
            return Err(error.with_context("declare cursor", sql));
        }
        Ok(session)
    }

    async fn begin(&mut self, sql: &str) -> Result<(), DriverError> {
        let statement = trim_statement(sql);
        self.client
            .batch_execute("BEGIN READ ONLY")
            .await
            .map_err(to_driver_error)?;
        let prepared = self
            .client
            .prepare(statement)
            .await
            .map_err(to_driver_error)?;
        self.columns = prepared
            .columns()
            .iter()
            .map(|column| ColumnMetadata::new(column.name()).with_type(column.type_().name()))
            .collect();
        self.client
            .batch_execute(&declare_sql(statement))
            .await
            .map_err(to_driver_error)
    }

    async fn fetch_rows(&mut self, sql: &str) -> Result<RowBatch, DriverError> {
        let messages = self
            .client
            .simple_query(sql)
            .await
            .map_err(to_driver_error)?;
        let rows = messages
            .iter()
            .filter_map(|message| match message {
                SimpleQueryMessage::Row(row) => Some(simple_row(row)),
                _ => None,
            })
            .collect();
        Ok(RowBatch {
            columns: self.columns.clone(),
            rows,
        })
    }
}

#[async_trait]
impl CursorSession for PostgresCursorSession {
    async fn fetch_forward(&mut self, count: usize) -> Result<RowBatch, DriverError> {
        self.fetch_rows(&fetch_forward_sql(count)).await
    }

    async fn fetch_from(&mut self, position: u64, count: usize) -> Result<RowBatch, DriverError> {
        self.client
            .batch_execute(&move_absolute_sql(position))
            .await
            .map_err(to_driver_error)?;
        self.fetch_rows(&fetch_forward_sql(count)).await
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // CLOSE fails inside an aborted transaction; ROLLBACK still ends it.
        if let Err(error) = self.client.batch_execute(&format!("CLOSE {CURSOR_NAME}")).await {
            debug!(%error, "cursor close skipped");
        }
        let rollback = self
            .client
            .batch_execute("ROLLBACK")
            .await
            .map_err(to_driver_error);
        self.task.abort();
        rollback
    }
}

async fn open_client(config: &Config) -> Result<(Client, JoinHandle<()>), DriverError> {
    let (client, connection) = config.connect(NoTls).await.map_err(to_driver_error)?;
    let task = tokio::spawn(async move {
        if let Err(error) = connection.await {
            warn!(%error, "postgres connection closed with error");
        }
    });
    Ok((client, task))
}

fn config_from_profile(profile: &ConnectionProfile) -> Result<Config, DriverError> {
    if matches!(profile.tls_mode, TlsMode::Require) {
        return Err(DriverError::new(
            "postgres profiles do not support tls_mode = \"require\"",
        ));
    }

    let mut config = Config::new();
    config
        .host(&profile.host)
        .port(profile.effective_port())
        .user(&profile.user)
        .application_name(APPLICATION_NAME)
        .ssl_mode(SslMode::Disable);
    if let Some(database) = non_empty(profile.database.as_deref()) {
        config.dbname(database);
    }
    if let Some(password) = resolve_password(profile) {
        config.password(password);
    }
    Ok(config)
}

fn declare_sql(statement: &str) -> String {
    format!("DECLARE {CURSOR_NAME} SCROLL CURSOR FOR {statement}")
}

fn fetch_forward_sql(count: usize) -> String {
    format!("FETCH FORWARD {count} FROM {CURSOR_NAME}")
}

fn move_absolute_sql(position: u64) -> String {
    format!("MOVE ABSOLUTE {position} IN {CURSOR_NAME}")
}

fn simple_row(row: &SimpleQueryRow) -> QueryRow {
    let values = (0..row.len())
        .map(|index| row.get(index).unwrap_or(NULL_TEXT).to_string())
        .collect();
    QueryRow::new(values)
}

fn to_driver_error(error: tokio_postgres::Error) -> DriverError {
    let message = match error.as_db_error() {
        Some(db_error) => format!("{}: {}", db_error.code().code(), db_error.message()),
        None => error.to_string(),
    };
    if error.is_closed() {
        DriverError::connection_lost(message)
    } else {
        DriverError::new(message)
    }
}
