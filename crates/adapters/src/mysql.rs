use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Column, OptsBuilder, Pool, Row, SslOpts, Value};
use tidal_core::cancellation::CancellationToken;
use tidal_core::connection_manager::{Connection, Connector};
use tidal_core::offset_replay::{OffsetReplayIterator, ReplayDriver};
use tidal_core::pagination::{
    ColumnMetadata, DriverError, PaginationError, PaginationIterator, QueryRow, RowBatch,
};
use tidal_core::profiles::{ConnectionProfile, TlsMode};
use tidal_core::query_runner::{
    BackendCancel, BufferedResult, ExecutionHandle, ExecutionLimits, PagingStrategy,
    QueryBackend,
};
use tidal_core::schema_cache::{SchemaBackendError, SchemaCatalog};
use tracing::{debug, info};

use crate::credentials::{non_empty, resolve_password};
use crate::schema::{catalog_from_listing, ColumnListing};
use crate::NULL_TEXT;

const ADAPTER_NAME: &str = "mysql";

const SCHEMA_LISTING_SQL: &str = "SELECT TABLE_SCHEMA, TABLE_NAME, COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE \
     FROM information_schema.COLUMNS \
     WHERE TABLE_SCHEMA NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys') \
     ORDER BY TABLE_SCHEMA, TABLE_NAME, ORDINAL_POSITION";

#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlConnector;

#[async_trait]
impl Connector for MysqlConnector {
    async fn connect(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<Arc<dyn Connection>, DriverError> {
        let pool = Pool::new(opts_from_profile(profile));
        info!(target = %profile.display_target(), "mysql pool created");
        Ok(Arc::new(MysqlConnection {
            pool: pool.clone(),
            database: profile.database.clone(),
            backend: Arc::new(MysqlQueryBackend { pool }),
        }))
    }
}

/// A pooled MySQL connection. Every statement checks a connection out of
/// the pool, so concurrent tabs never share a socket.
#[derive(Debug)]
pub struct MysqlConnection {
    pool: Pool,
    database: Option<String>,
    backend: Arc<MysqlQueryBackend>,
}

#[async_trait]
impl Connection for MysqlConnection {
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
        let mut conn = self.pool.get_conn().await.map_err(to_driver_error)?;
        conn.ping().await.map_err(to_driver_error)
    }

    async fn fetch_schema(&self) -> Result<SchemaCatalog, SchemaBackendError> {
        let mut conn = self.pool.get_conn().await.map_err(to_schema_error)?;
        let listing = conn
            .query_map(
                SCHEMA_LISTING_SQL,
                |(database, table, column, data_type, nullable): (
                    String,
                    String,
                    String,
                    String,
                    String,
                )| ColumnListing {
                    database,
                    table,
                    column,
                    data_type,
                    nullable: nullable.eq_ignore_ascii_case("YES"),
                },
            )
            .await
            .map_err(to_schema_error)?;
        Ok(catalog_from_listing(listing))
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        self.pool.clone().disconnect().await.map_err(to_driver_error)
    }
}

#[derive(Debug, Clone)]
pub struct MysqlQueryBackend {
    pool: Pool,
}

#[async_trait]
impl QueryBackend for MysqlQueryBackend {
    fn adapter_name(&self) -> &str {
        ADAPTER_NAME
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
        let driver = MysqlReplayDriver {
            pool: self.pool.clone(),
        };
        let iterator =
            OffsetReplayIterator::open(driver, sql, limits.page_size, limits.fetch_timeout, cancel)
                .await?;
        Ok(Box::new(iterator))
    }

    async fn run_buffered(
        &self,
        sql: &str,
        max_rows: usize,
        handle: &ExecutionHandle,
    ) -> Result<BufferedResult, DriverError> {
        let context = |error: mysql_async::Error| to_driver_error(error).with_context("execute", sql);
        let mut conn = self.pool.get_conn().await.map_err(context)?;
        let kill = Arc::new(MysqlKillQuery {
            pool: self.pool.clone(),
            connection_id: conn.id(),
        });
        handle.register_backend_cancel(Arc::clone(&kill) as Arc<dyn BackendCancel>);

        let mut result = conn.query_iter(sql).await.map_err(context)?;
        let columns = result
            .columns_ref()
            .iter()
            .map(column_metadata)
            .collect::<Vec<_>>();
        if columns.is_empty() {
            let affected = result.affected_rows();
            result.drop_result().await.map_err(context)?;
            return Ok(BufferedResult::affected(affected));
        }

        let mut rows = Vec::new();
        let mut truncated = false;
        while let Some(row) = result.next().await.map_err(context)? {
            if rows.len() == max_rows {
                truncated = true;
                break;
            }
            rows.push(row_to_query_row(row));
        }

        if truncated {
            // Stop the server from producing rows nobody will read.
            if let Err(error) = kill.cancel().await {
                debug!(%error, "could not stop truncated statement");
            }
        }
        if let Err(error) = result.drop_result().await {
            debug!(%error, "discarding remaining result sets failed");
        }
        Ok(BufferedResult::rows(columns, rows, truncated))
    }
}

/// Runs each windowed statement on a connection checked out of the pool.
#[derive(Debug, Clone)]
pub struct MysqlReplayDriver {
    pool: Pool,
}

#[async_trait]
impl ReplayDriver for MysqlReplayDriver {
    async fn query(&self, sql: &str) -> Result<RowBatch, DriverError> {
        let mut conn = self.pool.get_conn().await.map_err(to_driver_error)?;
        let mut result = conn.query_iter(sql).await.map_err(to_driver_error)?;
        let columns = result
            .columns_ref()
            .iter()
            .map(column_metadata)
            .collect::<Vec<_>>();
        let rows = result
            .collect::<Row>()
            .await
            .map_err(to_driver_error)?
            .into_iter()
            .map(row_to_query_row)
            .collect::<Vec<_>>();
        result.drop_result().await.map_err(to_driver_error)?;
        Ok(RowBatch { columns, rows })
    }
}

/// `KILL QUERY` issued from a separate pooled connection.
#[derive(Debug)]
struct MysqlKillQuery {
    pool: Pool,
    connection_id: u32,
}

#[async_trait]
impl BackendCancel for MysqlKillQuery {
    async fn cancel(&self) -> Result<(), DriverError> {
        let mut side = self.pool.get_conn().await.map_err(to_driver_error)?;
        side.query_drop(format!("KILL QUERY {}", self.connection_id))
            .await
            .map_err(to_driver_error)?;
        debug!(connection_id = self.connection_id, "kill query sent");
        Ok(())
    }
}

fn opts_from_profile(profile: &ConnectionProfile) -> OptsBuilder {
    let mut builder = OptsBuilder::default()
        .ip_or_hostname(profile.host.clone())
        .tcp_port(profile.effective_port())
        .user(Some(profile.user.clone()));

    if let Some(password) = resolve_password(profile) {
        builder = builder.pass(Some(password));
    }

    if let Some(database) = &profile.database {
        builder = builder.db_name(Some(database.clone()));
    }

    if profile_requests_tls(profile) {
        let mut ssl_opts = SslOpts::default();
        if let Some(ca_cert_path) = non_empty(profile.tls_ca_cert_path.as_deref()) {
            ssl_opts = ssl_opts.with_root_certs(vec![PathBuf::from(ca_cert_path).into()]);
        }
        builder = builder.ssl_opts(ssl_opts);
    }

    builder
}

fn profile_requests_tls(profile: &ConnectionProfile) -> bool {
    match profile.tls_mode {
        TlsMode::Disabled => false,
        TlsMode::Prefer => non_empty(profile.tls_ca_cert_path.as_deref()).is_some(),
        TlsMode::Require => true,
    }
}

fn column_metadata(column: &Column) -> ColumnMetadata {
    let type_name = format!("{:?}", column.column_type());
    let type_name = type_name
        .strip_prefix("MYSQL_TYPE_")
        .unwrap_or(&type_name)
        .to_string();
    ColumnMetadata::new(column.name_str().into_owned()).with_type(type_name)
}

fn row_to_query_row(row: Row) -> QueryRow {
    let values = row
        .unwrap()
        .into_iter()
        .map(mysql_value_to_string)
        .collect::<Vec<_>>();
    QueryRow::new(values)
}

fn mysql_value_to_string(value: Value) -> String {
    match value {
        Value::NULL => NULL_TEXT.to_string(),
        Value::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Value::Int(value) => value.to_string(),
        Value::UInt(value) => value.to_string(),
        Value::Float(value) => value.to_string(),
        Value::Double(value) => value.to_string(),
        Value::Date(year, month, day, hour, minute, second, micros) => format!(
            "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
        ),
        Value::Time(is_negative, days, hours, minutes, seconds, micros) => {
            let sign = if is_negative { "-" } else { "" };
            format!("{sign}{days:03} {hours:02}:{minutes:02}:{seconds:02}.{micros:06}")
        }
    }
}

fn to_driver_error(error: mysql_async::Error) -> DriverError {
    match error {
        mysql_async::Error::Io(_) => DriverError::connection_lost(error.to_string()),
        other => DriverError::new(other.to_string()),
    }
}

fn to_schema_error(error: mysql_async::Error) -> SchemaBackendError {
    SchemaBackendError::new(error.to_string())
}

#[cfg(test)]
mod tests {
    use mysql_async::Value;
    use tidal_core::profiles::{ConnectionProfile, Engine, TlsMode};

    use super::{mysql_value_to_string, opts_from_profile, profile_requests_tls};

    fn profile() -> ConnectionProfile {
        ConnectionProfile::new("local", Engine::Mysql, "127.0.0.1", "root")
    }

    #[test]
    fn value_conversion_is_human_readable() {
        assert_eq!(mysql_value_to_string(Value::NULL), "NULL");
        assert_eq!(mysql_value_to_string(Value::Bytes(b"hello".to_vec())), "hello");
        assert_eq!(mysql_value_to_string(Value::Int(-8)), "-8");
        assert_eq!(
            mysql_value_to_string(Value::Date(2024, 2, 29, 13, 5, 0, 0)),
            "2024-02-29 13:05:00.000000"
        );
        assert_eq!(
            mysql_value_to_string(Value::Time(true, 1, 2, 3, 4, 5)),
            "-001 02:03:04.000005"
        );
    }

    #[test]
    fn opts_builder_accepts_profile_defaults() {
        let mut profile = profile();
        profile.database = Some("app".to_string());
        let _opts = opts_from_profile(&profile);
    }

    #[test]
    fn tls_follows_profile_mode() {
        let mut profile = profile();
        assert!(!profile_requests_tls(&profile));

        profile.tls_ca_cert_path = Some("/etc/ssl/ca.pem".to_string());
        assert!(profile_requests_tls(&profile));

        profile.tls_mode = TlsMode::Disabled;
        assert!(!profile_requests_tls(&profile));

        profile.tls_mode = TlsMode::Require;
        profile.tls_ca_cert_path = None;
        assert!(profile_requests_tls(&profile));
    }
}
