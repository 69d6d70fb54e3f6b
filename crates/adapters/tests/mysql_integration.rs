use std::sync::Arc;
use std::time::Duration;

use tidal_adapters::mysql::MysqlConnector;
use tidal_core::connection_manager::{Connection, Connector};
use tidal_core::pagination::{FetchDirection, FetchOutcome};
use tidal_core::profiles::{ConnectionProfile, Engine};
use tidal_core::query_runner::{
    ExecutionHandle, ExecutionLimits, ExecutionOutcome, QueryRunner, QueryRunnerError,
};

fn mysql_integration_enabled() -> bool {
    matches!(
        std::env::var("TIDAL_RUN_MYSQL_INTEGRATION").ok().as_deref(),
        Some("1")
    )
}

fn integration_profile(database: Option<&str>) -> ConnectionProfile {
    let host = std::env::var("TIDAL_TEST_DB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let user = std::env::var("TIDAL_TEST_DB_USER").unwrap_or_else(|_| "root".to_string());
    let port = std::env::var("TIDAL_TEST_DB_PORT")
        .ok()
        .and_then(|raw| raw.parse::<u16>().ok());

    let mut profile = ConnectionProfile::new("adapters-integration", Engine::Mysql, host, user);
    profile.port = port;
    profile.database = database.map(str::to_string);
    profile
}

async fn execute_sql(connection: &Arc<dyn Connection>, sql: &str) {
    connection
        .query_backend()
        .run_buffered(sql, 10, &ExecutionHandle::new())
        .await
        .unwrap_or_else(|error| panic!("`{sql}` should succeed: {error}"));
}

fn page_ids(outcome: FetchOutcome) -> Vec<String> {
    match outcome {
        FetchOutcome::Page(page) => page
            .rows
            .into_iter()
            .map(|row| row.values[0].clone())
            .collect(),
        other => panic!("expected a page, got {other:?}"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn mysql_offset_replay_paging_schema_and_cancel() {
    if !mysql_integration_enabled() {
        return;
    }

    let database = "tidal_adapters_cov";
    let admin = MysqlConnector
        .connect(&integration_profile(None))
        .await
        .expect("admin connect should succeed");
    execute_sql(&admin, &format!("CREATE DATABASE IF NOT EXISTS `{database}`")).await;
    admin.disconnect().await.expect("admin disconnect should succeed");

    let connection = MysqlConnector
        .connect(&integration_profile(Some(database)))
        .await
        .expect("connect should succeed");
    connection.ping().await.expect("ping should succeed");
    assert_eq!(connection.adapter_name(), "mysql");
    assert_eq!(connection.database_name(), Some(database));

    execute_sql(&connection, "DROP TABLE IF EXISTS integration_users").await;
    execute_sql(
        &connection,
        "CREATE TABLE integration_users (\
         id BIGINT NOT NULL PRIMARY KEY,\
         email VARCHAR(64) NOT NULL,\
         age INT NULL\
         )",
    )
    .await;
    execute_sql(
        &connection,
        "INSERT INTO integration_users (id, email, age) VALUES \
         (1, 'a@example.com', 22), (2, 'b@example.com', NULL), (3, 'c@example.com', 41), \
         (4, 'd@example.com', 35), (5, 'e@example.com', 19)",
    )
    .await;

    let schema = connection
        .fetch_schema()
        .await
        .expect("schema fetch should succeed");
    let table = schema
        .table(database, "integration_users")
        .expect("table should be listed");
    assert_eq!(
        table
            .columns
            .iter()
            .map(|column| column.name.as_str())
            .collect::<Vec<_>>(),
        vec!["id", "email", "age"]
    );

    let limits = ExecutionLimits {
        page_size: 2,
        ..ExecutionLimits::default()
    };
    let runner = Arc::new(QueryRunner::with_limits(connection.query_backend(), limits));
    let outcome = runner
        .execute(
            "SELECT id, email, age FROM integration_users ORDER BY id;",
            Arc::new(ExecutionHandle::new()),
        )
        .await
        .expect("select should run");
    let ExecutionOutcome::Streaming(iterator) = outcome else {
        panic!("select should stream");
    };
    assert_eq!(iterator.columns().len(), 3);

    let first = iterator.fetch(FetchDirection::Forward).await.expect("page 1");
    assert_eq!(page_ids(first), vec!["1", "2"]);
    let second = iterator.fetch(FetchDirection::Forward).await.expect("page 2");
    assert_eq!(page_ids(second), vec!["3", "4"]);
    let back = iterator.fetch(FetchDirection::Backward).await.expect("prev page");
    assert_eq!(page_ids(back), vec!["1", "2"]);
    iterator.close().await;
    iterator.close().await;
    assert!(iterator.is_closed().await);

    let outcome = runner
        .execute(
            "UPDATE integration_users SET age = age + 1 WHERE age IS NOT NULL",
            Arc::new(ExecutionHandle::new()),
        )
        .await
        .expect("update should run");
    let ExecutionOutcome::Buffered(result) = outcome else {
        panic!("update should be buffered");
    };
    assert_eq!(result.rows_affected, Some(4));

    let handle = Arc::new(ExecutionHandle::new());
    let task = tokio::spawn({
        let runner = Arc::clone(&runner);
        let handle = Arc::clone(&handle);
        async move { runner.execute("DO SLEEP(30)", handle).await }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.cancel();
    let cancelled = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("cancel should unblock the wait")
        .expect("task should not panic");
    assert!(matches!(cancelled, Err(QueryRunnerError::Cancelled)));

    execute_sql(&connection, "DROP TABLE IF EXISTS integration_users").await;
    connection
        .disconnect()
        .await
        .expect("disconnect should succeed");
}
