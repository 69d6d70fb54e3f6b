use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tidal_adapters::EngineConnector;
use tidal_core::connection_manager::{establish, Connection};
use tidal_core::pagination::{FetchDirection, FetchOutcome, QueryRow, SharedIterator};
use tidal_core::profiles::{ConnectionProfile, Engine};
use tidal_core::query_runner::{ExecutionHandle, ExecutionLimits, ExecutionOutcome, QueryRunner};
use tidal_core::results_buffer::{DisplayBuffer, DISPLAY_BUFFER_CAPACITY};

const SEED_BATCH: u64 = 1_000;

/// Measures how fast a statement pages through the display buffer.
#[derive(Debug, Clone, Parser)]
#[command(name = "benchmark")]
struct BenchmarkConfig {
    /// Profile name reported in connection logs.
    #[arg(long, default_value = "bench-local")]
    profile_name: String,

    /// Database engine, `mysql` or `postgres`.
    #[arg(long, default_value = "mysql", value_parser = parse_engine)]
    engine: Engine,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port, defaults to the engine's standard port.
    #[arg(long)]
    port: Option<u16>,

    #[arg(long, default_value = "root")]
    user: String,

    #[arg(long, default_value = "tidal_bench")]
    database: String,

    #[arg(
        long,
        default_value = "SELECT id, user_id, category, payload, created_at FROM events ORDER BY id"
    )]
    sql: String,

    #[arg(long, default_value_t = tidal_core::pagination::DEFAULT_PAGE_SIZE)]
    page_size: usize,

    /// Stop after this many pages; 0 pages through the whole result.
    #[arg(long, default_value_t = 0)]
    max_pages: u64,

    /// Seed the `events` table up to this many rows first.
    #[arg(long, default_value_t = 0)]
    seed_rows: u64,

    /// Fail if the first page takes longer than this.
    #[arg(long)]
    assert_first_page_ms: Option<f64>,

    /// Fail if throughput drops below this.
    #[arg(long)]
    assert_min_rows_per_sec: Option<f64>,
}

#[derive(Debug, Clone)]
struct PagingMetrics {
    rows_fetched: u64,
    pages: u64,
    rows_evicted: u64,
    buffered_rows: usize,
    first_page: Option<Duration>,
    elapsed: Duration,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = BenchmarkConfig::parse();
    let profile = benchmark_profile(&config);

    let (connection, connect_latency) = establish(&EngineConnector::default(), &profile)
        .await
        .map_err(io_other)?;

    if config.seed_rows > 0 {
        ensure_seed_data(&connection, config.engine, config.seed_rows).await?;
    }

    let limits = ExecutionLimits {
        page_size: config.page_size,
        ..ExecutionLimits::default()
    };
    let runner = QueryRunner::with_limits(connection.query_backend(), limits);
    let outcome = runner
        .execute(&config.sql, Arc::new(ExecutionHandle::new()))
        .await
        .map_err(io_other)?;
    let ExecutionOutcome::Streaming(iterator) = outcome else {
        return Err(io_other("benchmark statement did not produce a paged result").into());
    };

    let metrics = run_paging_benchmark(&iterator, config.max_pages).await;
    iterator.close().await;
    let metrics = metrics?;

    let rows_per_sec = if metrics.elapsed.as_secs_f64() > 0.0 {
        metrics.rows_fetched as f64 / metrics.elapsed.as_secs_f64()
    } else {
        0.0
    };
    let first_page_ms = metrics
        .first_page
        .map_or(0.0, |duration| duration.as_secs_f64() * 1_000.0);

    println!("metric.strategy={}", runner.paging_strategy().label());
    println!(
        "metric.connect_ms={:.3}",
        connect_latency.as_secs_f64() * 1_000.0
    );
    println!("metric.first_page_ms={first_page_ms:.3}");
    println!("metric.pages={}", metrics.pages);
    println!("metric.rows_fetched={}", metrics.rows_fetched);
    println!("metric.rows_evicted={}", metrics.rows_evicted);
    println!("metric.buffered_rows={}", metrics.buffered_rows);
    println!(
        "metric.paging_elapsed_ms={:.3}",
        metrics.elapsed.as_secs_f64() * 1_000.0
    );
    println!("metric.rows_per_sec={rows_per_sec:.3}");
    if let Some(bytes) = peak_memory_bytes_best_effort() {
        println!("metric.peak_memory_bytes={bytes}");
    } else {
        println!("metric.peak_memory_bytes=n/a");
    }

    enforce_assertions(&config, first_page_ms, rows_per_sec)?;

    connection.disconnect().await.map_err(io_other)?;
    Ok(())
}

fn parse_engine(raw: &str) -> Result<Engine, String> {
    match raw.to_ascii_lowercase().as_str() {
        "mysql" => Ok(Engine::Mysql),
        "postgres" | "postgresql" => Ok(Engine::Postgres),
        other => Err(format!("unknown engine `{other}`")),
    }
}

fn benchmark_profile(config: &BenchmarkConfig) -> ConnectionProfile {
    let mut profile = ConnectionProfile::new(
        config.profile_name.clone(),
        config.engine,
        config.host.clone(),
        config.user.clone(),
    );
    profile.port = config.port;
    profile.database = Some(config.database.clone());
    profile
}

/// Pages forward through `iterator` the way the results view does,
/// keeping rows in a bounded display buffer.
async fn run_paging_benchmark(
    iterator: &SharedIterator,
    max_pages: u64,
) -> io::Result<PagingMetrics> {
    let mut buffer: DisplayBuffer<QueryRow> = DisplayBuffer::new(DISPLAY_BUFFER_CAPACITY);
    let started_at = Instant::now();
    let mut metrics = PagingMetrics {
        rows_fetched: 0,
        pages: 0,
        rows_evicted: 0,
        buffered_rows: 0,
        first_page: None,
        elapsed: Duration::ZERO,
    };

    while max_pages == 0 || metrics.pages < max_pages {
        match iterator
            .fetch(FetchDirection::Forward)
            .await
            .map_err(io_other)?
        {
            FetchOutcome::Page(page) => {
                metrics.pages += 1;
                metrics.rows_fetched += page.len() as u64;
                metrics.first_page.get_or_insert_with(|| started_at.elapsed());
                metrics.rows_evicted +=
                    buffer.push_page(FetchDirection::Forward, page.rows) as u64;
            }
            FetchOutcome::EndOfData | FetchOutcome::Unsupported => break,
        }
    }

    metrics.buffered_rows = buffer.len();
    metrics.elapsed = started_at.elapsed();
    Ok(metrics)
}

async fn ensure_seed_data(
    connection: &Arc<dyn Connection>,
    engine: Engine,
    target_rows: u64,
) -> io::Result<()> {
    execute_sql(connection, create_events_sql(engine)).await?;

    let existing_rows = query_scalar_u64(connection, "SELECT COUNT(*) FROM events").await?;
    if existing_rows >= target_rows {
        return Ok(());
    }

    let mut next = existing_rows + 1;
    while next <= target_rows {
        let end = (next + SEED_BATCH - 1).min(target_rows);
        execute_sql(connection, &build_insert_batch_sql(engine, next, end)).await?;
        next = end + 1;
    }

    Ok(())
}

fn create_events_sql(engine: Engine) -> &'static str {
    match engine {
        Engine::Mysql => {
            "CREATE TABLE IF NOT EXISTS events (\
             id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,\
             user_id INT NOT NULL,\
             category VARCHAR(32) NOT NULL,\
             payload VARCHAR(128) NOT NULL,\
             created_at DATETIME NOT NULL,\
             KEY idx_created_at (created_at)\
             )"
        }
        Engine::Postgres => {
            "CREATE TABLE IF NOT EXISTS events (\
             id BIGSERIAL PRIMARY KEY,\
             user_id INT NOT NULL,\
             category VARCHAR(32) NOT NULL,\
             payload VARCHAR(128) NOT NULL,\
             created_at TIMESTAMP NOT NULL\
             )"
        }
    }
}

async fn execute_sql(connection: &Arc<dyn Connection>, sql: &str) -> io::Result<()> {
    connection
        .query_backend()
        .run_buffered(sql, 0, &ExecutionHandle::new())
        .await
        .map_err(io_other)?;
    Ok(())
}

async fn query_scalar_u64(connection: &Arc<dyn Connection>, sql: &str) -> io::Result<u64> {
    let result = connection
        .query_backend()
        .run_buffered(sql, 1, &ExecutionHandle::new())
        .await
        .map_err(io_other)?;
    let value = result
        .rows
        .first()
        .and_then(|row| row.values.first())
        .ok_or_else(|| io_other("query returned no rows"))?;
    value
        .parse::<u64>()
        .map_err(|error| io_other(format!("failed to parse scalar value `{value}`: {error}")))
}

fn build_insert_batch_sql(engine: Engine, start: u64, end: u64) -> String {
    let mut values = Vec::new();
    for index in start..=end {
        let user_id = (index % 5_000) + 1;
        let category = match index % 5 {
            0 => "search",
            1 => "play",
            2 => "pause",
            3 => "skip",
            _ => "share",
        };
        let created_offset = index % 86_400;
        let created_at = match engine {
            Engine::Mysql => format!("NOW() - INTERVAL {created_offset} SECOND"),
            Engine::Postgres => format!("NOW() - INTERVAL '{created_offset} seconds'"),
        };
        values.push(format!(
            "({user_id}, '{category}', 'payload-{index}', {created_at})"
        ));
    }

    format!(
        "INSERT INTO events (user_id, category, payload, created_at) VALUES {}",
        values.join(",")
    )
}

fn enforce_assertions(
    config: &BenchmarkConfig,
    first_page_ms: f64,
    rows_per_sec: f64,
) -> io::Result<()> {
    if let Some(max_first_page_ms) = config.assert_first_page_ms {
        if first_page_ms > max_first_page_ms {
            return Err(io_other(format!(
                "first page latency {first_page_ms:.3}ms exceeded threshold {max_first_page_ms:.3}ms"
            )));
        }
    }

    if let Some(min_rows_per_sec) = config.assert_min_rows_per_sec {
        if rows_per_sec < min_rows_per_sec {
            return Err(io_other(format!(
                "rows/sec {rows_per_sec:.3} below threshold {min_rows_per_sec:.3}"
            )));
        }
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn peak_memory_bytes_best_effort() -> Option<u64> {
    let contents = std::fs::read_to_string("/proc/self/status").ok()?;
    let vm_hwm_line = contents.lines().find(|line| line.starts_with("VmHWM:"))?;
    let kb = vm_hwm_line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(kb * 1_024)
}

#[cfg(not(target_os = "linux"))]
fn peak_memory_bytes_best_effort() -> Option<u64> {
    None
}

fn io_other(error: impl std::fmt::Display) -> io::Error {
    io::Error::other(error.to_string())
}
