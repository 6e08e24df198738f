//! Database bootstrap helpers used by the setup sequence
use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use super::Pool;
use super::schema::quote_ident;
use crate::config::{
    CONNECT_TIMEOUT, MAINTENANCE_DATABASE, SETUP_CONNECT_ATTEMPTS, SETUP_INITIAL_BACKOFF,
    WarehouseConfig,
};

/// Run `operation` up to `attempts` times, doubling the delay after each failure
///
/// The attempt number (starting at 1) is passed to the operation. The last
/// error is returned once every attempt has failed.
pub async fn retry_with_backoff<T, F, Fut>(
    attempts: u32,
    initial_delay: Duration,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut delay = initial_delay;
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                warn!(
                    attempt,
                    attempts,
                    delay = ?delay,
                    error = %format!("{:#}", e),
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn connect_maintenance(options: PgConnectOptions) -> Result<PgConnection> {
    tokio::time::timeout(CONNECT_TIMEOUT, options.connect())
        .await
        .context("Timed out connecting to the server")?
        .with_context(|| format!("Failed to connect to database '{}'", MAINTENANCE_DATABASE))
}

/// Make sure the configured database exists, creating it when missing
///
/// Connects to the server's maintenance database, retrying while the server
/// may still be starting. Returns `true` if the database had to be created.
pub async fn ensure_database_exists(config: WarehouseConfig) -> Result<bool> {
    let options = config.maintenance_connect_options();

    info!(
        server = %config.host,
        database = %config.database,
        "checking that the target database exists"
    );

    let mut conn = retry_with_backoff(SETUP_CONNECT_ATTEMPTS, SETUP_INITIAL_BACKOFF, |_| {
        connect_maintenance(options.clone())
    })
    .await?;

    let exists: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM pg_database WHERE datname = $1")
        .bind(config.database.as_str())
        .fetch_optional(&mut conn)
        .await
        .context("Failed to query pg_database")?;

    let created = if exists.is_some() {
        info!(database = %config.database, "database already exists");
        false
    } else {
        info!(database = %config.database, "creating database");
        sqlx::query(&format!("CREATE DATABASE {}", quote_ident(&config.database)))
            .execute(&mut conn)
            .await
            .with_context(|| format!("Failed to create database '{}'", config.database))?;
        true
    };

    conn.close().await.ok();
    Ok(created)
}

/// Execute a SQL script file against the pool as a single unit of text
pub async fn run_script(pool: Pool, path: PathBuf) -> Result<()> {
    let sql = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read SQL script {}", path.display()))?;

    info!(script = %path.display(), bytes = sql.len(), "executing SQL script");

    pool.execute_script(&sql)
        .await
        .with_context(|| format!("SQL script {} failed", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();

        let result = retry_with_backoff(5, Duration::from_secs(2), |attempt| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(anyhow!("server starting"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 2s + 4s
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_last_error() {
        let start = tokio::time::Instant::now();

        let err = retry_with_backoff(3, Duration::from_secs(2), |attempt| async move {
            Err::<(), _>(anyhow!("attempt {} refused", attempt))
        })
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "attempt 3 refused");
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_run_script_executes_all_statements() {
        let pool = Pool::sqlite_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("01_create.sql");
        std::fs::write(
            &path,
            "CREATE TABLE \"yellow_taxi_trips\" (\"vendorid\" BIGINT);\n\
             INSERT INTO \"yellow_taxi_trips\" VALUES (1);\n",
        )
        .unwrap();

        run_script(pool.clone(), path.clone()).await.unwrap();

        assert_eq!(
            pool.count_rows("\"yellow_taxi_trips\"").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_run_script_missing_file() {
        let pool = Pool::sqlite_in_memory().await.unwrap();
        let err = run_script(pool, PathBuf::from("/nonexistent/03_validate.sql"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("03_validate.sql"));
    }

    #[tokio::test]
    async fn test_run_script_reports_sql_errors() {
        let pool = Pool::sqlite_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.sql");
        std::fs::write(&path, "SELEC nonsense;").unwrap();

        assert!(run_script(pool.clone(), path.clone()).await.is_err());
    }
}
