//! Adapter between bb8 and the sqlx::Postgres driver.
use derive_builder::Builder;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CONNECT_TIMEOUT, MAX_POOL_SIZE, PING_TIMEOUT, POOL_RECYCLE};

pub type Bb8Connection<'a> = bb8::PooledConnection<'a, ConnectionManager>;

/// Inner pool variants
#[derive(Debug, Clone)]
enum PoolInner {
    Postgres(bb8::Pool<ConnectionManager>),
    #[cfg(test)]
    Sqlite(sqlx::SqlitePool),
}

/// Connection that can be either Postgres or SQLite
pub enum PoolConnection {
    Postgres(Bb8Connection<'static>),
    #[cfg(test)]
    Sqlite(sqlx::pool::PoolConnection<sqlx::Sqlite>),
}

/// Open transaction on a [`PoolConnection`]
///
/// Dropping it without [`PoolTransaction::commit`] rolls back.
pub enum PoolTransaction<'c> {
    Postgres(sqlx::Transaction<'c, sqlx::Postgres>),
    #[cfg(test)]
    Sqlite(sqlx::Transaction<'c, sqlx::Sqlite>),
}

impl PoolConnection {
    pub async fn begin(&mut self) -> Result<PoolTransaction<'_>, sqlx::Error> {
        match self {
            PoolConnection::Postgres(conn) => {
                let tx = Connection::begin(&mut **conn).await?;
                Ok(PoolTransaction::Postgres(tx))
            }
            #[cfg(test)]
            PoolConnection::Sqlite(conn) => {
                let tx = Connection::begin(&mut **conn).await?;
                Ok(PoolTransaction::Sqlite(tx))
            }
        }
    }
}

impl PoolTransaction<'_> {
    /// Execute a statement without parameters (DDL)
    pub async fn execute(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        match self {
            PoolTransaction::Postgres(tx) => {
                sqlx::query(sql).execute(&mut **tx).await?;
            }
            #[cfg(test)]
            PoolTransaction::Sqlite(tx) => {
                sqlx::query(sql).execute(&mut **tx).await?;
            }
        }
        Ok(())
    }

    pub async fn commit(self) -> Result<(), sqlx::Error> {
        match self {
            PoolTransaction::Postgres(tx) => tx.commit().await,
            #[cfg(test)]
            PoolTransaction::Sqlite(tx) => tx.commit().await,
        }
    }
}

// Wrap pool implementations so callers don't care which backend is in use.
#[derive(Debug, Clone)]
pub struct Pool {
    inner: PoolInner,
}

#[derive(Builder)]
pub struct PoolArgs {
    connect_options: PgConnectOptions,
    #[builder(default = "MAX_POOL_SIZE")]
    max_pool_size: u32,
    #[builder(default = "POOL_RECYCLE")]
    max_lifetime: Duration,
}

/// Build a lazily-connecting pool
///
/// No connection is opened here. The first `acquire` connects, so an
/// unreachable server surfaces as a load failure of the partition that needed
/// it rather than aborting the run up front.
pub fn pool(args: PoolArgs) -> Pool {
    let PoolArgs {
        connect_options,
        max_pool_size,
        max_lifetime,
    } = args;

    tracing::debug!(
        host = connect_options.get_host(),
        port = connect_options.get_port(),
        database = connect_options.get_database(),
        max_pool_size,
        "creating connection pool"
    );

    let bb8_pool = bb8::Builder::new()
        .max_size(max_pool_size)
        .min_idle(None)
        .max_lifetime(Some(max_lifetime))
        .connection_timeout(CONNECT_TIMEOUT)
        .test_on_check_out(true)
        .build_unchecked(ConnectionManager::new(connect_options));

    Pool {
        inner: PoolInner::Postgres(bb8_pool),
    }
}

fn run_error(err: bb8::RunError<sqlx::Error>) -> sqlx::Error {
    match err {
        bb8::RunError::User(e) => e,
        bb8::RunError::TimedOut => sqlx::Error::PoolTimedOut,
    }
}

impl Pool {
    /// Create an in-memory SQLite pool for testing
    ///
    /// A single connection is kept open for the lifetime of the pool: every
    /// SQLite in-memory connection is its own database.
    #[cfg(test)]
    pub async fn sqlite_in_memory() -> Result<Self, sqlx::Error> {
        let sqlite_pool = sqlx::sqlite::SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Ok(Pool {
            inner: PoolInner::Sqlite(sqlite_pool),
        })
    }

    pub async fn acquire(&self) -> Result<PoolConnection, sqlx::Error> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let conn = pool.get_owned().await.map_err(run_error)?;
                Ok(PoolConnection::Postgres(conn))
            }
            #[cfg(test)]
            PoolInner::Sqlite(pool) => {
                let conn = pool.acquire().await?;
                Ok(PoolConnection::Sqlite(conn))
            }
        }
    }

    /// Execute a multi-statement SQL script as-is
    ///
    /// The script is sent through the simple query protocol, so it may contain
    /// any number of `;`-separated statements but no bind parameters.
    pub async fn execute_script(&self, sql: &str) -> Result<(), sqlx::Error> {
        match &self.inner {
            PoolInner::Postgres(pool) => {
                let mut conn = pool.get().await.map_err(run_error)?;
                sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(sql)).await?;
                Ok(())
            }
            #[cfg(test)]
            PoolInner::Sqlite(pool) => {
                sqlx::raw_sql(sql).execute(pool).await?;
                Ok(())
            }
        }
    }

    /// Count rows in a table; `table_spec` must already be quoted
    pub async fn count_rows(&self, table_spec: &str) -> Result<u64, sqlx::Error> {
        let sql = format!("SELECT COUNT(*) FROM {}", table_spec);
        let count: (i64,) = match &self.inner {
            PoolInner::Postgres(pool) => {
                let mut conn = pool.get().await.map_err(run_error)?;
                sqlx::query_as(&sql).fetch_one(&mut *conn).await?
            }
            #[cfg(test)]
            PoolInner::Sqlite(pool) => sqlx::query_as(&sql).fetch_one(pool).await?,
        };
        Ok(count.0.max(0) as u64)
    }

    /// Check if this pool is using PostgreSQL (returns false for SQLite)
    pub fn is_postgres(&self) -> bool {
        matches!(&self.inner, PoolInner::Postgres(_))
    }

    /// Quoted table reference for use in SQL
    ///
    /// SQLite has no schemas, so the schema name is dropped there.
    pub fn qualified_table_name(&self, schema_name: &str, table_name: &str) -> String {
        use super::schema::quote_ident;

        if self.is_postgres() {
            format!("{}.{}", quote_ident(schema_name), quote_ident(table_name))
        } else {
            quote_ident(table_name)
        }
    }
}

// Wrap the connect options so that we can implement the bb8::ManageConnection trait.
pub struct ConnectionManager {
    connect_options: Arc<PgConnectOptions>,
}

impl ConnectionManager {
    /// Create a new `ConnectionManager` with the specified connect options.
    pub fn new(connect_options: PgConnectOptions) -> Self {
        Self {
            connect_options: Arc::new(connect_options),
        }
    }
}

impl bb8::ManageConnection for ConnectionManager {
    type Connection = PgConnection;
    type Error = sqlx::Error;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let conn = tokio::time::timeout(CONNECT_TIMEOUT, self.connect_options.connect())
            .await
            .map_err(|_| sqlx::Error::PoolTimedOut)??;

        Ok(conn)
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        tokio::time::timeout(PING_TIMEOUT, Connection::ping(conn))
            .await
            // Convert tokio timeouts into sqlx pool timeouts. bb8 will retry a different connection on ping failure.
            .map_err(|_| sqlx::Error::PoolTimedOut)
            // Make sure that we also look at the actual ping result
            .and_then(|result| result)?;
        Ok(())
    }

    fn has_broken(&self, _conn: &mut Self::Connection) -> bool {
        // sqlx::PgConnection provides no non-async way to check for closed/broken connections.
        false
    }
}
