//! Configuration for the trip-record loader
//!
//! This module centralizes the tunable constants used throughout the
//! application and the explicit configuration structs handed to the runner.

use anyhow::{Result, anyhow};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use std::net::IpAddr;
use std::time::Duration;

// ============================================================================
// Source Configuration
// ============================================================================

/// Public CDN that hosts the NYC TLC trip-record files
pub const DEFAULT_BASE_URL: &str = "https://d37ci6vzurychx.cloudfront.net/trip-data";

pub const DEFAULT_DATASET: &str = "yellow_tripdata";

pub const DEFAULT_EXTENSION: &str = "parquet";

pub const DEFAULT_YEAR: i32 = 2013;

/// Timeout for downloading a single partition file
///
/// Monthly files are 100-500 MB, so the bound is generous. It covers the
/// whole transfer, not just the connect phase.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(300);

// ============================================================================
// Destination Configuration
// ============================================================================

pub const DEFAULT_SCHEMA: &str = "public";

pub const DEFAULT_TABLE: &str = "yellow_taxi_trips";

/// Rows written per batch
pub const BATCH_SIZE: usize = 10_000;

/// Upper bound on bind parameters in a single INSERT statement
///
/// PostgreSQL accepts 65535 and SQLite (>= 3.32) 32766; the lower of the two
/// keeps statements portable across the production and test pools.
pub const MAX_BIND_PARAMS: usize = 32_766;

// ============================================================================
// Connection Pool Configuration
// ============================================================================

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(45);

/// Liveness check run before a pooled connection is handed out
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Connections older than this are closed and replaced
pub const POOL_RECYCLE: Duration = Duration::from_secs(3600);

pub const MAX_POOL_SIZE: u32 = 2;

// ============================================================================
// Setup Configuration
// ============================================================================

/// Attempts made to reach the maintenance database (the server may still be starting)
pub const SETUP_CONNECT_ATTEMPTS: u32 = 5;

pub const SETUP_INITIAL_BACKOFF: Duration = Duration::from_secs(2);

/// Database used to check for and create the target database
pub const MAINTENANCE_DATABASE: &str = "postgres";

// ============================================================================
// Config structs
// ============================================================================

/// Database driver used to reach the warehouse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    Postgres,
}

impl Driver {
    /// Parse driver from string (case-insensitive)
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Driver::Postgres),
            _ => Err(anyhow!(
                "Unsupported driver: {}. Supported drivers: postgres",
                s
            )),
        }
    }

    fn scheme(&self) -> &'static str {
        match self {
            Driver::Postgres => "postgres",
        }
    }
}

/// Connection settings for the destination warehouse
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub driver: Driver,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "DataWarehouseTreinamento".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            driver: Driver::Postgres,
        }
    }
}

impl WarehouseConfig {
    /// Whether the server certificate is trusted without verification
    ///
    /// Only loopback hosts (local containers, dev instances) get this.
    pub fn trust_server_certificate(&self) -> bool {
        let host = self.host.trim().trim_start_matches('[').trim_end_matches(']');
        if host.eq_ignore_ascii_case("localhost") {
            return true;
        }
        host.parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
    }

    fn ssl_mode(&self) -> PgSslMode {
        if self.trust_server_certificate() {
            PgSslMode::Prefer
        } else {
            PgSslMode::VerifyFull
        }
    }

    fn ssl_mode_name(&self) -> &'static str {
        if self.trust_server_certificate() {
            "prefer"
        } else {
            "verify-full"
        }
    }

    /// Connection URL with the password redacted, for logs and banners
    pub fn connection_string(&self) -> String {
        self.connection_string_for(&self.database)
    }

    fn connection_string_for(&self, database: &str) -> String {
        format!(
            "{}://{}:***@{}:{}/{}?sslmode={}",
            self.driver.scheme(),
            self.user,
            self.host,
            self.port,
            database,
            self.ssl_mode_name()
        )
    }

    /// Connect options for the target database
    pub fn connect_options(&self) -> PgConnectOptions {
        self.connect_options_for(&self.database)
    }

    /// Connect options for the server's maintenance database
    pub fn maintenance_connect_options(&self) -> PgConnectOptions {
        self.connect_options_for(MAINTENANCE_DATABASE)
    }

    fn connect_options_for(&self, database: &str) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(database)
            .ssl_mode(self.ssl_mode());

        if self.password.is_empty() {
            options
        } else {
            options.password(&self.password)
        }
    }
}

/// Where partition files come from and how they are named
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// HTTP(S) base URL, `file://` URL, or local directory
    pub base_url: String,
    pub dataset: String,
    pub extension: String,
    pub year: i32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            dataset: DEFAULT_DATASET.to_string(),
            extension: DEFAULT_EXTENSION.to_string(),
            year: DEFAULT_YEAR,
        }
    }
}
