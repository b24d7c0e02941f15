//! Local database access.
//!
//! A [`DatabaseDescriptor`] says where the site database lives; a [`QueryBackend`] opens
//! one connection per call, runs the query verbatim and converts the rows to JSON objects.
//! [`SqlBackend`] is the production backend and dispatches on the descriptor's engine.

mod mssql;
mod postgres;
mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::Row;

/// Database engine the descriptor points at. Descriptors without one are SQL Server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbEngine {
    #[default]
    Mssql,
    Postgres,
    Sqlite,
}

/// Transport options for the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionOptions {
    /// Accept the server certificate without verifying it.
    #[serde(default = "default_true")]
    pub trust_server_certificate: bool,
    /// Require an encrypted connection.
    #[serde(default)]
    pub encrypt: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            trust_server_certificate: true,
            encrypt: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    15_000
}

/// Connection parameters for the site database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseDescriptor {
    #[serde(default)]
    pub engine: DbEngine,
    /// Host name, `host,port` or `host\INSTANCE`; unused for SQLite.
    #[serde(default)]
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Database name, or file path for SQLite.
    pub database: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub options: ConnectionOptions,
    /// Connect and query timeout in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

impl DatabaseDescriptor {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout)
    }

    /// Names of required fields that are empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.database.trim().is_empty() {
            missing.push("database");
        }
        if self.engine != DbEngine::Sqlite {
            if self.server.trim().is_empty() {
                missing.push("server");
            }
            if self.user.trim().is_empty() {
                missing.push("user");
            }
        }
        missing
    }
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database not configured")]
    NotConfigured,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Result of a manual connection test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTest {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Runs queries against the database a descriptor points at.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    /// Open a connection, run `sql` verbatim, release the connection and return the rows.
    async fn run_query(
        &self,
        descriptor: &DatabaseDescriptor,
        sql: &str,
    ) -> Result<Vec<Row>, DbError>;

    /// Open and close a connection without running anything.
    async fn ping(&self, descriptor: &DatabaseDescriptor) -> Result<(), DbError>;

    /// Manual connection test for the operator surface.
    async fn test_connection(&self, descriptor: &DatabaseDescriptor) -> ConnectionTest {
        match self.ping(descriptor).await {
            Ok(()) => ConnectionTest {
                success: true,
                error: None,
            },
            Err(e) => ConnectionTest {
                success: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Backend dispatching to tiberius (SQL Server), sqlx (Postgres) or rusqlite (SQLite).
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlBackend;

#[async_trait]
impl QueryBackend for SqlBackend {
    async fn run_query(
        &self,
        descriptor: &DatabaseDescriptor,
        sql: &str,
    ) -> Result<Vec<Row>, DbError> {
        match descriptor.engine {
            DbEngine::Mssql => mssql::run_query(descriptor, sql).await,
            DbEngine::Postgres => postgres::run_query(descriptor, sql).await,
            DbEngine::Sqlite => sqlite::run_query(descriptor, sql).await,
        }
    }

    async fn ping(&self, descriptor: &DatabaseDescriptor) -> Result<(), DbError> {
        match descriptor.engine {
            DbEngine::Mssql => mssql::ping(descriptor).await,
            DbEngine::Postgres => postgres::ping(descriptor).await,
            DbEngine::Sqlite => sqlite::ping(descriptor).await,
        }
    }
}
