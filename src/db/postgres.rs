//! Postgres driver (sqlx). One connection per call, no pooling across tasks.

use std::time::Duration;

use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgRow, PgSslMode};
use sqlx::{
    Column, ConnectOptions, Connection, Executor, PgConnection, Row as _, TypeInfo, ValueRef,
};

use super::{ConnectionOptions, DatabaseDescriptor, DbError};
use crate::task::Row;

const DEFAULT_PORT: u16 = 5432;

fn ssl_mode(options: &ConnectionOptions) -> PgSslMode {
    match (options.encrypt, options.trust_server_certificate) {
        (false, _) => PgSslMode::Prefer,
        (true, true) => PgSslMode::Require,
        (true, false) => PgSslMode::VerifyFull,
    }
}

fn connect_options(descriptor: &DatabaseDescriptor) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(descriptor.server.trim())
        .port(descriptor.port.unwrap_or(DEFAULT_PORT))
        .database(descriptor.database.trim())
        .username(descriptor.user.trim())
        .password(&descriptor.password)
        .ssl_mode(ssl_mode(&descriptor.options))
        .application_name("sitelink")
        // Queries come from the platform verbatim; don't flood the log with them.
        .disable_statement_logging()
}

async fn connect(
    descriptor: &DatabaseDescriptor,
    timeout: Duration,
) -> Result<PgConnection, DbError> {
    let options = connect_options(descriptor);
    match tokio::time::timeout(timeout, options.connect()).await {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(e)) => Err(DbError::Connect(e.to_string())),
        Err(_) => Err(DbError::Timeout(timeout)),
    }
}

pub(super) async fn ping(descriptor: &DatabaseDescriptor) -> Result<(), DbError> {
    let timeout = descriptor.request_timeout();
    let mut conn = connect(descriptor, timeout).await?;
    let result = conn.ping().await.map_err(|e| DbError::Connect(e.to_string()));
    if let Err(e) = conn.close().await {
        tracing::debug!("Failed to close test connection cleanly: {}", e);
    }
    result
}

pub(super) async fn run_query(
    descriptor: &DatabaseDescriptor,
    sql: &str,
) -> Result<Vec<Row>, DbError> {
    let timeout = descriptor.request_timeout();
    let mut conn = connect(descriptor, timeout).await?;

    // A bare &str runs through the simple-query protocol, so the text is sent untouched.
    let fetched = tokio::time::timeout(timeout, conn.fetch_all(sql)).await;

    let rows = match fetched {
        Ok(Ok(rows)) => rows,
        // Dropping the connection on the error paths releases it.
        Ok(Err(e)) => return Err(DbError::Query(e.to_string())),
        Err(_) => return Err(DbError::Timeout(timeout)),
    };

    let converted = rows.iter().map(row_to_json).collect::<Result<Vec<_>, _>>();
    if let Err(e) = conn.close().await {
        tracing::debug!("Failed to close connection cleanly: {}", e);
    }
    converted
}

fn row_to_json(row: &PgRow) -> Result<Row, DbError> {
    let mut obj = Row::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let value = column_value(row, idx, column.type_info().name())
            .map_err(|e| DbError::Query(format!("column '{}': {}", column.name(), e)))?;
        obj.insert(column.name().to_string(), value);
    }
    Ok(obj)
}

fn column_value(row: &PgRow, idx: usize, type_name: &str) -> Result<Value, sqlx::Error> {
    if row.try_get_raw(idx)?.is_null() {
        return Ok(Value::Null);
    }

    let value = match type_name {
        "BOOL" => Value::Bool(row.try_get::<bool, _>(idx)?),
        "INT2" => Value::from(row.try_get::<i16, _>(idx)?),
        "INT4" => Value::from(row.try_get::<i32, _>(idx)?),
        "INT8" => Value::from(row.try_get::<i64, _>(idx)?),
        "FLOAT4" => float(f64::from(row.try_get::<f32, _>(idx)?)),
        "FLOAT8" => float(row.try_get::<f64, _>(idx)?),
        "JSON" | "JSONB" => row.try_get::<Value, _>(idx)?,
        "UUID" => Value::String(row.try_get::<uuid::Uuid, _>(idx)?.to_string()),
        "TIMESTAMPTZ" => Value::String(
            row.try_get::<chrono::DateTime<chrono::Utc>, _>(idx)?
                .to_rfc3339(),
        ),
        "TIMESTAMP" => Value::String(
            row.try_get::<chrono::NaiveDateTime, _>(idx)?
                .format("%Y-%m-%dT%H:%M:%S%.f")
                .to_string(),
        ),
        "DATE" => Value::String(row.try_get::<chrono::NaiveDate, _>(idx)?.to_string()),
        "TIME" => Value::String(row.try_get::<chrono::NaiveTime, _>(idx)?.to_string()),
        // Simple-query results arrive in text format, so everything else reads as its text form.
        _ => Value::String(row.try_get_unchecked::<String, _>(idx)?),
    };
    Ok(value)
}

fn float(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbEngine;

    fn descriptor(options: ConnectionOptions) -> DatabaseDescriptor {
        DatabaseDescriptor {
            engine: DbEngine::Postgres,
            server: " db.local ".to_string(),
            port: None,
            database: "pos".to_string(),
            user: "reporter".to_string(),
            password: "pw".to_string(),
            options,
            request_timeout: 500,
        }
    }

    #[test]
    fn test_ssl_mode_follows_options() {
        assert!(matches!(ssl_mode(&ConnectionOptions::default()), PgSslMode::Prefer));
        assert!(matches!(
            ssl_mode(&ConnectionOptions {
                trust_server_certificate: true,
                encrypt: true,
            }),
            PgSslMode::Require
        ));
        assert!(matches!(
            ssl_mode(&ConnectionOptions {
                trust_server_certificate: false,
                encrypt: true,
            }),
            PgSslMode::VerifyFull
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_without_panicking() {
        let mut d = descriptor(ConnectionOptions::default());
        // Reserved TEST-NET address; either refused or timed out.
        d.server = "192.0.2.1".to_string();
        d.port = Some(1);

        let err = run_query(&d, "SELECT 1").await.unwrap_err();
        assert!(matches!(err, DbError::Connect(_) | DbError::Timeout(_)));
    }
}
