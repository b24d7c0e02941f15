//! SQLite driver (rusqlite). The descriptor's `database` field is the file path.

use std::path::PathBuf;

use base64::Engine as _;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;

use super::{DatabaseDescriptor, DbError};
use crate::task::Row;

fn open(descriptor: &DatabaseDescriptor) -> Result<Connection, DbError> {
    let path = PathBuf::from(&descriptor.database);
    let conn = Connection::open_with_flags(
        &path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI,
    )
    .map_err(|e| DbError::Connect(format!("{}: {}", path.display(), e)))?;
    conn.busy_timeout(descriptor.request_timeout())
        .map_err(|e| DbError::Connect(e.to_string()))?;
    Ok(conn)
}

async fn open_blocking(descriptor: &DatabaseDescriptor) -> Result<Connection, DbError> {
    let owned = descriptor.clone();
    tokio::task::spawn_blocking(move || open(&owned))
        .await
        .map_err(|e| DbError::Connect(format!("worker failed: {}", e)))?
}

pub(super) async fn ping(descriptor: &DatabaseDescriptor) -> Result<(), DbError> {
    let conn = open_blocking(descriptor).await?;
    drop(conn);
    Ok(())
}

pub(super) async fn run_query(
    descriptor: &DatabaseDescriptor,
    sql: &str,
) -> Result<Vec<Row>, DbError> {
    let timeout = descriptor.request_timeout();
    let conn = open_blocking(descriptor).await?;
    let interrupt = conn.get_interrupt_handle();
    let sql = sql.to_string();

    // The connection moves into the worker and is dropped there on every path.
    let worker = tokio::task::spawn_blocking(move || query_rows(&conn, &sql));

    match tokio::time::timeout(timeout, worker).await {
        Ok(Ok(rows)) => rows,
        Ok(Err(e)) => Err(DbError::Query(format!("worker failed: {}", e))),
        Err(_) => {
            interrupt.interrupt();
            Err(DbError::Timeout(timeout))
        }
    }
}

fn query_rows(conn: &Connection, sql: &str) -> Result<Vec<Row>, DbError> {
    let query_err = |e: rusqlite::Error| DbError::Query(e.to_string());

    let mut stmt = conn.prepare(sql).map_err(query_err)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query([]).map_err(query_err)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(query_err)? {
        let mut obj = Row::new();
        for (idx, name) in columns.iter().enumerate() {
            let value = row.get_ref(idx).map_err(query_err)?;
            obj.insert(name.clone(), to_json(value));
        }
        out.push(obj);
    }
    Ok(out)
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
    }
}
