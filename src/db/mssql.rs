//! SQL Server driver (tiberius). One TDS connection per call.
//!
//! `server` accepts `host`, `host,port` or `host\INSTANCE`. A named instance without an
//! explicit port is resolved through the SQL Browser service.

use std::time::Duration;

use base64::Engine as _;
use serde_json::Value;
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel, FromSql, SqlBrowser};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::{ConnectionOptions, DatabaseDescriptor, DbError};
use crate::task::Row;

type MssqlClient = Client<Compat<TcpStream>>;

/// Host, instance and port parsed out of the `server` field.
#[derive(Debug, PartialEq, Eq)]
struct ServerAddress<'a> {
    host: &'a str,
    instance: Option<&'a str>,
    port: Option<u16>,
}

fn parse_server(server: &str) -> Result<ServerAddress<'_>, DbError> {
    let server = server.trim();
    let (rest, port) = match server.rsplit_once(',') {
        Some((rest, port)) => {
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|e| DbError::Connect(format!("invalid port in '{}': {}", server, e)))?;
            (rest.trim(), Some(port))
        }
        None => (server, None),
    };
    let (host, instance) = match rest.split_once('\\') {
        Some((host, instance)) if !instance.trim().is_empty() => {
            (host.trim(), Some(instance.trim()))
        }
        Some((host, _)) => (host.trim(), None),
        None => (rest, None),
    };
    Ok(ServerAddress {
        host,
        instance,
        port,
    })
}

fn encryption(options: &ConnectionOptions) -> EncryptionLevel {
    if options.encrypt {
        EncryptionLevel::Required
    } else {
        EncryptionLevel::Off
    }
}

/// Build the tiberius config. The flag says whether the port must come from SQL Browser.
fn build_config(descriptor: &DatabaseDescriptor) -> Result<(Config, bool), DbError> {
    let address = parse_server(&descriptor.server)?;
    let port = descriptor.port.or(address.port);

    let mut config = Config::new();
    config.host(address.host);
    config.database(descriptor.database.trim());
    config.application_name("sitelink");
    config.authentication(AuthMethod::sql_server(
        descriptor.user.trim(),
        &descriptor.password,
    ));
    config.encryption(encryption(&descriptor.options));
    if descriptor.options.trust_server_certificate {
        config.trust_cert();
    }
    if let Some(instance) = address.instance {
        config.instance_name(instance);
    }
    // Without a port tiberius targets 1433, or the browser port for a named instance.
    if let Some(port) = port {
        config.port(port);
    }

    let use_browser = address.instance.is_some() && port.is_none();
    Ok((config, use_browser))
}

async fn open(descriptor: &DatabaseDescriptor) -> Result<MssqlClient, DbError> {
    let (config, use_browser) = build_config(descriptor)?;

    let tcp = if use_browser {
        TcpStream::connect_named(&config)
            .await
            .map_err(|e| DbError::Connect(e.to_string()))?
    } else {
        TcpStream::connect(config.get_addr())
            .await
            .map_err(|e| DbError::Connect(e.to_string()))?
    };
    tcp.set_nodelay(true)
        .map_err(|e| DbError::Connect(e.to_string()))?;

    Client::connect(config, tcp.compat_write())
        .await
        .map_err(|e| DbError::Connect(e.to_string()))
}

async fn connect(
    descriptor: &DatabaseDescriptor,
    timeout: Duration,
) -> Result<MssqlClient, DbError> {
    match tokio::time::timeout(timeout, open(descriptor)).await {
        Ok(result) => result,
        Err(_) => Err(DbError::Timeout(timeout)),
    }
}

pub(super) async fn ping(descriptor: &DatabaseDescriptor) -> Result<(), DbError> {
    let client = connect(descriptor, descriptor.request_timeout()).await?;
    if let Err(e) = client.close().await {
        tracing::debug!("Failed to close test connection cleanly: {}", e);
    }
    Ok(())
}

pub(super) async fn run_query(
    descriptor: &DatabaseDescriptor,
    sql: &str,
) -> Result<Vec<Row>, DbError> {
    let timeout = descriptor.request_timeout();
    let mut client = connect(descriptor, timeout).await?;

    let fetched = tokio::time::timeout(timeout, async {
        client.simple_query(sql).await?.into_first_result().await
    })
    .await;

    let rows = match fetched {
        Ok(Ok(rows)) => rows,
        Ok(Err(e)) => return Err(DbError::Query(e.to_string())),
        Err(_) => return Err(DbError::Timeout(timeout)),
    };

    let converted = rows.into_iter().map(row_to_json).collect::<Result<Vec<_>, _>>();
    if let Err(e) = client.close().await {
        tracing::debug!("Failed to close connection cleanly: {}", e);
    }
    converted
}

fn row_to_json(row: tiberius::Row) -> Result<Row, DbError> {
    let names: Vec<String> = row.columns().iter().map(|c| c.name().to_string()).collect();
    let mut obj = Row::new();
    for (name, data) in names.into_iter().zip(row) {
        let value = column_to_json(data)
            .map_err(|e| DbError::Query(format!("column '{}': {}", name, e)))?;
        obj.insert(name, value);
    }
    Ok(obj)
}

fn column_to_json(data: ColumnData<'static>) -> Result<Value, tiberius::error::Error> {
    let value = match &data {
        ColumnData::U8(v) => v.map(Value::from),
        ColumnData::I16(v) => v.map(Value::from),
        ColumnData::I32(v) => v.map(Value::from),
        ColumnData::I64(v) => v.map(Value::from),
        ColumnData::F32(v) => v.map(|f| float(f64::from(f))),
        ColumnData::F64(v) => v.map(float),
        ColumnData::Bit(v) => v.map(Value::Bool),
        ColumnData::String(v) => v.as_ref().map(|s| Value::String(s.to_string())),
        ColumnData::Guid(v) => v.as_ref().map(|g| Value::String(g.to_string())),
        ColumnData::Binary(v) => v
            .as_ref()
            .map(|b| Value::String(base64::engine::general_purpose::STANDARD.encode(b))),
        // Decimals come back as JSON numbers, losing precision past f64.
        ColumnData::Numeric(v) => v
            .as_ref()
            .map(|n| float(n.value() as f64 / 10f64.powi(i32::from(n.scale())))),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|x| Value::String(x.clone().into_owned().into_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            chrono::NaiveDateTime::from_sql(&data)?
                .map(|dt| Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
        }
        ColumnData::Date(_) => {
            chrono::NaiveDate::from_sql(&data)?.map(|d| Value::String(d.to_string()))
        }
        ColumnData::Time(_) => {
            chrono::NaiveTime::from_sql(&data)?.map(|t| Value::String(t.to_string()))
        }
        ColumnData::DateTimeOffset(_) => {
            chrono::DateTime::<chrono::FixedOffset>::from_sql(&data)?
                .map(|dt| Value::String(dt.to_rfc3339()))
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

fn float(f: f64) -> Value {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
