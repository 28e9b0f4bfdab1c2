use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::domain::models::{StationRef, Vendor};

pub const LATEST_SCHEMA_VERSION: u32 = 1;

const MIGRATIONS: &[(u32, &str)] = &[(
    1,
    r#"
CREATE TABLE IF NOT EXISTS customers (
    customer_key TEXT PRIMARY KEY,
    vendor TEXT NOT NULL,
    external_id TEXT NOT NULL,
    device_ids TEXT NOT NULL DEFAULT '[]',
    linked_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_customers_station
ON customers (vendor, external_id);
"#,
)];

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {current}; latest supported is {latest}")]
    UnsupportedSchemaVersion { current: u32, latest: u32 },
    #[error("corrupt directory row for {customer_key}: {reason}")]
    CorruptRow { customer_key: String, reason: String },
}

pub fn open_connection(path: &str) -> Result<Connection, DbError> {
    Connection::open(path).map_err(DbError::from)
}

pub fn run_migrations(connection: &mut Connection) -> Result<(), DbError> {
    let current_version = schema_version(connection)?;

    if current_version > LATEST_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            current: current_version,
            latest: LATEST_SCHEMA_VERSION,
        });
    }

    let transaction = connection.transaction()?;

    for (version, sql) in MIGRATIONS {
        if *version > current_version {
            transaction.execute_batch(sql)?;
            transaction.pragma_update(None, "user_version", version)?;
        }
    }

    transaction.commit()?;

    Ok(())
}

pub fn schema_version(connection: &Connection) -> Result<u32, DbError> {
    let version = connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomerRecord {
    pub customer_key: String,
    pub station: StationRef,
    pub linked_at: String,
}

pub fn find_customer(
    connection: &Connection,
    customer_key: &str,
) -> Result<Option<CustomerRecord>, DbError> {
    let row = connection
        .query_row(
            "SELECT customer_key, vendor, external_id, device_ids, linked_at
             FROM customers
             WHERE customer_key = ?1",
            params![customer_key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((customer_key, vendor, external_id, device_ids, linked_at)) = row else {
        return Ok(None);
    };

    let vendor = vendor
        .parse::<Vendor>()
        .map_err(|reason| DbError::CorruptRow {
            customer_key: customer_key.clone(),
            reason,
        })?;
    let device_ids: Vec<String> =
        serde_json::from_str(&device_ids).map_err(|error| DbError::CorruptRow {
            customer_key: customer_key.clone(),
            reason: format!("invalid device_ids: {error}"),
        })?;

    Ok(Some(CustomerRecord {
        customer_key,
        station: StationRef {
            vendor,
            external_id,
            device_ids,
        },
        linked_at,
    }))
}

/// Inserts a new link. Returns `false` without touching the row when the
/// customer is already linked.
pub fn insert_customer(connection: &Connection, record: &CustomerRecord) -> Result<bool, DbError> {
    let device_ids =
        serde_json::to_string(&record.station.device_ids).map_err(|error| DbError::CorruptRow {
            customer_key: record.customer_key.clone(),
            reason: format!("device_ids not encodable: {error}"),
        })?;

    let inserted = connection.execute(
        "INSERT OR IGNORE INTO customers (customer_key, vendor, external_id, device_ids, linked_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.customer_key,
            record.station.vendor.as_str(),
            record.station.external_id,
            device_ids,
            record.linked_at,
        ],
    )?;

    Ok(inserted == 1)
}

pub fn count_customers(connection: &Connection) -> Result<i64, DbError> {
    let count = connection.query_row("SELECT COUNT(*) FROM customers", [], |row| row.get(0))?;
    Ok(count)
}
