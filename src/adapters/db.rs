use rusqlite::{Connection, params};
use thiserror::Error;

use crate::domain::models::Transaction;

pub const LATEST_SCHEMA_VERSION: u32 = 1;

const MIGRATIONS: &[(u32, &str)] = &[(
    1,
    r#"
CREATE TABLE IF NOT EXISTS transactions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    car_id TEXT NOT NULL,
    charger_id TEXT NOT NULL,
    energy_kwh REAL NOT NULL,
    cost REAL NOT NULL,
    logical_timestamp INTEGER NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_transactions_logical_timestamp
ON transactions (logical_timestamp);
"#,
)];

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {current}; latest supported is {latest}")]
    UnsupportedSchemaVersion { current: u32, latest: u32 },
    #[error("logical timestamp {0} does not fit in a database integer")]
    TimestampOutOfRange(u64),
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

/// Appends one billed transaction. The service never updates or deletes rows.
pub fn insert_transaction(
    connection: &Connection,
    transaction: &Transaction,
    recorded_at: &str,
) -> Result<i64, DbError> {
    let logical_timestamp = i64::try_from(transaction.logical_timestamp)
        .map_err(|_| DbError::TimestampOutOfRange(transaction.logical_timestamp))?;

    connection.execute(
        "INSERT INTO transactions (car_id, charger_id, energy_kwh, cost, logical_timestamp, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            transaction.car_id,
            transaction.charger_id,
            transaction.energy_kwh,
            transaction.cost,
            logical_timestamp,
            recorded_at,
        ],
    )?;

    Ok(connection.last_insert_rowid())
}

pub fn count_transactions(connection: &Connection) -> Result<u64, DbError> {
    let count: i64 =
        connection.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;
    Ok(u64::try_from(count).unwrap_or_default())
}

/// Empties the ledger table, keeping the schema. Used by the init tool only.
pub fn clear_transactions(connection: &Connection) -> Result<usize, DbError> {
    Ok(connection.execute("DELETE FROM transactions", [])?)
}
