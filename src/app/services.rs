use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;
use thiserror::Error;

use crate::adapters::db;
use crate::adapters::db::DbError;
use crate::domain::models::Transaction;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("database lock poisoned")]
    DbLockPoisoned,
    #[error("database operation failed: {0}")]
    Database(#[from] DbError),
}

/// Durable sink for billed transactions. Inserts are not idempotent.
pub trait TransactionStore: Send + 'static {
    fn insert_transaction(&self, transaction: &Transaction) -> Result<i64, ServiceError>;
}

#[derive(Clone)]
pub struct SqliteTransactionStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteTransactionStore {
    pub fn new(connection: Arc<Mutex<Connection>>) -> Self {
        Self { connection }
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, ServiceError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        op(&connection).map_err(ServiceError::from)
    }
}

impl TransactionStore for SqliteTransactionStore {
    fn insert_transaction(&self, transaction: &Transaction) -> Result<i64, ServiceError> {
        let recorded_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.with_connection(|connection| {
            db::insert_transaction(connection, transaction, &recorded_at)
        })
    }
}
