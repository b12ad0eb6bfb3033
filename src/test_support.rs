use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::adapters::db::{open_connection, run_migrations};
use crate::app::services::{ServiceError, TransactionStore};
use crate::domain::models::Transaction;

static TEST_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opens a migrated database in a throwaway directory.
pub fn open_test_connection(test_name: &str) -> Connection {
    let path = unique_test_db_path(test_name);
    let mut connection =
        open_connection(path.to_string_lossy().as_ref()).expect("test db should open");
    run_migrations(&mut connection).expect("test db migrations should succeed");
    connection
}

pub fn unique_test_db_path(test_name: &str) -> PathBuf {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let counter = TEST_DB_COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = dir.path().join(format!("{test_name}-{counter}.sqlite"));
    std::mem::forget(dir);
    path
}

/// Store double that records inserts, optionally failing every one of them.
#[derive(Clone, Default)]
pub struct RecordingStore {
    inserted: Arc<Mutex<Vec<Transaction>>>,
    attempts: Arc<AtomicU64>,
    fail: bool,
}

impl RecordingStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn inserted(&self) -> Vec<Transaction> {
        self.inserted.lock().expect("store lock").clone()
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl TransactionStore for RecordingStore {
    fn insert_transaction(&self, transaction: &Transaction) -> Result<i64, ServiceError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ServiceError::DbLockPoisoned);
        }

        let mut inserted = self.inserted.lock().map_err(|_| ServiceError::DbLockPoisoned)?;
        inserted.push(transaction.clone());
        Ok(inserted.len() as i64)
    }
}
