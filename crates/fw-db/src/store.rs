//! [`SessionStore`] implementation over a shared [`Database`].

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use fw_core::{
    ActivityLogEntry, FuelFillEvent, OperatingSession, Plate, SessionId, SessionPatch,
    SessionStatus, SessionStore, StoreError,
};
use rusqlite::ErrorCode;

use crate::{CreateOutcome, Database, DbError, UpdateOutcome};

/// Thread-safe store handed to ingest workers.
pub struct SqliteStore {
    db: Mutex<Database>,
}

impl SqliteStore {
    pub const fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }

    pub fn open(path: &Path) -> Result<Self, DbError> {
        Database::open(path).map(Self::new)
    }

    /// Runs `f` with exclusive access to the underlying database.
    pub fn with_db<T>(
        &self,
        f: impl FnOnce(&mut Database) -> Result<T, DbError>,
    ) -> Result<T, StoreError> {
        let mut db = self.lock()?;
        f(&mut db).map_err(store_error)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>, StoreError> {
        self.db
            .lock()
            .map_err(|_| StoreError::Backend("database mutex poisoned".to_string()))
    }
}

impl SessionStore for SqliteStore {
    fn create_session(&self, session: &OperatingSession) -> Result<SessionId, StoreError> {
        let mut db = self.lock()?;
        match db.create_session(session) {
            Ok(CreateOutcome::Created | CreateOutcome::AlreadyExists) => Ok(session.id.clone()),
            Ok(CreateOutcome::Conflict(existing)) => Err(StoreError::Conflict {
                plate: session.plate.clone(),
                existing,
            }),
            // Another process won the race between our check and the insert.
            Err(err) if is_constraint_violation(&err) => {
                match db.ongoing_session(&session.plate).map_err(store_error)? {
                    Some(existing) => Err(StoreError::Conflict {
                        plate: session.plate.clone(),
                        existing: existing.id,
                    }),
                    None => Err(store_error(err)),
                }
            }
            Err(err) => Err(store_error(err)),
        }
    }

    fn update_session(
        &self,
        id: &SessionId,
        expected_status: SessionStatus,
        patch: &SessionPatch,
    ) -> Result<(), StoreError> {
        let db = self.lock()?;
        match db
            .update_session(id, expected_status, patch)
            .map_err(store_error)?
        {
            UpdateOutcome::Applied | UpdateOutcome::AlreadyApplied => Ok(()),
            UpdateOutcome::NotFound => Err(StoreError::NotFound(id.clone())),
            UpdateOutcome::StatusMismatch(actual) => Err(StoreError::PreconditionFailed {
                id: id.clone(),
                expected: expected_status,
                actual,
            }),
        }
    }

    fn upsert_fill_event(&self, fill: &FuelFillEvent) -> Result<(), StoreError> {
        self.lock()?.upsert_fill_event(fill).map_err(store_error)
    }

    fn append_activity(&self, entry: &ActivityLogEntry) -> Result<(), StoreError> {
        self.lock()?.append_activity(entry).map_err(store_error)
    }

    fn ongoing_session(&self, plate: &Plate) -> Result<Option<OperatingSession>, StoreError> {
        self.lock()?.ongoing_session(plate).map_err(store_error)
    }
}

fn sqlite_code(err: &DbError) -> Option<ErrorCode> {
    match err {
        DbError::Sqlite(rusqlite::Error::SqliteFailure(failure, _)) => Some(failure.code),
        _ => None,
    }
}

fn is_constraint_violation(err: &DbError) -> bool {
    sqlite_code(err) == Some(ErrorCode::ConstraintViolation)
}

/// Lock contention is the only failure worth retrying.
fn store_error(err: DbError) -> StoreError {
    match sqlite_code(&err) {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            StoreError::Unavailable(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}
