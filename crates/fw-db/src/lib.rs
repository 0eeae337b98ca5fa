//! Storage layer for fuel session reconstruction.
//!
//! Provides persistence for operating sessions, fuel fill events and the
//! activity audit trail using `rusqlite`.
//!
//! # Thread Safety
//!
//! [`Database`] wraps a `rusqlite::Connection`, which is `Send` but not `Sync`.
//! Ingest workers share one through [`SqliteStore`], which serializes access
//! with a `Mutex` and implements [`fw_core::SessionStore`].
//!
//! # Schema
//!
//! ## Timestamp Format
//!
//! Timestamps are stored as TEXT in RFC 3339 with millisecond precision
//! (e.g., `2025-03-01T06:00:00.000Z`) so lexicographic ordering matches
//! chronological ordering. `session_date` is a plain `YYYY-MM-DD` string.
//!
//! ## Single ONGOING Session
//!
//! A partial unique index on `operating_sessions(plate) WHERE status =
//! 'ONGOING'` makes the one-open-session-per-plate rule hold even when
//! several ingest processes write to the same file.

mod repair;
mod store;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use fw_core::{
    ActivityKind, ActivityLogEntry, DetectionMethod, FillId, FuelFillEvent, OperatingSession,
    Plate, SessionId, SessionPatch, SessionStatus,
};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use thiserror::Error;

pub use repair::{RepairReport, SkippedRepair};
pub use store::SqliteStore;

/// How long a connection waits on a lock held by another process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SESSION_COLUMNS: &str = "id, plate, company, cost_code, unmapped, session_date, \
     start_time, end_time, opening_fuel, closing_fuel, operating_hours, fuel_used_liters, \
     fuel_filled_liters, cost, status, notes";

const FILL_COLUMNS: &str =
    "id, plate, fill_start_time, fill_end_time, fuel_before, fuel_after, fill_amount, detection_method";

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// An error from the underlying database.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Failed to parse a stored timestamp or date.
    #[error("invalid timestamp in {table} row {id}: {timestamp}")]
    TimestampParse {
        table: &'static str,
        id: String,
        timestamp: String,
        #[source]
        source: chrono::ParseError,
    },
    /// A stored value no longer passes domain validation.
    #[error("invalid {table} row {id}: {message}")]
    InvalidRow {
        table: &'static str,
        id: String,
        message: String,
    },
}

/// Database connection wrapper.
///
/// See the [module documentation](self) for thread safety considerations.
pub struct Database {
    conn: Connection,
}

/// Result of [`Database::create_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// A row with the same ID already exists; nothing was written.
    AlreadyExists,
    /// Another ONGOING session holds the plate.
    Conflict(SessionId),
}

/// Result of [`Database::update_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The row already has the patch's target status.
    AlreadyApplied,
    NotFound,
    StatusMismatch(SessionStatus),
}

/// Filter for [`Database::list_sessions`].
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub plate: Option<Plate>,
    pub status: Option<SessionStatus>,
    /// Inclusive lower bound on `start_time`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `start_time`.
    pub to: Option<DateTime<Utc>>,
}

/// Row counts shown by `fw status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StoreSummary {
    pub ongoing: usize,
    pub completed: usize,
    pub fuel_fill_completed: usize,
    pub unmapped: usize,
    pub fill_events: usize,
    pub activity_entries: usize,
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Database {
    /// Opens a database at the given path, creating it if necessary.
    ///
    /// The database schema is automatically initialized on first open.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Opens an in-memory database.
    ///
    /// Useful for testing. The database is destroyed when the connection closes.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Initializes the database schema.
    ///
    /// This is idempotent - safe to call on an already-initialized database.
    fn init(&self) -> Result<(), DbError> {
        self.conn.execute_batch(
            "
            -- status: ONGOING, COMPLETED or FUEL_FILL_COMPLETED
            -- end_time/closing_fuel are NULL while ONGOING
            CREATE TABLE IF NOT EXISTS operating_sessions (
                id TEXT PRIMARY KEY,
                plate TEXT NOT NULL,
                company TEXT NOT NULL,
                cost_code TEXT NOT NULL,
                unmapped INTEGER NOT NULL DEFAULT 0,
                session_date TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                opening_fuel REAL NOT NULL,
                closing_fuel REAL,
                operating_hours REAL NOT NULL DEFAULT 0,
                fuel_used_liters REAL NOT NULL DEFAULT 0,
                fuel_filled_liters REAL NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                notes TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_ongoing
                ON operating_sessions(plate) WHERE status = 'ONGOING';
            CREATE INDEX IF NOT EXISTS idx_sessions_plate_date
                ON operating_sessions(plate, session_date);
            CREATE INDEX IF NOT EXISTS idx_sessions_start ON operating_sessions(start_time);

            CREATE TABLE IF NOT EXISTS fuel_fill_events (
                id TEXT PRIMARY KEY,
                plate TEXT NOT NULL,
                fill_start_time TEXT NOT NULL,
                fill_end_time TEXT NOT NULL,
                fuel_before REAL NOT NULL,
                fuel_after REAL NOT NULL,
                fill_amount REAL NOT NULL,
                detection_method TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_fills_plate_start
                ON fuel_fill_events(plate, fill_start_time);

            -- Append-only audit trail
            CREATE TABLE IF NOT EXISTS activity_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                plate TEXT NOT NULL,
                kind TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                detail TEXT,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_activity_plate ON activity_log(plate, seq);
            ",
        )?;
        Ok(())
    }

    /// Inserts a session unless its ID exists or the plate already has a
    /// different ONGOING session.
    pub fn create_session(&mut self, session: &OperatingSession) -> Result<CreateOutcome, DbError> {
        let now = format_timestamp(Utc::now());
        let tx = self.conn.transaction()?;

        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM operating_sessions WHERE id = ?",
                [session.id.as_str()],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if exists {
            return Ok(CreateOutcome::AlreadyExists);
        }
        if session.status == SessionStatus::Ongoing {
            if let Some(existing) = ongoing_session_id(&tx, &session.plate)? {
                return Ok(CreateOutcome::Conflict(existing));
            }
        }

        tx.execute(
            "
            INSERT INTO operating_sessions (
                id, plate, company, cost_code, unmapped, session_date, start_time, end_time,
                opening_fuel, closing_fuel, operating_hours, fuel_used_liters,
                fuel_filled_liters, cost, status, notes, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
            params![
                session.id.as_str(),
                session.plate.as_str(),
                session.company,
                session.cost_code,
                session.unmapped,
                format_date(session.session_date),
                format_timestamp(session.start_time),
                session.end_time.map(format_timestamp),
                session.opening_fuel,
                session.closing_fuel,
                session.operating_hours,
                session.fuel_used_liters,
                session.fuel_filled_liters,
                session.cost,
                session.status.as_str(),
                session.notes,
                now,
                now,
            ],
        )?;
        tx.commit()?;
        Ok(CreateOutcome::Created)
    }

    /// Applies `patch` only while the row still has `expected` status.
    pub fn update_session(
        &self,
        id: &SessionId,
        expected: SessionStatus,
        patch: &SessionPatch,
    ) -> Result<UpdateOutcome, DbError> {
        if update_conditional(&self.conn, id, expected, patch, Utc::now())? {
            return Ok(UpdateOutcome::Applied);
        }
        match session_status(&self.conn, id)? {
            None => Ok(UpdateOutcome::NotFound),
            Some(actual) if patch.status == Some(actual) => Ok(UpdateOutcome::AlreadyApplied),
            Some(actual) => Ok(UpdateOutcome::StatusMismatch(actual)),
        }
    }

    /// Inserts or replaces a fill event by ID.
    pub fn upsert_fill_event(&self, fill: &FuelFillEvent) -> Result<(), DbError> {
        upsert_fill(&self.conn, fill, Utc::now())
    }

    /// Appends one audit entry.
    pub fn append_activity(&self, entry: &ActivityLogEntry) -> Result<(), DbError> {
        append_activity(&self.conn, entry, Utc::now())
    }

    pub fn get_session(&self, id: &SessionId) -> Result<Option<OperatingSession>, DbError> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM operating_sessions WHERE id = ?");
        self.conn
            .query_row(&query, [id.as_str()], read_session_row)
            .optional()?
            .map(SessionRow::into_session)
            .transpose()
    }

    /// The plate's ONGOING session. If storage somehow holds more than one,
    /// the earliest is returned.
    pub fn ongoing_session(&self, plate: &Plate) -> Result<Option<OperatingSession>, DbError> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM operating_sessions
             WHERE plate = ? AND status = 'ONGOING'
             ORDER BY start_time, id LIMIT 1"
        );
        self.conn
            .query_row(&query, [plate.as_str()], read_session_row)
            .optional()?
            .map(SessionRow::into_session)
            .transpose()
    }

    /// Lists sessions ordered by plate, then start time.
    pub fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<OperatingSession>, DbError> {
        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();
        if let Some(plate) = &filter.plate {
            clauses.push("plate = ?");
            values.push(plate.to_string());
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(status.as_str().to_string());
        }
        if let Some(from) = filter.from {
            clauses.push("start_time >= ?");
            values.push(format_timestamp(from));
        }
        if let Some(to) = filter.to {
            clauses.push("start_time < ?");
            values.push(format_timestamp(to));
        }
        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM operating_sessions {where_clause}
             ORDER BY plate, start_time, id"
        );

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), read_session_row)?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?.into_session()?);
        }
        Ok(sessions)
    }

    /// Lists fill events ordered by plate, then start time.
    pub fn list_fills(
        &self,
        plate: Option<&Plate>,
        from: Option<DateTime<Utc>>,
    ) -> Result<Vec<FuelFillEvent>, DbError> {
        let query = format!(
            "SELECT {FILL_COLUMNS} FROM fuel_fill_events
             WHERE (?1 IS NULL OR plate = ?1) AND (?2 IS NULL OR fill_start_time >= ?2)
             ORDER BY plate, fill_start_time, id"
        );
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(
            params![plate.map(Plate::as_str), from.map(format_timestamp)],
            read_fill_row,
        )?;
        let mut fills = Vec::new();
        for row in rows {
            fills.push(row?.into_fill()?);
        }
        Ok(fills)
    }

    /// Most recent audit entries first.
    pub fn list_activity(
        &self,
        plate: Option<&Plate>,
        limit: usize,
    ) -> Result<Vec<ActivityLogEntry>, DbError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT seq, plate, kind, timestamp, detail
            FROM activity_log
            WHERE (?1 IS NULL OR plate = ?1)
            ORDER BY seq DESC
            LIMIT ?2
            ",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![plate.map(Plate::as_str), limit], |row| {
            Ok(ActivityRow {
                seq: row.get(0)?,
                plate: row.get(1)?,
                kind: row.get(2)?,
                timestamp: row.get(3)?,
                detail: row.get(4)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    pub fn summary(&self) -> Result<StoreSummary, DbError> {
        let mut summary = StoreSummary::default();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT status, COUNT(*) FROM operating_sessions GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                let count = usize::try_from(count).unwrap_or_default();
                match status.parse::<SessionStatus>() {
                    Ok(SessionStatus::Ongoing) => summary.ongoing = count,
                    Ok(SessionStatus::Completed) => summary.completed = count,
                    Ok(SessionStatus::FuelFillCompleted) => summary.fuel_fill_completed = count,
                    Err(err) => tracing::warn!(%status, error = %err, "unexpected session status"),
                }
            }
        }
        summary.unmapped = count(&self.conn, "SELECT COUNT(*) FROM operating_sessions WHERE unmapped = 1")?;
        summary.fill_events = count(&self.conn, "SELECT COUNT(*) FROM fuel_fill_events")?;
        summary.activity_entries = count(&self.conn, "SELECT COUNT(*) FROM activity_log")?;
        summary.last_activity_at = self
            .conn
            .query_row("SELECT MAX(timestamp) FROM activity_log", [], |row| {
                row.get::<_, Option<String>>(0)
            })?
            .map(|ts| parse_timestamp(&ts, "activity_log", "max"))
            .transpose()?;
        Ok(summary)
    }
}

fn count(conn: &Connection, query: &str) -> Result<usize, DbError> {
    let value: i64 = conn.query_row(query, [], |row| row.get(0))?;
    Ok(usize::try_from(value).unwrap_or_default())
}

fn ongoing_session_id(conn: &Connection, plate: &Plate) -> Result<Option<SessionId>, DbError> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM operating_sessions WHERE plate = ? AND status = 'ONGOING'
             ORDER BY start_time, id LIMIT 1",
            [plate.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    id.map(|id| parse_session_id(id, "operating_sessions"))
        .transpose()
}

fn session_status(conn: &Connection, id: &SessionId) -> Result<Option<SessionStatus>, DbError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM operating_sessions WHERE id = ?",
            [id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    status
        .map(|status| {
            status.parse().map_err(|err: fw_core::ValidationError| DbError::InvalidRow {
                table: "operating_sessions",
                id: id.to_string(),
                message: err.to_string(),
            })
        })
        .transpose()
}

/// Conditional update shared by live ingest and the repair applier.
/// Returns whether a row matched `id` and `expected`.
fn update_conditional(
    conn: &Connection,
    id: &SessionId,
    expected: SessionStatus,
    patch: &SessionPatch,
    now: DateTime<Utc>,
) -> Result<bool, DbError> {
    let changed = conn.execute(
        "
        UPDATE operating_sessions SET
            start_time = COALESCE(?1, start_time),
            session_date = COALESCE(?2, session_date),
            end_time = COALESCE(?3, end_time),
            opening_fuel = COALESCE(?4, opening_fuel),
            closing_fuel = COALESCE(?5, closing_fuel),
            operating_hours = COALESCE(?6, operating_hours),
            fuel_used_liters = COALESCE(?7, fuel_used_liters),
            fuel_filled_liters = COALESCE(?8, fuel_filled_liters),
            cost = COALESCE(?9, cost),
            status = COALESCE(?10, status),
            notes = COALESCE(?11, notes),
            updated_at = ?12
        WHERE id = ?13 AND status = ?14
        ",
        params![
            patch.start_time.map(format_timestamp),
            patch.start_time.map(|start| format_date(start.date_naive())),
            patch.end_time.map(format_timestamp),
            patch.opening_fuel,
            patch.closing_fuel,
            patch.operating_hours,
            patch.fuel_used_liters,
            patch.fuel_filled_liters,
            patch.cost,
            patch.status.map(|status| status.as_str()),
            patch.notes,
            format_timestamp(now),
            id.as_str(),
            expected.as_str(),
        ],
    )?;
    Ok(changed > 0)
}

fn upsert_fill(conn: &Connection, fill: &FuelFillEvent, now: DateTime<Utc>) -> Result<(), DbError> {
    conn.execute(
        "
        INSERT INTO fuel_fill_events (
            id, plate, fill_start_time, fill_end_time, fuel_before, fuel_after,
            fill_amount, detection_method, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            fill_end_time = excluded.fill_end_time,
            fuel_before = excluded.fuel_before,
            fuel_after = excluded.fuel_after,
            fill_amount = excluded.fill_amount,
            detection_method = excluded.detection_method,
            updated_at = excluded.updated_at
        ",
        params![
            fill.id.as_str(),
            fill.plate.as_str(),
            format_timestamp(fill.fill_start_time),
            format_timestamp(fill.fill_end_time),
            fill.fuel_before,
            fill.fuel_after,
            fill.fill_amount,
            fill.detection_method.as_str(),
            format_timestamp(now),
        ],
    )?;
    Ok(())
}

fn append_activity(
    conn: &Connection,
    entry: &ActivityLogEntry,
    now: DateTime<Utc>,
) -> Result<(), DbError> {
    conn.execute(
        "INSERT INTO activity_log (plate, kind, timestamp, detail, recorded_at) VALUES (?, ?, ?, ?, ?)",
        params![
            entry.plate.as_str(),
            entry.kind.as_str(),
            format_timestamp(entry.timestamp),
            entry.detail,
            format_timestamp(now),
        ],
    )?;
    Ok(())
}

struct SessionRow {
    id: String,
    plate: String,
    company: String,
    cost_code: String,
    unmapped: bool,
    session_date: String,
    start_time: String,
    end_time: Option<String>,
    opening_fuel: f64,
    closing_fuel: Option<f64>,
    operating_hours: f64,
    fuel_used_liters: f64,
    fuel_filled_liters: f64,
    cost: f64,
    status: String,
    notes: Option<String>,
}

fn read_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        id: row.get(0)?,
        plate: row.get(1)?,
        company: row.get(2)?,
        cost_code: row.get(3)?,
        unmapped: row.get(4)?,
        session_date: row.get(5)?,
        start_time: row.get(6)?,
        end_time: row.get(7)?,
        opening_fuel: row.get(8)?,
        closing_fuel: row.get(9)?,
        operating_hours: row.get(10)?,
        fuel_used_liters: row.get(11)?,
        fuel_filled_liters: row.get(12)?,
        cost: row.get(13)?,
        status: row.get(14)?,
        notes: row.get(15)?,
    })
}

impl SessionRow {
    fn into_session(self) -> Result<OperatingSession, DbError> {
        const TABLE: &str = "operating_sessions";
        let invalid = |message: String| DbError::InvalidRow {
            table: TABLE,
            id: self.id.clone(),
            message,
        };
        let plate = Plate::new(self.plate.clone()).map_err(|e| invalid(e.to_string()))?;
        let status = self
            .status
            .parse::<SessionStatus>()
            .map_err(|e| invalid(e.to_string()))?;
        let session_date = NaiveDate::parse_from_str(&self.session_date, "%Y-%m-%d").map_err(
            |source| DbError::TimestampParse {
                table: TABLE,
                id: self.id.clone(),
                timestamp: self.session_date.clone(),
                source,
            },
        )?;
        let start_time = parse_timestamp(&self.start_time, TABLE, &self.id)?;
        let end_time = self
            .end_time
            .as_deref()
            .map(|ts| parse_timestamp(ts, TABLE, &self.id))
            .transpose()?;

        Ok(OperatingSession {
            id: parse_session_id(self.id, TABLE)?,
            plate,
            company: self.company,
            cost_code: self.cost_code,
            unmapped: self.unmapped,
            session_date,
            start_time,
            end_time,
            opening_fuel: self.opening_fuel,
            closing_fuel: self.closing_fuel,
            operating_hours: self.operating_hours,
            fuel_used_liters: self.fuel_used_liters,
            fuel_filled_liters: self.fuel_filled_liters,
            cost: self.cost,
            status,
            notes: self.notes,
        })
    }
}

struct FillRow {
    id: String,
    plate: String,
    fill_start_time: String,
    fill_end_time: String,
    fuel_before: f64,
    fuel_after: f64,
    fill_amount: f64,
    detection_method: String,
}

fn read_fill_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FillRow> {
    Ok(FillRow {
        id: row.get(0)?,
        plate: row.get(1)?,
        fill_start_time: row.get(2)?,
        fill_end_time: row.get(3)?,
        fuel_before: row.get(4)?,
        fuel_after: row.get(5)?,
        fill_amount: row.get(6)?,
        detection_method: row.get(7)?,
    })
}

impl FillRow {
    fn into_fill(self) -> Result<FuelFillEvent, DbError> {
        const TABLE: &str = "fuel_fill_events";
        let invalid = |message: String| DbError::InvalidRow {
            table: TABLE,
            id: self.id.clone(),
            message,
        };
        let plate = Plate::new(self.plate.clone()).map_err(|e| invalid(e.to_string()))?;
        let detection_method = self
            .detection_method
            .parse::<DetectionMethod>()
            .map_err(|e| invalid(e.to_string()))?;
        let id = FillId::new(self.id.clone()).map_err(|e| invalid(e.to_string()))?;
        Ok(FuelFillEvent {
            id,
            plate,
            fill_start_time: parse_timestamp(&self.fill_start_time, TABLE, &self.id)?,
            fill_end_time: parse_timestamp(&self.fill_end_time, TABLE, &self.id)?,
            fuel_before: self.fuel_before,
            fuel_after: self.fuel_after,
            fill_amount: self.fill_amount,
            detection_method,
        })
    }
}

struct ActivityRow {
    seq: i64,
    plate: String,
    kind: String,
    timestamp: String,
    detail: Option<String>,
}

impl ActivityRow {
    fn into_entry(self) -> Result<ActivityLogEntry, DbError> {
        const TABLE: &str = "activity_log";
        let id = self.seq.to_string();
        let invalid = |message: String| DbError::InvalidRow {
            table: TABLE,
            id: id.clone(),
            message,
        };
        let plate = Plate::new(self.plate).map_err(|e| invalid(e.to_string()))?;
        let kind = self
            .kind
            .parse::<ActivityKind>()
            .map_err(|e| invalid(e.to_string()))?;
        Ok(ActivityLogEntry {
            plate,
            kind,
            timestamp: parse_timestamp(&self.timestamp, TABLE, &id)?,
            detail: self.detail,
        })
    }
}

fn parse_session_id(id: String, table: &'static str) -> Result<SessionId, DbError> {
    SessionId::new(id.clone()).map_err(|err| DbError::InvalidRow {
        table,
        id,
        message: err.to_string(),
    })
}

fn parse_timestamp(timestamp: &str, table: &'static str, id: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|source| DbError::TimestampParse {
            table,
            id: id.to_string(),
            timestamp: timestamp.to_string(),
            source,
        })
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
