//! SQLite driver.
//!
//! SQLite has no server-side lock primitive, so mutual exclusion goes
//! through a dedicated `nomad_lock` table: acquiring is an `INSERT OR
//! FAIL` of the lock key, releasing is a `DELETE`. Schema changes here are
//! not reliably transactional, so the driver reports no transactional DDL
//! and migrations run statement by statement.

use super::{quote_with, AppliedRecord, Connection, Driver, DriverConfig};
use crate::error::{Error, Kind};
use rusqlite::{Connection as RqlConnection, Error as RqlError};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const ENSURE_TABLE: &str = "CREATE TABLE IF NOT EXISTS %TABLE% (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    checksum TEXT NOT NULL,
    applied_at TEXT,
    rolled_back_at TEXT
)";

const ENSURE_LOCK_TABLE: &str = "CREATE TABLE IF NOT EXISTS nomad_lock (
    lock_name TEXT PRIMARY KEY
)";

const FETCH_APPLIED: &str = "SELECT version, name, checksum, applied_at, rolled_back_at \
    FROM %TABLE% WHERE applied_at IS NOT NULL ORDER BY version ASC";

const MARK_APPLIED: &str = "INSERT INTO %TABLE% (version, name, checksum, applied_at, rolled_back_at) \
    VALUES (?1, ?2, ?3, ?4, NULL) \
    ON CONFLICT(version) DO UPDATE SET \
        name = excluded.name, \
        checksum = excluded.checksum, \
        applied_at = excluded.applied_at, \
        rolled_back_at = NULL";

const MARK_ROLLED_BACK: &str = "UPDATE %TABLE% SET rolled_back_at = ?1 WHERE version = ?2";

pub struct SqliteDriver {
    config: DriverConfig,
}

impl SqliteDriver {
    pub fn new(config: DriverConfig) -> Self {
        SqliteDriver { config }
    }

    fn db_path(&self) -> &str {
        let url = self.config.url.as_str();
        url.strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("file://"))
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url)
    }
}

impl Driver for SqliteDriver {
    fn supports_transactional_ddl(&self) -> bool {
        false
    }

    fn connect(&self) -> Result<Box<dyn Connection>, Error> {
        let conn = RqlConnection::open(self.db_path()).map_err(|e| {
            Error::new(Kind::Connection(
                format!("could not open sqlite database {}", self.db_path()),
                Box::new(e),
            ))
        })?;
        conn.busy_timeout(Duration::from_millis(self.config.connect_timeout_ms))
            .map_err(map_error)?;
        // the lock table must exist before acquire_lock, which runs ahead
        // of ensure_migrations_table in the engine prelude
        conn.execute_batch(ENSURE_LOCK_TABLE).map_err(map_error)?;
        Ok(Box::new(SqliteConnection {
            conn,
            table: quote_with(&self.config.table, '"'),
        }))
    }

    fn quote_ident(&self, name: &str) -> String {
        quote_with(name, '"')
    }
}

struct SqliteConnection {
    conn: RqlConnection,
    table: String,
}

impl SqliteConnection {
    fn sql(&self, template: &str) -> String {
        template.replace("%TABLE%", &self.table)
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

impl Connection for SqliteConnection {
    fn probe(&mut self) -> Result<(), Error> {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map(|_| ())
            .map_err(map_error)
    }

    fn ensure_migrations_table(&mut self) -> Result<(), Error> {
        self.conn
            .execute_batch(&self.sql(ENSURE_TABLE))
            .map_err(map_error)
    }

    fn fetch_applied_migrations(&mut self) -> Result<Vec<AppliedRecord>, Error> {
        let mut stmt = self
            .conn
            .prepare(&self.sql(FETCH_APPLIED))
            .map_err(map_error)?;
        let mut rows = stmt.query([]).map_err(map_error)?;
        let mut applied = Vec::new();
        while let Some(row) = rows.next().map_err(map_error)? {
            let version: i64 = row.get(0).map_err(map_error)?;
            let name: String = row.get(1).map_err(map_error)?;
            let checksum: String = row.get(2).map_err(map_error)?;
            let applied_at: String = row.get(3).map_err(map_error)?;
            let rolled_back_at: Option<String> = row.get(4).map_err(map_error)?;
            // safe to call unwrap, we stored it in RFC 3339 format
            let applied_at = OffsetDateTime::parse(&applied_at, &Rfc3339).unwrap();
            let rolled_back_at =
                rolled_back_at.map(|s| OffsetDateTime::parse(&s, &Rfc3339).unwrap());
            applied.push(AppliedRecord {
                version: version as u64,
                name,
                checksum,
                applied_at,
                rolled_back_at,
            });
        }
        Ok(applied)
    }

    fn mark_applied(&mut self, version: u64, name: &str, checksum: &str) -> Result<(), Error> {
        self.conn
            .execute(
                &self.sql(MARK_APPLIED),
                rusqlite::params![version as i64, name, checksum, now_rfc3339()],
            )
            .map(|_| ())
            .map_err(map_error)
    }

    fn mark_rolled_back(&mut self, version: u64) -> Result<(), Error> {
        self.conn
            .execute(
                &self.sql(MARK_ROLLED_BACK),
                rusqlite::params![now_rfc3339(), version as i64],
            )
            .map(|_| ())
            .map_err(map_error)
    }

    fn acquire_lock(&mut self, key: &str, _attempt_timeout_ms: u64) -> Result<bool, Error> {
        match self.conn.execute(
            "INSERT OR FAIL INTO nomad_lock (lock_name) VALUES (?1)",
            rusqlite::params![key],
        ) {
            Ok(_) => Ok(true),
            Err(RqlError::SqliteFailure(ffi_err, _))
                if ffi_err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(other) => Err(map_error(other)),
        }
    }

    fn release_lock(&mut self, key: &str) -> Result<(), Error> {
        self.conn
            .execute(
                "DELETE FROM nomad_lock WHERE lock_name = ?1",
                rusqlite::params![key],
            )
            .map(|_| ())
            .map_err(map_error)
    }

    fn begin_transaction(&mut self) -> Result<(), Error> {
        self.conn.execute_batch("BEGIN").map_err(map_error)
    }

    fn commit_transaction(&mut self) -> Result<(), Error> {
        self.conn.execute_batch("COMMIT").map_err(map_error)
    }

    fn rollback_transaction(&mut self) -> Result<(), Error> {
        self.conn.execute_batch("ROLLBACK").map_err(map_error)
    }

    fn run_statement(&mut self, sql: &str) -> Result<(), Error> {
        self.conn.execute_batch(sql).map_err(map_error)
    }
}

fn map_error(err: RqlError) -> Error {
    if let RqlError::SqliteFailure(_, ref message) = err {
        let message = message.clone().unwrap_or_else(|| err.to_string());
        return Error::new(Kind::Sql {
            message,
            sqlstate: None,
            position: None,
            path: None,
            line: 0,
            column: 0,
            sql: String::new(),
        });
    }
    Error::new(Kind::Connection(
        "error communicating with the database".into(),
        Box::new(err),
    ))
}
