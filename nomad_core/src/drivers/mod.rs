//! Database drivers.
//!
//! The engine sees two capability interfaces and nothing else: a [`Driver`]
//! that knows how to open sessions against one backend, and a
//! [`Connection`] carrying the per-session operations (bookkeeping table,
//! exclusive lock, transaction control, statement execution). Each backend
//! classifies its own native errors into the crate taxonomy; raw driver
//! errors never cross this boundary.

#[cfg(feature = "mysql")]
mod mysql;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "sqlite")]
mod sqlite;

use crate::error::{Error, Kind};
use time::OffsetDateTime;

/// One row of the bookkeeping table with a non-null `applied_at`.
/// Rolled-back rows are kept, not deleted; `rolled_back_at` distinguishes.
#[derive(Clone, Debug)]
pub struct AppliedRecord {
    pub version: u64,
    pub name: String,
    pub checksum: String,
    pub applied_at: OffsetDateTime,
    pub rolled_back_at: Option<OffsetDateTime>,
}

/// Connection parameters shared by every backend.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub url: String,
    pub table: String,
    pub schema: Option<String>,
    pub connect_timeout_ms: u64,
}

/// A database backend. One value per process; sessions are checked out
/// with [`Driver::connect`] and returned by dropping them.
pub trait Driver {
    /// Whether DDL statements can run inside a transaction on this backend.
    fn supports_transactional_ddl(&self) -> bool;

    /// Open a session.
    fn connect(&self) -> Result<Box<dyn Connection>, Error>;

    /// Backend-correct identifier quoting, doubling the quote character.
    fn quote_ident(&self, name: &str) -> String;
}

/// One session against the target database. Dropping the value returns it;
/// any in-flight transaction is rolled back by the backend on close.
pub trait Connection {
    /// Cheap round-trip used before any real work.
    fn probe(&mut self) -> Result<(), Error>;

    /// Idempotently create the bookkeeping table.
    fn ensure_migrations_table(&mut self) -> Result<(), Error>;

    /// All rows with a non-null `applied_at`, ascending by version.
    fn fetch_applied_migrations(&mut self) -> Result<Vec<AppliedRecord>, Error>;

    /// Upsert by version: refresh `applied_at`, `name` and `checksum`,
    /// clear `rolled_back_at`.
    fn mark_applied(&mut self, version: u64, name: &str, checksum: &str) -> Result<(), Error>;

    /// Stamp `rolled_back_at`; the row stays.
    fn mark_rolled_back(&mut self, version: u64) -> Result<(), Error>;

    /// Try to take the exclusive migration lock. Returns whether it was
    /// acquired; never blocks past `attempt_timeout_ms`. Lock scope is
    /// this session.
    fn acquire_lock(&mut self, key: &str, attempt_timeout_ms: u64) -> Result<bool, Error>;

    /// Idempotent release of [`Connection::acquire_lock`].
    fn release_lock(&mut self, key: &str) -> Result<(), Error>;

    fn begin_transaction(&mut self) -> Result<(), Error>;
    fn commit_transaction(&mut self) -> Result<(), Error>;
    fn rollback_transaction(&mut self) -> Result<(), Error>;

    /// Execute one statement, classifying any backend error.
    fn run_statement(&mut self, sql: &str) -> Result<(), Error>;
}

/// Open the driver for a connection URL. Bare paths are SQLite databases.
pub fn open(config: DriverConfig) -> Result<Box<dyn Driver>, Error> {
    let scheme = match config.url.split_once("://") {
        Some((scheme, _)) => scheme.to_ascii_lowercase(),
        None => String::from("sqlite"),
    };

    match scheme.as_str() {
        "postgres" | "postgresql" => {
            cfg_if::cfg_if! {
                if #[cfg(feature = "postgres")] {
                    Ok(Box::new(self::postgres::PostgresDriver::new(config)))
                } else {
                    Err(scheme_not_compiled_in("postgres"))
                }
            }
        }
        "mysql" => {
            cfg_if::cfg_if! {
                if #[cfg(feature = "mysql")] {
                    Ok(Box::new(self::mysql::MysqlDriver::new(config)))
                } else {
                    Err(scheme_not_compiled_in("mysql"))
                }
            }
        }
        "sqlite" | "file" => {
            cfg_if::cfg_if! {
                if #[cfg(feature = "sqlite")] {
                    Ok(Box::new(self::sqlite::SqliteDriver::new(config)))
                } else {
                    Err(scheme_not_compiled_in("sqlite"))
                }
            }
        }
        other => Err(Error::new(Kind::InvalidUrl(format!(
            "unsupported database scheme \"{}\"",
            other
        )))),
    }
}

#[allow(dead_code)]
fn scheme_not_compiled_in(name: &str) -> Error {
    Error::new(Kind::InvalidUrl(format!(
        "support for {} databases is not compiled into this build",
        name
    )))
}

// Doubles `quote` inside `name` and wraps it. Shared by the backends.
pub(crate) fn quote_with(name: &str, quote: char) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push(quote);
    for c in name.chars() {
        if c == quote {
            out.push(quote);
        }
        out.push(c);
    }
    out.push(quote);
    out
}
