//! PostgreSQL driver.
//!
//! Uses session-scoped advisory locks for mutual exclusion and supports
//! transactional DDL, so migrations normally run with their bookkeeping
//! update in one transaction.

use super::{quote_with, AppliedRecord, Connection, Driver, DriverConfig};
use crate::error::{Error, Kind};
use crate::lockkey;
use postgres::error::ErrorPosition;
use postgres::{Client, Config as PgConfig, Error as PgError, NoTls};
use std::time::Duration;
use time::OffsetDateTime;

const ENSURE_TABLE: &str = "CREATE TABLE IF NOT EXISTS %TABLE% (
    version BIGINT PRIMARY KEY,
    name TEXT NOT NULL,
    checksum TEXT NOT NULL,
    applied_at TIMESTAMPTZ,
    rolled_back_at TIMESTAMPTZ
)";

const FETCH_APPLIED: &str = "SELECT version, name, checksum, applied_at, rolled_back_at \
    FROM %TABLE% WHERE applied_at IS NOT NULL ORDER BY version ASC";

const MARK_APPLIED: &str = "INSERT INTO %TABLE% (version, name, checksum, applied_at, rolled_back_at) \
    VALUES ($1, $2, $3, now(), NULL) \
    ON CONFLICT (version) DO UPDATE SET \
        name = EXCLUDED.name, \
        checksum = EXCLUDED.checksum, \
        applied_at = now(), \
        rolled_back_at = NULL";

const MARK_ROLLED_BACK: &str =
    "UPDATE %TABLE% SET rolled_back_at = now() WHERE version = $1";

pub struct PostgresDriver {
    config: DriverConfig,
}

impl PostgresDriver {
    pub fn new(config: DriverConfig) -> Self {
        PostgresDriver { config }
    }

    fn qualified_table(&self) -> String {
        match &self.config.schema {
            Some(schema) => format!(
                "{}.{}",
                self.quote_ident(schema),
                self.quote_ident(&self.config.table)
            ),
            None => self.quote_ident(&self.config.table),
        }
    }
}

impl Driver for PostgresDriver {
    fn supports_transactional_ddl(&self) -> bool {
        true
    }

    fn connect(&self) -> Result<Box<dyn Connection>, Error> {
        let mut pg_config: PgConfig = self
            .config
            .url
            .parse()
            .map_err(|e: PgError| Error::new(Kind::InvalidUrl(e.to_string())))?;
        pg_config.connect_timeout(Duration::from_millis(self.config.connect_timeout_ms));
        let client = pg_config.connect(NoTls).map_err(map_error)?;
        Ok(Box::new(PostgresConnection {
            client,
            table: self.qualified_table(),
        }))
    }

    fn quote_ident(&self, name: &str) -> String {
        quote_with(name, '"')
    }
}

struct PostgresConnection {
    client: Client,
    table: String,
}

impl PostgresConnection {
    fn sql(&self, template: &str) -> String {
        template.replace("%TABLE%", &self.table)
    }
}

impl Connection for PostgresConnection {
    fn probe(&mut self) -> Result<(), Error> {
        self.client.batch_execute("SELECT 1").map_err(map_error)
    }

    fn ensure_migrations_table(&mut self) -> Result<(), Error> {
        self.client
            .batch_execute(&self.sql(ENSURE_TABLE))
            .map_err(map_error)
    }

    fn fetch_applied_migrations(&mut self) -> Result<Vec<AppliedRecord>, Error> {
        let rows = self
            .client
            .query(&self.sql(FETCH_APPLIED), &[])
            .map_err(map_error)?;
        let mut applied = Vec::with_capacity(rows.len());
        for row in rows {
            let version: i64 = row.get(0);
            let applied_at: OffsetDateTime = row.get(3);
            let rolled_back_at: Option<OffsetDateTime> = row.get(4);
            applied.push(AppliedRecord {
                version: version as u64,
                name: row.get(1),
                checksum: row.get(2),
                applied_at,
                rolled_back_at,
            });
        }
        Ok(applied)
    }

    fn mark_applied(&mut self, version: u64, name: &str, checksum: &str) -> Result<(), Error> {
        self.client
            .execute(
                &self.sql(MARK_APPLIED),
                &[&(version as i64), &name, &checksum],
            )
            .map(|_| ())
            .map_err(map_error)
    }

    fn mark_rolled_back(&mut self, version: u64) -> Result<(), Error> {
        self.client
            .execute(&self.sql(MARK_ROLLED_BACK), &[&(version as i64)])
            .map(|_| ())
            .map_err(map_error)
    }

    fn acquire_lock(&mut self, key: &str, _attempt_timeout_ms: u64) -> Result<bool, Error> {
        // pg_try_advisory_lock never blocks, the per-attempt timeout is moot
        let row = self
            .client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&lockkey::narrow(key)])
            .map_err(map_error)?;
        Ok(row.get(0))
    }

    fn release_lock(&mut self, key: &str) -> Result<(), Error> {
        self.client
            .query_one("SELECT pg_advisory_unlock($1)", &[&lockkey::narrow(key)])
            .map(|_| ())
            .map_err(map_error)
    }

    fn begin_transaction(&mut self) -> Result<(), Error> {
        self.client.batch_execute("BEGIN").map_err(map_error)
    }

    fn commit_transaction(&mut self) -> Result<(), Error> {
        self.client.batch_execute("COMMIT").map_err(map_error)
    }

    fn rollback_transaction(&mut self) -> Result<(), Error> {
        self.client.batch_execute("ROLLBACK").map_err(map_error)
    }

    fn run_statement(&mut self, sql: &str) -> Result<(), Error> {
        self.client.batch_execute(sql).map_err(map_error)
    }
}

// SQLSTATE classes that are connection problems rather than statement
// problems: invalid authorization (28xxx), unknown database (3D000),
// connection exceptions (08xxx).
fn is_connection_state(code: &str) -> bool {
    code.starts_with("28") || code.starts_with("08") || code == "3D000"
}

fn map_error(err: PgError) -> Error {
    if let Some(db) = err.as_db_error() {
        let code = db.code().code().to_string();
        let message = db.message().to_string();
        let position = db.position().and_then(|p| match p {
            ErrorPosition::Original(n) => Some(*n),
            ErrorPosition::Internal { .. } => None,
        });
        if !is_connection_state(&code) {
            return Error::new(Kind::Sql {
                message,
                sqlstate: Some(code),
                position,
                path: None,
                line: 0,
                column: 0,
                sql: String::new(),
            });
        }
        return Error::new(Kind::Connection(message, Box::new(err)));
    }
    Error::new(Kind::Connection(
        "error communicating with the database".into(),
        Box::new(err),
    ))
}
