//! MySQL driver.
//!
//! Mutual exclusion goes through `GET_LOCK`, which accepts the full
//! 64-hex lock key (MySQL allows lock names up to 64 characters). MySQL
//! cannot run DDL transactionally, so the engine never wraps migrations
//! here; bookkeeping updates run as the final statements on the session.

use super::{quote_with, AppliedRecord, Connection, Driver, DriverConfig};
use crate::error::{Error, Kind};
use mysql::prelude::Queryable;
use mysql::{Conn, Error as MyError, Opts, OptsBuilder};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const ENSURE_TABLE: &str = "CREATE TABLE IF NOT EXISTS %TABLE% (
    version BIGINT PRIMARY KEY,
    name TEXT NOT NULL,
    checksum TEXT NOT NULL,
    applied_at TIMESTAMP NULL DEFAULT NULL,
    rolled_back_at TIMESTAMP NULL DEFAULT NULL
)";

const FETCH_APPLIED: &str = "SELECT version, name, checksum, \
        DATE_FORMAT(applied_at, '%Y-%m-%dT%H:%i:%SZ'), \
        DATE_FORMAT(rolled_back_at, '%Y-%m-%dT%H:%i:%SZ') \
    FROM %TABLE% WHERE applied_at IS NOT NULL ORDER BY version ASC";

const MARK_APPLIED: &str = "INSERT INTO %TABLE% (version, name, checksum, applied_at, rolled_back_at) \
    VALUES (?, ?, ?, CURRENT_TIMESTAMP, NULL) \
    ON DUPLICATE KEY UPDATE \
        name = VALUES(name), \
        checksum = VALUES(checksum), \
        applied_at = CURRENT_TIMESTAMP, \
        rolled_back_at = NULL";

const MARK_ROLLED_BACK: &str =
    "UPDATE %TABLE% SET rolled_back_at = CURRENT_TIMESTAMP WHERE version = ?";

// Server error codes that mean the connection target is wrong rather than
// a statement: access denied, unknown database, host not allowed.
const CONNECTION_CODES: &[u16] = &[1044, 1045, 1049, 1130];

pub struct MysqlDriver {
    config: DriverConfig,
}

impl MysqlDriver {
    pub fn new(config: DriverConfig) -> Self {
        MysqlDriver { config }
    }
}

impl Driver for MysqlDriver {
    fn supports_transactional_ddl(&self) -> bool {
        false
    }

    fn connect(&self) -> Result<Box<dyn Connection>, Error> {
        let opts = Opts::from_url(&self.config.url)
            .map_err(|e| Error::new(Kind::InvalidUrl(e.to_string())))?;
        let opts = OptsBuilder::from_opts(opts)
            .tcp_connect_timeout(Some(Duration::from_millis(self.config.connect_timeout_ms)));
        let conn = Conn::new(opts).map_err(map_error)?;
        Ok(Box::new(MysqlConnection {
            conn,
            table: quote_with(&self.config.table, '`'),
        }))
    }

    fn quote_ident(&self, name: &str) -> String {
        quote_with(name, '`')
    }
}

struct MysqlConnection {
    conn: Conn,
    table: String,
}

impl MysqlConnection {
    fn sql(&self, template: &str) -> String {
        template.replace("%TABLE%", &self.table)
    }
}

impl Connection for MysqlConnection {
    fn probe(&mut self) -> Result<(), Error> {
        self.conn.query_drop("SELECT 1").map_err(map_error)
    }

    fn ensure_migrations_table(&mut self) -> Result<(), Error> {
        self.conn
            .query_drop(self.sql(ENSURE_TABLE))
            .map_err(map_error)
    }

    fn fetch_applied_migrations(&mut self) -> Result<Vec<AppliedRecord>, Error> {
        let rows: Vec<(i64, String, String, String, Option<String>)> = self
            .conn
            .query(self.sql(FETCH_APPLIED))
            .map_err(map_error)?;
        let mut applied = Vec::with_capacity(rows.len());
        for (version, name, checksum, applied_at, rolled_back_at) in rows {
            // safe to call unwrap, DATE_FORMAT above always produces RFC 3339
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
            .exec_drop(self.sql(MARK_APPLIED), (version as i64, name, checksum))
            .map_err(map_error)
    }

    fn mark_rolled_back(&mut self, version: u64) -> Result<(), Error> {
        self.conn
            .exec_drop(self.sql(MARK_ROLLED_BACK), (version as i64,))
            .map_err(map_error)
    }

    fn acquire_lock(&mut self, key: &str, _attempt_timeout_ms: u64) -> Result<bool, Error> {
        // GET_LOCK with timeout 0 returns immediately; NULL means the
        // server could not even attempt the lock
        let acquired: Option<Option<i64>> = self
            .conn
            .exec_first("SELECT GET_LOCK(?, 0)", (key,))
            .map_err(map_error)?;
        Ok(acquired.flatten() == Some(1))
    }

    fn release_lock(&mut self, key: &str) -> Result<(), Error> {
        self.conn
            .exec_drop("SELECT RELEASE_LOCK(?)", (key,))
            .map_err(map_error)
    }

    fn begin_transaction(&mut self) -> Result<(), Error> {
        self.conn.query_drop("START TRANSACTION").map_err(map_error)
    }

    fn commit_transaction(&mut self) -> Result<(), Error> {
        self.conn.query_drop("COMMIT").map_err(map_error)
    }

    fn rollback_transaction(&mut self) -> Result<(), Error> {
        self.conn.query_drop("ROLLBACK").map_err(map_error)
    }

    fn run_statement(&mut self, sql: &str) -> Result<(), Error> {
        self.conn.query_drop(sql).map_err(map_error)
    }
}

fn map_error(err: MyError) -> Error {
    match err {
        MyError::MySqlError(ref server) if !CONNECTION_CODES.contains(&server.code) => {
            Error::new(Kind::Sql {
                message: server.message.clone(),
                sqlstate: Some(server.state.clone()),
                position: None,
                path: None,
                line: 0,
                column: 0,
                sql: String::new(),
            })
        }
        other => Error::new(Kind::Connection(
            "error communicating with the database".into(),
            Box::new(other),
        )),
    }
}
