//! Tool configuration: a TOML file, environment variables, or both.
//!
//! Resolution order is the caller's concern (the CLI applies flags over
//! environment over file); this module only loads and validates.

use crate::error::{Error, Kind};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

pub const DEFAULT_TABLE: &str = "nomad_migrations";
pub const DEFAULT_DIR: &str = "migrations";
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_LOCK_ATTEMPT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Resolved tool configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection URL of the target database.
    pub url: Option<String>,
    /// Directory holding the migration files.
    pub dir: String,
    /// Name of the bookkeeping table.
    pub table: String,
    /// Schema holding the bookkeeping table (PostgreSQL only).
    pub schema: Option<String>,
    /// Tolerate checksum drift instead of failing.
    pub allow_drift: bool,
    /// Automatically skip the transaction for hazardous statements.
    pub auto_notx: bool,
    /// Overall budget for acquiring the migration lock.
    pub lock_timeout_ms: u64,
    /// Budget for a single lock attempt.
    pub lock_attempt_timeout_ms: u64,
    /// Budget for establishing a connection.
    pub connect_timeout_ms: u64,
    /// Emit the line-delimited JSON event stream on stdout.
    pub events: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            url: None,
            dir: DEFAULT_DIR.into(),
            table: DEFAULT_TABLE.into(),
            schema: None,
            allow_drift: false,
            auto_notx: false,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            lock_attempt_timeout_ms: DEFAULT_LOCK_ATTEMPT_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            events: false,
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    /// Load a Config from a TOML file on disk.
    pub fn from_file<P: AsRef<Path>>(location: P) -> Result<Config, Error> {
        let file = std::fs::read_to_string(&location).map_err(|err| {
            Error::new(Kind::ParseConfig(format!(
                "could not open config file, {}",
                err
            )))
        })?;

        let config: Config = toml::from_str(&file).map_err(|err| {
            Error::new(Kind::ParseConfig(format!(
                "could not parse config file, {}",
                err
            )))
        })?;

        Ok(config)
    }

    /// Overlay `NOMAD_*` environment variables onto this config.
    pub fn overlay_env(mut self) -> Result<Config, Error> {
        if let Ok(url) = env::var("NOMAD_DATABASE_URL") {
            self.url = Some(url);
        }
        if let Ok(dir) = env::var("NOMAD_MIGRATIONS_DIR") {
            self.dir = dir;
        }
        if let Ok(table) = env::var("NOMAD_TABLE") {
            self.table = table;
        }
        if let Ok(schema) = env::var("NOMAD_SCHEMA") {
            self.schema = Some(schema);
        }
        if let Ok(v) = env::var("NOMAD_ALLOW_DRIFT") {
            self.allow_drift = parse_bool("NOMAD_ALLOW_DRIFT", &v)?;
        }
        if let Ok(v) = env::var("NOMAD_AUTO_NOTX") {
            self.auto_notx = parse_bool("NOMAD_AUTO_NOTX", &v)?;
        }
        if let Ok(v) = env::var("NOMAD_LOCK_TIMEOUT_MS") {
            self.lock_timeout_ms = parse_ms("NOMAD_LOCK_TIMEOUT_MS", &v)?;
        }
        if let Ok(v) = env::var("NOMAD_EVENTS") {
            self.events = parse_bool("NOMAD_EVENTS", &v)?;
        }
        Ok(self)
    }

    pub fn set_url(mut self, url: &str) -> Config {
        self.url = Some(url.into());
        self
    }

    pub fn set_dir(mut self, dir: &str) -> Config {
        self.dir = dir.into();
        self
    }

    pub fn set_table(mut self, table: &str) -> Config {
        self.table = table.into();
        self
    }

    pub fn set_schema(mut self, schema: &str) -> Config {
        self.schema = Some(schema.into());
        self
    }

    /// The connection URL, or a config error naming what is missing.
    pub fn require_url(&self) -> Result<&str, Error> {
        self.url.as_deref().ok_or_else(|| {
            Error::new(Kind::ParseConfig(
                "no database url configured; set url in the config file, \
                 NOMAD_DATABASE_URL, or pass --url"
                    .into(),
            ))
        })
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::new(Kind::ParseConfig(format!(
            "{} must be a boolean, got {:?}",
            key, other
        )))),
    }
}

fn parse_ms(key: &str, value: &str) -> Result<u64, Error> {
    value.parse().map_err(|_| {
        Error::new(Kind::ParseConfig(format!(
            "{} must be an integer number of milliseconds, got {:?}",
            key, value
        )))
    })
}
