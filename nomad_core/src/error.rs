use std::fmt;
use std::path::PathBuf;
use thiserror::Error as TError;

/// An Error occurred during a migration cycle
#[derive(Debug)]
pub struct Error {
    kind: Box<Kind>,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            kind: Box::new(kind),
        }
    }

    /// Return the kind of error occurred
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub(crate) fn into_kind(self) -> Kind {
        *self.kind
    }

    /// Stable process exit code for this error, used by the CLI.
    pub fn exit_code(&self) -> i32 {
        match &*self.kind {
            Kind::Sql { .. } => 1,
            Kind::Drift { .. } => 2,
            Kind::LockTimeout { .. } => 3,
            Kind::ParseConfig(_) => 4,
            Kind::MissingFile { .. } => 5,
            Kind::ChecksumMismatch { .. } => 6,
            Kind::Connection(_, _) | Kind::InvalidUrl(_) => 7,
            Kind::Interrupted => 130,
            _ => 10,
        }
    }

    /// Source location of a failed statement, when the error carries one.
    pub fn location(&self) -> Option<(&PathBuf, u32, u32)> {
        match &*self.kind {
            Kind::Sql {
                path: Some(path),
                line,
                column,
                ..
            } => Some((path, *line, *column)),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some((path, line, column)) = self.location() {
            write!(f, "{}:{}:{}: {}", path.display(), line, column, self.kind)
        } else {
            write!(f, "{}", self.kind)
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.kind.source()
    }
}

/// Enum listing possible errors from the migration engine.
#[derive(Debug, TError)]
pub enum Kind {
    /// The database rejected a statement
    #[error("{message}")]
    Sql {
        message: String,
        sqlstate: Option<String>,
        /// Backend-reported 1-based character offset into the statement.
        /// Consumed by the engine when it folds driver errors onto file
        /// positions; cleared afterwards.
        position: Option<u32>,
        path: Option<PathBuf>,
        line: u32,
        column: u32,
        sql: String,
    },
    /// At least one applied migration's checksum no longer matches its file
    #[error("checksum drift detected for migration(s): {}", versions.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    Drift { versions: Vec<u64> },
    /// The exclusive migration lock could not be acquired within the budget
    #[error("could not acquire migration lock within {budget_ms}ms")]
    LockTimeout { budget_ms: u64 },
    /// An Error parsing nomad config
    #[error("error parsing config: {0}")]
    ParseConfig(String),
    /// An applied migration has no corresponding file on disk
    #[error("applied migration(s) missing from the filesystem: {}", versions.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
    MissingFile { versions: Vec<u64> },
    /// Migration content changed between planning and apply-time verification
    #[error("checksum mismatch for migration {version}: expected {expected}, found {found}")]
    ChecksumMismatch {
        version: u64,
        expected: String,
        found: String,
    },
    /// An Error from an underlying database connection
    #[error("`{0}`, `{1}`")]
    Connection(String, #[source] Box<dyn std::error::Error + Sync + Send>),
    /// The connection URL could not be understood
    #[error("invalid database url: {0}")]
    InvalidUrl(String),
    /// The operation was cut short by an interrupt signal
    #[error("interrupted")]
    Interrupted,
    /// An Error from an invalid file name migration
    #[error("invalid migration file name {0}, must be in the format {{14-digit version}}_{{name}}.sql")]
    InvalidName(String),
    /// Migration versions must be unique
    #[error("migration version {0} is repeated, migration versions must be unique")]
    RepeatedVersion(u64),
    /// An Error from an invalid migrations path location
    #[error("invalid migrations path {0}, {1}")]
    InvalidMigrationPath(PathBuf, std::io::Error),
    /// An Error from an invalid migration file (not readable, not UTF-8 etc)
    #[error("invalid migration file at path {0}, {1}")]
    InvalidMigrationFile(PathBuf, std::io::Error),
    /// A migration cannot run, e.g. hazardous statements inside a transaction
    #[error("{0}")]
    Unsupported(String),
    /// Conflicts reported by the planner, e.g. rollback without a down file
    #[error("cannot build plan: {}", reasons.join("; "))]
    Plan { reasons: Vec<String> },
}

// Helper trait for classifying driver-native errors as connection failures.
pub trait WrapConnectionError<T, E> {
    fn connect_err(self, msg: &str) -> Result<T, Error>;
}

impl<T, E> WrapConnectionError<T, E> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn connect_err(self, msg: &str) -> Result<T, Error> {
        self.map_err(|err| Error::new(Kind::Connection(msg.into(), Box::new(err))))
    }
}
