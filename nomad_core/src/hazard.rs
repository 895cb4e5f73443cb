//! Detection of statements that cannot run inside a transaction.
//!
//! Every hazard class is prefix-shaped, so detection runs on statements the
//! parser has already split and inspects only the leading keywords past any
//! leading comments. String and comment interiors can never match.

use crate::error::{Error, Kind};
use crate::parser::{self, Statement};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Statement classes PostgreSQL refuses to run inside a transaction block.
/// MySQL and SQLite currently contribute no classes of their own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HazardKind {
    CreateIndexConcurrently,
    DropIndexConcurrently,
    Reindex,
    Vacuum,
    Cluster,
    RefreshMaterializedViewConcurrently,
    AlterType,
    AlterSystem,
    CreateDatabase,
    DropDatabase,
    Tablespace,
}

impl fmt::Display for HazardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HazardKind::CreateIndexConcurrently => "CREATE_INDEX_CONCURRENTLY",
            HazardKind::DropIndexConcurrently => "DROP_INDEX_CONCURRENTLY",
            HazardKind::Reindex => "REINDEX",
            HazardKind::Vacuum => "VACUUM",
            HazardKind::Cluster => "CLUSTER",
            HazardKind::RefreshMaterializedViewConcurrently => {
                "REFRESH_MATERIALIZED_VIEW_CONCURRENTLY"
            }
            HazardKind::AlterType => "ALTER_TYPE",
            HazardKind::AlterSystem => "ALTER_SYSTEM",
            HazardKind::CreateDatabase => "CREATE_DATABASE",
            HazardKind::DropDatabase => "DROP_DATABASE",
            HazardKind::Tablespace => "TABLESPACE",
        };
        f.write_str(name)
    }
}

/// A hazardous statement and where it sits in the migration file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hazard {
    pub kind: HazardKind,
    pub line: u32,
    pub column: u32,
    pub statement: String,
}

fn prefix_table() -> &'static [(Regex, HazardKind)] {
    static TABLE: OnceLock<Vec<(Regex, HazardKind)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let entries: &[(&str, HazardKind)] = &[
            (
                r"^CREATE\s+(?:UNIQUE\s+)?INDEX\s+CONCURRENTLY\b",
                HazardKind::CreateIndexConcurrently,
            ),
            (
                r"^DROP\s+INDEX\s+CONCURRENTLY\b",
                HazardKind::DropIndexConcurrently,
            ),
            (r"^REINDEX\b", HazardKind::Reindex),
            (r"^VACUUM\b", HazardKind::Vacuum),
            (r"^CLUSTER\b", HazardKind::Cluster),
            (
                r"^REFRESH\s+MATERIALIZED\s+VIEW\s+CONCURRENTLY\b",
                HazardKind::RefreshMaterializedViewConcurrently,
            ),
            (r"^ALTER\s+TYPE\b", HazardKind::AlterType),
            (r"^ALTER\s+SYSTEM\b", HazardKind::AlterSystem),
            (r"^CREATE\s+DATABASE\b", HazardKind::CreateDatabase),
            (r"^DROP\s+DATABASE\b", HazardKind::DropDatabase),
            (
                r"^(?:CREATE|DROP|ALTER)\s+TABLESPACE\b",
                HazardKind::Tablespace,
            ),
        ];
        entries
            .iter()
            .map(|(pat, kind)| {
                (
                    Regex::new(&format!("(?is){}", pat)).unwrap(),
                    *kind,
                )
            })
            .collect()
    })
}

/// Classify already-split statements.
pub fn detect_in(statements: &[Statement]) -> Vec<Hazard> {
    let mut hazards = Vec::new();
    for stmt in statements {
        let Some(body) = leading_keywords(&stmt.sql) else {
            continue;
        };
        for (re, kind) in prefix_table() {
            if re.is_match(body) {
                hazards.push(Hazard {
                    kind: *kind,
                    line: stmt.line,
                    column: stmt.column,
                    statement: stmt.sql.clone(),
                });
                break;
            }
        }
    }
    hazards
}

/// Split raw SQL text and classify the resulting statements.
pub fn detect(sql_text: &str) -> Vec<Hazard> {
    detect_in(&parser::split_statements(sql_text))
}

// The statement past its leading comments and whitespace.
fn leading_keywords(sql: &str) -> Option<&str> {
    let mut rest = sql.trim_start();
    loop {
        if let Some(stripped) = rest.strip_prefix("--") {
            rest = stripped
                .split_once('\n')
                .map(|(_, tail)| tail)
                .unwrap_or("")
                .trim_start();
        } else if rest.starts_with("/*") {
            let mut depth = 0usize;
            let bytes = rest.as_bytes();
            let mut i = 0;
            while i < bytes.len() {
                if bytes[i..].starts_with(b"/*") {
                    depth += 1;
                    i += 2;
                } else if bytes[i..].starts_with(b"*/") {
                    depth -= 1;
                    i += 2;
                    if depth == 0 {
                        break;
                    }
                } else {
                    i += 1;
                }
            }
            rest = rest[i..].trim_start();
        } else {
            break;
        }
    }
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

/// The transaction decision for one migration section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxDecision {
    pub should_skip_transaction: bool,
    pub hazards_detected: Vec<Hazard>,
}

/// Decide whether a section may run inside a transaction.
///
/// A `notx` section always skips the transaction. Otherwise hazards either
/// force a skip (when `auto_notx` is enabled, with a warning) or fail the
/// migration with instructions to annotate the section.
pub fn validate(
    hazards: Vec<Hazard>,
    section_notx: bool,
    auto_notx: bool,
) -> Result<TxDecision, Error> {
    if section_notx {
        return Ok(TxDecision {
            should_skip_transaction: true,
            hazards_detected: hazards,
        });
    }
    if hazards.is_empty() {
        return Ok(TxDecision {
            should_skip_transaction: false,
            hazards_detected: hazards,
        });
    }
    let kinds = hazard_names(&hazards);
    if auto_notx {
        log::warn!(
            "statements cannot run in a transaction ({}), skipping transaction",
            kinds
        );
        return Ok(TxDecision {
            should_skip_transaction: true,
            hazards_detected: hazards,
        });
    }
    Err(Error::new(Kind::Unsupported(format!(
        "migration contains statements that cannot run inside a transaction ({}); \
         add `-- + nomad notx` to the section or enable auto-notx",
        kinds
    ))))
}

pub(crate) fn hazard_names(hazards: &[Hazard]) -> String {
    let mut names: Vec<String> = hazards.iter().map(|h| h.kind.to_string()).collect();
    names.dedup();
    names.join(", ")
}
