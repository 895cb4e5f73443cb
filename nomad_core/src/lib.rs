//! Core engine of the nomad SQL schema-migration tool.
//!
//! Migration files are plain SQL with `-- + nomad` directives; their
//! identity is a SHA-256 content checksum recorded in a bookkeeping table
//! inside the target database. The engine plans and executes forward and
//! backward moves through the version history under a per-database
//! exclusive lock, with transactional wrapping wherever the backend and
//! the statements allow it.

pub mod checksum;
pub mod config;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod events;
pub mod hazard;
pub mod lockkey;
pub mod parser;
pub mod planner;
pub mod store;

pub use crate::config::Config;
pub use crate::engine::{Engine, Report, StatusReport, VerifyReport};
pub use crate::error::Error;
pub use crate::events::Direction;
pub use crate::planner::{Plan, PlanOptions, TagFilter};

#[cfg(feature = "sqlite")]
pub use rusqlite;

#[cfg(feature = "postgres")]
pub use postgres;

#[cfg(feature = "mysql")]
pub use mysql;
