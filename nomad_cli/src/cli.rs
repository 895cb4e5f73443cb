//! Command-line surface: argument definitions and dispatch into the engine.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nomad_core::engine::Engine;
use nomad_core::planner::{PlanOptions, TagFilter};
use nomad_core::{Config, Plan, Report};
use std::collections::BTreeSet;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nomad", version)]
#[command(about = "SQL schema migrations from plain .sql files")]
pub struct Cli {
    #[command(flatten)]
    pub globals: Globals,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args)]
pub struct Globals {
    /// Path to a nomad.toml config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Database connection URL
    #[arg(long, global = true)]
    pub url: Option<String>,

    /// Directory containing migration files
    #[arg(long, global = true)]
    pub dir: Option<String>,

    /// Name of the bookkeeping table
    #[arg(long, global = true)]
    pub table: Option<String>,

    /// Schema holding the bookkeeping table (PostgreSQL)
    #[arg(long, global = true)]
    pub schema: Option<String>,

    /// Emit line-delimited JSON events on stdout
    #[arg(long, global = true)]
    pub events: bool,

    /// Tolerate checksum drift instead of failing
    #[arg(long, global = true)]
    pub allow_drift: bool,

    /// Skip the transaction automatically for hazardous statements
    #[arg(long, global = true)]
    pub auto_notx: bool,

    /// Overall lock acquisition budget in milliseconds
    #[arg(long, global = true)]
    pub lock_timeout: Option<u64>,
}

#[derive(Args, Clone, Default)]
pub struct SelectionArgs {
    /// Only migrations carrying one of these tags (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Only migrations carrying at least one tag
    #[arg(long)]
    pub only_tagged: bool,

    /// Include untagged prerequisites of the selected migrations
    #[arg(long)]
    pub include_ancestors: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Apply pending migrations
    Up {
        /// Apply at most this many migrations
        #[arg(long)]
        limit: Option<usize>,

        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Roll back applied migrations
    Down {
        /// Roll back this many migrations
        #[arg(long, default_value_t = 1)]
        count: usize,

        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Migrate forward or backward to an exact version
    To {
        /// Target version (14-digit timestamp)
        version: u64,
    },
    /// Roll back and re-apply the last applied migration
    Redo,
    /// Show each migration's state against the database
    Status {
        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Check recorded checksums against the files on disk
    Verify,
    /// Preview what an operation would run
    Plan {
        #[command(subcommand)]
        target: PlanTarget,
    },
}

#[derive(Subcommand)]
pub enum PlanTarget {
    /// Preview pending migrations
    Up {
        #[arg(long)]
        limit: Option<usize>,

        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Preview a rollback
    Down {
        #[arg(long, default_value_t = 1)]
        count: usize,

        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Preview a jump to an exact version
    To { version: u64 },
}

impl SelectionArgs {
    fn filter(&self) -> Option<TagFilter> {
        if self.tags.is_empty() && !self.only_tagged {
            return None;
        }
        let tags: BTreeSet<String> = self
            .tags
            .iter()
            .filter(|t| !t.is_empty())
            .map(|t| t.trim().to_lowercase())
            .collect();
        Some(TagFilter {
            tags: (!tags.is_empty()).then_some(tags),
            only_tagged: self.only_tagged,
        })
    }

    fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            filter: self.filter(),
            include_ancestors: self.include_ancestors,
            ..PlanOptions::default()
        }
    }
}

pub fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli.globals)?;
    let mut engine = Engine::from_config(&config)?;

    match cli.command {
        Command::Up { limit, selection } => {
            let mut opts = selection.plan_options();
            opts.limit = limit;
            let report = engine.up(&opts)?;
            print_report(&report);
        }
        Command::Down { count, selection } => {
            let mut opts = selection.plan_options();
            opts.count = Some(count);
            let report = engine.down(&opts)?;
            print_report(&report);
        }
        Command::To { version } => {
            let report = engine.migrate_to(version)?;
            print_report(&report);
        }
        Command::Redo => {
            let report = engine.redo()?;
            print_report(&report);
        }
        Command::Status { selection } => {
            let filter = selection.filter();
            let report = engine.status(filter.as_ref())?;
            println!("database: {}", engine.redacted_url());
            for row in &report.rows {
                let drift_note = if row.has_drift { "  (drift tolerated)" } else { "" };
                println!("{:>14}  {:<20}  {}{}", row.version, row.state, row.name, drift_note);
            }
            for version in &report.missing {
                println!("{:>14}  {:<20}  (file missing)", version, "missing");
            }
        }
        Command::Verify => {
            let report = engine.verify()?;
            if report.valid {
                println!("ok: all applied migrations match their files");
            } else {
                for version in &report.drifted {
                    println!("drifted: {}", version);
                }
                for version in &report.missing {
                    println!("missing: {}", version);
                }
                println!(
                    "invalid: {} drifted, {} missing",
                    report.drift_count, report.missing_count
                );
            }
        }
        Command::Plan { target } => {
            let plan = match target {
                PlanTarget::Up { limit, selection } => {
                    let mut opts = selection.plan_options();
                    opts.limit = limit;
                    engine.plan_up(&opts)?
                }
                PlanTarget::Down { count, selection } => {
                    let mut opts = selection.plan_options();
                    opts.count = Some(count);
                    engine.plan_down(&opts)?
                }
                PlanTarget::To { version } => engine.plan_to(version)?,
            };
            print_plan(&plan)?;
        }
    }
    Ok(())
}

fn resolve_config(globals: &Globals) -> Result<Config> {
    let mut config = match &globals.config {
        Some(path) => Config::from_file(path)?,
        None => {
            let default_path = PathBuf::from("nomad.toml");
            if default_path.is_file() {
                Config::from_file(&default_path)?
            } else {
                Config::new()
            }
        }
    };
    config = config.overlay_env().context("invalid environment value")?;

    if let Some(url) = &globals.url {
        config = config.set_url(url);
    }
    if let Some(dir) = &globals.dir {
        config = config.set_dir(dir);
    }
    if let Some(table) = &globals.table {
        config = config.set_table(table);
    }
    if let Some(schema) = &globals.schema {
        config = config.set_schema(schema);
    }
    if globals.events {
        config.events = true;
    }
    if globals.allow_drift {
        config.allow_drift = true;
    }
    if globals.auto_notx {
        config.auto_notx = true;
    }
    if let Some(timeout) = globals.lock_timeout {
        config.lock_timeout_ms = timeout;
    }
    Ok(config)
}

fn print_report(report: &Report) {
    let verb = match report.direction {
        nomad_core::Direction::Up => "applied",
        nomad_core::Direction::Down => "rolled back",
    };
    for migration in &report.completed {
        println!(
            "{} {} {} in {}ms",
            verb, migration.version, migration.name, migration.elapsed_ms
        );
    }
    println!("{} {} migration(s)", verb, report.completed.len());
}

fn print_plan(plan: &Plan) -> Result<()> {
    for warning in &plan.warnings {
        log::warn!("{}", warning);
    }
    if !plan.errors.is_empty() {
        for error in &plan.errors {
            eprintln!("error: {}", error);
        }
        anyhow::bail!("plan has {} error(s)", plan.errors.len());
    }

    println!("direction: {}", plan.direction);
    for migration in &plan.migrations {
        let tx_note = match &migration.reason {
            Some(reason) => format!("no transaction ({})", reason),
            None => "transaction".to_string(),
        };
        println!(
            "{:>14}  {:<30}  {} statement(s), {}",
            migration.version,
            migration.name,
            migration.statements.len(),
            tx_note
        );
    }
    println!(
        "total {}, transactional {}, non-transactional {}, hazards {}",
        plan.summary.total,
        plan.summary.transactional,
        plan.summary.non_transactional,
        plan.summary.hazard_count
    );
    Ok(())
}
