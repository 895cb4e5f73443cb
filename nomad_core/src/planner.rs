//! Decides which migrations an operation would run, and how.
//!
//! The planner never touches the database: it reconciles the on-disk file
//! set against the currently-applied versions and produces an ordered,
//! annotated [`Plan`]. Execution and preview share the same plans.

use crate::events::Direction;
use crate::hazard::{self, Hazard};
use crate::parser::Statement;
use crate::store::MigrationFile;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Selects migrations by tag: any-match on `tags`, or every tagged file
/// when `only_tagged` is set.
#[derive(Clone, Debug, Default)]
pub struct TagFilter {
    pub tags: Option<BTreeSet<String>>,
    pub only_tagged: bool,
}

impl TagFilter {
    pub fn is_active(&self) -> bool {
        self.only_tagged || self.tags.as_ref().is_some_and(|t| !t.is_empty())
    }

    fn matches(&self, file: &MigrationFile) -> bool {
        file.parsed.matches_tags(self.tags.as_ref(), self.only_tagged)
    }
}

/// Driver capabilities and policy the planner folds into its annotations.
#[derive(Clone, Copy, Debug)]
pub struct PlanContext {
    pub supports_transactional_ddl: bool,
    pub auto_notx: bool,
}

#[derive(Clone, Debug, Default)]
pub struct PlanOptions {
    /// Take at most this many migrations off the front of an up plan.
    pub limit: Option<usize>,
    /// Take at most this many migrations off the front of a down plan.
    pub count: Option<usize>,
    pub filter: Option<TagFilter>,
    pub include_ancestors: bool,
}

/// One migration the plan would execute, with its transaction decision.
#[derive(Clone, Debug)]
pub struct PlannedMigration {
    pub version: u64,
    pub name: String,
    pub transaction: bool,
    /// Why `transaction` is false, when it is.
    pub reason: Option<String>,
    pub hazards: Vec<Hazard>,
    pub statements: Vec<Statement>,
}

#[derive(Clone, Debug, Default)]
pub struct PlanSummary {
    pub total: usize,
    pub transactional: usize,
    pub non_transactional: usize,
    pub hazard_count: usize,
}

#[derive(Clone, Debug)]
pub struct Plan {
    pub direction: Direction,
    pub migrations: Vec<PlannedMigration>,
    pub summary: PlanSummary,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    fn build(
        direction: Direction,
        migrations: Vec<PlannedMigration>,
        errors: Vec<String>,
        warnings: Vec<String>,
    ) -> Plan {
        let migrations = if errors.is_empty() {
            migrations
        } else {
            Vec::new()
        };
        let summary = PlanSummary {
            total: migrations.len(),
            transactional: migrations.iter().filter(|m| m.transaction).count(),
            non_transactional: migrations.iter().filter(|m| !m.transaction).count(),
            hazard_count: migrations.iter().map(|m| m.hazards.len()).sum(),
        };
        Plan {
            direction,
            migrations,
            summary,
            errors,
            warnings,
        }
    }
}

/// Plan pending migrations, ascending by version.
pub fn plan_up(
    files: &[Arc<MigrationFile>],
    applied: &BTreeSet<u64>,
    ctx: &PlanContext,
    opts: &PlanOptions,
) -> Plan {
    let pending: Vec<&Arc<MigrationFile>> = files
        .iter()
        .filter(|f| !applied.contains(&f.version))
        .collect();

    let mut warnings = Vec::new();
    let mut chosen: Vec<&Arc<MigrationFile>> = match opts.filter.as_ref().filter(|f| f.is_active())
    {
        Some(filter) => {
            let selected: BTreeSet<u64> = pending
                .iter()
                .filter(|f| filter.matches(f))
                .map(|f| f.version)
                .collect();
            match selected.iter().next().copied() {
                None => Vec::new(),
                Some(min_selected) if opts.include_ancestors => pending
                    .iter()
                    .filter(|f| f.version <= min_selected || selected.contains(&f.version))
                    .copied()
                    .collect(),
                Some(_) => {
                    let max_selected = *selected.iter().next_back().unwrap();
                    if pending
                        .iter()
                        .any(|f| !selected.contains(&f.version) && f.version < max_selected)
                    {
                        warnings.push(
                            "Tag filter excludes earlier pending migrations; \
                             use include-ancestors to include prerequisites."
                                .to_string(),
                        );
                    }
                    pending
                        .iter()
                        .filter(|f| selected.contains(&f.version))
                        .copied()
                        .collect()
                }
            }
        }
        None => pending,
    };

    if let Some(limit) = opts.limit {
        chosen.truncate(limit);
    }

    let migrations = chosen
        .into_iter()
        .map(|f| annotate(f, Direction::Up, ctx))
        .collect();
    Plan::build(Direction::Up, migrations, Vec::new(), warnings)
}

/// Plan a rollback of currently-applied migrations, descending by version.
/// With a tag filter the walk stops at the first non-matching migration so
/// the rollback stays contiguous from the head of history.
pub fn plan_down(
    files: &[Arc<MigrationFile>],
    applied_desc: &[u64],
    ctx: &PlanContext,
    opts: &PlanOptions,
) -> Plan {
    let by_version: HashMap<u64, &Arc<MigrationFile>> =
        files.iter().map(|f| (f.version, f)).collect();
    let filter = opts.filter.as_ref().filter(|f| f.is_active());

    let mut candidates: Vec<u64> = Vec::new();
    for &version in applied_desc {
        match filter {
            Some(filter) => match by_version.get(&version) {
                Some(file) if filter.matches(file) => candidates.push(version),
                // first non-match (or unknown file) ends the contiguous run
                _ => break,
            },
            None => candidates.push(version),
        }
    }

    if let Some(count) = opts.count {
        candidates.truncate(count);
    }

    let mut errors = Vec::new();
    let mut migrations = Vec::new();
    for version in candidates {
        match by_version.get(&version) {
            Some(file) => migrations.push(annotate(file, Direction::Down, ctx)),
            None => errors.push(format!(
                "cannot roll back {}: migration file is missing",
                version
            )),
        }
    }
    Plan::build(Direction::Down, migrations, errors, Vec::new())
}

/// Plan towards an exact version: rolls back above it or applies up to it.
pub fn plan_to(
    files: &[Arc<MigrationFile>],
    applied: &BTreeSet<u64>,
    target: u64,
    ctx: &PlanContext,
) -> Plan {
    let current = applied.iter().next_back().copied().unwrap_or(0);

    if target == current {
        return Plan::build(Direction::Up, Vec::new(), Vec::new(), Vec::new());
    }

    if target < current {
        let applied_desc: Vec<u64> = applied
            .iter()
            .rev()
            .copied()
            .filter(|v| *v > target)
            .collect();
        return plan_down(files, &applied_desc, ctx, &PlanOptions::default());
    }

    let mut migrations = Vec::new();
    for file in files {
        if file.version <= target && !applied.contains(&file.version) {
            migrations.push(annotate(file, Direction::Up, ctx));
        }
    }
    Plan::build(Direction::Up, migrations, Vec::new(), Vec::new())
}

// A one-migration plan, used by redo to drive each half of the cycle.
pub(crate) fn plan_single(file: &MigrationFile, direction: Direction, ctx: &PlanContext) -> Plan {
    let annotated = annotate(file, direction, ctx);
    Plan::build(direction, vec![annotated], Vec::new(), Vec::new())
}

fn annotate(file: &MigrationFile, direction: Direction, ctx: &PlanContext) -> PlannedMigration {
    let section = match direction {
        Direction::Up => &file.parsed.up,
        Direction::Down => &file.parsed.down,
    };
    let section_notx = file.parsed.section_no_transaction(section);
    let hazards = hazard::detect_in(&section.statements);
    let hazards_present = !hazards.is_empty();

    let transaction =
        ctx.supports_transactional_ddl && !section_notx && !(ctx.auto_notx && hazards_present);
    let reason = if transaction {
        None
    } else if !ctx.supports_transactional_ddl {
        Some("driver does not support transactional DDL".to_string())
    } else if section_notx {
        Some("notx directive".to_string())
    } else {
        Some(format!("hazard: {}", hazard::hazard_names(&hazards)))
    };

    PlannedMigration {
        version: file.version,
        name: file.name.clone(),
        transaction,
        reason,
        hazards,
        statements: section.statements.clone(),
    }
}
