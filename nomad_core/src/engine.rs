//! The migration engine: orchestrates locking, integrity verification,
//! planning and execution over one driver connection.
//!
//! Mutating operations share a prelude: connect, probe, acquire the
//! exclusive migration lock with exponential backoff, ensure the
//! bookkeeping table, then load and plan. The lock and the connection are
//! owned by a scope guard so both are returned on every exit path,
//! including panics; interrupt signals are polled at suspension points and
//! surface as a typed error so the same scope unwinds normally.

use crate::config::Config;
use crate::drivers::{self, AppliedRecord, Connection, Driver, DriverConfig};
use crate::error::{Error, Kind};
use crate::events::{self, Direction, Event, EventSink};
use crate::hazard;
use crate::lockkey;
use crate::planner::{self, Plan, PlanContext, PlanOptions, PlannedMigration};
use crate::store::{self, MigrationFile, MigrationStore};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_millis(5_000);

/// Classification of one migration file against the applied records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileState {
    Applied,
    Pending,
    Drifted,
    LegacyNoChecksum,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileState::Applied => "applied",
            FileState::Pending => "pending",
            FileState::Drifted => "drifted",
            FileState::LegacyNoChecksum => "legacy-no-checksum",
        };
        f.pad(s)
    }
}

#[derive(Clone, Debug)]
pub struct StatusRow {
    pub version: u64,
    pub name: String,
    pub state: FileState,
    pub applied_at: Option<OffsetDateTime>,
    pub has_drift: bool,
}

#[derive(Clone, Debug)]
pub struct StatusReport {
    pub rows: Vec<StatusRow>,
    /// Applied versions with no file on disk. Empty when a tag filter is
    /// active, since tag membership cannot be determined without a file.
    pub missing: Vec<u64>,
}

#[derive(Clone, Debug)]
pub struct VerifyReport {
    pub valid: bool,
    pub drift_count: usize,
    pub missing_count: usize,
    pub drifted: Vec<u64>,
    pub missing: Vec<u64>,
}

#[derive(Clone, Debug)]
pub struct CompletedMigration {
    pub version: u64,
    pub name: String,
    pub elapsed_ms: u64,
}

/// What a mutating operation actually did.
#[derive(Clone, Debug)]
pub struct Report {
    pub direction: Direction,
    pub completed: Vec<CompletedMigration>,
}

impl Report {
    fn empty(direction: Direction) -> Report {
        Report {
            direction,
            completed: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
struct EngineOptions {
    url: String,
    allow_drift: bool,
    auto_notx: bool,
    lock_timeout_ms: u64,
    lock_attempt_timeout_ms: u64,
}

/// The entrypoint for every migration operation.
pub struct Engine {
    driver: Box<dyn Driver>,
    store: MigrationStore,
    options: EngineOptions,
    sink: EventSink,
    lock_key: String,
}

impl Engine {
    pub fn from_config(config: &Config) -> Result<Engine, Error> {
        let url = config.require_url()?.to_string();
        let driver = drivers::open(DriverConfig {
            url: url.clone(),
            table: config.table.clone(),
            schema: config.schema.clone(),
            connect_timeout_ms: config.connect_timeout_ms,
        })?;
        let lock_key = lockkey::derive(
            &url,
            &config.dir,
            config.schema.as_deref(),
            &config.table,
        );
        Ok(Engine {
            driver,
            store: MigrationStore::new(&config.dir),
            options: EngineOptions {
                url,
                allow_drift: config.allow_drift,
                auto_notx: config.auto_notx,
                lock_timeout_ms: config.lock_timeout_ms,
                lock_attempt_timeout_ms: config.lock_attempt_timeout_ms,
            },
            sink: EventSink::new(config.events),
            lock_key,
        })
    }

    /// The connection target with any password masked.
    pub fn redacted_url(&self) -> String {
        lockkey::redact_url(&self.options.url)
    }

    fn plan_context(&self) -> PlanContext {
        PlanContext {
            supports_transactional_ddl: self.driver.supports_transactional_ddl(),
            auto_notx: self.options.auto_notx,
        }
    }

    // ---- read-only operations -------------------------------------------

    /// Classify every migration file and applied record. Raises drift and
    /// missing-file errors unless drift is allowed or a tag filter is
    /// active.
    pub fn status(&mut self, filter: Option<&planner::TagFilter>) -> Result<StatusReport, Error> {
        let mut conn = self.connect()?;
        conn.ensure_migrations_table()?;
        let files = self.store.load_all()?;
        let records = conn.fetch_applied_migrations()?;
        drop(conn);

        let filter_active = filter.is_some_and(|f| f.is_active());
        let current = store::currently_applied(&records);

        let mut rows = Vec::new();
        let mut drifted = Vec::new();
        for file in &files {
            if let Some(filter) = filter {
                if filter_active && !file.parsed.matches_tags(filter.tags.as_ref(), filter.only_tagged)
                {
                    continue;
                }
            }
            let record = current.iter().find(|r| r.version == file.version);
            let (state, has_drift) = match record {
                None => (FileState::Pending, false),
                Some(r) if r.checksum.is_empty() => (FileState::LegacyNoChecksum, false),
                Some(r) if r.checksum != file.checksum => (FileState::Drifted, true),
                Some(_) => (FileState::Applied, false),
            };
            if has_drift {
                drifted.push(file.version);
            }
            rows.push(StatusRow {
                version: file.version,
                name: file.name.clone(),
                state,
                applied_at: record.map(|r| r.applied_at),
                has_drift,
            });
        }

        let missing: Vec<u64> = if filter_active {
            Vec::new()
        } else {
            current
                .iter()
                .filter(|r| !files.iter().any(|f| f.version == r.version))
                .map(|r| r.version)
                .collect()
        };

        if !self.options.allow_drift && !filter_active {
            if !drifted.is_empty() {
                return Err(Error::new(Kind::Drift { versions: drifted }));
            }
            if !missing.is_empty() {
                return Err(Error::new(Kind::MissingFile { versions: missing }));
            }
        }

        Ok(StatusReport { rows, missing })
    }

    /// Structured integrity check; never raises over its findings.
    pub fn verify(&mut self) -> Result<VerifyReport, Error> {
        self.sink.emit(Event::VerifyStart {
            timestamp: events::now_timestamp(),
        });

        let mut conn = self.connect()?;
        conn.ensure_migrations_table()?;
        let files = self.store.load_all()?;
        let records = conn.fetch_applied_migrations()?;
        drop(conn);

        let (drifted, missing) = reconcile(&files, &records);
        let report = VerifyReport {
            valid: drifted.is_empty() && missing.is_empty(),
            drift_count: drifted.len(),
            missing_count: missing.len(),
            drifted,
            missing,
        };

        self.sink.emit(Event::VerifyEnd {
            timestamp: events::now_timestamp(),
            valid: report.valid,
            drift_count: report.drift_count,
            missing_count: report.missing_count,
        });
        Ok(report)
    }

    pub fn plan_up(&mut self, opts: &PlanOptions) -> Result<Plan, Error> {
        let (files, records) = self.load_state()?;
        let applied = applied_versions(&records);
        Ok(planner::plan_up(&files, &applied, &self.plan_context(), opts))
    }

    pub fn plan_down(&mut self, opts: &PlanOptions) -> Result<Plan, Error> {
        let (files, records) = self.load_state()?;
        let applied_desc = applied_versions_desc(&records);
        Ok(planner::plan_down(&files, &applied_desc, &self.plan_context(), opts))
    }

    pub fn plan_to(&mut self, target: u64) -> Result<Plan, Error> {
        let (files, records) = self.load_state()?;
        let applied = applied_versions(&records);
        Ok(planner::plan_to(&files, &applied, target, &self.plan_context()))
    }

    // ---- mutating operations --------------------------------------------

    pub fn up(&mut self, opts: &PlanOptions) -> Result<Report, Error> {
        let mut session = self.lock_session()?;
        let outcome = self.run_up(&mut session, opts);
        self.finish(session, outcome)
    }

    pub fn down(&mut self, opts: &PlanOptions) -> Result<Report, Error> {
        let mut session = self.lock_session()?;
        let outcome = self.run_down(&mut session, opts);
        self.finish(session, outcome)
    }

    pub fn migrate_to(&mut self, target: u64) -> Result<Report, Error> {
        let mut session = self.lock_session()?;
        let outcome = self.run_to(&mut session, target);
        self.finish(session, outcome)
    }

    /// Roll back and re-apply the last applied migration under one lock.
    pub fn redo(&mut self) -> Result<Report, Error> {
        let mut session = self.lock_session()?;
        let outcome = self.run_redo(&mut session);
        self.finish(session, outcome)
    }

    // ---- internals ------------------------------------------------------

    fn connect(&self) -> Result<Box<dyn Connection>, Error> {
        let mut conn = self.driver.connect()?;
        conn.probe()?;
        Ok(conn)
    }

    fn load_state(&mut self) -> Result<(Vec<Arc<MigrationFile>>, Vec<AppliedRecord>), Error> {
        let mut conn = self.connect()?;
        conn.ensure_migrations_table()?;
        let files = self.store.load_all()?;
        let records = conn.fetch_applied_migrations()?;
        Ok((files, records))
    }

    fn lock_session(&mut self) -> Result<LockedSession, Error> {
        let interrupt = InterruptGuard::install();
        let mut conn = self.connect()?;
        self.acquire_lock_with_backoff(conn.as_mut(), &interrupt)?;
        self.sink.emit(Event::LockAcquired {
            timestamp: events::now_timestamp(),
            key: self.lock_key.clone(),
        });
        let mut session = LockedSession {
            conn,
            key: self.lock_key.clone(),
            released: false,
            interrupt,
        };
        session.conn().ensure_migrations_table()?;
        Ok(session)
    }

    fn acquire_lock_with_backoff(
        &self,
        conn: &mut dyn Connection,
        interrupt: &InterruptGuard,
    ) -> Result<(), Error> {
        let budget = Duration::from_millis(self.options.lock_timeout_ms);
        let started = Instant::now();
        let mut backoff = BACKOFF_INITIAL;
        loop {
            interrupt.check()?;
            if conn.acquire_lock(&self.lock_key, self.options.lock_attempt_timeout_ms)? {
                return Ok(());
            }
            if started.elapsed() + backoff >= budget {
                return Err(Error::new(Kind::LockTimeout {
                    budget_ms: self.options.lock_timeout_ms,
                }));
            }
            log::debug!("migration lock busy, retrying in {:?}", backoff);
            std::thread::sleep(backoff);
            backoff = std::cmp::min(backoff * 2, BACKOFF_CAP);
        }
    }

    fn finish<T>(&self, mut session: LockedSession, outcome: Result<T, Error>) -> Result<T, Error> {
        let released = session.release();
        self.sink.emit(Event::LockReleased {
            timestamp: events::now_timestamp(),
            key: self.lock_key.clone(),
        });
        drop(session);
        match outcome {
            Ok(value) => released.map(|_| value),
            Err(err) => {
                if let Err(release_err) = released {
                    log::warn!("failed to release migration lock: {}", release_err);
                }
                Err(err)
            }
        }
    }

    fn run_up(&mut self, session: &mut LockedSession, opts: &PlanOptions) -> Result<Report, Error> {
        let files = self.store.load_all()?;
        let records = session.conn().fetch_applied_migrations()?;
        self.check_integrity(&files, &records)?;

        let applied = applied_versions(&records);
        let plan = planner::plan_up(&files, &applied, &self.plan_context(), opts);
        self.execute_plan(session, &files, plan)
    }

    fn run_down(
        &mut self,
        session: &mut LockedSession,
        opts: &PlanOptions,
    ) -> Result<Report, Error> {
        let files = self.store.load_all()?;
        let records = session.conn().fetch_applied_migrations()?;
        self.check_integrity(&files, &records)?;

        let applied_desc = applied_versions_desc(&records);
        let plan = planner::plan_down(&files, &applied_desc, &self.plan_context(), opts);
        self.execute_plan(session, &files, plan)
    }

    fn run_to(&mut self, session: &mut LockedSession, target: u64) -> Result<Report, Error> {
        let files = self.store.load_all()?;
        let records = session.conn().fetch_applied_migrations()?;
        self.check_integrity(&files, &records)?;

        let applied = applied_versions(&records);
        let plan = planner::plan_to(&files, &applied, target, &self.plan_context());
        self.execute_plan(session, &files, plan)
    }

    fn run_redo(&mut self, session: &mut LockedSession) -> Result<Report, Error> {
        let files = self.store.load_all()?;
        let records = session.conn().fetch_applied_migrations()?;
        let current = store::currently_applied(&records);

        let Some(last) = current.last() else {
            log::info!("no applied migrations to redo");
            return Ok(Report::empty(Direction::Up));
        };
        let file = files
            .iter()
            .find(|f| f.version == last.version)
            .ok_or_else(|| {
                Error::new(Kind::MissingFile {
                    versions: vec![last.version],
                })
            })?;
        if !self.options.allow_drift
            && !last.checksum.is_empty()
            && last.checksum != file.checksum
        {
            return Err(Error::new(Kind::ChecksumMismatch {
                version: last.version,
                expected: last.checksum.clone(),
                found: file.checksum.clone(),
            }));
        }

        let ctx = self.plan_context();
        let down = planner::plan_single(file, Direction::Down, &ctx);
        let up = planner::plan_single(file, Direction::Up, &ctx);
        let file = Arc::clone(file);

        let mut report = self.execute_plan(session, &files, down)?;
        let mut re_applied = self.execute_plan(session, &files, up)?;
        report.completed.append(&mut re_applied.completed);
        log::info!("redid migration {} {}", file.version, file.name);
        Ok(report)
    }

    fn check_integrity(
        &self,
        files: &[Arc<MigrationFile>],
        records: &[AppliedRecord],
    ) -> Result<(), Error> {
        let (drifted, missing) = reconcile(files, records);
        if self.options.allow_drift {
            for version in &drifted {
                log::warn!("tolerating checksum drift for migration {}", version);
            }
            for version in &missing {
                log::warn!("tolerating missing file for applied migration {}", version);
            }
            return Ok(());
        }
        if !drifted.is_empty() {
            return Err(Error::new(Kind::Drift { versions: drifted }));
        }
        if !missing.is_empty() {
            return Err(Error::new(Kind::MissingFile { versions: missing }));
        }
        Ok(())
    }

    fn execute_plan(
        &mut self,
        session: &mut LockedSession,
        files: &[Arc<MigrationFile>],
        plan: Plan,
    ) -> Result<Report, Error> {
        if !plan.errors.is_empty() {
            return Err(Error::new(Kind::Plan {
                reasons: plan.errors,
            }));
        }
        for warning in &plan.warnings {
            log::warn!("{}", warning);
        }
        if plan.migrations.is_empty() {
            log::info!("no migrations to run");
            return Ok(Report::empty(plan.direction));
        }

        let mut report = Report::empty(plan.direction);
        for migration in &plan.migrations {
            session.check_interrupt()?;
            let file = files
                .iter()
                .find(|f| f.version == migration.version)
                .ok_or_else(|| {
                    Error::new(Kind::MissingFile {
                        versions: vec![migration.version],
                    })
                })?;

            log::info!(
                "{} migration {} {}",
                match plan.direction {
                    Direction::Up => "applying",
                    Direction::Down => "rolling back",
                },
                migration.version,
                migration.name
            );
            self.sink.emit(Event::ApplyStart {
                timestamp: events::now_timestamp(),
                version: migration.version,
                name: migration.name.clone(),
                direction: plan.direction,
            });
            let started = Instant::now();

            self.apply_section(session, file, migration, plan.direction)?;

            let elapsed_ms = started.elapsed().as_millis() as u64;
            self.sink.emit(Event::ApplyEnd {
                timestamp: events::now_timestamp(),
                version: migration.version,
                name: migration.name.clone(),
                direction: plan.direction,
                elapsed_ms,
            });
            report.completed.push(CompletedMigration {
                version: migration.version,
                name: migration.name.clone(),
                elapsed_ms,
            });
        }
        Ok(report)
    }

    fn apply_section(
        &mut self,
        session: &mut LockedSession,
        file: &MigrationFile,
        migration: &PlannedMigration,
        direction: Direction,
    ) -> Result<(), Error> {
        let section = match direction {
            Direction::Up => &file.parsed.up,
            Direction::Down => &file.parsed.down,
        };
        let section_notx = file.parsed.section_no_transaction(section);
        // hazard validation only matters where a transaction would wrap the
        // section; drivers without transactional DDL never wrap
        let use_tx = if self.driver.supports_transactional_ddl() {
            let decision = hazard::validate(
                migration.hazards.clone(),
                section_notx,
                self.options.auto_notx,
            )?;
            !decision.should_skip_transaction
        } else {
            false
        };

        let conn = session.conn();
        if migration.statements.is_empty() {
            // nothing to execute, the bookkeeping row is the whole change
            return match direction {
                Direction::Up => conn.mark_applied(file.version, &file.name, &file.checksum),
                Direction::Down => conn.mark_rolled_back(file.version),
            };
        }

        if use_tx {
            conn.begin_transaction()?;
        }
        let result = self.run_statements(session, file, migration, direction);
        let conn = session.conn();
        match result {
            Ok(()) => {
                if use_tx {
                    conn.commit_transaction()?;
                }
                Ok(())
            }
            Err(err) => {
                if use_tx {
                    if let Err(rollback_err) = conn.rollback_transaction() {
                        log::warn!("rollback after failure also failed: {}", rollback_err);
                    }
                }
                Err(err)
            }
        }
    }

    fn run_statements(
        &mut self,
        session: &mut LockedSession,
        file: &MigrationFile,
        migration: &PlannedMigration,
        direction: Direction,
    ) -> Result<(), Error> {
        for stmt in &migration.statements {
            session.check_interrupt()?;
            let started = Instant::now();
            session
                .conn()
                .run_statement(&stmt.sql)
                .map_err(|err| locate_sql_error(err, file, stmt.line, stmt.column, &stmt.sql))?;
            self.sink.emit(Event::StatementRun {
                timestamp: events::now_timestamp(),
                version: migration.version,
                name: migration.name.clone(),
                direction,
                elapsed_ms: started.elapsed().as_millis() as u64,
                sql: events::sql_preview(&stmt.sql),
            });
        }
        let conn = session.conn();
        match direction {
            Direction::Up => conn.mark_applied(file.version, &file.name, &file.checksum),
            Direction::Down => conn.mark_rolled_back(file.version),
        }
    }
}

fn applied_versions(records: &[AppliedRecord]) -> BTreeSet<u64> {
    store::currently_applied(records)
        .into_iter()
        .map(|r| r.version)
        .collect()
}

fn applied_versions_desc(records: &[AppliedRecord]) -> Vec<u64> {
    let mut versions: Vec<u64> = store::currently_applied(records)
        .into_iter()
        .map(|r| r.version)
        .collect();
    versions.sort_unstable_by(|a, b| b.cmp(a));
    versions
}

// Drifted and missing versions among the currently-applied records.
fn reconcile(files: &[Arc<MigrationFile>], records: &[AppliedRecord]) -> (Vec<u64>, Vec<u64>) {
    let mut drifted = Vec::new();
    let mut missing = Vec::new();
    for record in store::currently_applied(records) {
        match files.iter().find(|f| f.version == record.version) {
            None => missing.push(record.version),
            Some(file) => {
                if !record.checksum.is_empty() && record.checksum != file.checksum {
                    drifted.push(record.version);
                }
            }
        }
    }
    (drifted, missing)
}

/// Fold a driver SQL error onto the statement's position in its file. The
/// backend's intra-statement character offset, when present, is added to
/// the parser's base position as a `(dy, dx)` displacement.
fn locate_sql_error(
    err: Error,
    file: &MigrationFile,
    base_line: u32,
    base_column: u32,
    sql: &str,
) -> Error {
    match err.into_kind() {
        Kind::Sql {
            message,
            sqlstate,
            position,
            ..
        } => {
            let (line, column) = match position {
                Some(pos) => offset_position(sql, base_line, base_column, pos),
                None => (base_line, base_column),
            };
            Error::new(Kind::Sql {
                message,
                sqlstate,
                position: None,
                path: Some(file.path.clone()),
                line,
                column,
                sql: sql.to_string(),
            })
        }
        other => Error::new(other),
    }
}

// Translate a 1-based character offset into a statement to an absolute
// (line, column), given where the statement starts in its file.
fn offset_position(sql: &str, base_line: u32, base_column: u32, pos: u32) -> (u32, u32) {
    let index = (pos.saturating_sub(1)) as usize;
    let mut dy: u32 = 0;
    let mut dx: u32 = 0;
    for c in sql.chars().take(index) {
        if c == '\n' {
            dy += 1;
            dx = 0;
        } else {
            dx += 1;
        }
    }
    if dy == 0 {
        (base_line, base_column + dx)
    } else {
        (base_line + dy, dx + 1)
    }
}

struct InterruptGuard {
    flag: Arc<AtomicBool>,
    ids: Vec<signal_hook::SigId>,
}

impl InterruptGuard {
    // registration failure downgrades to no interrupt handling rather than
    // failing the migration
    fn install() -> InterruptGuard {
        let flag = Arc::new(AtomicBool::new(false));
        let mut ids = Vec::new();
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            match signal_hook::flag::register(signal, Arc::clone(&flag)) {
                Ok(id) => ids.push(id),
                Err(err) => log::warn!("could not register signal handler: {}", err),
            }
        }
        InterruptGuard { flag, ids }
    }

    fn check(&self) -> Result<(), Error> {
        if self.flag.load(Ordering::Relaxed) {
            Err(Error::new(Kind::Interrupted))
        } else {
            Ok(())
        }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Owns the connection and the acquired lock for one mutating operation.
/// Dropping releases the lock (best effort) and returns the connection.
struct LockedSession {
    conn: Box<dyn Connection>,
    key: String,
    released: bool,
    interrupt: InterruptGuard,
}

impl LockedSession {
    fn conn(&mut self) -> &mut dyn Connection {
        self.conn.as_mut()
    }

    fn check_interrupt(&self) -> Result<(), Error> {
        self.interrupt.check()
    }

    fn release(&mut self) -> Result<(), Error> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let key = self.key.clone();
        self.conn.release_lock(&key)
    }
}

impl Drop for LockedSession {
    fn drop(&mut self) {
        if !self.released {
            let key = self.key.clone();
            if let Err(err) = self.conn.release_lock(&key) {
                log::warn!("failed to release migration lock: {}", err);
            }
        }
    }
}
