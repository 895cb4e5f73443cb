#![cfg(feature = "sqlite")]

use nomad_core::checksum;
use nomad_core::engine::{Engine, FileState};
use nomad_core::lockkey;
use nomad_core::planner::{PlanOptions, TagFilter};
use nomad_core::Config;
use rusqlite::Connection as RawConnection;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const CREATE_USERS: &str =
    "-- + nomad up\nCREATE TABLE users(id INT);\n-- + nomad down\nDROP TABLE users;\n";

struct Harness {
    _tmp: TempDir,
    migrations: PathBuf,
    db: PathBuf,
    config: Config,
}

fn harness(files: &[(&str, &str)]) -> Harness {
    let tmp = TempDir::new().unwrap();
    let migrations = tmp.path().join("migrations");
    fs::create_dir(&migrations).unwrap();
    for (name, body) in files {
        fs::write(migrations.join(name), body).unwrap();
    }
    let db = tmp.path().join("nomad.db");
    let config = Config::new()
        .set_url(&format!("sqlite://{}", db.display()))
        .set_dir(migrations.to_str().unwrap());
    Harness {
        _tmp: tmp,
        migrations,
        db,
        config,
    }
}

fn engine(config: &Config) -> Engine {
    Engine::from_config(config).unwrap()
}

fn raw(db: &Path) -> RawConnection {
    RawConnection::open(db).unwrap()
}

fn table_exists(db: &Path, name: &str) -> bool {
    let count: i64 = raw(db)
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .unwrap();
    count == 1
}

fn bookkeeping_row(db: &Path, version: u64) -> (String, Option<String>, Option<String>) {
    raw(db)
        .query_row(
            "SELECT checksum, applied_at, rolled_back_at FROM \"nomad_migrations\" WHERE version = ?1",
            [version as i64],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap()
}

fn applied_versions(db: &Path) -> Vec<u64> {
    let conn = raw(db);
    let mut stmt = conn
        .prepare(
            "SELECT version FROM \"nomad_migrations\" \
             WHERE applied_at IS NOT NULL AND rolled_back_at IS NULL ORDER BY version",
        )
        .unwrap();
    let versions = stmt
        .query_map([], |row| row.get::<_, i64>(0))
        .unwrap()
        .map(|v| v.unwrap() as u64)
        .collect();
    versions
}

#[test]
fn applies_and_rolls_back_a_migration() {
    let h = harness(&[("20240101120000_create.sql", CREATE_USERS)]);

    let report = engine(&h.config).up(&PlanOptions::default()).unwrap();
    assert_eq!(report.completed.len(), 1);
    assert_eq!(report.completed[0].version, 20240101120000);
    assert!(table_exists(&h.db, "users"));

    let (checksum_col, applied_at, rolled_back_at) = bookkeeping_row(&h.db, 20240101120000);
    assert_eq!(checksum_col, checksum::checksum(CREATE_USERS.as_bytes()));
    assert!(applied_at.is_some());
    assert!(rolled_back_at.is_none());

    let report = engine(&h.config)
        .down(&PlanOptions {
            count: Some(1),
            ..PlanOptions::default()
        })
        .unwrap();
    assert_eq!(report.completed.len(), 1);
    assert!(!table_exists(&h.db, "users"));

    let (_, applied_at, rolled_back_at) = bookkeeping_row(&h.db, 20240101120000);
    // rollback stamps rolled_back_at and keeps the original applied_at
    assert!(applied_at.is_some());
    assert!(rolled_back_at.is_some());
}

#[test]
fn reapplying_clears_the_rollback_stamp() {
    let h = harness(&[("20240101120000_create.sql", CREATE_USERS)]);

    engine(&h.config).up(&PlanOptions::default()).unwrap();
    engine(&h.config).down(&PlanOptions::default()).unwrap();
    engine(&h.config).up(&PlanOptions::default()).unwrap();

    let (_, applied_at, rolled_back_at) = bookkeeping_row(&h.db, 20240101120000);
    assert!(applied_at.is_some());
    assert!(rolled_back_at.is_none());
    assert!(table_exists(&h.db, "users"));
}

#[test]
fn up_is_idempotent_when_everything_is_applied() {
    let h = harness(&[("20240101120000_create.sql", CREATE_USERS)]);

    engine(&h.config).up(&PlanOptions::default()).unwrap();
    let report = engine(&h.config).up(&PlanOptions::default()).unwrap();
    assert!(report.completed.is_empty());
}

#[test]
fn status_detects_drift() {
    let mut h = harness(&[("20240101120000_create.sql", CREATE_USERS)]);

    engine(&h.config).up(&PlanOptions::default()).unwrap();

    fs::write(
        h.migrations.join("20240101120000_create.sql"),
        "-- + nomad up\nCREATE TABLE users(id INT, name TEXT);\n-- + nomad down\nDROP TABLE users;\n",
    )
    .unwrap();

    let err = engine(&h.config).status(None).unwrap_err();
    assert_eq!(err.exit_code(), 2);

    h.config.allow_drift = true;
    let report = engine(&h.config).status(None).unwrap();
    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.rows[0].state, FileState::Drifted);
    assert!(report.rows[0].has_drift);
}

#[test]
fn drift_blocks_mutating_operations() {
    let h = harness(&[("20240101120000_create.sql", CREATE_USERS)]);

    engine(&h.config).up(&PlanOptions::default()).unwrap();
    fs::write(
        h.migrations.join("20240101120000_create.sql"),
        "-- + nomad up\nCREATE TABLE users(id INT, name TEXT);\n-- + nomad down\nDROP TABLE users;\n",
    )
    .unwrap();

    let err = engine(&h.config)
        .down(&PlanOptions::default())
        .unwrap_err();
    assert_eq!(err.exit_code(), 2);
    // nothing was rolled back
    assert!(table_exists(&h.db, "users"));
}

#[test]
fn status_detects_missing_files() {
    let h = harness(&[("20240101120000_create.sql", CREATE_USERS)]);

    engine(&h.config).up(&PlanOptions::default()).unwrap();
    fs::remove_file(h.migrations.join("20240101120000_create.sql")).unwrap();

    let err = engine(&h.config).status(None).unwrap_err();
    assert_eq!(err.exit_code(), 5);
}

#[test]
fn verify_reports_without_raising() {
    let h = harness(&[("20240101120000_create.sql", CREATE_USERS)]);

    engine(&h.config).up(&PlanOptions::default()).unwrap();
    let report = engine(&h.config).verify().unwrap();
    assert!(report.valid);
    assert_eq!(report.drift_count, 0);

    fs::write(
        h.migrations.join("20240101120000_create.sql"),
        "-- + nomad up\nCREATE TABLE users(id BIGINT);\n-- + nomad down\nDROP TABLE users;\n",
    )
    .unwrap();
    let report = engine(&h.config).verify().unwrap();
    assert!(!report.valid);
    assert_eq!(report.drift_count, 1);
    assert_eq!(report.drifted, vec![20240101120000]);
}

#[test]
fn lock_contention_times_out_with_code_3() {
    let mut h = harness(&[("20240101120000_create.sql", CREATE_USERS)]);
    h.config.lock_timeout_ms = 300;

    // hold the lock the way a concurrent invocation would
    let holder = raw(&h.db);
    holder
        .execute_batch("CREATE TABLE IF NOT EXISTS nomad_lock (lock_name TEXT PRIMARY KEY)")
        .unwrap();
    let key = lockkey::derive(
        h.config.url.as_deref().unwrap(),
        &h.config.dir,
        None,
        "nomad_migrations",
    );
    holder
        .execute(
            "INSERT INTO nomad_lock (lock_name) VALUES (?1)",
            [key.as_str()],
        )
        .unwrap();

    let err = engine(&h.config).up(&PlanOptions::default()).unwrap_err();
    assert_eq!(err.exit_code(), 3);
    assert!(!table_exists(&h.db, "users"));
}

#[test]
fn lock_is_released_after_an_operation() {
    let h = harness(&[("20240101120000_create.sql", CREATE_USERS)]);

    engine(&h.config).up(&PlanOptions::default()).unwrap();

    let count: i64 = raw(&h.db)
        .query_row("SELECT COUNT(*) FROM nomad_lock", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn migrate_to_rolls_back_above_the_target() {
    let h = harness(&[
        (
            "20240101000000_one.sql",
            "-- + nomad up\nCREATE TABLE t1(id INT);\n-- + nomad down\nDROP TABLE t1;\n",
        ),
        (
            "20240102000000_two.sql",
            "-- + nomad up\nCREATE TABLE t2(id INT);\n-- + nomad down\nDROP TABLE t2;\n",
        ),
        (
            "20240103000000_three.sql",
            "-- + nomad up\nCREATE TABLE t3(id INT);\n-- + nomad down\nDROP TABLE t3;\n",
        ),
    ]);

    engine(&h.config).up(&PlanOptions::default()).unwrap();
    assert_eq!(
        applied_versions(&h.db),
        vec![20240101000000, 20240102000000, 20240103000000]
    );

    let report = engine(&h.config).migrate_to(20240101000000).unwrap();
    let rolled: Vec<u64> = report.completed.iter().map(|m| m.version).collect();
    assert_eq!(rolled, vec![20240103000000, 20240102000000]);

    assert_eq!(applied_versions(&h.db), vec![20240101000000]);
    let (_, _, rolled_back_at) = bookkeeping_row(&h.db, 20240102000000);
    assert!(rolled_back_at.is_some());
    let (_, _, rolled_back_at) = bookkeeping_row(&h.db, 20240103000000);
    assert!(rolled_back_at.is_some());
    assert!(table_exists(&h.db, "t1"));
    assert!(!table_exists(&h.db, "t2"));
    assert!(!table_exists(&h.db, "t3"));
}

#[test]
fn migrate_to_current_version_is_a_no_op() {
    let h = harness(&[("20240101120000_create.sql", CREATE_USERS)]);

    engine(&h.config).up(&PlanOptions::default()).unwrap();
    let report = engine(&h.config).migrate_to(20240101120000).unwrap();
    assert!(report.completed.is_empty());
}

const BASE_AND_SEED: &[(&str, &str)] = &[
    (
        "20240101000000_base.sql",
        "-- + nomad up\nCREATE TABLE base(id INT);\n-- + nomad down\nDROP TABLE base;\n",
    ),
    (
        "20240102000000_seed_users.sql",
        "-- + nomad tags: seed\n-- + nomad up\nCREATE TABLE seed_users(id INT);\n-- + nomad down\nDROP TABLE seed_users;\n",
    ),
];

fn seed_opts() -> PlanOptions {
    PlanOptions {
        filter: Some(TagFilter {
            tags: Some(BTreeSet::from(["seed".to_string()])),
            only_tagged: false,
        }),
        ..PlanOptions::default()
    }
}

#[test]
fn tag_filter_applies_only_matching_migrations() {
    let h = harness(BASE_AND_SEED);

    let report = engine(&h.config).up(&seed_opts()).unwrap();
    let versions: Vec<u64> = report.completed.iter().map(|m| m.version).collect();
    assert_eq!(versions, vec![20240102000000]);
    assert_eq!(applied_versions(&h.db), vec![20240102000000]);
}

#[test]
fn tag_filter_with_ancestors_pulls_in_prerequisites() {
    let h = harness(BASE_AND_SEED);

    let opts = PlanOptions {
        include_ancestors: true,
        ..seed_opts()
    };
    let report = engine(&h.config).up(&opts).unwrap();
    let versions: Vec<u64> = report.completed.iter().map(|m| m.version).collect();
    assert_eq!(versions, vec![20240101000000, 20240102000000]);
    assert_eq!(
        applied_versions(&h.db),
        vec![20240101000000, 20240102000000]
    );
}

#[test]
fn redo_rolls_back_and_reapplies_the_last_migration() {
    let h = harness(&[("20240101120000_create.sql", CREATE_USERS)]);

    engine(&h.config).up(&PlanOptions::default()).unwrap();
    let report = engine(&h.config).redo().unwrap();
    assert_eq!(report.completed.len(), 2);

    let (_, applied_at, rolled_back_at) = bookkeeping_row(&h.db, 20240101120000);
    assert!(applied_at.is_some());
    assert!(rolled_back_at.is_none());
    assert!(table_exists(&h.db, "users"));
}

#[test]
fn redo_refuses_a_drifted_migration() {
    let h = harness(&[("20240101120000_create.sql", CREATE_USERS)]);

    engine(&h.config).up(&PlanOptions::default()).unwrap();
    fs::write(
        h.migrations.join("20240101120000_create.sql"),
        "-- + nomad up\nCREATE TABLE users(id BIGINT);\n-- + nomad down\nDROP TABLE users;\n",
    )
    .unwrap();

    let err = engine(&h.config).redo().unwrap_err();
    assert_eq!(err.exit_code(), 6);
}

#[test]
fn empty_sections_update_bookkeeping_only() {
    let h = harness(&[(
        "20240101120000_marker.sql",
        "-- + nomad up\n-- + nomad down\n",
    )]);

    let report = engine(&h.config).up(&PlanOptions::default()).unwrap();
    assert_eq!(report.completed.len(), 1);
    assert_eq!(applied_versions(&h.db), vec![20240101120000]);

    engine(&h.config).down(&PlanOptions::default()).unwrap();
    assert!(applied_versions(&h.db).is_empty());
}

#[test]
fn sql_errors_carry_file_line_and_column() {
    let h = harness(&[(
        "20240101120000_broken.sql",
        "-- + nomad up\nCREATE TABLE ok_table(id INT);\nINSERT INTO missing_table VALUES (1);\n-- + nomad down\n",
    )]);

    let err = engine(&h.config).up(&PlanOptions::default()).unwrap_err();
    assert_eq!(err.exit_code(), 1);
    let message = err.to_string();
    assert!(
        message.contains("20240101120000_broken.sql:3:1"),
        "unexpected message: {}",
        message
    );
}

#[test]
fn plan_preview_does_not_execute() {
    let h = harness(&[("20240101120000_create.sql", CREATE_USERS)]);

    let plan = engine(&h.config).plan_up(&PlanOptions::default()).unwrap();
    assert_eq!(plan.migrations.len(), 1);
    // sqlite never wraps migrations in a transaction
    assert!(!plan.migrations[0].transaction);
    assert_eq!(
        plan.migrations[0].reason.as_deref(),
        Some("driver does not support transactional DDL")
    );
    assert!(!table_exists(&h.db, "users"));
    assert!(applied_versions(&h.db).is_empty());
}

#[test]
fn empty_migrations_directory_is_a_no_op() {
    let h = harness(&[]);
    let report = engine(&h.config).up(&PlanOptions::default()).unwrap();
    assert!(report.completed.is_empty());
}
