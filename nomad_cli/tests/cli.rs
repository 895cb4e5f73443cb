use assert_cmd::Command;
use predicates::str::contains;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

const CREATE_USERS: &str =
    "-- + nomad up\nCREATE TABLE users(id INT);\n-- + nomad down\nDROP TABLE users;\n";

fn workspace(files: &[(&str, &str)]) -> (TempDir, PathBuf, String) {
    let tmp = TempDir::new().unwrap();
    let migrations = tmp.path().join("migrations");
    fs::create_dir(&migrations).unwrap();
    for (name, body) in files {
        fs::write(migrations.join(name), body).unwrap();
    }
    let url = format!("sqlite://{}", tmp.path().join("nomad.db").display());
    (tmp, migrations, url)
}

fn nomad() -> Command {
    Command::cargo_bin("nomad").unwrap()
}

#[test]
fn status_lists_pending_migrations() {
    let (_tmp, migrations, url) = workspace(&[("20240101120000_create.sql", CREATE_USERS)]);

    nomad()
        .args(["--url", &url, "--dir", migrations.to_str().unwrap(), "status"])
        .assert()
        .success()
        .stdout(contains("pending"))
        .stdout(contains("create"));
}

#[test]
fn up_applies_and_status_reports_applied() {
    let (_tmp, migrations, url) = workspace(&[("20240101120000_create.sql", CREATE_USERS)]);
    let dir = migrations.to_str().unwrap();

    nomad()
        .args(["--url", &url, "--dir", dir, "up"])
        .assert()
        .success()
        .stdout(contains("applied 1 migration(s)"));

    nomad()
        .args(["--url", &url, "--dir", dir, "status"])
        .assert()
        .success()
        .stdout(contains("applied"));
}

#[test]
fn drift_exits_with_code_2() {
    let (_tmp, migrations, url) = workspace(&[("20240101120000_create.sql", CREATE_USERS)]);
    let dir = migrations.to_str().unwrap();

    nomad().args(["--url", &url, "--dir", dir, "up"]).assert().success();

    fs::write(
        migrations.join("20240101120000_create.sql"),
        "-- + nomad up\nCREATE TABLE users(id INT, name TEXT);\n-- + nomad down\nDROP TABLE users;\n",
    )
    .unwrap();

    nomad()
        .args(["--url", &url, "--dir", dir, "status"])
        .assert()
        .failure()
        .code(2);

    nomad()
        .args(["--url", &url, "--dir", dir, "--allow-drift", "status"])
        .assert()
        .success()
        .stdout(contains("drifted"));
}

#[test]
fn plan_up_previews_without_applying() {
    let (_tmp, migrations, url) = workspace(&[("20240101120000_create.sql", CREATE_USERS)]);
    let dir = migrations.to_str().unwrap();

    nomad()
        .args(["--url", &url, "--dir", dir, "plan", "up"])
        .assert()
        .success()
        .stdout(contains("direction: up"))
        .stdout(contains("total 1"));

    // still pending
    nomad()
        .args(["--url", &url, "--dir", dir, "status"])
        .assert()
        .success()
        .stdout(contains("pending"));
}

#[test]
fn unsupported_scheme_exits_with_code_7() {
    let (_tmp, migrations, _) = workspace(&[]);

    nomad()
        .args([
            "--url",
            "oracle://db",
            "--dir",
            migrations.to_str().unwrap(),
            "status",
        ])
        .assert()
        .failure()
        .code(7);
}

#[test]
fn missing_url_exits_with_code_4() {
    let (_tmp, migrations, _) = workspace(&[]);

    nomad()
        .env_remove("NOMAD_DATABASE_URL")
        .args(["--dir", migrations.to_str().unwrap(), "status"])
        .assert()
        .failure()
        .code(4);
}

#[test]
fn verify_reports_ok_on_a_clean_history() {
    let (_tmp, migrations, url) = workspace(&[("20240101120000_create.sql", CREATE_USERS)]);
    let dir = migrations.to_str().unwrap();

    nomad().args(["--url", &url, "--dir", dir, "up"]).assert().success();

    nomad()
        .args(["--url", &url, "--dir", dir, "verify"])
        .assert()
        .success()
        .stdout(contains("ok"));
}

#[test]
fn events_flag_emits_json_lines() {
    let (_tmp, migrations, url) = workspace(&[("20240101120000_create.sql", CREATE_USERS)]);
    let dir = migrations.to_str().unwrap();

    nomad()
        .args(["--url", &url, "--dir", dir, "--events", "up"])
        .assert()
        .success()
        .stdout(contains(r#"{"event":"lock-acquired""#))
        .stdout(contains(r#"{"event":"apply-end""#));
}
