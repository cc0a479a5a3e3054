//! Smoke tests -- verify the binary runs and the offline subcommands work.

use assert_cmd::Command;
use predicates::prelude::*;

fn write_config(dir: &std::path::Path) -> std::path::PathBuf {
    let rules = dir.join("rules");
    std::fs::create_dir_all(&rules).unwrap();
    std::fs::write(
        rules.join("quiet.toml"),
        "name = \"quiet-ingest\"\nindex = \"logs-*\"\nrun_every = { minutes = 5 }\n\
         [kind]\ntype = \"flatline\"\ntimeframe = { minutes = 10 }\n",
    )
    .unwrap();

    let config = dir.join("config.toml");
    std::fs::write(
        &config,
        format!(
            "[rules]\npaths = [{:?}]\n\n[storage]\npath = {:?}\n",
            rules.display().to_string(),
            dir.join("state.db").display().to_string()
        ),
    )
    .unwrap();
    config
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("elasticalert")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Leader-elected rule evaluation"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("elasticalert")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("elasticalert"));
}

#[test]
fn test_serve_subcommand_exists() {
    Command::cargo_bin("elasticalert")
        .unwrap()
        .args(["serve", "--help"])
        .assert()
        .success();
}

#[test]
fn test_validate_reports_valid_rules() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    Command::cargo_bin("elasticalert")
        .unwrap()
        .arg("validate")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("quiet-ingest"))
        .stdout(predicate::str::contains("1 valid, 0 invalid"));
}

#[test]
fn test_validate_fails_on_invalid_rule() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    std::fs::write(
        dir.path().join("rules").join("broken.toml"),
        "name = \"broken\"\nindex = \"x\"\nrun_every = { minutes = 1 }\n\
         [kind]\ntype = \"frequency\"\n",
    )
    .unwrap();

    Command::cargo_bin("elasticalert")
        .unwrap()
        .arg("validate")
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stdout(predicate::str::contains("1 valid, 1 invalid"))
        .stdout(predicate::str::contains("broken"));
}

#[test]
fn test_silences_list_and_purge_on_fresh_db() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    Command::cargo_bin("elasticalert")
        .unwrap()
        .args(["silences", "list", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("No silences stored."));

    Command::cargo_bin("elasticalert")
        .unwrap()
        .args(["silences", "purge", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Purged 0 expired silence(s)."));
}
