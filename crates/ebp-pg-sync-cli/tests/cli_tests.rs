//! CLI integration tests for ebp-pg-sync.
//!
//! These tests cover argument parsing, help output, exit codes for
//! configuration errors and the backup housekeeping commands, none of which
//! need a live database.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Get a command for the ebp-pg-sync binary.
fn cmd() -> Command {
    Command::cargo_bin("ebp-pg-sync").unwrap()
}

/// A valid configuration whose backup directory is `backup_dir`.
fn config_file(backup_dir: &std::path::Path) -> tempfile::NamedTempFile {
    config_file_with(backup_dir, "")
}

/// Like [`config_file`], with extra lines under `backup:`.
fn config_file_with(backup_dir: &std::path::Path, backup_extra: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
source:
  host: erp-sql
  database: EBP_GESCOM
  user: sync
  password: secret
target:
  host: pg-mirror
  database: ebp_mirror
  user: sync
  password: secret
  ssl_mode: disable
backup:
  directory: {}
{}
"#,
        backup_dir.display(),
        backup_extra
    )
    .unwrap();
    file
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sync"))
        .stdout(predicate::str::contains("verify"))
        .stdout(predicate::str::contains("repair"))
        .stdout(predicate::str::contains("backup"))
        .stdout(predicate::str::contains("audit"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_sync_subcommand_help() {
    cmd()
        .args(["sync", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--tables"))
        .stdout(predicate::str::contains("--drop-and-create"))
        .stdout(predicate::str::contains("--incremental"))
        .stdout(predicate::str::contains("--workers"));
}

#[test]
fn test_verify_subcommand_help() {
    cmd()
        .args(["verify", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--sample-size"));
}

#[test]
fn test_repair_subcommand_help() {
    cmd()
        .args(["repair", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--from"));
}

#[test]
fn test_backup_subcommand_help() {
    cmd()
        .args(["backup", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--format"))
        .stdout(predicate::str::contains("--force-os"))
        .stdout(predicate::str::contains("--list"))
        .stdout(predicate::str::contains("--cleanup"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("ebp-pg-sync"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_global_flags_and_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("--shutdown-timeout"))
        .stdout(predicate::str::contains("[default: 60]"))
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("[default: info]"))
        .stdout(predicate::str::contains("[default: config.yaml]"));
}

#[test]
fn test_short_config_flag() {
    cmd()
        .args(["-c", "some_config.yaml", "--help"])
        .assert()
        .success();
}

#[test]
fn test_drop_and_create_conflicts_with_incremental() {
    cmd()
        .args(["sync", "--drop-and-create", "--incremental"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_1() {
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "health-check"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("IO error"));
}

#[test]
fn test_invalid_yaml_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(2);
}

#[test]
fn test_missing_required_fields_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "source:").unwrap();
    writeln!(file, "  host: erp-sql").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(2);
}

#[test]
fn test_same_endpoint_is_configuration_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
source: {{host: db, port: 5432, database: ebp, user: u}}
target: {{host: db, port: 5432, database: ebp, user: u, ssl_mode: disable}}
"#
    )
    .unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "audit"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("ConfigurationError"));
}

#[test]
fn test_invalid_backup_format_fails_before_connecting() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_file(dir.path());

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "backup",
            "--format",
            "zip",
        ])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid backup format"));
}

// =============================================================================
// Backup Housekeeping Tests
// =============================================================================

#[test]
fn test_backup_list_empty_directory() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_file(dir.path());

    cmd()
        .args(["--config", config.path().to_str().unwrap(), "backup", "--list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No backups in"));
}

#[test]
fn test_backup_list_json_reads_manifests() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("ebp_mirror_20240517_140309_full.dump"), b"PGDMP").unwrap();
    std::fs::write(
        dir.path()
            .join("ebp_mirror_20240517_140309_full.dump.manifest.json"),
        format!(
            r#"{{"database":"ebp_mirror","format":"custom","tables":[],"filePath":"{}","sizeBytes":5,"sizeInMb":0.0,"createdAt":"2024-05-17T14:03:09Z"}}"#,
            dir.path()
                .join("ebp_mirror_20240517_140309_full.dump")
                .display()
        ),
    )
    .unwrap();
    let config = config_file(dir.path());

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "--output-json",
            "backup",
            "--list",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"database\": \"ebp_mirror\""));
}

#[test]
fn test_backup_cleanup_keeps_newest() {
    let dir = tempfile::tempdir().unwrap();
    for (stamp, created) in [
        ("20240101_000000", "2024-01-01T00:00:00Z"),
        ("20240201_000000", "2024-02-01T00:00:00Z"),
    ] {
        let dump = dir.path().join(format!("ebp_mirror_{}_full.sql", stamp));
        std::fs::write(&dump, b"-- dump").unwrap();
        std::fs::write(
            dir.path().join(format!("ebp_mirror_{}_full.sql.manifest.json", stamp)),
            format!(
                r#"{{"database":"ebp_mirror","format":"plain","tables":[],"filePath":"{}","sizeBytes":7,"sizeInMb":0.0,"createdAt":"{}"}}"#,
                dump.display(),
                created
            ),
        )
        .unwrap();
    }
    let config = config_file(dir.path());

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "backup",
            "--cleanup",
            "1",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 backup(s)"));

    assert!(dir.path().join("ebp_mirror_20240201_000000_full.sql").exists());
    assert!(!dir.path().join("ebp_mirror_20240101_000000_full.sql").exists());
}

#[test]
fn test_backup_cleanup_defaults_to_configured_keep() {
    let dir = tempfile::tempdir().unwrap();
    for (stamp, created) in [
        ("20240101_000000", "2024-01-01T00:00:00Z"),
        ("20240201_000000", "2024-02-01T00:00:00Z"),
        ("20240301_000000", "2024-03-01T00:00:00Z"),
    ] {
        let dump = dir.path().join(format!("ebp_mirror_{}_full.sql", stamp));
        std::fs::write(&dump, b"-- dump").unwrap();
        std::fs::write(
            dir.path().join(format!("ebp_mirror_{}_full.sql.manifest.json", stamp)),
            format!(
                r#"{{"database":"ebp_mirror","format":"plain","tables":[],"filePath":"{}","sizeBytes":7,"sizeInMb":0.0,"createdAt":"{}"}}"#,
                dump.display(),
                created
            ),
        )
        .unwrap();
    }
    let config = config_file_with(dir.path(), "  keep: 2");

    cmd()
        .args([
            "--config",
            config.path().to_str().unwrap(),
            "backup",
            "--cleanup",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 backup(s), kept up to 2"));

    assert!(dir.path().join("ebp_mirror_20240301_000000_full.sql").exists());
    assert!(dir.path().join("ebp_mirror_20240201_000000_full.sql").exists());
    assert!(!dir.path().join("ebp_mirror_20240101_000000_full.sql").exists());
}

#[test]
fn test_backup_does_not_connect_to_source() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("no-such-pg_dump");
    let config = config_file_with(
        dir.path(),
        &format!("  pg_dump_path: {}", missing.display()),
    );

    // The source host does not resolve; only pg_dump is attempted.
    cmd()
        .args(["--config", config.path().to_str().unwrap(), "backup"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Backup failed"))
        .stderr(predicate::str::contains("no-such-pg_dump"));
}

// =============================================================================
// No Subcommand Tests
// =============================================================================

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}
