//! Integration tests for the launchpad CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const ENV_OVERRIDES: &[&str] = &[
    "LAUNCHPAD_PORT",
    "LAUNCHPAD_DB_PATH",
    "LAUNCHPAD_WORKSPACE_ROOT",
    "LAUNCHPAD_COMPUTE_URL",
    "LAUNCHPAD_COMPUTE_TOKEN",
    "LAUNCHPAD_COMPUTE_ORG",
    "LAUNCHPAD_LOCAL_PREVIEW",
];

/// Launchpad command isolated from the caller's environment and config.
fn launchpad(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("launchpad");
    cmd.current_dir(dir.path())
        .env("HOME", dir.path())
        .env("XDG_CONFIG_HOME", dir.path().join(".config"))
        .env_remove("RUST_LOG");
    for key in ENV_OVERRIDES {
        cmd.env_remove(key);
    }
    cmd
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = TempDir::new().unwrap();
        launchpad(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("init-db"))
            .stdout(predicate::str::contains("sweep"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        launchpad(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_sweep_flags_conflict() {
        let dir = TempDir::new().unwrap();
        launchpad(&dir)
            .args(["sweep", "--previews-only", "--workspaces-only"])
            .assert()
            .failure();
    }
}

mod config_commands {
    use super::*;

    #[test]
    fn test_show_defaults() {
        let dir = TempDir::new().unwrap();
        launchpad(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[server]"))
            .stdout(predicate::str::contains("port = 8787"));
    }

    #[test]
    fn test_show_redacts_compute_token() {
        let dir = TempDir::new().unwrap();
        launchpad(&dir)
            .env("LAUNCHPAD_COMPUTE_TOKEN", "super-secret-token")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("<redacted>"))
            .stdout(predicate::str::contains("super-secret-token").not());
    }

    #[test]
    fn test_explicit_config_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[server]\nport = 9100\n").unwrap();
        launchpad(&dir)
            .args(["--config", path.to_str().unwrap(), "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 9100"));
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("launchpad.toml"), "[server]\nport = 9100\n").unwrap();
        launchpad(&dir)
            .env("LAUNCHPAD_PORT", "9200")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 9200"));
    }

    #[test]
    fn test_init_writes_file_once() {
        let dir = TempDir::new().unwrap();
        launchpad(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Wrote default configuration"));
        let written = fs::read_to_string(dir.path().join("launchpad.toml")).unwrap();
        assert!(written.contains("[gc]"));

        launchpad(&dir)
            .args(["config", "init"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"));

        launchpad(&dir)
            .args(["config", "init", "--force"])
            .assert()
            .success();
    }
}

mod database {
    use super::*;

    #[test]
    fn test_init_db_creates_file() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("nested/state.db");
        launchpad(&dir)
            .args(["init-db", "--db-path", db_path.to_str().unwrap()])
            .assert()
            .success()
            .stdout(predicate::str::contains("Database initialized"));
        assert!(db_path.is_file());

        // idempotent
        launchpad(&dir)
            .args(["init-db", "--db-path", db_path.to_str().unwrap()])
            .assert()
            .success();
    }

    #[test]
    fn test_sweep_on_empty_state() {
        let dir = TempDir::new().unwrap();
        launchpad(&dir)
            .env("LAUNCHPAD_DB_PATH", dir.path().join("state.db"))
            .env("LAUNCHPAD_WORKSPACE_ROOT", dir.path().join("workspaces"))
            .arg("sweep")
            .assert()
            .success()
            .stdout(predicate::str::contains("0 expired"))
            .stdout(predicate::str::contains("0 deleted"));
    }

    #[test]
    fn test_sweep_workspaces_only() {
        let dir = TempDir::new().unwrap();
        launchpad(&dir)
            .env("LAUNCHPAD_DB_PATH", dir.path().join("state.db"))
            .env("LAUNCHPAD_WORKSPACE_ROOT", dir.path().join("workspaces"))
            .args(["sweep", "--workspaces-only"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Workspaces:"))
            .stdout(predicate::str::contains("Previews:").not());
    }
}
