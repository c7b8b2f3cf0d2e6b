//! Integration tests for Tether

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn tether() -> Command {
        cargo_bin_cmd!("tether")
    }

    /// Write a config that keeps every path inside `dir`
    fn isolated_config(dir: &Path) -> std::path::PathBuf {
        let config = dir.join("config.toml");
        let store = dir.join("sessions.db");
        std::fs::write(
            &config,
            format!(
                "[general]\naudit_log = false\n\n[store]\npath = {:?}\n",
                store.display().to_string()
            ),
        )
        .unwrap();
        config
    }

    #[test]
    fn help_displays() {
        tether()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("messaging session gateway"));
    }

    #[test]
    fn version_displays() {
        tether()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("tether"));
    }

    #[test]
    fn serve_help_lists_flags() {
        tether()
            .args(["serve", "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--session"))
            .stdout(predicate::str::contains("--no-restore"));
    }

    #[test]
    fn list_empty() {
        let dir = TempDir::new().unwrap();
        let config = isolated_config(dir.path());
        tether()
            .arg("--config")
            .arg(&config)
            .args(["list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No sessions"));
    }

    #[test]
    fn list_empty_json() {
        let dir = TempDir::new().unwrap();
        let config = isolated_config(dir.path());
        tether()
            .arg("--config")
            .arg(&config)
            .args(["list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::diff("[]\n"));
    }

    #[test]
    fn config_path() {
        tether()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        tether()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("[retry]"));
    }

    #[test]
    fn config_init_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("fresh.toml");

        tether()
            .arg("--config")
            .arg(&config)
            .args(["config", "init"])
            .assert()
            .success();
        assert!(config.exists());

        tether()
            .arg("--config")
            .arg(&config)
            .args(["config", "init"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--force"));
    }

    #[test]
    fn invalid_config_is_reported() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("broken.toml");
        std::fs::write(&config, "[retry]\nmax_attempts = \"lots\"\n").unwrap();

        tether()
            .arg("--config")
            .arg(&config)
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn serve_rejects_invalid_session_id() {
        let dir = TempDir::new().unwrap();
        let config = isolated_config(dir.path());
        tether()
            .arg("--config")
            .arg(&config)
            .args(["serve", "--bind", "127.0.0.1:0", "--session", "bad/id"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("bad/id"));
    }

    #[test]
    fn unknown_command_fails() {
        tether().arg("frobnicate").assert().failure();
    }
}
