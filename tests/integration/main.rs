//! Integration tests for Depot

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Temp config with file storage under the same temp dir
    struct Sandbox {
        dir: TempDir,
        config: PathBuf,
    }

    impl Sandbox {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let config = dir.path().join("config.toml");
            let storage = dir.path().join("storage");
            std::fs::write(
                &config,
                format!(
                    r#"
[general]
audit_log = true

[storage]
backend = "file"
root = "{}"

[upstream]
timeout_secs = 2

[repositories.releases]
format = "raw"

[repositories.down]
format = "raw"
remote_url = "http://127.0.0.1:9"
"#,
                    storage.display().to_string().replace('\\', "/")
                ),
            )
            .unwrap();
            Self { dir, config }
        }

        fn path(&self) -> &Path {
            self.dir.path()
        }

        fn depot(&self) -> Command {
            let mut cmd = depot();
            cmd.env("DEPOT_CONFIG", &self.config);
            cmd
        }
    }

    fn depot() -> Command {
        let mut cmd = cargo_bin_cmd!("depot");
        cmd.env_remove("RUST_LOG");
        cmd
    }

    #[test]
    fn help_displays() {
        depot()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("caching proxy registry"));
    }

    #[test]
    fn version_displays() {
        depot()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("depot"));
    }

    #[test]
    fn config_path_follows_env() {
        let sandbox = Sandbox::new();
        sandbox
            .depot()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let sandbox = Sandbox::new();
        sandbox
            .depot()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]"))
            .stdout(predicate::str::contains("[repositories.releases]"));
    }

    #[test]
    fn config_init_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("fresh.toml");

        depot()
            .env("DEPOT_CONFIG", &config)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration initialized"));
        assert!(config.exists());

        depot()
            .env("DEPOT_CONFIG", &config)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("bad.toml");
        std::fs::write(&config, "[repositories.pods]\nformat = \"cocoapods\"\n").unwrap();

        depot()
            .env("DEPOT_CONFIG", &config)
            .arg("repos")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn repos_lists_configured_repositories() {
        let sandbox = Sandbox::new();
        sandbox
            .depot()
            .args(["repos", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("down"))
            .stdout(predicate::str::contains("releases"));

        sandbox
            .depot()
            .args(["repos", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"hosted\""))
            .stdout(predicate::str::contains("http://127.0.0.1:9"));
    }

    #[test]
    fn fetch_unknown_repository() {
        let sandbox = Sandbox::new();
        sandbox
            .depot()
            .args(["fetch", "nope", "pkg/a"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Repository not found"))
            .stderr(predicate::str::contains("depot repos"));
    }

    #[test]
    fn fetch_missing_hosted_artifact() {
        let sandbox = Sandbox::new();
        sandbox
            .depot()
            .args(["fetch", "releases", "tools/app.zip"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Not found: releases/tools/app.zip"));
    }

    #[test]
    fn fetch_from_unreachable_upstream() {
        let sandbox = Sandbox::new();
        sandbox
            .depot()
            .args(["fetch", "down", "pkg/a", "-o"])
            .arg(sandbox.path().join("out.bin"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Upstream unavailable"));
        assert!(!sandbox.path().join("out.bin").exists());
    }

    #[test]
    fn fetch_writes_audit_log() {
        let sandbox = Sandbox::new();
        let _ = sandbox.depot().args(["fetch", "releases", "missing"]).assert();

        let log = std::fs::read_to_string(sandbox.path().join("storage").join("audit.log")).unwrap();
        assert!(log.contains("\"proxy.fetch\""));
        assert!(log.contains("cli:"));
    }

    #[test]
    fn browse_empty_repository() {
        let sandbox = Sandbox::new();
        sandbox
            .depot()
            .args(["browse", "releases"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing under releases"))
            .stdout(predicate::str::contains("depot rebuild releases"));
    }

    #[test]
    fn gc_sweeps_every_repository() {
        let sandbox = Sandbox::new();
        sandbox
            .depot()
            .args(["gc"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Collected 0 orphaned blob(s)"));

        sandbox
            .depot()
            .args(["gc", "nope"])
            .assert()
            .failure();
    }

    #[test]
    fn rebuild_empty_repository() {
        let sandbox = Sandbox::new();
        sandbox
            .depot()
            .args(["rebuild", "releases"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Indexed 0 artifact(s)"));
    }

    #[test]
    fn invalidate_requires_confirmation() {
        let sandbox = Sandbox::new();
        sandbox
            .depot()
            .args(["invalidate", "down"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Invalidation skipped"));

        sandbox
            .depot()
            .args(["invalidate", "down", "--yes"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Expired 0 entries"));
    }

    #[test]
    fn delete_missing_artifact() {
        let sandbox = Sandbox::new();
        sandbox
            .depot()
            .args(["delete", "releases", "pkg/a", "--yes"])
            .assert()
            .success()
            .stdout(predicate::str::contains("is not stored"));
    }
}
