//! CLI tests for the edr-agent binary.

use assert_cmd::Command;
use chrono::Utc;
use edr_common::{CanonicalEvent, EventFields, PlatformTag, ProcessFields};
use edr_spool::Spool;
use predicates::prelude::*;
use std::collections::BTreeMap;
use std::path::Path;
use tempfile::TempDir;

fn edr_agent() -> Command {
    let mut cmd = Command::cargo_bin("edr-agent").expect("edr-agent binary should exist");
    // Keep host configuration out of the tests.
    cmd.env_remove("EDR_AGENT_CONFIG")
        .env_remove("EDR_AGENT_CONFIG_DIR")
        .env("EDR_LOG", "error");
    cmd
}

fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("agent.json");
    std::fs::write(&path, body).unwrap();
    path
}

fn event(pid: u32) -> CanonicalEvent {
    CanonicalEvent {
        event_id: uuid::Uuid::new_v4(),
        timestamp: Utc::now(),
        hostname: "cli-host".into(),
        os_type: PlatformTag::Linux,
        fields: EventFields::Process(ProcessFields {
            pid,
            ..ProcessFields::default()
        }),
        os_variant_fields: BTreeMap::new(),
    }
}

mod version {
    use super::*;

    #[test]
    fn json_version() {
        edr_agent()
            .arg("version")
            .assert()
            .success()
            .stdout(predicate::str::contains("\"agent_version\""))
            .stdout(predicate::str::contains("\"schema_version\""));
    }

    #[test]
    fn summary_version() {
        edr_agent()
            .args(["version", "--format", "summary"])
            .assert()
            .success()
            .stdout(predicate::str::starts_with("edr-agent "));
    }

    #[test]
    fn unknown_command_fails() {
        edr_agent()
            .arg("nonexistent-command")
            .assert()
            .failure()
            .stderr(predicate::str::contains("error"));
    }
}

mod config {
    use super::*;

    #[test]
    fn validate_accepts_good_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(dir.path(), r#"{"collector": {"host": "10.0.0.5", "port": 6000}}"#);
        edr_agent()
            .args(["config", "validate"])
            .arg(&path)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"status\": \"valid\""));
    }

    #[test]
    fn validate_rejects_zero_port() {
        let dir = TempDir::new().unwrap();
        let path = write_config(dir.path(), r#"{"collector": {"port": 0}}"#);
        edr_agent()
            .args(["config", "validate"])
            .arg(&path)
            .assert()
            .code(11)
            .stdout(predicate::str::contains("\"validation_code\":65"));
    }

    #[test]
    fn validate_rejects_broken_json() {
        let dir = TempDir::new().unwrap();
        let path = write_config(dir.path(), "{ not json");
        edr_agent()
            .args(["config", "validate"])
            .arg(&path)
            .assert()
            .code(11)
            .stdout(predicate::str::contains("\"validation_code\":61"));
    }

    #[test]
    fn show_reports_source_and_values() {
        let dir = TempDir::new().unwrap();
        let path = write_config(dir.path(), r#"{"collector": {"host": "collector.internal"}}"#);
        edr_agent()
            .arg("--config")
            .arg(&path)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("collector.internal"))
            .stdout(predicate::str::contains("\"source\""));
    }

    #[test]
    fn environment_path_is_used() {
        let dir = TempDir::new().unwrap();
        let path = write_config(dir.path(), r#"{"collector": {"host": "from-env.internal"}}"#);
        edr_agent()
            .env("EDR_AGENT_CONFIG", &path)
            .args(["config", "show", "--format", "summary"])
            .assert()
            .success()
            .stdout(predicate::str::contains("from-env.internal"));
    }
}

mod spool {
    use super::*;

    #[test]
    fn status_of_empty_spool() {
        let dir = TempDir::new().unwrap();
        edr_agent()
            .args(["spool", "status", "--dir"])
            .arg(dir.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("\"pending\": 0"));
        assert!(dir.path().join("pending").is_dir());
    }

    #[test]
    fn list_shows_pending_ids_in_order() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();
        let first = spool.enqueue(&event(1)).unwrap();
        let second = spool.enqueue(&event(2)).unwrap();

        let output = edr_agent()
            .args(["spool", "list", "--format", "summary", "--dir"])
            .arg(dir.path())
            .output()
            .unwrap();
        assert!(output.status.success());
        let stdout = String::from_utf8(output.stdout).unwrap();
        let lines: Vec<&str> = stdout.lines().collect();
        assert_eq!(lines, vec![first.as_str(), second.as_str()]);
    }

    #[test]
    fn quarantined_entries_need_attention() {
        let dir = TempDir::new().unwrap();
        let spool = Spool::open(dir.path()).unwrap();
        let id = spool.enqueue(&event(3)).unwrap();
        std::fs::write(spool.pending_path(&id), b"truncated{").unwrap();
        assert!(spool.read(&id).is_err());

        edr_agent()
            .args(["spool", "status", "--dir"])
            .arg(dir.path())
            .assert()
            .code(1)
            .stdout(predicate::str::contains("\"quarantined\": 1"));

        edr_agent()
            .args(["spool", "quarantine", "--dir"])
            .arg(dir.path())
            .assert()
            .success()
            .stdout(predicate::str::contains(id.as_str()));
    }
}

#[cfg(unix)]
mod run {
    use super::*;
    use std::net::TcpListener;
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    #[test]
    fn sigterm_stops_agent_cleanly() {
        let dir = TempDir::new().unwrap();
        let spool_dir = dir.path().join("spool");
        let watch_dir = dir.path().join("watch");
        std::fs::create_dir(&watch_dir).unwrap();
        // A port nobody listens on: the agent runs offline.
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let config = serde_json::json!({
            "collector": {"host": "127.0.0.1", "port": port, "reconnect_interval_secs": 1},
            "probes": {
                "enable_process": false,
                "enable_network": false,
                "enable_file": true,
                "watch_paths": [watch_dir],
            },
            "spool": {"dir": spool_dir},
        });
        let path = write_config(dir.path(), &config.to_string());

        let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("edr-agent"))
            .arg("--config")
            .arg(&path)
            .arg("run")
            .env("EDR_LOG", "error")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        std::thread::sleep(Duration::from_millis(500));
        std::fs::write(watch_dir.join("dropped.txt"), b"payload").unwrap();
        std::thread::sleep(Duration::from_millis(500));
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }

        let deadline = Instant::now() + Duration::from_secs(15);
        let status = loop {
            if let Some(status) = child.try_wait().unwrap() {
                break status;
            }
            if Instant::now() > deadline {
                let _ = child.kill();
                panic!("agent did not exit after SIGTERM");
            }
            std::thread::sleep(Duration::from_millis(50));
        };
        assert_eq!(status.code(), Some(0));

        // Offline: the file event is still waiting in the spool.
        let spool = Spool::open(&spool_dir).unwrap();
        assert!(spool.pending_count().unwrap() >= 1);
    }
}
