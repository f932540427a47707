//! Integration tests for CLI argument handling
//!
//! Runs the binary for parse-level behavior and for the commands that work
//! without the network.

use std::process::Command;

use tempfile::TempDir;

/// Helper to run the CLI with given args and capture output
fn run_cli(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_mutapa-worker"))
        .args(args)
        .env_remove("MUTAPA_WORKER_CONFIG")
        .output()
        .expect("Failed to execute mutapa-worker")
}

#[test]
fn test_help_flag_exits_successfully() {
    let output = run_cli(&["--help"]);
    assert!(
        output.status.success(),
        "Expected --help to exit successfully"
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("mutapa-worker"), "Help should mention mutapa-worker");
    assert!(stdout.contains("install"), "Help should list the install command");
    assert!(stdout.contains("push"), "Help should list the push command");
}

#[test]
fn test_unknown_subcommand_prints_error_and_exits() {
    let output = run_cli(&["deploy"]);
    assert!(!output.status.success(), "Expected unknown command to fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("unrecognized") || stderr.contains("invalid"),
        "Should print error message about the subcommand: {}",
        stderr
    );
}

#[test]
fn test_invalid_fetch_target_fails() {
    let cache = TempDir::new().expect("Failed to create temp directory");
    let dir = cache.path().to_str().unwrap();
    let output = run_cli(&["--offline", "--cache-dir", dir, "fetch", "article.html"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Invalid URL"), "stderr: {}", stderr);
}

#[test]
fn test_status_on_empty_cache_dir() {
    let cache = TempDir::new().expect("Failed to create temp directory");
    let dir = cache.path().to_str().unwrap();
    let output = run_cli(&["--offline", "--cache-dir", dir, "status"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let record: serde_json::Value = serde_json::from_str(&stdout).expect("status prints JSON");
    assert!(record["active"].is_null());
    assert!(record["waiting"].is_null());
}

#[test]
fn test_offline_install_fails_without_generation() {
    let cache = TempDir::new().expect("Failed to create temp directory");
    let dir = cache.path().to_str().unwrap();
    let output = run_cli(&["--offline", "--cache-dir", dir, "install"]);
    assert!(!output.status.success());

    let output = run_cli(&["--offline", "--cache-dir", dir, "generations"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).trim().is_empty());
}

#[test]
fn test_push_click_opens_page() {
    let cache = TempDir::new().expect("Failed to create temp directory");
    let dir = cache.path().to_str().unwrap();
    let output = run_cli(&[
        "--offline",
        "--cache-dir",
        dir,
        "push",
        r#"{"notification":{"title":"Breaking"},"data":{"url":"/articles.html"}}"#,
        "--click",
    ]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"title\": \"Breaking\""));
    assert!(stdout.contains("\"action\": \"opened\""));
    assert!(stdout.contains("https://www.mutapatimes.com/articles.html"));
}

#[cfg(test)]
mod unit_tests {
    //! Unit tests for CLI parsing that don't require running the binary

    use clap::Parser;
    use mutapa_worker::cli::{parse_target, Cli, Command};
    use mutapa_worker::config::WorkerConfig;

    #[test]
    fn test_cli_fetch_defaults() {
        let cli = Cli::parse_from(["mutapa-worker", "fetch", "/index.html"]);
        assert_eq!(
            cli.command,
            Command::Fetch {
                url: "/index.html".to_string(),
                navigate: false,
                output: None,
            }
        );
    }

    #[test]
    fn test_cli_push_without_clients() {
        let cli = Cli::parse_from(["mutapa-worker", "push", "Power cuts extended"]);
        assert_eq!(
            cli.command,
            Command::Push {
                payload: "Power cuts extended".to_string(),
                click: false,
                clients: vec![],
            }
        );
    }

    #[test]
    fn test_parse_target_keeps_query() {
        let url = parse_target("/data/weather.json?city=harare", &WorkerConfig::default()).unwrap();
        assert_eq!(url.query(), Some("city=harare"));
    }
}
