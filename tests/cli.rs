use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tempfile::TempDir;

use lightning_serve::config::load_config;

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_lightning-serve"))
}

fn write_config(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("lightning.toml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_load_config_from_file() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(
        &tmp,
        r#"
[server]
bind = "0.0.0.0:9000"
allowed_origins = ["https://app.example.com"]

[retrieval]
default_top_k = 5

[cache]
ttl_secs = 30
capacity = 100
"#,
    );

    let config = load_config(&path).unwrap();
    assert_eq!(config.server.bind, "0.0.0.0:9000");
    assert_eq!(config.server.allowed_origins, vec!["https://app.example.com"]);
    assert_eq!(config.retrieval.default_top_k, 5);
    assert_eq!(config.cache.capacity, 100);

    let params = config.pipeline_params();
    assert_eq!(params.default_top_k, 5);
    assert_eq!(params.cache.ttl.as_secs(), 30);
}

#[test]
fn test_load_config_reports_invalid_values() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(&tmp, "[pipeline]\nmax_concurrency = 0\n");
    let err = load_config(&path).unwrap_err();
    assert!(err.to_string().contains("max_concurrency"));

    let path = write_config(&tmp, "[server\nbind = ");
    assert!(load_config(&path).is_err());
}

#[test]
fn test_help_lists_commands() {
    let output = Command::new(binary()).arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("serve"));
    assert!(stdout.contains("bench"));
}

#[test]
fn test_serve_with_missing_explicit_config_fails() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");
    let output = Command::new(binary())
        .args(["--config", missing.to_str().unwrap(), "serve"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to read config file"), "stderr: {}", stderr);
}

#[test]
fn test_bench_against_unreachable_server_counts_errors() {
    let output = Command::new(binary())
        .args([
            "bench",
            "--url",
            "http://127.0.0.1:9",
            "--queries",
            "3",
            "--concurrency",
            "2",
            "--timeout-secs",
            "5",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("requests:     3"), "stdout: {}", stdout);
    assert!(stdout.contains("errors:       3 (100.0%)"), "stdout: {}", stdout);
}
