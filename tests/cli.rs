use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn snap_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_snap"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Local files to upload
    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("service.py"),
        "import os\n\nclass Service:\n    def run(self, job):\n        return os.getenv('JOB')\n\ndef helper(a, b):\n    return a + b\n",
    )
    .unwrap();
    fs::write(
        files_dir.join("orders.csv"),
        "id,name,total\n1,alpha,9.5\n2,beta,3\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/snap.sqlite"

[staging]
root = "{root}/staging"
exclude_globs = ["**/*.snap"]

[pipeline]
workers = 2
parser_timeout_secs = 10
"#,
        root = root.display()
    );

    let config_path = config_dir.join("snap.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_snap(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = snap_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("SNAP_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run snap binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn run_json(config_path: &Path, args: &[&str]) -> Value {
    let (stdout, stderr, success) = run_snap(config_path, args);
    assert!(success, "snap {:?} failed: {}", args, stderr);
    serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("bad JSON ({}): {}", e, stdout))
}

/// Stage both sample files for `project` and process it.
fn stage_and_process(tmp: &TempDir, config: &Path, project: &str) -> Value {
    let files = tmp.path().join("files");
    let service = files.join("service.py");
    let orders = files.join("orders.csv");
    run_json(
        config,
        &["stage", project, "src/service.py", "--file", service.to_str().unwrap()],
    );
    run_json(
        config,
        &["stage", project, "data/orders.csv", "--file", orders.to_str().unwrap()],
    );
    run_json(config, &["process", project, "--vendor-id", "acme", "--progress", "off"])
}

#[test]
fn test_init() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_snap(&config, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully"));

    // Idempotent
    let (_, _, success) = run_snap(&config, &["init"]);
    assert!(success);
}

#[test]
fn test_stage_and_list() {
    let (_tmp, config) = setup_test_env();
    let staged = run_json(
        &config,
        &["stage", "alpha", "notes/todo.md", "--content", "# Todo\n\n- ship it\n"],
    );
    assert_eq!(staged["project_id"], "alpha");
    assert_eq!(staged["path"], "notes/todo.md");

    let info = run_json(&config, &["staging", "alpha"]);
    assert_eq!(info["exists"], true);
    assert_eq!(info["file_count"], 1);
    assert_eq!(info["files"][0]["path"], "notes/todo.md");

    let other = run_json(&config, &["staging", "beta"]);
    assert_eq!(other["exists"], false);
    assert_eq!(other["file_count"], 0);
}

#[test]
fn test_stage_base64_content() {
    let (_tmp, config) = setup_test_env();
    // "a,b\n1,2\n"
    let staged = run_json(
        &config,
        &["stage", "alpha", "t.csv", "--content", "YSxiCjEsMgo=", "--encoding", "base64"],
    );
    assert_eq!(staged["bytes"], 8);
}

#[test]
fn test_stage_rejects_unsafe_names() {
    let (_tmp, config) = setup_test_env();
    for name in ["../escape.py", "con.py", ".env", "a/.git/config"] {
        let (_, stderr, success) = run_snap(&config, &["stage", "alpha", name, "--content", "x"]);
        assert!(!success, "{} was accepted", name);
        assert!(!stderr.is_empty());
    }
    let info = run_json(&config, &["staging", "alpha"]);
    assert_eq!(info["file_count"], 0);
}

#[test]
fn test_stage_requires_content() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_snap(&config, &["stage", "alpha", "a.py"]);
    assert!(!success);
    assert!(stderr.contains("--file or --content"));
}

#[test]
fn test_process_and_query() {
    let (tmp, config) = setup_test_env();
    let manifest = stage_and_process(&tmp, &config, "alpha");
    assert_eq!(manifest["state"], "DONE");
    assert_eq!(manifest["files_seen"], 2);
    assert_eq!(manifest["files_processed"], 2);
    assert_eq!(manifest["files_failed"], 0);
    assert_eq!(manifest["snapshot_counts"]["functions"], 1);
    assert_eq!(manifest["snapshot_counts"]["csv_schema"], 1);
    assert_eq!(manifest["snapshot_counts"]["repo_metadata"], 1);

    let functions = run_json(&config, &["query", "alpha", "--type", "functions"]);
    assert_eq!(functions["count"], 1);
    assert_eq!(functions["snapshots"][0]["source_path"], "src/service.py");
    assert_eq!(functions["snapshots"][0]["fields"]["function_count"], 2);

    let by_path = run_json(&config, &["query", "alpha", "--path", "data/orders.csv"]);
    let types: Vec<&str> = by_path["snapshots"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["snapshot_type"].as_str().unwrap())
        .collect();
    assert!(types.contains(&"csv_data"));
    assert!(types.contains(&"csv_schema"));
    assert!(by_path["snapshots"]
        .as_array()
        .unwrap()
        .iter()
        .all(|s| s["project_id"] == "alpha"));
}

#[test]
fn test_process_with_vendor_id() {
    let (tmp, config) = setup_test_env();
    let service = tmp.path().join("files/service.py");
    run_json(
        &config,
        &["stage", "alpha", "service.py", "--file", service.to_str().unwrap()],
    );
    let manifest = run_json(
        &config,
        &["process", "alpha", "--vendor-id", "acme", "--progress", "off"],
    );
    assert_eq!(manifest["vendor_id"], "acme");
}

#[test]
fn test_process_requires_vendor_id() {
    let (tmp, config) = setup_test_env();
    let service = tmp.path().join("files/service.py");
    run_json(
        &config,
        &["stage", "alpha", "service.py", "--file", service.to_str().unwrap()],
    );
    let (stdout, stderr, success) = run_snap(&config, &["process", "alpha", "--progress", "off"]);
    assert!(!success);
    assert!(stdout.is_empty());
    assert!(stderr.contains("--vendor-id"), "{}", stderr);

    let (_, _, success) = run_snap(
        &config,
        &["process", "alpha", "--vendor-id", "", "--progress", "off"],
    );
    assert!(!success);
}

#[test]
fn test_process_without_staging_fails() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_snap(&config, &["process", "ghost", "--vendor-id", "acme", "--progress", "off"]);
    assert!(!success);
    assert!(stdout.is_empty());
    assert!(stderr.contains("ghost"));
}

#[test]
fn test_process_json_progress() {
    let (tmp, config) = setup_test_env();
    let service = tmp.path().join("files/service.py");
    run_json(
        &config,
        &["stage", "alpha", "service.py", "--file", service.to_str().unwrap()],
    );
    let (stdout, stderr, success) = run_snap(&config, &["process", "alpha", "--vendor-id", "acme", "--progress", "json"]);
    assert!(success, "{}", stderr);
    let manifest: Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(manifest["files_processed"], 1);
    let events: Vec<Value> = stderr
        .lines()
        .filter_map(|l| serde_json::from_str::<Value>(l).ok())
        .filter(|v| v.get("event").is_some())
        .collect();
    assert!(events
        .iter()
        .any(|e| e["event"] == "state" && e["state"] == "DONE"));
    assert!(events
        .iter()
        .any(|e| e["event"] == "progress" && e["n"] == 1 && e["total"] == 1));
}

#[test]
fn test_clone_rejects_disallowed_host() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_snap(
        &config,
        &[
            "process",
            "alpha",
            "--vendor-id",
            "acme",
            "--url",
            "https://evil.example/acme/repo",
            "--progress",
            "off",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("evil.example"));
}

#[test]
fn test_branch_requires_url() {
    let (_tmp, config) = setup_test_env();
    let (_, _, success) = run_snap(&config, &["process", "alpha", "--vendor-id", "acme", "--branch", "main"]);
    assert!(!success);
}

#[test]
fn test_query_unknown_type() {
    let (_tmp, config) = setup_test_env();
    let (_, _, success) = run_snap(&config, &["query", "alpha", "--type", "embeddings"]);
    assert!(!success);
}

#[test]
fn test_manifest_and_notebook() {
    let (tmp, config) = setup_test_env();
    let processed = stage_and_process(&tmp, &config, "alpha");

    let manifest = run_json(&config, &["manifest", "alpha"]);
    assert_eq!(manifest["project_id"], "alpha");
    assert_eq!(manifest["total_snapshots"], processed["total_snapshots"]);
    assert_eq!(manifest["file_count"], 2);
    assert!(manifest["last_processed_at"].is_string());

    let notebook = run_json(&config, &["notebook", "alpha"]);
    assert_eq!(notebook["repo"]["name"], "alpha");
    let paths: Vec<&str> = notebook["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["source_path"].as_str().unwrap())
        .collect();
    assert_eq!(paths, vec!["data/orders.csv", "src/service.py"]);
    assert!(notebook["files"][1]["snapshots"]["functions"].is_object());
}

#[test]
fn test_manifest_of_unknown_project_is_empty() {
    let (_tmp, config) = setup_test_env();
    let manifest = run_json(&config, &["manifest", "nobody"]);
    assert_eq!(manifest["total_snapshots"], 0);
    assert_eq!(manifest["counts_by_type"]["functions"], 0);
    assert!(manifest["last_processed_at"].is_null());
}

#[test]
fn test_projects_are_isolated() {
    let (tmp, config) = setup_test_env();
    stage_and_process(&tmp, &config, "alpha");
    run_json(&config, &["stage", "beta", "only.md", "--content", "# Beta\n\nJust notes.\n"]);
    run_json(&config, &["process", "beta", "--vendor-id", "acme", "--progress", "off"]);

    let beta = run_json(&config, &["query", "beta"]);
    let snapshots = beta["snapshots"].as_array().unwrap();
    assert!(!snapshots.is_empty());
    assert!(snapshots.iter().all(|s| s["project_id"] == "beta"));
    assert!(snapshots
        .iter()
        .all(|s| s["source_path"] == "only.md" || s["source_path"] == "."));

    let alpha = run_json(&config, &["query", "alpha", "--path", "only.md"]);
    assert_eq!(alpha["count"], 0);
}

#[test]
fn test_clear_staging() {
    let (_tmp, config) = setup_test_env();
    run_json(&config, &["stage", "alpha", "a.py", "--content", "x = 1\n"]);
    run_json(&config, &["stage", "alpha", "b.py", "--content", "y = 2\n"]);
    let cleared = run_json(&config, &["clear-staging", "alpha"]);
    assert_eq!(cleared["removed"], 2);
    let info = run_json(&config, &["staging", "alpha"]);
    assert_eq!(info["file_count"], 0);
}

#[test]
fn test_delete_cascades() {
    let (tmp, config) = setup_test_env();
    let processed = stage_and_process(&tmp, &config, "alpha");

    let outcome = run_json(&config, &["delete", "alpha"]);
    assert_eq!(outcome["records_removed"], processed["total_snapshots"]);
    assert_eq!(outcome["files_removed"], 2);

    let after = run_json(&config, &["query", "alpha"]);
    assert_eq!(after["count"], 0);
    let info = run_json(&config, &["staging", "alpha"]);
    assert_eq!(info["exists"], false);
}

#[test]
fn test_stats() {
    let (tmp, config) = setup_test_env();
    stage_and_process(&tmp, &config, "alpha");
    let (stdout, stderr, success) = run_snap(&config, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    assert!(stdout.contains("Snapshot Harness"));
    assert!(stdout.contains("functions"));
    assert!(stdout.contains("csv_schema"));
}

#[test]
fn test_missing_config() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");
    let (_, stderr, success) = run_snap(&missing, &["stats"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_invalid_project_id() {
    let (_tmp, config) = setup_test_env();
    let (_, _, success) = run_snap(&config, &["manifest", "../alpha"]);
    assert!(!success);
}
