use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ragcli_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ragcli"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    setup_with_extra("")
}

/// Temp workspace whose Ollama endpoint refuses connections.
fn setup_with_extra(extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.",
    )
    .unwrap();
    fs::write(files_dir.join("scan.pdf"), "%PDF-1.4").unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/ragcli.sqlite"

[ollama]
endpoint = "http://127.0.0.1:1"

[embedding]
timeout_secs = 2
max_retries = 0

[logging]
level = "warn"
{}"#,
        root.display(),
        extra
    );

    let config_path = config_dir.join("ragcli.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ragcli(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ragcli_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ragcli binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn files_dir(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("files")
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ragcli(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/ragcli.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_ragcli(&config_path, &["init"]);
    assert!(first, "First init failed");
    let (_, _, second) = run_ragcli(&config_path, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[test]
fn test_status_on_empty_database() {
    let (_tmp, config_path) = setup_test_env();
    run_ragcli(&config_path, &["init"]);

    let (stdout, stderr, success) = run_ragcli(&config_path, &["status"]);
    assert!(success, "status failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Documents:   0"));
    assert!(stdout.contains("Strategy:    EXACT"));
    assert!(stdout.contains("unavailable"));
}

#[test]
fn test_documents_list_empty() {
    let (_tmp, config_path) = setup_test_env();
    run_ragcli(&config_path, &["init"]);

    let (stdout, _, success) = run_ragcli(&config_path, &["documents", "list"]);
    assert!(success);
    assert!(stdout.contains("No documents."));
}

#[test]
fn test_upload_unreachable_provider_marks_error() {
    let (_tmp, config_path) = setup_test_env();
    run_ragcli(&config_path, &["init"]);

    let alpha = files_dir(&config_path).join("alpha.md");
    let (stdout, stderr, success) = run_ragcli(
        &config_path,
        &["upload", alpha.to_str().unwrap(), "--progress", "off"],
    );
    assert!(!success, "upload should fail: stdout={}", stdout);
    assert!(stderr.contains("unreachable"), "stderr={}", stderr);
    assert!(stderr.contains("1 of 1 uploads failed"));

    let (stdout, _, success) = run_ragcli(&config_path, &["documents", "list"]);
    assert!(success);
    assert!(stdout.contains("ERROR"), "stdout={}", stdout);
    assert!(stdout.contains("alpha.md"));
}

#[test]
fn test_upload_rejects_unsupported_format() {
    let (_tmp, config_path) = setup_test_env();
    run_ragcli(&config_path, &["init"]);

    let pdf = files_dir(&config_path).join("scan.pdf");
    let (_, stderr, success) = run_ragcli(
        &config_path,
        &["upload", pdf.to_str().unwrap(), "--progress", "off"],
    );
    assert!(!success);
    assert!(stderr.contains("unsupported format 'pdf'"), "stderr={}", stderr);

    // rejected before a document record exists
    let (stdout, _, _) = run_ragcli(&config_path, &["documents", "list"]);
    assert!(stdout.contains("No documents."));
}

#[test]
fn test_search_fails_when_provider_unreachable() {
    let (_tmp, config_path) = setup_test_env();
    run_ragcli(&config_path, &["init"]);

    let (_, stderr, success) = run_ragcli(&config_path, &["search", "rust"]);
    assert!(!success);
    assert!(stderr.contains("unreachable"), "stderr={}", stderr);
}

#[test]
fn test_delete_unknown_document() {
    let (_tmp, config_path) = setup_test_env();
    run_ragcli(&config_path, &["init"]);

    let (_, stderr, success) = run_ragcli(&config_path, &["documents", "delete", "nope"]);
    assert!(!success);
    assert!(stderr.contains("not found"), "stderr={}", stderr);
}

#[test]
fn test_invalid_config_is_rejected() {
    let (_tmp, config_path) = setup_with_extra("\n[documents]\nchunk_overlap_percentage = 95\n");

    let (_, stderr, success) = run_ragcli(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("chunk_overlap_percentage"), "stderr={}", stderr);
}

#[test]
fn test_models_lists_registry_without_ollama() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ragcli(&config_path, &["models"]);
    assert!(success, "models failed: {}", stderr);
    assert!(stdout.contains("nomic-embed-text"));
    assert!(stdout.contains("gemma3:270m"));
    assert!(stderr.contains("unavailable"));
}
