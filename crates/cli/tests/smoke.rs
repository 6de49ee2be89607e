use std::path::Path;

fn run(config_dir: &Path, args: &[&str]) -> (i32, String) {
    let mut out = Vec::new();
    let mut full = vec!["vaultsync", "--config-dir", config_dir.to_str().unwrap()];
    full.extend_from_slice(args);
    let status = cli::run(full, &mut out);
    (status, String::from_utf8(out).unwrap())
}

#[test]
fn add_list_and_switch_account() {
    let dir = tempfile::tempdir().unwrap();

    let (status, out) = run(
        dir.path(),
        &["account", "add", "--email", "alice@example.com", "--password", "hunter2"],
    );
    assert_eq!(status, 0, "add failed: {out}");
    assert!(out.contains("\"event\":\"account_added\""));
    assert!(out.contains("alice@example.com"));

    let (status, out) = run(dir.path(), &["account", "list"]);
    assert_eq!(status, 0);
    assert!(out.contains("account_list"));
    assert!(out.contains("alice@example.com"));

    let (status, out) = run(
        dir.path(),
        &["account", "add", "--email", "bob@example.com", "--password", "swordfish"],
    );
    assert_eq!(status, 0, "second add failed: {out}");
    let id: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
    let bob_id = id["id"].as_str().unwrap().to_string();

    let (status, out) = run(dir.path(), &["account", "switch", &bob_id]);
    assert_eq!(status, 0, "switch failed: {out}");
    assert!(out.contains("account_switched"));
}

#[test]
fn duplicate_email_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (status, _) = run(
        dir.path(),
        &["account", "add", "--email", "dup@example.com", "--password", "p"],
    );
    assert_eq!(status, 0);

    let (status, out) = run(
        dir.path(),
        &["account", "add", "--email", "dup@example.com", "--password", "p"],
    );
    assert_ne!(status, 0, "expected duplicate email to fail: {out}");
    assert!(out.contains("\"event\":\"error\""));
}

#[test]
fn group_add_and_remove_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let (status, out) = run(dir.path(), &["group", "add", "--name", "Work"]);
    assert_eq!(status, 0);
    let value: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
    let group_id = value["id"].as_str().unwrap().to_string();

    let (status, out) = run(dir.path(), &["group", "remove", &group_id]);
    assert_eq!(status, 0, "remove failed: {out}");
    assert!(out.contains("group_removed"));
}

#[test]
fn copy_between_two_accounts_completes() {
    let dir = tempfile::tempdir().unwrap();

    let (_, out) = run(
        dir.path(),
        &["account", "add", "--email", "src@example.com", "--password", "p"],
    );
    let src: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
    let src_id = src["id"].as_str().unwrap().to_string();

    let (_, out) = run(
        dir.path(),
        &["account", "add", "--email", "dst@example.com", "--password", "p"],
    );
    let dst: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
    let dst_id = dst["id"].as_str().unwrap().to_string();

    let (status, out) = run(
        dir.path(),
        &[
            "copy", "--from", &src_id, "--to", &dst_id, "--dest", "/", "/missing-file",
        ],
    );
    assert_eq!(status, 0, "copy command failed: {out}");
    assert!(out.contains("transfer_queued"));
    assert!(out.contains("transfer_failed") || out.contains("transfer_completed"));
}

#[test]
fn log_list_reports_empty_history() {
    let dir = tempfile::tempdir().unwrap();
    let (status, out) = run(dir.path(), &["log", "list"]);
    assert_eq!(status, 0, "log list failed: {out}");
    assert!(out.contains("transfer_log"));
}
