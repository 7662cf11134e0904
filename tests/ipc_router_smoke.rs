use serde_json::json;
use std::io::Write;

mod test_support;

use test_support::{
    error_code, read_response, request, request_err, request_ok, select_workspace, spawn_sidecar,
    temp_dir,
};

#[test]
fn health_and_store_less_methods_work_before_workspace() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health["version"].as_str(), Some(env!("CARGO_PKG_VERSION")));
    assert!(health["workspacePath"].is_null());

    let template = request_ok(&mut stdin, &mut reader, "2", "import.sampleTemplate", json!({}));
    assert!(template["csv"]
        .as_str()
        .unwrap_or("")
        .starts_with("QuestionType,QuestionText,Required"));

    let err = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "skills.list",
        json!({}),
    );
    assert_eq!(error_code(&err), "no_workspace");

    let err = request_err(&mut stdin, &mut reader, "4", "nope.method", json!({}));
    assert_eq!(error_code(&err), "not_implemented");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn bad_json_line_gets_error_and_loop_continues() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let resp = read_response(&mut reader);
    assert_eq!(resp["ok"].as_bool(), Some(false));
    assert_eq!(resp["error"]["code"].as_str(), Some("bad_json"));

    let health = request(&mut stdin, &mut reader, "after", "health", json!({}));
    assert_eq!(health["ok"].as_bool(), Some(true));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn workspace_select_creates_store_and_reports_path() {
    let root = temp_dir("skilltrack-router-ws");
    let workspace = root.join("nested");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let err = request_err(&mut stdin, &mut reader, "1", "workspace.select", json!({}));
    assert_eq!(error_code(&err), "bad_params");

    select_workspace(&mut stdin, &mut reader, &workspace);
    assert!(workspace.join("skilltrack.sqlite3").is_file());

    let health = request_ok(&mut stdin, &mut reader, "2", "health", json!({}));
    assert_eq!(
        health["workspacePath"].as_str(),
        Some(workspace.to_string_lossy().as_ref())
    );

    let listed = request_ok(&mut stdin, &mut reader, "3", "categories.list", json!({}));
    assert_eq!(listed["categories"].as_array().map(|a| a.len()), Some(0));

    let err = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "classes.list",
        json!({ "actorId": "ghost" }),
    );
    assert_eq!(error_code(&err), "unauthorized");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(root);
}
