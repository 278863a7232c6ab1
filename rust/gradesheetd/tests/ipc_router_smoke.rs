mod test_support;

use serde_json::json;
use std::io::Write;
use test_support::{read_response, request_err, request_ok, spawn_sidecar, temp_dir};

#[test]
fn router_handles_health_errors_and_bad_json() {
    let workspace = temp_dir("gradesheet-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health["version"].as_str().is_some());
    assert!(health["workspacePath"].is_null());

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "gradeSheets.get",
        json!({ "sheetId": "x" }),
    );
    assert_eq!(code, "no_workspace");

    let (code, _) = request_err(&mut stdin, &mut reader, "3", "workspace.select", json!({}));
    assert_eq!(code, "bad_params");

    writeln!(stdin, "{{not json").expect("write garbage");
    stdin.flush().expect("flush");
    let bad = read_response(&mut reader);
    assert_eq!(bad["ok"], false);
    assert_eq!(bad["error"]["code"], "bad_json");

    let selected = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert!(selected["workspacePath"].as_str().is_some());
    assert!(workspace.join("gradesheet.sqlite3").exists());

    let (code, _) = request_err(&mut stdin, &mut reader, "5", "classes.list", json!({}));
    assert_eq!(code, "not_implemented");

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "gradeSheets.get",
        json!({ "sheetId": "does-not-exist" }),
    );
    assert_eq!(code, "not_found");

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "gradeSheets.updateScore",
        json!({ "sheetId": "does-not-exist", "student": "S1", "field": "homework", "value": 1 }),
    );
    assert_eq!(code, "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
