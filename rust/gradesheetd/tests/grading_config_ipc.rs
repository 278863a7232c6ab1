mod test_support;

use serde_json::json;
use test_support::{f64_at, request_err, request_ok, spawn_sidecar, temp_dir};

#[test]
fn grading_limits_defaults_update_and_apply() {
    let workspace = temp_dir("gradesheet-config");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let defaults = request_ok(&mut stdin, &mut reader, "2", "grading.config.get", json!({}));
    assert_eq!(f64_at(&defaults, "maxTotal"), 100.0);
    assert_eq!(f64_at(&defaults["componentMax"], "writing"), 15.0);
    assert_eq!(f64_at(&defaults["componentMax"], "exam"), 25.0);

    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "grading.config.update",
        json!({ "patch": { "maxTotal": -5 } }),
    );
    assert_eq!(code, "bad_params");
    let (code, _) = request_err(
        &mut stdin,
        &mut reader,
        "3a",
        "grading.config.update",
        json!({ "patch": { "componentMax": { "homework": 5 } } }),
    );
    assert_eq!(code, "bad_params");

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grading.config.update",
        json!({ "patch": { "maxTotal": 120, "componentMax": { "exam": 45, "writing": 70 } } }),
    );
    assert_eq!(f64_at(&updated, "maxTotal"), 120.0);
    assert_eq!(f64_at(&updated["componentMax"], "exam"), 45.0);
    assert_eq!(f64_at(&updated["componentMax"], "writing"), 70.0);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "batches.create",
        json!({ "title": "Config batch" }),
    );
    let batch_id = created["batchId"].as_str().expect("batchId").to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "enrollments.add",
        json!({ "batchId": batch_id, "student": "S1", "studentName": "Ana" }),
    );
    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "gradeSheets.open",
        json!({ "batchId": batch_id, "instructor": "Administrator" }),
    );
    assert_eq!(f64_at(&sheet, "maxTotal"), 120.0);
    let sheet_id = sheet["sheetId"].as_str().expect("sheetId").to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "gradeSheets.updateScore",
        json!({
            "sheetId": sheet_id,
            "student": "S1",
            "field": "exam",
            "value": 45,
            "instructor": "Administrator",
        }),
    );
    let resp = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "gradeSheets.updateScore",
        json!({
            "sheetId": sheet_id,
            "student": "S1",
            "field": "writing",
            "value": 70,
            "instructor": "Administrator",
        }),
    );
    assert_eq!(f64_at(&resp["row"], "total"), 115.0);
    assert_eq!(resp["overLimit"], false);

    let resp = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "gradeSheets.updateScore",
        json!({
            "sheetId": sheet_id,
            "student": "S1",
            "field": "final_oral",
            "value": "5.5",
            "instructor": "Administrator",
        }),
    );
    assert_eq!(f64_at(&resp["row"], "total"), 120.5);
    assert_eq!(resp["overLimit"], true);
    assert!(resp["warning"].as_str().expect("warning").contains("exceed 120"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
