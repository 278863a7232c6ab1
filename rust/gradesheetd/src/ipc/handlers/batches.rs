use crate::grades::RosterSource;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::sheets::{self, EnrollmentSource};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn parse_opt_date(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    let Some(raw) = optional_str(req, key) else {
        return Ok(None);
    };
    match NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
        Ok(d) => Ok(Some(d.format("%Y-%m-%d").to_string())),
        Err(_) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be YYYY-MM-DD", key),
            Some(json!({ "field": key, "value": raw })),
        )),
    }
}

pub(crate) fn require_batch(conn: &Connection, req: &Request, batch_id: &str) -> Result<(), serde_json::Value> {
    match sheets::batch_exists(conn, batch_id) {
        Ok(true) => Ok(()),
        Ok(false) => Err(err(
            &req.id,
            "not_found",
            "batch not found",
            Some(json!({ "batchId": batch_id })),
        )),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

pub(crate) fn require_permission(
    conn: &Connection,
    req: &Request,
    batch_id: &str,
    instructor: &str,
) -> Result<(), serde_json::Value> {
    match sheets::can_manage_batch(conn, batch_id, instructor) {
        Ok(true) => Ok(()),
        Ok(false) => Err(err(
            &req.id,
            "forbidden",
            format!(
                "You are not allowed to manage grades for batch {}.",
                batch_id
            ),
            Some(json!({ "batchId": batch_id, "instructor": instructor })),
        )),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

fn handle_batches_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start_date = match parse_opt_date(req, "startDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end_date = match parse_opt_date(req, "endDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let (Some(s), Some(e)) = (&start_date, &end_date) {
        if e < s {
            return err(
                &req.id,
                "bad_params",
                "endDate must not be before startDate",
                Some(json!({ "startDate": s, "endDate": e })),
            );
        }
    }
    let instructors: Vec<String> = match req.params.get("instructors") {
        None => Vec::new(),
        Some(v) if v.is_null() => Vec::new(),
        Some(v) => {
            let Some(arr) = v.as_array() else {
                return err(&req.id, "bad_params", "instructors must be an array", None);
            };
            let mut out = Vec::new();
            for item in arr {
                match item.as_str().map(str::trim).filter(|s| !s.is_empty()) {
                    Some(s) => out.push(s.to_string()),
                    None => {
                        return err(
                            &req.id,
                            "bad_params",
                            "instructors must be non-empty strings",
                            None,
                        )
                    }
                }
            }
            out
        }
    };

    let batch_id = Uuid::new_v4().to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO batches(id, title, start_date, end_date) VALUES(?, ?, ?, ?)",
        (&batch_id, &title, &start_date, &end_date),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "batches" })),
        );
    }
    for instructor in &instructors {
        if let Err(e) = tx.execute(
            "INSERT OR IGNORE INTO batch_instructors(batch_id, instructor) VALUES(?, ?)",
            (&batch_id, instructor),
        ) {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "batch_instructors" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    info!(batch_id = %batch_id, %title, "batch created");
    ok(&req.id, json!({ "batchId": batch_id }))
}

fn handle_batches_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let instructor = optional_str(req, "instructor");

    let (sql, args): (&str, Vec<String>) = match &instructor {
        Some(i) => (
            "SELECT b.id, b.title, b.start_date, b.end_date
             FROM batches b
             JOIN batch_instructors bi ON bi.batch_id = b.id
             WHERE bi.instructor = ?
             ORDER BY b.start_date IS NULL, b.start_date, b.title",
            vec![i.clone()],
        ),
        None => (
            "SELECT b.id, b.title, b.start_date, b.end_date
             FROM batches b
             ORDER BY b.start_date IS NULL, b.start_date, b.title",
            Vec::new(),
        ),
    };

    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let batches = match stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "startDate": r.get::<_, Option<String>>(2)?,
                "endDate": r.get::<_, Option<String>>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "batches": batches }))
}

fn handle_batches_assign_instructor(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let batch_id = match required_str(req, "batchId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let instructor = match required_str(req, "instructor") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_batch(conn, req, &batch_id) {
        return e;
    }
    if let Err(e) = conn.execute(
        "INSERT OR IGNORE INTO batch_instructors(batch_id, instructor) VALUES(?, ?)",
        (&batch_id, &instructor),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "batch_instructors" })),
        );
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_enrollments_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let batch_id = match required_str(req, "batchId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student = match required_str(req, "student") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_name = optional_str(req, "studentName").unwrap_or_else(|| student.clone());
    if let Err(e) = require_batch(conn, req, &batch_id) {
        return e;
    }
    if let Err(e) = conn.execute(
        "INSERT INTO batch_enrollments(batch_id, student, student_name) VALUES(?, ?, ?)
         ON CONFLICT(batch_id, student) DO UPDATE SET student_name = excluded.student_name",
        (&batch_id, &student, &student_name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "batch_enrollments" })),
        );
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_enrollments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    // Missing batch yields an empty list rather than an error.
    let Some(batch_id) = optional_str(req, "batchId") else {
        return ok(&req.id, json!({ "students": [] }));
    };
    if let Some(instructor) = optional_str(req, "instructor") {
        if let Err(e) = require_permission(conn, req, &batch_id, &instructor) {
            return e;
        }
    }
    let source = EnrollmentSource { conn };
    match source.enrolled_students(&batch_id) {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "batches.create" => Some(handle_batches_create(state, req)),
        "batches.list" => Some(handle_batches_list(state, req)),
        "batches.assignInstructor" => Some(handle_batches_assign_instructor(state, req)),
        "enrollments.add" => Some(handle_enrollments_add(state, req)),
        "enrollments.list" => Some(handle_enrollments_list(state, req)),
        _ => None,
    }
}
