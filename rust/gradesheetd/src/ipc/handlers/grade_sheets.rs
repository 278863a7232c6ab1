use crate::config;
use crate::grades::{
    coerce_score, collect_issues, over_limit_warning, validate_field, validate_for_submit,
    GradeField, GradingConfig, Roster,
};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::batches::{require_batch, require_permission};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use crate::sheets::{self, EnrollmentSource, SheetHeader, SheetStatus};
use rusqlite::Connection;
use serde_json::json;
use tracing::{debug, info, warn};

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn db(code: &'static str, e: anyhow::Error) -> Self {
        Self {
            code,
            message: e.to_string(),
            details: None,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn warning_json(roster: &Roster, cfg: &GradingConfig) -> (bool, serde_json::Value) {
    let over = roster.check_over_limit(cfg.max_total);
    let warning = if over {
        json!(over_limit_warning(cfg.max_total))
    } else {
        serde_json::Value::Null
    };
    (over, warning)
}

fn sheet_model(header: &SheetHeader, roster: &Roster, cfg: &GradingConfig) -> serde_json::Value {
    let (over, warning) = warning_json(roster, cfg);
    json!({
        "sheetId": header.id,
        "batchId": header.batch_id,
        "instructor": header.instructor,
        "status": header.status.as_str(),
        "createdAt": header.created_at,
        "updatedAt": header.updated_at,
        "rows": roster.records(),
        "maxTotal": cfg.max_total,
        "overLimit": over,
        "warning": warning,
        "components": cfg.components_json(),
    })
}

fn load_header(conn: &Connection, sheet_id: &str) -> Result<SheetHeader, HandlerErr> {
    match sheets::load_sheet(conn, sheet_id) {
        Ok(Some(h)) => Ok(h),
        Ok(None) => Err(HandlerErr {
            code: "not_found",
            message: "grade sheet not found".to_string(),
            details: Some(json!({ "sheetId": sheet_id })),
        }),
        Err(e) => Err(HandlerErr::db("db_query_failed", e)),
    }
}

fn require_draft(header: &SheetHeader) -> Result<(), HandlerErr> {
    if header.status == SheetStatus::Draft {
        return Ok(());
    }
    Err(HandlerErr {
        code: "not_draft",
        message: format!("grade sheet is {}", header.status.as_str()),
        details: Some(json!({ "sheetId": header.id, "status": header.status.as_str() })),
    })
}

/// Same rule as `gradeSheets.open`: the caller must manage the sheet's batch.
fn require_sheet_permission(
    conn: &Connection,
    header: &SheetHeader,
    instructor: &str,
) -> Result<(), HandlerErr> {
    match sheets::can_manage_batch(conn, &header.batch_id, instructor) {
        Ok(true) => Ok(()),
        Ok(false) => {
            warn!(sheet_id = %header.id, %instructor, "grade sheet access denied");
            Err(HandlerErr {
                code: "forbidden",
                message: format!(
                    "You are not allowed to manage grades for batch {}.",
                    header.batch_id
                ),
                details: Some(json!({ "sheetId": header.id, "instructor": instructor })),
            })
        }
        Err(e) => Err(HandlerErr::db("db_query_failed", e)),
    }
}

fn required_param(req: &Request, key: &str) -> Result<String, HandlerErr> {
    required_str(req, key).map_err(|_| HandlerErr {
        code: "bad_params",
        message: format!("missing {}", key),
        details: None,
    })
}

/// Sheet header, its stored roster with fresh totals, and the limits in force.
fn load_sheet_state(
    conn: &Connection,
    sheet_id: &str,
) -> Result<(SheetHeader, Roster, GradingConfig), HandlerErr> {
    let header = load_header(conn, sheet_id)?;
    let mut roster =
        sheets::load_roster(conn, sheet_id).map_err(|e| HandlerErr::db("db_query_failed", e))?;
    roster.recompute_all();
    let cfg =
        config::load_grading_config(conn).map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok((header, roster, cfg))
}

fn open_sheet(
    conn: &Connection,
    batch_id: &str,
    instructor: &str,
) -> Result<(SheetHeader, Roster, GradingConfig), HandlerErr> {
    let existing = sheets::find_open_sheet(conn, batch_id, instructor)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let header = match existing {
        Some(h) => h,
        None => {
            let h = sheets::create_sheet(conn, batch_id, instructor)
                .map_err(|e| HandlerErr::db("db_insert_failed", e))?;
            info!(sheet_id = %h.id, %batch_id, %instructor, "grade sheet created");
            h
        }
    };

    let (header, mut roster, cfg) = load_sheet_state(conn, &header.id)?;
    if header.status == SheetStatus::Draft {
        let source = EnrollmentSource { conn };
        let added = roster
            .populate_from_source(&source, batch_id)
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        if added > 0 {
            debug!(sheet_id = %header.id, added, "populated roster from enrollments");
            roster.recompute_all();
        }
        sheets::save_roster(conn, &header.id, &roster)
            .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    Ok((header, roster, cfg))
}

fn handle_open(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    if let Err(e) = require_permission(conn, req, &batch_id, &instructor) {
        return e;
    }

    match open_sheet(conn, &batch_id, &instructor) {
        Ok((header, roster, cfg)) => ok(&req.id, sheet_model(&header, &roster, &cfg)),
        Err(e) => e.response(&req.id),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let sheet_id = match required_str(req, "sheetId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_sheet_state(conn, &sheet_id) {
        Ok((header, roster, cfg)) => ok(&req.id, sheet_model(&header, &roster, &cfg)),
        Err(e) => e.response(&req.id),
    }
}

fn update_score(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let sheet_id = required_param(req, "sheetId")?;
    let student = required_param(req, "student")?;
    let field_raw = required_param(req, "field")?;
    let Some(field) = GradeField::parse(&field_raw) else {
        return Err(HandlerErr {
            code: "bad_params",
            message: format!("unknown grade field: {}", field_raw),
            details: Some(json!({
                "field": field_raw,
                "allowed": GradeField::ALL.iter().map(|f| f.camel_key()).collect::<Vec<_>>(),
            })),
        });
    };
    let instructor = required_param(req, "instructor")?;
    // Anything that is not a finite number clears the cell.
    let value = req.params.get("value").and_then(coerce_score);

    let (header, mut roster, cfg) = load_sheet_state(conn, &sheet_id)?;
    require_sheet_permission(conn, &header, &instructor)?;
    require_draft(&header)?;

    let Some((idx, record)) = roster.get_mut(&student) else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not on grade sheet".to_string(),
            details: Some(json!({ "sheetId": sheet_id, "student": student })),
        });
    };
    record.scores.set(field, value);
    // Rejected edits never reach storage; the stored cell keeps its value.
    if let Err(e) = validate_field(record, idx, field, &cfg) {
        warn!(sheet_id = %sheet_id, code = e.code(), "score update rejected");
        return Err(HandlerErr {
            code: "validation_failed",
            message: e.to_string(),
            details: Some(json!({ "reason": e.code(), "issues": [e.to_json()] })),
        });
    }
    record.recompute_total();
    let row = record.clone();

    sheets::save_record_score(conn, &sheet_id, &row, field)
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;

    let (over, warning) = warning_json(&roster, &cfg);
    if over {
        debug!(sheet_id = %sheet_id, student = %row.student, total = row.total, "over-limit total");
    }
    Ok(json!({
        "row": row,
        "maxTotal": cfg.max_total,
        "overLimit": over,
        "warning": warning,
    }))
}

fn handle_update_score(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    match update_score(conn, req) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_validate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let sheet_id = match required_str(req, "sheetId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (_, roster, cfg) = match load_sheet_state(conn, &sheet_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let issues: Vec<serde_json::Value> = collect_issues(&roster, &cfg)
        .iter()
        .map(|i| i.to_json())
        .collect();
    let (over, warning) = warning_json(&roster, &cfg);
    ok(
        &req.id,
        json!({
            "valid": issues.is_empty(),
            "issues": issues,
            "overLimit": over,
            "warning": warning,
        }),
    )
}

fn submit(
    conn: &Connection,
    sheet_id: &str,
    instructor: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let (header, mut roster, cfg) = load_sheet_state(conn, sheet_id)?;
    require_sheet_permission(conn, &header, instructor)?;
    require_draft(&header)?;

    if let Err(e) = validate_for_submit(&mut roster, &cfg) {
        warn!(sheet_id = %sheet_id, code = e.code(), "submit rejected");
        let issues: Vec<serde_json::Value> = collect_issues(&roster, &cfg)
            .iter()
            .map(|i| i.to_json())
            .collect();
        return Err(HandlerErr {
            code: "validation_failed",
            message: e.to_string(),
            details: Some(json!({ "reason": e.code(), "issues": issues })),
        });
    }

    sheets::save_roster(conn, sheet_id, &roster)
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    sheets::set_status(conn, sheet_id, SheetStatus::Submitted)
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    info!(sheet_id = %sheet_id, rows = roster.len(), "grade sheet submitted");

    let header = load_header(conn, sheet_id)?;
    Ok(sheet_model(&header, &roster, &cfg))
}

fn handle_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let sheet_id = match required_str(req, "sheetId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let instructor = match required_str(req, "instructor") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match submit(conn, &sheet_id, &instructor) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_cancel(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let sheet_id = match required_str(req, "sheetId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let instructor = match required_str(req, "instructor") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let header = match load_header(conn, &sheet_id) {
        Ok(h) => h,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_sheet_permission(conn, &header, &instructor) {
        return e.response(&req.id);
    }
    if header.status == SheetStatus::Cancelled {
        return err(
            &req.id,
            "not_draft",
            "grade sheet is already cancelled",
            Some(json!({ "sheetId": sheet_id })),
        );
    }
    if let Err(e) = sheets::set_status(conn, &sheet_id, SheetStatus::Cancelled) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    info!(sheet_id = %sheet_id, "grade sheet cancelled");
    ok(
        &req.id,
        json!({ "ok": true, "status": SheetStatus::Cancelled.as_str() }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "gradeSheets.open" => Some(handle_open(state, req)),
        "gradeSheets.get" => Some(handle_get(state, req)),
        "gradeSheets.updateScore" => Some(handle_update_score(state, req)),
        "gradeSheets.validate" => Some(handle_validate(state, req)),
        "gradeSheets.submit" => Some(handle_submit(state, req)),
        "gradeSheets.cancel" => Some(handle_cancel(state, req)),
        _ => None,
    }
}
