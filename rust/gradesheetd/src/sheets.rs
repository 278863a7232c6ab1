use crate::grades::{GradeField, GradeRecord, Roster, RosterSource, StudentRef, SubScores};
use rusqlite::{Connection, OptionalExtension, Row};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Instructor allowed to manage every batch.
pub const ADMIN_INSTRUCTOR: &str = "Administrator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetStatus {
    Draft,
    Submitted,
    Cancelled,
}

impl SheetStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "submitted" => Some(Self::Submitted),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SheetHeader {
    pub id: String,
    pub batch_id: String,
    pub instructor: String,
    pub status: SheetStatus,
    pub created_at: String,
    pub updated_at: String,
}

pub fn now_ts() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

/// Enrollment table as the roster source, ordered by student name.
pub struct EnrollmentSource<'a> {
    pub conn: &'a Connection,
}

impl RosterSource for EnrollmentSource<'_> {
    fn enrolled_students(&self, batch_id: &str) -> anyhow::Result<Vec<StudentRef>> {
        let mut stmt = self.conn.prepare(
            "SELECT student, student_name FROM batch_enrollments
             WHERE batch_id = ?
             ORDER BY student_name COLLATE NOCASE, student",
        )?;
        let rows = stmt
            .query_map([batch_id], |r| {
                Ok(StudentRef {
                    student: r.get(0)?,
                    student_name: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

pub fn batch_exists(conn: &Connection, batch_id: &str) -> anyhow::Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM batches WHERE id = ?", [batch_id], |r| r.get(0))
        .optional()?;
    Ok(found.is_some())
}

pub fn can_manage_batch(conn: &Connection, batch_id: &str, instructor: &str) -> anyhow::Result<bool> {
    if instructor == ADMIN_INSTRUCTOR {
        return Ok(true);
    }
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM batch_instructors WHERE batch_id = ? AND instructor = ?",
            (batch_id, instructor),
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn header_from_row(r: &Row<'_>) -> rusqlite::Result<SheetHeader> {
    let status: String = r.get(3)?;
    Ok(SheetHeader {
        id: r.get(0)?,
        batch_id: r.get(1)?,
        instructor: r.get(2)?,
        // Unknown statuses only come from hand-edited databases; keep them read-only.
        status: SheetStatus::parse(&status).unwrap_or(SheetStatus::Submitted),
        created_at: r.get(4)?,
        updated_at: r.get(5)?,
    })
}

pub fn load_sheet(conn: &Connection, sheet_id: &str) -> anyhow::Result<Option<SheetHeader>> {
    let header = conn
        .query_row(
            "SELECT id, batch_id, instructor, status, created_at, updated_at
             FROM grade_sheets WHERE id = ?",
            [sheet_id],
            header_from_row,
        )
        .optional()?;
    Ok(header)
}

/// Oldest sheet for the pair that has not been cancelled.
pub fn find_open_sheet(
    conn: &Connection,
    batch_id: &str,
    instructor: &str,
) -> anyhow::Result<Option<SheetHeader>> {
    let header = conn
        .query_row(
            "SELECT id, batch_id, instructor, status, created_at, updated_at
             FROM grade_sheets
             WHERE batch_id = ? AND instructor = ? AND status != 'cancelled'
             ORDER BY created_at, id
             LIMIT 1",
            (batch_id, instructor),
            header_from_row,
        )
        .optional()?;
    Ok(header)
}

pub fn create_sheet(conn: &Connection, batch_id: &str, instructor: &str) -> anyhow::Result<SheetHeader> {
    let ts = now_ts();
    let header = SheetHeader {
        id: Uuid::new_v4().to_string(),
        batch_id: batch_id.to_string(),
        instructor: instructor.to_string(),
        status: SheetStatus::Draft,
        created_at: ts.clone(),
        updated_at: ts,
    };
    conn.execute(
        "INSERT INTO grade_sheets(id, batch_id, instructor, status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &header.id,
            &header.batch_id,
            &header.instructor,
            header.status.as_str(),
            &header.created_at,
            &header.updated_at,
        ),
    )?;
    Ok(header)
}

pub fn set_status(conn: &Connection, sheet_id: &str, status: SheetStatus) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE grade_sheets SET status = ?, updated_at = ? WHERE id = ?",
        (status.as_str(), now_ts(), sheet_id),
    )?;
    Ok(())
}

fn score_columns() -> String {
    GradeField::ALL
        .iter()
        .map(|f| f.key())
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn load_roster(conn: &Connection, sheet_id: &str) -> anyhow::Result<Roster> {
    let sql = format!(
        "SELECT student, student_name, {}, total FROM grade_records
         WHERE sheet_id = ? ORDER BY idx",
        score_columns()
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map([sheet_id], |r| {
            let mut scores = SubScores::default();
            for (i, f) in GradeField::ALL.iter().enumerate() {
                scores.set(*f, r.get::<_, Option<f64>>(2 + i)?);
            }
            Ok(GradeRecord {
                student: r.get(0)?,
                student_name: r.get(1)?,
                scores,
                total: r.get(2 + GradeField::ALL.len())?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Roster::from_records(records))
}

/// Rewrites all rows of the sheet so stored order matches roster order.
pub fn save_roster(conn: &Connection, sheet_id: &str, roster: &Roster) -> anyhow::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM grade_records WHERE sheet_id = ?", [sheet_id])?;
    {
        let sql = format!(
            "INSERT INTO grade_records(sheet_id, idx, student, student_name, {}, total)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            score_columns()
        );
        let mut stmt = tx.prepare(&sql)?;
        for (idx, rec) in roster.records().iter().enumerate() {
            let s = &rec.scores;
            stmt.execute(rusqlite::params![
                sheet_id,
                idx as i64,
                rec.student,
                rec.student_name,
                s.attendance,
                s.participation,
                s.assignments,
                s.speaking,
                s.writing,
                s.communicative_competence,
                s.final_oral,
                s.exam,
                rec.total,
            ])?;
        }
    }
    tx.execute(
        "UPDATE grade_sheets SET updated_at = ? WHERE id = ?",
        (now_ts(), sheet_id),
    )?;
    tx.commit()?;
    Ok(())
}

/// Writes one sub-score and the record's recomputed total.
pub fn save_record_score(
    conn: &Connection,
    sheet_id: &str,
    record: &GradeRecord,
    field: GradeField,
) -> anyhow::Result<()> {
    let sql = format!(
        "UPDATE grade_records SET {} = ?, total = ? WHERE sheet_id = ? AND student = ?",
        field.key()
    );
    conn.execute(
        &sql,
        (record.scores.get(field), record.total, sheet_id, &record.student),
    )?;
    conn.execute(
        "UPDATE grade_sheets SET updated_at = ? WHERE id = ?",
        (now_ts(), sheet_id),
    )?;
    Ok(())
}
