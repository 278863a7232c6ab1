use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use tracing::debug;

pub const DB_FILE_NAME: &str = "gradesheet.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(&db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    debug!(path = %db_path.display(), "opened workspace database");
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS batches(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            start_date TEXT,
            end_date TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS batch_instructors(
            batch_id TEXT NOT NULL,
            instructor TEXT NOT NULL,
            PRIMARY KEY(batch_id, instructor),
            FOREIGN KEY(batch_id) REFERENCES batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_batch_instructors_instructor ON batch_instructors(instructor)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS batch_enrollments(
            batch_id TEXT NOT NULL,
            student TEXT NOT NULL,
            student_name TEXT NOT NULL,
            PRIMARY KEY(batch_id, student),
            FOREIGN KEY(batch_id) REFERENCES batches(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_sheets(
            id TEXT PRIMARY KEY,
            batch_id TEXT NOT NULL,
            instructor TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'draft',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(batch_id) REFERENCES batches(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_sheets_batch ON grade_sheets(batch_id, instructor)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_records(
            sheet_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            student TEXT NOT NULL,
            student_name TEXT NOT NULL,
            attendance REAL,
            participation REAL,
            assignments REAL,
            speaking REAL,
            writing REAL,
            communicative_competence REAL,
            final_oral REAL,
            exam REAL,
            total REAL NOT NULL DEFAULT 0,
            PRIMARY KEY(sheet_id, student),
            FOREIGN KEY(sheet_id) REFERENCES grade_sheets(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_records_sheet_idx ON grade_records(sheet_id, idx)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

/// The stored text for `key`, unparsed.
pub fn settings_get_raw(conn: &Connection, key: &str) -> anyhow::Result<Option<String>> {
    let raw = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    Ok(raw)
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}
