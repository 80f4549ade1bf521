use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "campus.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            roll_number TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS batches(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_batches_class ON batches(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS batch_students(
            batch_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(batch_id, student_id),
            FOREIGN KEY(batch_id) REFERENCES batches(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_batch_students_student ON batch_students(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS faculty(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            department TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;
    // Faculty rows predating admin/email support get the columns added in place.
    ensure_faculty_profile_columns(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            class_id TEXT NOT NULL,
            teacher_id TEXT,
            department TEXT NOT NULL DEFAULT '',
            sub_type TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(teacher_id) REFERENCES faculty(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_class ON subjects(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_batches(
            subject_id TEXT NOT NULL,
            batch_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(subject_id, batch_id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_batches_batch ON subject_batches(batch_id)",
        [],
    )?;

    // Denormalized back-references. Composite keys make every add a set-add.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_subjects(
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            PRIMARY KEY(class_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_subjects(
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            PRIMARY KEY(student_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_subjects_subject ON student_subjects(subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS faculty_subjects(
            faculty_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            PRIMARY KEY(faculty_id, subject_id)
        )",
        [],
    )?;

    // Sessions outlive their subject, so subject_id carries no foreign key.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_sessions(
            id TEXT PRIMARY KEY,
            date TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            session TEXT NOT NULL,
            UNIQUE(date, subject_id, session)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_sessions_subject_date
         ON attendance_sessions(subject_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            session_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(session_id, student_id),
            FOREIGN KEY(session_id) REFERENCES attendance_sessions(id)
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_faculty_profile_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "faculty", "email")? {
        conn.execute("ALTER TABLE faculty ADD COLUMN email TEXT", [])?;
    }
    if !table_has_column(conn, "faculty", "is_admin")? {
        conn.execute(
            "ALTER TABLE faculty ADD COLUMN is_admin INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    #[test]
    fn open_db_is_idempotent_and_adds_faculty_columns() {
        let ws = temp_dir("campusd-db-open");
        {
            let conn = Connection::open(ws.join(DB_FILE_NAME)).expect("open raw");
            conn.execute(
                "CREATE TABLE faculty(id TEXT PRIMARY KEY, name TEXT NOT NULL, department TEXT NOT NULL DEFAULT '')",
                [],
            )
            .expect("create old faculty");
            conn.execute(
                "INSERT INTO faculty(id, name) VALUES('f1', 'Old Row')",
                [],
            )
            .expect("insert old faculty");
        }

        let conn = open_db(&ws).expect("first open");
        assert!(table_has_column(&conn, "faculty", "email").expect("pragma"));
        assert!(table_has_column(&conn, "faculty", "is_admin").expect("pragma"));
        let is_admin: i64 = conn
            .query_row("SELECT is_admin FROM faculty WHERE id = 'f1'", [], |r| r.get(0))
            .expect("old row");
        assert_eq!(is_admin, 0);
        drop(conn);

        open_db(&ws).expect("second open");
    }
}
