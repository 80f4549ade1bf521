use crate::model::{CoreError, Status};
use chrono::{DateTime, NaiveDate, Utc};
use log::{info, warn};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInput {
    pub student_id: String,
    pub status: Status,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub student_id: String,
    pub status: Status,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSession {
    pub id: String,
    pub date: String,
    pub subject_id: String,
    pub session: String,
    pub records: Vec<SessionRecord>,
}

/// Accepts `YYYY-MM-DD`, or an RFC 3339 timestamp taken as its UTC calendar date.
pub fn parse_date(raw: &str) -> Result<NaiveDate, CoreError> {
    let t = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(t, DATE_FORMAT) {
        return Ok(d);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Ok(dt.with_timezone(&Utc).date_naive());
    }
    Err(CoreError::bad_params("date must be YYYY-MM-DD").with_details(json!({ "date": raw })))
}

pub fn required_date(params: &serde_json::Value, key: &str) -> Result<NaiveDate, CoreError> {
    let raw = params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::bad_params(format!("missing {}", key)))?;
    parse_date(raw)
}

pub fn parse_records(raw: Option<&serde_json::Value>) -> Result<Vec<RecordInput>, CoreError> {
    let Some(arr) = raw.and_then(|v| v.as_array()) else {
        return Err(CoreError::bad_params("missing records[]"));
    };
    let mut out = Vec::with_capacity(arr.len());
    for (i, rec) in arr.iter().enumerate() {
        let student_id = rec
            .get("student")
            .or_else(|| rec.get("studentId"))
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                CoreError::bad_params(format!("record at index {} missing student", i))
            })?;
        let status = Status::parse(rec.get("status"))
            .map_err(|e| e.with_details(json!({ "index": i })))?;
        out.push(RecordInput { student_id, status });
    }
    Ok(out)
}

pub fn parse_sessions(raw: Option<&serde_json::Value>) -> Result<Vec<String>, CoreError> {
    let labels: Vec<String> = match raw {
        Some(serde_json::Value::String(s)) => vec![s.trim().to_string()],
        Some(serde_json::Value::Array(arr)) => arr
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.as_str().map(|s| s.trim().to_string()).ok_or_else(|| {
                    CoreError::bad_params("sessions must be strings")
                        .with_details(json!({ "index": i }))
                })
            })
            .collect::<Result<_, _>>()?,
        _ => return Err(CoreError::bad_params("missing sessions[]")),
    };
    let mut out: Vec<String> = Vec::new();
    for label in labels {
        if !label.is_empty() && !out.contains(&label) {
            out.push(label);
        }
    }
    if out.is_empty() {
        return Err(CoreError::bad_params("sessions must name at least one session"));
    }
    Ok(out)
}

pub fn subject_exists(conn: &Connection, subject_id: &str) -> Result<bool, CoreError> {
    Ok(conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}

fn map_write_err(e: rusqlite::Error, table: &str) -> CoreError {
    if let rusqlite::Error::SqliteFailure(f, _) = &e {
        if f.code == rusqlite::ErrorCode::ConstraintViolation {
            return CoreError::new("conflict", e.to_string()).with_details(json!({ "table": table }));
        }
    }
    CoreError::store("db_update_failed", e, table)
}

fn replace_records(
    conn: &Connection,
    session_id: &str,
    records: &[RecordInput],
) -> Result<(), CoreError> {
    conn.execute(
        "DELETE FROM attendance_records WHERE session_id = ?",
        [session_id],
    )
    .map_err(|e| CoreError::store("db_delete_failed", e, "attendance_records"))?;
    // A repeated student keeps its last status.
    let mut stmt = conn.prepare(
        "INSERT OR REPLACE INTO attendance_records(session_id, student_id, status, sort_order)
         VALUES(?, ?, ?, ?)",
    )?;
    for (i, rec) in records.iter().enumerate() {
        stmt.execute((session_id, &rec.student_id, rec.status.as_str(), i as i64))
            .map_err(|e| map_write_err(e, "attendance_records"))?;
    }
    Ok(())
}

fn load_records(conn: &Connection, session_id: &str) -> Result<Vec<SessionRecord>, CoreError> {
    let mut stmt = conn.prepare(
        "SELECT student_id, status FROM attendance_records
         WHERE session_id = ? ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([session_id], |r| {
            Ok(SessionRecord {
                student_id: r.get(0)?,
                status: Status::from_stored(&r.get::<_, String>(1)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_session(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<AttendanceSession>, CoreError> {
    let row = conn
        .query_row(
            "SELECT id, date, subject_id, session FROM attendance_sessions WHERE id = ?",
            [session_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;
    let Some((id, date, subject_id, session)) = row else {
        return Ok(None);
    };
    let records = load_records(conn, &id)?;
    Ok(Some(AttendanceSession {
        id,
        date,
        subject_id,
        session,
        records,
    }))
}

/// Upserts one (date, subject, session) identity; the record list is replaced wholesale.
pub fn upsert_session(
    conn: &Connection,
    date: NaiveDate,
    subject_id: &str,
    session: &str,
    records: &[RecordInput],
) -> Result<AttendanceSession, CoreError> {
    let date_key = date.format(DATE_FORMAT).to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CoreError::new("db_tx_failed", e.to_string()))?;
    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM attendance_sessions WHERE date = ? AND subject_id = ? AND session = ?",
            (&date_key, subject_id, session),
            |r| r.get(0),
        )
        .optional()?;
    let session_id = match existing {
        Some(id) => id,
        None => {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO attendance_sessions(id, date, subject_id, session) VALUES(?, ?, ?, ?)",
                (&id, &date_key, subject_id, session),
            )
            .map_err(|e| map_write_err(e, "attendance_sessions"))?;
            id
        }
    };
    replace_records(&tx, &session_id, records)?;
    tx.commit()
        .map_err(|e| CoreError::new("db_commit_failed", e.to_string()))?;

    load_session(conn, &session_id)?
        .ok_or_else(|| CoreError::new("db_query_failed", "session vanished after upsert"))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelFailure {
    pub session: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct RecordOutcome {
    pub saved: Vec<AttendanceSession>,
    pub failures: Vec<LabelFailure>,
}

/// Upserts every label on its own; a failed label leaves the others committed.
pub fn record_sessions(
    conn: &Connection,
    date: NaiveDate,
    subject_id: &str,
    sessions: &[String],
    records: &[RecordInput],
) -> RecordOutcome {
    let mut out = RecordOutcome::default();
    for label in sessions {
        match upsert_session(conn, date, subject_id, label, records) {
            Ok(session) => out.saved.push(session),
            Err(e) => {
                warn!(
                    "attendance upsert failed subject={} date={} session={} code={}",
                    subject_id, date, label, e.code
                );
                out.failures.push(LabelFailure {
                    session: label.clone(),
                    code: e.code,
                    message: e.message,
                });
            }
        }
    }
    info!(
        "attendance recorded subject={} date={} saved={} rejected={}",
        subject_id,
        date,
        out.saved.len(),
        out.failures.len()
    );
    out
}

pub fn update_session(
    conn: &Connection,
    session_id: &str,
    date: NaiveDate,
    subject_id: &str,
    records: &[RecordInput],
) -> Result<AttendanceSession, CoreError> {
    if load_session(conn, session_id)?.is_none() {
        return Err(CoreError::not_found("attendance record not found")
            .with_details(json!({ "id": session_id })));
    }
    let date_key = date.format(DATE_FORMAT).to_string();
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CoreError::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "UPDATE attendance_sessions SET date = ?, subject_id = ? WHERE id = ?",
        (&date_key, subject_id, session_id),
    )
    .map_err(|e| map_write_err(e, "attendance_sessions"))?;
    replace_records(&tx, session_id, records)?;
    tx.commit()
        .map_err(|e| CoreError::new("db_commit_failed", e.to_string()))?;
    info!("attendance session updated id={} date={}", session_id, date_key);

    load_session(conn, session_id)?
        .ok_or_else(|| CoreError::new("db_query_failed", "session vanished after update"))
}

pub fn delete_session(conn: &Connection, session_id: &str) -> Result<AttendanceSession, CoreError> {
    let Some(existing) = load_session(conn, session_id)? else {
        return Err(CoreError::not_found("attendance record not found")
            .with_details(json!({ "id": session_id })));
    };
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CoreError::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "DELETE FROM attendance_records WHERE session_id = ?",
        [session_id],
    )
    .map_err(|e| CoreError::store("db_delete_failed", e, "attendance_records"))?;
    tx.execute("DELETE FROM attendance_sessions WHERE id = ?", [session_id])
        .map_err(|e| CoreError::store("db_delete_failed", e, "attendance_sessions"))?;
    tx.commit()
        .map_err(|e| CoreError::new("db_commit_failed", e.to_string()))?;
    info!("attendance session deleted id={}", session_id);
    Ok(existing)
}

/// Sessions for a subject ordered by date then label, optionally bounded (inclusive).
pub fn list_sessions(
    conn: &Connection,
    subject_id: &str,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<Vec<AttendanceSession>, CoreError> {
    let start_key = start
        .map(|d| d.format(DATE_FORMAT).to_string())
        .unwrap_or_else(|| "0000-01-01".to_string());
    let end_key = end
        .map(|d| d.format(DATE_FORMAT).to_string())
        .unwrap_or_else(|| "9999-12-31".to_string());
    let mut stmt = conn.prepare(
        "SELECT id FROM attendance_sessions
         WHERE subject_id = ? AND date >= ? AND date <= ?
         ORDER BY date, session",
    )?;
    let ids = stmt
        .query_map((subject_id, &start_key, &end_key), |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(s) = load_session(conn, &id)? {
            out.push(s);
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudentTally {
    pub student_id: String,
    pub present_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally {
    pub total_lectures: usize,
    /// Every student with at least one record, in first-seen order.
    pub students: Vec<StudentTally>,
}

/// Each session is one lecture regardless of how many records it carries.
pub fn tally<'a, I>(sessions: I) -> Tally
where
    I: IntoIterator<Item = &'a [SessionRecord]>,
{
    let mut total_lectures = 0;
    let mut students: Vec<StudentTally> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for records in sessions {
        total_lectures += 1;
        for rec in records {
            let slot = *index.entry(rec.student_id.clone()).or_insert_with(|| {
                students.push(StudentTally {
                    student_id: rec.student_id.clone(),
                    present_count: 0,
                });
                students.len() - 1
            });
            if rec.status == Status::Present {
                students[slot].present_count += 1;
            }
        }
    }
    Tally {
        total_lectures,
        students,
    }
}

pub fn attendance_percentage(present_count: usize, total_lectures: usize) -> Option<f64> {
    if total_lectures == 0 {
        return None;
    }
    Some(100.0 * present_count as f64 / total_lectures as f64)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAttendance {
    pub student_id: String,
    pub roll_number: String,
    pub student_name: String,
    pub present_count: usize,
    pub attendance_percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceReport {
    pub subject_id: String,
    pub subject_name: String,
    pub teacher_name: Option<String>,
    pub start_date: String,
    pub end_date: String,
    pub total_lectures: usize,
    pub students: Vec<StudentAttendance>,
}

pub fn aggregate(
    conn: &Connection,
    subject_id: &str,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<AttendanceReport, CoreError> {
    if start > end {
        return Err(CoreError::bad_params("startDate must not be after endDate"));
    }
    let sessions = list_sessions(conn, subject_id, Some(start), Some(end))?;
    if sessions.is_empty() {
        return Err(CoreError::not_found("no attendance recorded in range").with_details(json!({
            "subjectId": subject_id,
            "startDate": start.format(DATE_FORMAT).to_string(),
            "endDate": end.format(DATE_FORMAT).to_string(),
        })));
    }

    let subject: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT s.name, f.name
             FROM subjects s
             LEFT JOIN faculty f ON f.id = s.teacher_id
             WHERE s.id = ?",
            [subject_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((subject_name, teacher_name)) = subject else {
        return Err(CoreError::not_found("subject not found")
            .with_details(json!({ "subjectId": subject_id })));
    };

    let tally = tally(sessions.iter().map(|s| s.records.as_slice()));

    let mut student_stmt = conn.prepare("SELECT roll_number, name FROM students WHERE id = ?")?;
    let mut students: Vec<StudentAttendance> = Vec::with_capacity(tally.students.len());
    for t in tally.students {
        // Records pointing at removed students drop out of the report.
        let Some((roll_number, student_name)) = student_stmt
            .query_row([&t.student_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .optional()?
        else {
            continue;
        };
        let attendance_percentage =
            attendance_percentage(t.present_count, tally.total_lectures).unwrap_or(0.0);
        students.push(StudentAttendance {
            student_id: t.student_id,
            roll_number,
            student_name,
            present_count: t.present_count,
            attendance_percentage,
        });
    }
    if students.is_empty() {
        return Err(CoreError::not_found("no enrolled students recorded in range")
            .with_details(json!({ "subjectId": subject_id })));
    }
    students.sort_by(|a, b| {
        a.roll_number
            .cmp(&b.roll_number)
            .then_with(|| a.student_name.cmp(&b.student_name))
    });

    Ok(AttendanceReport {
        subject_id: subject_id.to_string(),
        subject_name,
        teacher_name,
        start_date: start.format(DATE_FORMAT).to_string(),
        end_date: end.format(DATE_FORMAT).to_string(),
        total_lectures: tally.total_lectures,
        students,
    })
}
