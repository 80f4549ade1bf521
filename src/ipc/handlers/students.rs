use crate::enrollment;
use crate::ipc::error::respond;
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::model::{CoreError, Student};
use log::info;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn student_subjects(conn: &Connection, student_id: &str) -> Result<Vec<String>, CoreError> {
    let mut stmt = conn.prepare(
        "SELECT subject_id FROM student_subjects WHERE student_id = ? ORDER BY subject_id",
    )?;
    let ids = stmt
        .query_map([student_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn load_student(conn: &Connection, student_id: &str) -> Result<Option<Student>, CoreError> {
    let row = conn
        .query_row(
            "SELECT id, class_id, roll_number, name FROM students WHERE id = ?",
            [student_id],
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
    let Some((id, class_id, roll_number, name)) = row else {
        return Ok(None);
    };
    let subjects = student_subjects(conn, &id)?;
    Ok(Some(Student {
        id,
        class_id,
        roll_number,
        name,
        subjects,
    }))
}

fn students_list(conn: &Connection, class_id: &str) -> Result<serde_json::Value, CoreError> {
    if !enrollment::class_exists(conn, class_id)? {
        return Err(CoreError::not_found("class not found"));
    }
    let mut stmt = conn.prepare(
        "SELECT id FROM students WHERE class_id = ? ORDER BY roll_number, name",
    )?;
    let ids = stmt
        .query_map([class_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut students = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(s) = load_student(conn, &id)? {
            students.push(s);
        }
    }
    Ok(json!({ "students": students }))
}

/// New students pick up every theory subject already attached to their class.
fn students_create(
    conn: &Connection,
    student_id: String,
    class_id: &str,
    roll_number: &str,
    name: &str,
) -> Result<Student, CoreError> {
    if !enrollment::class_exists(conn, class_id)? {
        return Err(CoreError::not_found("class not found"));
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CoreError::new("db_tx_failed", e.to_string()))?;
    let snapshots =
        enrollment::snapshot_subjects(&tx, &enrollment::class_subject_ids(&tx, class_id)?)?;
    tx.execute(
        "INSERT INTO students(id, class_id, roll_number, name) VALUES(?, ?, ?, ?)",
        (&student_id, class_id, roll_number, name),
    )
    .map_err(|e| CoreError::store("db_insert_failed", e, "students"))?;
    enrollment::resync_subjects(&tx, &snapshots)?;
    tx.commit()
        .map_err(|e| CoreError::new("db_commit_failed", e.to_string()))?;
    info!("student created id={} class={}", student_id, class_id);

    load_student(conn, &student_id)?
        .ok_or_else(|| CoreError::new("db_query_failed", "student vanished after insert"))
}

fn students_update(conn: &Connection, req: &Request, student_id: &str) -> Result<Student, CoreError> {
    let Some(existing) = load_student(conn, student_id)? else {
        return Err(CoreError::not_found("student not found"));
    };
    let roll_number = optional_str(req, "rollNumber").unwrap_or(existing.roll_number);
    let name = optional_str(req, "name").unwrap_or(existing.name);
    conn.execute(
        "UPDATE students SET roll_number = ?, name = ? WHERE id = ?",
        (&roll_number, &name, student_id),
    )
    .map_err(|e| CoreError::store("db_update_failed", e, "students"))?;
    load_student(conn, student_id)?
        .ok_or_else(|| CoreError::new("db_query_failed", "student vanished after update"))
}

fn students_delete(conn: &Connection, student_id: &str) -> Result<serde_json::Value, CoreError> {
    if load_student(conn, student_id)?.is_none() {
        return Err(CoreError::not_found("student not found"));
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CoreError::new("db_tx_failed", e.to_string()))?;
    for (table, sql) in [
        ("batch_students", "DELETE FROM batch_students WHERE student_id = ?"),
        ("student_subjects", "DELETE FROM student_subjects WHERE student_id = ?"),
        ("students", "DELETE FROM students WHERE id = ?"),
    ] {
        tx.execute(sql, [student_id])
            .map_err(|e| CoreError::store("db_delete_failed", e, table))?;
    }
    tx.commit()
        .map_err(|e| CoreError::new("db_commit_failed", e.to_string()))?;
    info!("student deleted id={}", student_id);
    Ok(json!({ "ok": true }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let roll_number = match required_str(req, "rollNumber") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = optional_str(req, "id").unwrap_or_else(|| Uuid::new_v4().to_string());
    respond(
        &req.id,
        students_create(conn, student_id, &class_id, &roll_number, &name),
    )
}

fn handle_students_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let res = load_student(conn, &student_id)
        .and_then(|s| s.ok_or_else(|| CoreError::not_found("student not found")));
    respond(&req.id, res)
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    respond(&req.id, students_list(conn, &class_id))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    respond(&req.id, students_update(conn, req, &student_id))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    respond(&req.id, students_delete(conn, &student_id))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle_students_create(state, req)),
        "students.get" => Some(handle_students_get(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
