use crate::ipc::error::respond;
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::model::{CoreError, Faculty};
use log::info;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub fn load_faculty(conn: &Connection, faculty_id: &str) -> Result<Option<Faculty>, CoreError> {
    let row = conn
        .query_row(
            "SELECT id, name, department, email, is_admin FROM faculty WHERE id = ?",
            [faculty_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, i64>(4)? != 0,
                ))
            },
        )
        .optional()?;
    let Some((id, name, department, email, is_admin)) = row else {
        return Ok(None);
    };
    let mut stmt = conn.prepare(
        "SELECT subject_id FROM faculty_subjects WHERE faculty_id = ? ORDER BY subject_id",
    )?;
    let subjects = stmt
        .query_map([&id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(Faculty {
        id,
        name,
        department,
        email,
        is_admin,
        subjects,
    }))
}

/// Teacher picker rows: id and name only.
pub fn teacher_options(conn: &Connection) -> Result<Vec<serde_json::Value>, CoreError> {
    let mut stmt = conn.prepare("SELECT id, name FROM faculty ORDER BY name, id")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn parse_is_admin(req: &Request) -> Result<Option<bool>, CoreError> {
    match req.params.get("isAdmin") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| CoreError::bad_params("isAdmin must be a boolean")),
    }
}

fn faculty_create(conn: &Connection, req: &Request, name: &str) -> Result<Faculty, CoreError> {
    let faculty_id = optional_str(req, "id").unwrap_or_else(|| Uuid::new_v4().to_string());
    let department = optional_str(req, "department").unwrap_or_default();
    let email = optional_str(req, "email");
    let is_admin = parse_is_admin(req)?.unwrap_or(false);
    conn.execute(
        "INSERT INTO faculty(id, name, department, email, is_admin) VALUES(?, ?, ?, ?, ?)",
        (&faculty_id, name, &department, &email, is_admin as i64),
    )
    .map_err(|e| CoreError::store("db_insert_failed", e, "faculty"))?;
    info!("faculty created id={}", faculty_id);
    load_faculty(conn, &faculty_id)?
        .ok_or_else(|| CoreError::new("db_query_failed", "faculty vanished after insert"))
}

fn faculty_update(conn: &Connection, req: &Request, faculty_id: &str) -> Result<Faculty, CoreError> {
    let Some(existing) = load_faculty(conn, faculty_id)? else {
        return Err(CoreError::not_found("faculty not found"));
    };
    let name = optional_str(req, "name").unwrap_or(existing.name);
    let department = optional_str(req, "department").unwrap_or(existing.department);
    let email = optional_str(req, "email").or(existing.email);
    let is_admin = parse_is_admin(req)?.unwrap_or(existing.is_admin);
    conn.execute(
        "UPDATE faculty SET name = ?, department = ?, email = ?, is_admin = ? WHERE id = ?",
        (&name, &department, &email, is_admin as i64, faculty_id),
    )
    .map_err(|e| CoreError::store("db_update_failed", e, "faculty"))?;
    load_faculty(conn, faculty_id)?
        .ok_or_else(|| CoreError::new("db_query_failed", "faculty vanished after update"))
}

/// Subjects taught by the removed faculty keep running without a teacher.
fn faculty_delete(conn: &Connection, faculty_id: &str) -> Result<serde_json::Value, CoreError> {
    if load_faculty(conn, faculty_id)?.is_none() {
        return Err(CoreError::not_found("faculty not found"));
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CoreError::new("db_tx_failed", e.to_string()))?;
    let released = tx
        .execute(
            "UPDATE subjects SET teacher_id = NULL WHERE teacher_id = ?",
            [faculty_id],
        )
        .map_err(|e| CoreError::store("db_update_failed", e, "subjects"))?;
    for (table, sql) in [
        ("faculty_subjects", "DELETE FROM faculty_subjects WHERE faculty_id = ?"),
        ("faculty", "DELETE FROM faculty WHERE id = ?"),
    ] {
        tx.execute(sql, [faculty_id])
            .map_err(|e| CoreError::store("db_delete_failed", e, table))?;
    }
    tx.commit()
        .map_err(|e| CoreError::new("db_commit_failed", e.to_string()))?;
    info!("faculty deleted id={} subjectsReleased={}", faculty_id, released);
    Ok(json!({ "ok": true, "subjectsReleased": released }))
}

fn faculty_list(conn: &Connection, department: Option<&str>) -> Result<serde_json::Value, CoreError> {
    let mut stmt = conn.prepare("SELECT id FROM faculty ORDER BY name, id")?;
    let ids = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(f) = load_faculty(conn, &id)? {
            if department.map(|d| d == f.department).unwrap_or(true) {
                out.push(f);
            }
        }
    }
    Ok(json!({ "faculty": out }))
}

fn handle_faculty_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    respond(&req.id, faculty_create(conn, req, &name))
}

fn handle_faculty_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let faculty_id = match required_str(req, "facultyId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    respond(&req.id, faculty_update(conn, req, &faculty_id))
}

fn handle_faculty_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let faculty_id = match required_str(req, "facultyId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let res = load_faculty(conn, &faculty_id)
        .and_then(|f| f.ok_or_else(|| CoreError::not_found("faculty not found")));
    respond(&req.id, res)
}

fn handle_faculty_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let department = optional_str(req, "department");
    respond(&req.id, faculty_list(conn, department.as_deref()))
}

fn handle_faculty_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let faculty_id = match required_str(req, "facultyId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    respond(&req.id, faculty_delete(conn, &faculty_id))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "faculty.create" => Some(handle_faculty_create(state, req)),
        "faculty.update" => Some(handle_faculty_update(state, req)),
        "faculty.get" => Some(handle_faculty_get(state, req)),
        "faculty.list" => Some(handle_faculty_list(state, req)),
        "faculty.delete" => Some(handle_faculty_delete(state, req)),
        _ => None,
    }
}
