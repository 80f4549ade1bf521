use crate::enrollment;
use crate::ipc::error::{core_err, err, ok, respond};
use crate::ipc::helpers::{db_conn, optional_str, required_str, string_list};
use crate::ipc::types::{AppState, Request};
use crate::model::{Batch, CoreError};
use log::info;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    // Correlated subqueries keep the counts from multiplying across joins.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM batches b WHERE b.class_id = c.id) AS batch_count,
           (SELECT COUNT(*) FROM class_subjects cs WHERE cs.class_id = c.id) AS subject_count
         FROM classes c
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let student_count: i64 = row.get(2)?;
            let batch_count: i64 = row.get(3)?;
            let subject_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "studentCount": student_count,
                "batchCount": batch_count,
                "subjectCount": subject_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let class_id = optional_str(req, "id").unwrap_or_else(|| Uuid::new_v4().to_string());

    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name) VALUES(?, ?)",
        (&class_id, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }
    info!("class created id={} name={}", class_id, name);

    ok(&req.id, json!({ "classId": class_id, "name": name }))
}

pub fn load_batch(conn: &Connection, batch_id: &str) -> Result<Option<Batch>, CoreError> {
    let row = conn
        .query_row(
            "SELECT id, class_id, name FROM batches WHERE id = ?",
            [batch_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((id, class_id, name)) = row else {
        return Ok(None);
    };
    let mut stmt = conn.prepare(
        "SELECT bs.student_id
         FROM batch_students bs
         JOIN students s ON s.id = bs.student_id
         WHERE bs.batch_id = ?
         ORDER BY s.roll_number, s.name",
    )?;
    let students = stmt
        .query_map([&id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(Batch {
        id,
        class_id,
        name,
        students,
    }))
}

fn class_batches(conn: &Connection, class_id: &str) -> Result<Vec<Batch>, CoreError> {
    let mut stmt = conn.prepare("SELECT id FROM batches WHERE class_id = ? ORDER BY name, id")?;
    let ids = stmt
        .query_map([class_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(b) = load_batch(conn, &id)? {
            out.push(b);
        }
    }
    Ok(out)
}

fn classes_get(conn: &Connection, class_id: &str) -> Result<serde_json::Value, CoreError> {
    let name: Option<String> = conn
        .query_row("SELECT name FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()?;
    let Some(name) = name else {
        return Err(CoreError::not_found("class not found"));
    };

    let mut stmt = conn.prepare(
        "SELECT id FROM students WHERE class_id = ? ORDER BY roll_number, name",
    )?;
    let students = stmt
        .query_map([class_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut stmt = conn.prepare(
        "SELECT subject_id FROM class_subjects WHERE class_id = ? ORDER BY subject_id",
    )?;
    let subjects = stmt
        .query_map([class_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let batches = class_batches(conn, class_id)?;

    Ok(json!({
        "id": class_id,
        "name": name,
        "students": students,
        "batches": batches,
        "subjects": subjects
    }))
}

fn classes_delete(conn: &Connection, class_id: &str) -> Result<serde_json::Value, CoreError> {
    if !enrollment::class_exists(conn, class_id)? {
        return Err(CoreError::not_found("class not found"));
    }
    let subject_ids = enrollment::class_subject_ids(conn, class_id)?;
    if !subject_ids.is_empty() {
        return Err(
            CoreError::new("conflict", "class still has subjects; delete them first")
                .with_details(json!({ "subjectIds": subject_ids })),
        );
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CoreError::new("db_tx_failed", e.to_string()))?;
    // Dependency order; there is no ON DELETE CASCADE.
    for (table, sql) in [
        (
            "batch_students",
            "DELETE FROM batch_students
             WHERE batch_id IN (SELECT id FROM batches WHERE class_id = ?)",
        ),
        ("batches", "DELETE FROM batches WHERE class_id = ?"),
        (
            "student_subjects",
            "DELETE FROM student_subjects
             WHERE student_id IN (SELECT id FROM students WHERE class_id = ?)",
        ),
        ("students", "DELETE FROM students WHERE class_id = ?"),
        ("class_subjects", "DELETE FROM class_subjects WHERE class_id = ?"),
        ("classes", "DELETE FROM classes WHERE id = ?"),
    ] {
        tx.execute(sql, [class_id])
            .map_err(|e| CoreError::store("db_delete_failed", e, table))?;
    }
    tx.commit()
        .map_err(|e| CoreError::new("db_commit_failed", e.to_string()))?;
    info!("class deleted id={}", class_id);
    Ok(json!({ "ok": true }))
}

fn check_students_in_class(
    conn: &Connection,
    class_id: &str,
    student_ids: &[String],
) -> Result<(), CoreError> {
    let mut stmt = conn.prepare("SELECT 1 FROM students WHERE id = ? AND class_id = ?")?;
    let mut outsiders: Vec<&str> = Vec::new();
    for sid in student_ids {
        let found = stmt
            .query_row((sid, class_id), |r| r.get::<_, i64>(0))
            .optional()?;
        if found.is_none() {
            outsiders.push(sid);
        }
    }
    if !outsiders.is_empty() {
        return Err(CoreError::bad_params("students must belong to the batch's class")
            .with_details(json!({ "studentIds": outsiders })));
    }
    Ok(())
}

fn write_batch_roster(
    conn: &Connection,
    batch_id: &str,
    student_ids: &[String],
) -> Result<(), CoreError> {
    conn.execute("DELETE FROM batch_students WHERE batch_id = ?", [batch_id])
        .map_err(|e| CoreError::store("db_delete_failed", e, "batch_students"))?;
    let mut stmt = conn
        .prepare("INSERT OR IGNORE INTO batch_students(batch_id, student_id) VALUES(?, ?)")?;
    for sid in student_ids {
        stmt.execute((batch_id, sid))
            .map_err(|e| CoreError::store("db_insert_failed", e, "batch_students"))?;
    }
    Ok(())
}

fn batches_create(
    conn: &Connection,
    class_id: &str,
    batch_id: String,
    name: &str,
    student_ids: &[String],
) -> Result<Batch, CoreError> {
    if !enrollment::class_exists(conn, class_id)? {
        return Err(CoreError::not_found("class not found"));
    }
    check_students_in_class(conn, class_id, student_ids)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CoreError::new("db_tx_failed", e.to_string()))?;
    // A subject may already name this id; its closure grows once the batch exists.
    let snapshots =
        enrollment::snapshot_subjects(&tx, &enrollment::batch_subject_ids(&tx, &batch_id)?)?;
    tx.execute(
        "INSERT INTO batches(id, class_id, name) VALUES(?, ?, ?)",
        (&batch_id, class_id, name),
    )
    .map_err(|e| CoreError::store("db_insert_failed", e, "batches"))?;
    write_batch_roster(&tx, &batch_id, student_ids)?;
    enrollment::resync_subjects(&tx, &snapshots)?;
    tx.commit()
        .map_err(|e| CoreError::new("db_commit_failed", e.to_string()))?;
    info!(
        "batch created id={} class={} students={}",
        batch_id,
        class_id,
        student_ids.len()
    );

    load_batch(conn, &batch_id)?
        .ok_or_else(|| CoreError::new("db_query_failed", "batch vanished after insert"))
}

fn batches_set_students(
    conn: &Connection,
    batch_id: &str,
    student_ids: &[String],
) -> Result<serde_json::Value, CoreError> {
    let Some(batch) = load_batch(conn, batch_id)? else {
        return Err(CoreError::not_found("batch not found"));
    };
    check_students_in_class(conn, &batch.class_id, student_ids)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CoreError::new("db_tx_failed", e.to_string()))?;
    let snapshots =
        enrollment::snapshot_subjects(&tx, &enrollment::batch_subject_ids(&tx, batch_id)?)?;
    write_batch_roster(&tx, batch_id, student_ids)?;
    let changed = enrollment::resync_subjects(&tx, &snapshots)?;
    tx.commit()
        .map_err(|e| CoreError::new("db_commit_failed", e.to_string()))?;
    info!(
        "batch roster replaced id={} students={} subjectLinksChanged={}",
        batch_id,
        student_ids.len(),
        changed
    );

    let batch = load_batch(conn, batch_id)?;
    Ok(json!({ "batch": batch, "subjectLinksChanged": changed }))
}

fn batches_delete(conn: &Connection, batch_id: &str) -> Result<serde_json::Value, CoreError> {
    if load_batch(conn, batch_id)?.is_none() {
        return Err(CoreError::not_found("batch not found"));
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| CoreError::new("db_tx_failed", e.to_string()))?;
    let snapshots =
        enrollment::snapshot_subjects(&tx, &enrollment::batch_subject_ids(&tx, batch_id)?)?;
    tx.execute("DELETE FROM batch_students WHERE batch_id = ?", [batch_id])
        .map_err(|e| CoreError::store("db_delete_failed", e, "batch_students"))?;
    tx.execute("DELETE FROM batches WHERE id = ?", [batch_id])
        .map_err(|e| CoreError::store("db_delete_failed", e, "batches"))?;
    let changed = enrollment::resync_subjects(&tx, &snapshots)?;
    tx.execute("DELETE FROM subject_batches WHERE batch_id = ?", [batch_id])
        .map_err(|e| CoreError::store("db_delete_failed", e, "subject_batches"))?;
    tx.commit()
        .map_err(|e| CoreError::new("db_commit_failed", e.to_string()))?;
    info!("batch deleted id={} subjectLinksChanged={}", batch_id, changed);
    Ok(json!({ "ok": true, "subjectLinksChanged": changed }))
}

fn handle_classes_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    respond(&req.id, classes_get(conn, &class_id))
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    respond(&req.id, classes_delete(conn, &class_id))
}

fn handle_batches_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_ids = if req.params.get("studentIds").is_some() {
        match string_list(req, "studentIds") {
            Ok(v) => v,
            Err(resp) => return resp,
        }
    } else {
        Vec::new()
    };
    let batch_id = optional_str(req, "id").unwrap_or_else(|| Uuid::new_v4().to_string());
    match batches_create(conn, &class_id, batch_id, &name, &student_ids) {
        Ok(batch) => ok(&req.id, json!({ "batch": batch })),
        Err(e) => core_err(&req.id, e),
    }
}

fn handle_batches_set_students(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let batch_id = match required_str(req, "batchId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_ids = match string_list(req, "studentIds") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    respond(&req.id, batches_set_students(conn, &batch_id, &student_ids))
}

fn handle_batches_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let batch_id = match required_str(req, "batchId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    respond(&req.id, batches_delete(conn, &batch_id))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.get" => Some(handle_classes_get(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        "batches.create" => Some(handle_batches_create(state, req)),
        "batches.setStudents" => Some(handle_batches_set_students(state, req)),
        "batches.delete" => Some(handle_batches_delete(state, req)),
        _ => None,
    }
}
