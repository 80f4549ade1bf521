use crate::enrollment::{self, SubjectFields};
use crate::ipc::error::{core_err, respond};
use crate::ipc::handlers::faculty::teacher_options;
use crate::ipc::helpers::{db_conn, optional_str};
use crate::ipc::types::{AppState, Request};
use crate::model::{CoreError, Scope};
use rusqlite::Connection;
use serde_json::json;

/// Subject routes accept `subjectId` and the older `_id` key.
fn subject_id_param(req: &Request) -> Result<String, CoreError> {
    optional_str(req, "subjectId")
        .or_else(|| optional_str(req, "_id"))
        .ok_or_else(|| CoreError::bad_params("missing subjectId"))
}

fn enrolled_students(
    conn: &Connection,
    subject_id: &str,
    batch_id: Option<&str>,
) -> Result<Vec<serde_json::Value>, CoreError> {
    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "rollNumber": r.get::<_, String>(1)?,
            "name": r.get::<_, String>(2)?
        }))
    };
    let rows = match batch_id {
        Some(batch_id) => {
            let mut stmt = conn.prepare(
                "SELECT st.id, st.roll_number, st.name
                 FROM student_subjects ss
                 JOIN students st ON st.id = ss.student_id
                 JOIN batch_students bs ON bs.student_id = st.id AND bs.batch_id = ?
                 WHERE ss.subject_id = ?
                 ORDER BY st.roll_number, st.name",
            )?;
            let rows = stmt
                .query_map((batch_id, subject_id), map_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT st.id, st.roll_number, st.name
                 FROM student_subjects ss
                 JOIN students st ON st.id = ss.student_id
                 WHERE ss.subject_id = ?
                 ORDER BY st.roll_number, st.name",
            )?;
            let rows = stmt
                .query_map([subject_id], map_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };
    Ok(rows)
}

/// Everything the attendance sheet for one subject needs.
fn subjects_get(
    conn: &Connection,
    subject_id: &str,
    batch_id: Option<&str>,
) -> Result<serde_json::Value, CoreError> {
    let Some(subject) = enrollment::load_subject(conn, subject_id)? else {
        return Err(CoreError::not_found("subject not found")
            .with_details(json!({ "subjectId": subject_id })));
    };

    // A batch filter only narrows batch-based subjects.
    let batch_filter = match (subject.sub_type.scope(), batch_id) {
        (Scope::Batches, Some(b)) => {
            if !subject.batch_ids.iter().any(|x| x == b) {
                return Err(CoreError::bad_params("batch is not attached to subject")
                    .with_details(json!({ "subjectId": subject_id, "batchId": b })));
            }
            Some(b)
        }
        _ => None,
    };

    let mut stmt = conn.prepare("SELECT id FROM batches WHERE class_id = ? ORDER BY name, id")?;
    let class_batches = stmt
        .query_map([&subject.class_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let students = enrolled_students(conn, subject_id, batch_filter)?;
    let teachers = teacher_options(conn)?;
    Ok(json!({
        "subject": subject,
        "batches": class_batches,
        "students": students,
        "teachers": teachers
    }))
}

fn subjects_list(conn: &Connection) -> Result<serde_json::Value, CoreError> {
    let subjects = enrollment::list_subjects(conn)?;
    let teachers = teacher_options(conn)?;
    Ok(json!({ "subjects": subjects, "teachers": teachers }))
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let fields = match SubjectFields::from_params(&req.params) {
        Ok(v) => v,
        Err(e) => return core_err(&req.id, e),
    };
    let requested_id = optional_str(req, "id").or_else(|| optional_str(req, "_id"));
    respond(&req.id, enrollment::create_subject(conn, requested_id, fields))
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let res = subject_id_param(req).and_then(|subject_id| {
        let fields = SubjectFields::from_params(&req.params)?;
        enrollment::update_subject(conn, &subject_id, fields)
    });
    respond(&req.id, res)
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let res = subject_id_param(req)
        .and_then(|subject_id| enrollment::delete_subject(conn, &subject_id));
    respond(&req.id, res)
}

fn handle_subjects_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let batch_id = optional_str(req, "batchId");
    let res = subject_id_param(req)
        .and_then(|subject_id| subjects_get(conn, &subject_id, batch_id.as_deref()));
    respond(&req.id, res)
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    respond(&req.id, subjects_list(conn))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        "subjects.get" => Some(handle_subjects_get(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        _ => None,
    }
}
