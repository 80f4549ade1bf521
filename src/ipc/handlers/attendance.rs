use crate::attendance::{self, parse_records, parse_sessions, required_date};
use crate::ipc::error::{core_err, ok, respond};
use crate::ipc::helpers::{db_conn, optional_str};
use crate::ipc::types::{AppState, Request};
use crate::model::CoreError;
use rusqlite::Connection;
use serde_json::json;

fn subject_param(req: &Request) -> Result<String, CoreError> {
    optional_str(req, "subjectId")
        .or_else(|| optional_str(req, "subject"))
        .ok_or_else(|| CoreError::bad_params("missing subjectId"))
}

fn session_id_param(req: &Request) -> Result<String, CoreError> {
    optional_str(req, "id")
        .or_else(|| optional_str(req, "_id"))
        .ok_or_else(|| CoreError::bad_params("missing id"))
}

fn optional_date(req: &Request, key: &str) -> Result<Option<chrono::NaiveDate>, CoreError> {
    match optional_str(req, key) {
        Some(raw) => attendance::parse_date(&raw).map(Some),
        None => Ok(None),
    }
}

fn ensure_subject(conn: &Connection, subject_id: &str) -> Result<(), CoreError> {
    if attendance::subject_exists(conn, subject_id)? {
        Ok(())
    } else {
        Err(CoreError::not_found("subject not found")
            .with_details(json!({ "subjectId": subject_id })))
    }
}

fn handle_attendance_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let parsed = (|| -> Result<_, CoreError> {
        let date = required_date(&req.params, "date")?;
        let subject_id = subject_param(req)?;
        let records = parse_records(req.params.get("records"))?;
        let sessions = parse_sessions(req.params.get("sessions"))?;
        ensure_subject(conn, &subject_id)?;
        Ok((date, subject_id, records, sessions))
    })();
    let (date, subject_id, records, sessions) = match parsed {
        Ok(v) => v,
        Err(e) => return core_err(&req.id, e),
    };

    let outcome = attendance::record_sessions(conn, date, &subject_id, &sessions, &records);
    let mut result = serde_json::Map::new();
    result.insert("saved".into(), json!(outcome.saved.len()));
    result.insert("attendances".into(), json!(outcome.saved));
    if !outcome.failures.is_empty() {
        result.insert("rejected".into(), json!(outcome.failures.len()));
        result.insert("errors".into(), json!(outcome.failures));
    }
    ok(&req.id, serde_json::Value::Object(result))
}

fn handle_attendance_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let res = (|| -> Result<_, CoreError> {
        let session_id = session_id_param(req)?;
        let date = required_date(&req.params, "date")?;
        let subject_id = subject_param(req)?;
        let records = parse_records(req.params.get("records"))?;
        ensure_subject(conn, &subject_id)?;
        attendance::update_session(conn, &session_id, date, &subject_id, &records)
    })();
    respond(&req.id, res)
}

fn handle_attendance_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let res = session_id_param(req)
        .and_then(|id| attendance::delete_session(conn, &id))
        .map(|deleted| json!({ "ok": true, "attendance": deleted }));
    respond(&req.id, res)
}

fn handle_attendance_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let res = (|| -> Result<_, CoreError> {
        let subject_id = subject_param(req)?;
        let start = optional_date(req, "startDate")?;
        let end = optional_date(req, "endDate")?;
        let sessions = attendance::list_sessions(conn, &subject_id, start, end)?;
        Ok(json!({ "attendances": sessions }))
    })();
    respond(&req.id, res)
}

fn handle_attendance_report(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let res = (|| -> Result<_, CoreError> {
        let subject_id = subject_param(req)?;
        let start = required_date(&req.params, "startDate")?;
        let end = required_date(&req.params, "endDate")?;
        attendance::aggregate(conn, &subject_id, start, end)
    })();
    respond(&req.id, res)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.record" => Some(handle_attendance_record(state, req)),
        "attendance.update" => Some(handle_attendance_update(state, req)),
        "attendance.delete" => Some(handle_attendance_delete(state, req)),
        "attendance.list" => Some(handle_attendance_list(state, req)),
        "attendance.report" => Some(handle_attendance_report(state, req)),
        _ => None,
    }
}
