use crate::model::CoreError;
use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

pub fn core_err(id: &str, e: CoreError) -> serde_json::Value {
    err(id, &e.code, e.message, e.details)
}

/// Wraps a core result in the response envelope, serializing the success value.
pub fn respond<T: serde::Serialize>(id: &str, res: Result<T, CoreError>) -> serde_json::Value {
    match res {
        Ok(v) => match serde_json::to_value(v) {
            Ok(result) => ok(id, result),
            Err(e) => err(id, "serialize_failed", e.to_string(), None),
        },
        Err(e) => core_err(id, e),
    }
}
