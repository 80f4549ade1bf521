use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;
use log::{debug, warn};

type TryHandle = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const HANDLERS: &[TryHandle] = &[
    handlers::core::try_handle,
    handlers::classes::try_handle,
    handlers::students::try_handle,
    handlers::faculty::try_handle,
    handlers::subjects::try_handle,
    handlers::attendance::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    debug!("request id={} method={}", req.id, req.method);
    let resp = HANDLERS
        .iter()
        .find_map(|try_handle| try_handle(state, &req))
        .unwrap_or_else(|| {
            err(
                &req.id,
                "not_implemented",
                format!("unknown method: {}", req.method),
                None,
            )
        });

    if resp.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let error = resp.get("error");
        warn!(
            "request failed id={} method={} code={} message={}",
            req.id,
            req.method,
            error
                .and_then(|e| e.get("code"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown"),
            error
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
        );
    }
    resp
}
