mod attendance;
mod db;
mod enrollment;
mod ipc;
mod model;

use log::{error, info, warn};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

const LOG_ENV: &str = "CAMPUSD_LOG";
const WORKSPACE_ENV: &str = "CAMPUSD_WORKSPACE";

fn main() {
    // stdout carries the IPC stream, so logs go to stderr.
    env_logger::Builder::from_env(env_logger::Env::new().filter_or(LOG_ENV, "info"))
        .target(env_logger::Target::Stderr)
        .init();

    let mut state = ipc::AppState::default();

    if let Some(path) = std::env::var_os(WORKSPACE_ENV).filter(|v| !v.is_empty()) {
        let path = PathBuf::from(path);
        if let Err(e) = ipc::select_workspace(&mut state, &path) {
            error!("failed to open {} {}: {e:#}", WORKSPACE_ENV, path.display());
        }
    }
    info!("campusd {} ready", env!("CARGO_PKG_VERSION"));

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                warn!("stdin closed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                warn!("bad request line: {e}");
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    info!("campusd shutting down");
}
