use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_campusd");
    let mut child = Command::new(exe)
        .env_remove("CAMPUSD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn campusd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    workspace: PathBuf,
    seq: u64,
}

impl Sidecar {
    fn start(prefix: &str) -> Self {
        let workspace = temp_dir(prefix);
        let (child, stdin, reader) = spawn_sidecar();
        let mut s = Sidecar {
            child,
            stdin,
            reader,
            workspace,
            seq: 0,
        };
        let path = s.workspace.to_string_lossy().to_string();
        s.ok("workspace.select", json!({ "path": path }));
        s
    }

    fn next_id(&mut self) -> String {
        self.seq += 1;
        self.seq.to_string()
    }

    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = self.next_id();
        request(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = self.next_id();
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn student_subjects(&mut self, student_id: &str) -> Vec<String> {
        let student = self.ok("students.get", json!({ "studentId": student_id }));
        serde_json::from_value(student["subjects"].clone()).expect("subjects array")
    }

    fn finish(mut self) {
        drop(self.stdin);
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.workspace);
    }
}

fn seed(s: &mut Sidecar) {
    s.ok("classes.create", json!({ "id": "c1", "name": "BE-A" }));
    for (id, roll, name) in [("st-a", "01", "Asha"), ("st-b", "02", "Bilal")] {
        s.ok(
            "students.create",
            json!({ "id": id, "classId": "c1", "rollNumber": roll, "name": name }),
        );
    }
    s.ok(
        "subjects.create",
        json!({ "id": "s1", "name": "Networks", "classId": "c1", "subType": "theory" }),
    );
}

#[test]
fn recording_the_same_session_twice_keeps_the_second_roll() {
    let mut s = Sidecar::start("campus-attendance-upsert");
    seed(&mut s);

    let first = s.ok(
        "attendance.record",
        json!({
            "date": "2024-01-10",
            "subjectId": "s1",
            "sessions": ["L1"],
            "records": [
                { "studentId": "st-a", "status": "present" },
                { "studentId": "st-b", "status": "present" }
            ]
        }),
    );
    assert_eq!(first["saved"], 1);
    assert!(first.get("rejected").is_none());
    let session_id = first["attendances"][0]["id"]
        .as_str()
        .expect("session id")
        .to_string();

    let second = s.ok(
        "attendance.record",
        json!({
            "date": "2024-01-10",
            "subject": "s1",
            "sessions": "L1",
            "records": [
                { "student": "st-a", "status": "absent" },
                { "student": "st-b", "status": "present" }
            ]
        }),
    );
    assert_eq!(second["attendances"][0]["id"], session_id.as_str());

    let listed = s.ok("attendance.list", json!({ "subjectId": "s1" }));
    let sessions = listed["attendances"].as_array().expect("attendances");
    assert_eq!(sessions.len(), 1);
    assert_eq!(
        sessions[0]["records"],
        json!([
            { "studentId": "st-a", "status": "absent" },
            { "studentId": "st-b", "status": "present" }
        ])
    );

    s.finish();
}

#[test]
fn each_session_label_is_its_own_lecture() {
    let mut s = Sidecar::start("campus-attendance-labels");
    seed(&mut s);

    let saved = s.ok(
        "attendance.record",
        json!({
            "date": "2024-01-10T09:30:00Z",
            "subjectId": "s1",
            "sessions": ["L1", "L2", "L1"],
            "records": [{ "studentId": "st-a", "status": "present" }]
        }),
    );
    assert_eq!(saved["saved"], 2);
    assert_eq!(saved["attendances"][0]["date"], "2024-01-10");

    let listed = s.ok("attendance.list", json!({ "subjectId": "s1" }));
    let labels: Vec<&str> = listed["attendances"]
        .as_array()
        .expect("attendances")
        .iter()
        .filter_map(|v| v["session"].as_str())
        .collect();
    assert_eq!(labels, vec!["L1", "L2"]);

    s.finish();
}

#[test]
fn missing_status_means_absent() {
    let mut s = Sidecar::start("campus-attendance-status");
    seed(&mut s);

    let saved = s.ok(
        "attendance.record",
        json!({
            "date": "2024-01-10",
            "subjectId": "s1",
            "sessions": ["L1"],
            "records": [
                { "studentId": "st-a" },
                { "studentId": "st-b", "status": null }
            ]
        }),
    );
    assert_eq!(
        saved["attendances"][0]["records"],
        json!([
            { "studentId": "st-a", "status": "absent" },
            { "studentId": "st-b", "status": "absent" }
        ])
    );

    s.finish();
}

#[test]
fn malformed_record_requests_are_rejected() {
    let mut s = Sidecar::start("campus-attendance-invalid");
    seed(&mut s);

    let no_records = s.call(
        "attendance.record",
        json!({ "date": "2024-01-10", "subjectId": "s1", "sessions": ["L1"] }),
    );
    assert_eq!(error_code(&no_records), "bad_params");

    let bad_status = s.call(
        "attendance.record",
        json!({
            "date": "2024-01-10",
            "subjectId": "s1",
            "sessions": ["L1"],
            "records": [{ "studentId": "st-a", "status": "late" }]
        }),
    );
    assert_eq!(error_code(&bad_status), "bad_params");

    let bad_date = s.call(
        "attendance.record",
        json!({
            "date": "10/01/2024",
            "subjectId": "s1",
            "sessions": ["L1"],
            "records": []
        }),
    );
    assert_eq!(error_code(&bad_date), "bad_params");

    let no_sessions = s.call(
        "attendance.record",
        json!({ "date": "2024-01-10", "subjectId": "s1", "sessions": [], "records": [] }),
    );
    assert_eq!(error_code(&no_sessions), "bad_params");

    let numeric_session = s.call(
        "attendance.record",
        json!({ "date": "2024-01-10", "subjectId": "s1", "sessions": [5, "L1"], "records": [] }),
    );
    assert_eq!(error_code(&numeric_session), "bad_params");

    let unknown_subject = s.call(
        "attendance.record",
        json!({
            "date": "2024-01-10",
            "subjectId": "nope",
            "sessions": ["L1"],
            "records": []
        }),
    );
    assert_eq!(error_code(&unknown_subject), "not_found");

    let listed = s.ok("attendance.list", json!({ "subjectId": "s1" }));
    assert_eq!(listed["attendances"], json!([]));

    s.finish();
}

#[test]
fn sessions_can_be_edited_and_removed_by_id() {
    let mut s = Sidecar::start("campus-attendance-edit");
    seed(&mut s);

    let saved = s.ok(
        "attendance.record",
        json!({
            "date": "2024-01-10",
            "subjectId": "s1",
            "sessions": ["L1"],
            "records": [{ "studentId": "st-a", "status": "present" }]
        }),
    );
    let id = saved["attendances"][0]["id"]
        .as_str()
        .expect("session id")
        .to_string();

    let updated = s.ok(
        "attendance.update",
        json!({
            "id": id,
            "date": "2024-01-12",
            "subjectId": "s1",
            "records": [{ "studentId": "st-b", "status": "present" }]
        }),
    );
    assert_eq!(updated["date"], "2024-01-12");
    assert_eq!(updated["session"], "L1");
    assert_eq!(
        updated["records"],
        json!([{ "studentId": "st-b", "status": "present" }])
    );

    let ranged = s.ok(
        "attendance.list",
        json!({ "subjectId": "s1", "startDate": "2024-01-11", "endDate": "2024-01-31" }),
    );
    assert_eq!(ranged["attendances"].as_array().map(|a| a.len()), Some(1));
    let before = s.ok(
        "attendance.list",
        json!({ "subjectId": "s1", "endDate": "2024-01-11" }),
    );
    assert_eq!(before["attendances"], json!([]));

    let deleted = s.ok("attendance.delete", json!({ "id": id }));
    assert_eq!(deleted["attendance"]["id"], id.as_str());
    let again = s.call("attendance.delete", json!({ "id": id }));
    assert_eq!(error_code(&again), "not_found");
    let ghost = s.call(
        "attendance.update",
        json!({ "id": id, "date": "2024-01-12", "subjectId": "s1", "records": [] }),
    );
    assert_eq!(error_code(&ghost), "not_found");

    s.finish();
}

#[test]
fn one_failing_label_keeps_the_rest_of_the_batch() {
    let mut s = Sidecar::start("campus-attendance-partial");
    seed(&mut s);
    {
        let conn = rusqlite::Connection::open(s.workspace.join("campus.sqlite3"))
            .expect("open workspace db");
        conn.execute_batch(
            "CREATE TRIGGER reject_bad_label BEFORE INSERT ON attendance_sessions
             WHEN NEW.session = 'bad'
             BEGIN SELECT RAISE(ABORT, 'label refused'); END;",
        )
        .expect("install trigger");
    }

    let res = s.ok(
        "attendance.record",
        json!({
            "date": "2024-01-10",
            "subjectId": "s1",
            "sessions": ["bad", "L1"],
            "records": [{ "studentId": "st-a", "status": "present" }]
        }),
    );
    assert_eq!(res["saved"], 1);
    assert_eq!(res["rejected"], 1);
    assert_eq!(res["errors"][0]["session"], "bad");
    assert_eq!(res["attendances"][0]["session"], "L1");

    let listed = s.ok("attendance.list", json!({ "subjectId": "s1" }));
    let sessions = listed["attendances"].as_array().expect("attendances");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["session"], "L1");
    assert_eq!(
        sessions[0]["records"],
        json!([{ "studentId": "st-a", "status": "present" }])
    );

    s.finish();
}
