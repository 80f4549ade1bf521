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
    s.ok("classes.create", json!({ "id": "c1", "name": "SE-A" }));
    for (id, roll, name) in [("st-a", "01", "Asha"), ("st-b", "02", "Bilal")] {
        s.ok(
            "students.create",
            json!({ "id": id, "classId": "c1", "rollNumber": roll, "name": name }),
        );
    }
    s.ok(
        "batches.create",
        json!({ "id": "b1", "classId": "c1", "name": "B1", "studentIds": ["st-a"] }),
    );
    s.ok("faculty.create", json!({ "id": "f1", "name": "Dr Rao" }));
    s.ok(
        "subjects.create",
        json!({
            "id": "s1",
            "name": "Mathematics",
            "classId": "c1",
            "teacherId": "f1",
            "subType": "theory"
        }),
    );
    s.ok(
        "subjects.create",
        json!({
            "id": "p1",
            "name": "Physics Lab",
            "classId": "c1",
            "teacherId": "f1",
            "subType": "practical",
            "batchIds": ["b1"]
        }),
    );
}

#[test]
fn delete_leaves_no_dangling_subject_ids() {
    let mut s = Sidecar::start("campus-subject-delete");
    seed(&mut s);
    assert_eq!(
        s.student_subjects("st-a"),
        vec!["p1".to_string(), "s1".to_string()]
    );

    let deleted = s.ok("subjects.delete", json!({ "subjectId": "s1" }));
    assert_eq!(deleted["membership"]["studentsRemove"], json!(["st-a", "st-b"]));
    assert_eq!(deleted["membership"]["classRemove"], "c1");
    assert_eq!(deleted["membership"]["facultyRemove"], "f1");
    s.ok("subjects.delete", json!({ "_id": "p1" }));

    assert!(s.student_subjects("st-a").is_empty());
    assert!(s.student_subjects("st-b").is_empty());
    let class = s.ok("classes.get", json!({ "classId": "c1" }));
    assert_eq!(class["subjects"], json!([]));
    let faculty = s.ok("faculty.get", json!({ "facultyId": "f1" }));
    assert_eq!(faculty["subjects"], json!([]));
    let listed = s.ok("subjects.list", json!({}));
    assert_eq!(listed["subjects"], json!([]));

    s.finish();
}

#[test]
fn deleting_a_missing_subject_is_not_found() {
    let mut s = Sidecar::start("campus-subject-delete-missing");
    seed(&mut s);

    s.ok("subjects.delete", json!({ "subjectId": "s1" }));
    let again = s.call("subjects.delete", json!({ "subjectId": "s1" }));
    assert_eq!(error_code(&again), "not_found");
    let never = s.call("subjects.delete", json!({ "subjectId": "nope" }));
    assert_eq!(error_code(&never), "not_found");
    let no_id = s.call("subjects.delete", json!({}));
    assert_eq!(error_code(&no_id), "bad_params");

    // The surviving subject is untouched.
    assert_eq!(s.student_subjects("st-a"), vec!["p1".to_string()]);

    s.finish();
}

#[test]
fn attendance_history_outlives_its_subject() {
    let mut s = Sidecar::start("campus-subject-delete-history");
    seed(&mut s);

    s.ok(
        "attendance.record",
        json!({
            "date": "2024-02-01",
            "subjectId": "s1",
            "sessions": ["L1"],
            "records": [{ "studentId": "st-a", "status": "present" }]
        }),
    );
    s.ok("subjects.delete", json!({ "subjectId": "s1" }));

    let listed = s.ok("attendance.list", json!({ "subjectId": "s1" }));
    assert_eq!(listed["attendances"].as_array().map(|a| a.len()), Some(1));

    // New sessions need a live subject.
    let late = s.call(
        "attendance.record",
        json!({
            "date": "2024-02-02",
            "subjectId": "s1",
            "sessions": ["L1"],
            "records": []
        }),
    );
    assert_eq!(error_code(&late), "not_found");

    s.finish();
}

#[test]
fn faculty_delete_releases_taught_subjects() {
    let mut s = Sidecar::start("campus-faculty-delete");
    seed(&mut s);

    let removed = s.ok("faculty.delete", json!({ "facultyId": "f1" }));
    assert_eq!(removed["subjectsReleased"], 2);

    let subject = s.ok("subjects.get", json!({ "subjectId": "s1" }));
    assert!(subject["subject"]["teacherId"].is_null());
    assert_eq!(subject["teachers"], json!([]));
    // Students keep the subject.
    assert_eq!(
        s.student_subjects("st-b"),
        vec!["s1".to_string()]
    );
    let gone = s.call("faculty.get", json!({ "facultyId": "f1" }));
    assert_eq!(error_code(&gone), "not_found");

    s.finish();
}

#[test]
fn class_delete_waits_for_its_subjects() {
    let mut s = Sidecar::start("campus-class-delete");
    seed(&mut s);

    let blocked = s.call("classes.delete", json!({ "classId": "c1" }));
    assert_eq!(error_code(&blocked), "conflict");

    s.ok("subjects.delete", json!({ "subjectId": "s1" }));
    s.ok("subjects.delete", json!({ "subjectId": "p1" }));
    s.ok("classes.delete", json!({ "classId": "c1" }));

    let student = s.call("students.get", json!({ "studentId": "st-a" }));
    assert_eq!(error_code(&student), "not_found");
    let listed = s.ok("classes.list", json!({}));
    assert_eq!(listed["classes"], json!([]));

    s.finish();
}
