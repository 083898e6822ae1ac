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
    let exe = env!("CARGO_BIN_EXE_resultsd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn resultsd");
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
    assert!(!line.trim().is_empty(), "empty response for {}", method);
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

#[test]
fn student_registration_rules_and_search() {
    let workspace = temp_dir("resultsd-students-register");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "2", "classes.create", json!({ "name": "JSS1" }));
    let _ = request_ok(&mut stdin, &mut reader, "3", "classes.create", json!({ "name": "JSS2" }));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({ "name": "Adaeze Okafor", "admNo": "ADM/001", "className": "JSS1" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({
            "name": "Bello Musa",
            "admNo": "ADM/002",
            "className": "JSS2",
            "photo": "data:image/png;base64,AAAA"
        }),
    );

    let dup = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.create",
        json!({ "name": "Someone Else", "admNo": "ADM/001", "className": "JSS2" }),
    );
    assert_eq!(error_code(&dup), "duplicate");

    let no_class = request(
        &mut stdin,
        &mut reader,
        "7",
        "students.create",
        json!({ "name": "Chinedu", "admNo": "ADM/003", "className": "SS3" }),
    );
    assert_eq!(error_code(&no_class), "not_found");

    let blank_name = request(
        &mut stdin,
        &mut reader,
        "8",
        "students.create",
        json!({ "name": "   ", "admNo": "ADM/004", "className": "JSS1" }),
    );
    assert_eq!(error_code(&blank_name), "bad_params");

    let all = request_ok(&mut stdin, &mut reader, "9", "students.list", json!({}));
    assert_eq!(all["students"].as_array().map(|a| a.len()), Some(2));

    let jss2 = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.list",
        json!({ "className": "JSS2" }),
    );
    assert_eq!(jss2["students"][0]["name"], "Bello Musa");
    assert_eq!(jss2["students"][0]["photo"], "data:image/png;base64,AAAA");

    let searched = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "students.list",
        json!({ "query": "okaf" }),
    );
    let found = searched["students"].as_array().expect("students");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["admNo"], "ADM/001");

    let in_use = request(
        &mut stdin,
        &mut reader,
        "12",
        "classes.delete",
        json!({ "name": "JSS1" }),
    );
    assert_eq!(error_code(&in_use), "in_use");
    assert_eq!(in_use["error"]["details"]["studentCount"], 1);
}

#[test]
fn deleting_a_student_removes_results_and_reranks_the_class() {
    let workspace = temp_dir("resultsd-students-delete");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "2", "classes.create", json!({ "name": "JSS3" }));
    let _ = request_ok(&mut stdin, &mut reader, "3", "subjects.create", json!({ "name": "English" }));

    let mut ids = Vec::new();
    for (i, (name, adm)) in [("Ada", "J3-1"), ("Bayo", "J3-2"), ("Chi", "J3-3")]
        .iter()
        .enumerate()
    {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "students.create",
            json!({ "name": name, "admNo": adm, "className": "JSS3" }),
        );
        ids.push(created["studentId"].as_str().expect("studentId").to_string());
    }
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "results.save",
        json!({
            "className": "JSS3",
            "subject": "English",
            "rows": [
                { "studentId": ids[0], "test": 30, "exam": 60 },
                { "studentId": ids[1], "test": 20, "exam": 50 },
                { "studentId": ids[2], "test": 10, "exam": 40 }
            ]
        }),
    );

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "students.delete",
        json!({ "studentId": ids[0] }),
    );
    assert_eq!(deleted["recomputed"], 1);
    assert_eq!(deleted["failures"], json!([]));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "results.list",
        json!({ "className": "JSS3" }),
    );
    let results = listed["results"].as_array().expect("results");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["studentName"], "Bayo");
    assert_eq!(results[0]["position"], "1st");
    assert_eq!(results[1]["studentName"], "Chi");
    assert_eq!(results[1]["position"], "2nd");

    let gone = request(
        &mut stdin,
        &mut reader,
        "7",
        "reports.studentSheet",
        json!({ "admNo": "J3-1" }),
    );
    assert_eq!(error_code(&gone), "not_found");

    let again = request(
        &mut stdin,
        &mut reader,
        "8",
        "students.delete",
        json!({ "studentId": ids[0] }),
    );
    assert_eq!(error_code(&again), "not_found");

    let counts = request_ok(&mut stdin, &mut reader, "9", "dashboard.counts", json!({}));
    assert_eq!(counts["students"], 2);
}
