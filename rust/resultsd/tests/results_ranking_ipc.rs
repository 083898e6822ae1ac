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

fn open_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    prefix: &str,
    subjects: &[&str],
    students: &[(&str, &str)],
) -> Vec<String> {
    let workspace = temp_dir(prefix);
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(stdin, reader, "cls", "classes.create", json!({ "name": "JSS1" }));
    for (i, s) in subjects.iter().enumerate() {
        let _ = request_ok(
            stdin,
            reader,
            &format!("sub{}", i),
            "subjects.create",
            json!({ "name": s }),
        );
    }
    students
        .iter()
        .enumerate()
        .map(|(i, (name, adm_no))| {
            let created = request_ok(
                stdin,
                reader,
                &format!("stu{}", i),
                "students.create",
                json!({ "name": name, "admNo": adm_no, "className": "JSS1" }),
            );
            created["studentId"].as_str().expect("studentId").to_string()
        })
        .collect()
}

fn positions_by_student(results: &serde_json::Value) -> Vec<(String, String)> {
    results["results"]
        .as_array()
        .expect("results array")
        .iter()
        .map(|r| {
            (
                r["studentName"].as_str().unwrap_or("").to_string(),
                r["position"].as_str().unwrap_or("").to_string(),
            )
        })
        .collect()
}

#[test]
fn equal_totals_share_a_position_and_the_next_total_skips_ahead() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let ids = open_class(
        &mut stdin,
        &mut reader,
        "resultsd-ranking-ties",
        &["Mathematics"],
        &[("Ada", "A1"), ("Bayo", "A2"), ("Chi", "A3"), ("Dayo", "A4")],
    );

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "results.save",
        json!({
            "className": "JSS1",
            "subject": "Mathematics",
            "rows": [
                { "studentId": ids[0], "test": 30, "exam": 60 },
                { "studentId": ids[1], "test": 25, "exam": 55 },
                { "studentId": ids[2], "test": 30, "exam": 60 },
                { "studentId": ids[3], "test": 40, "exam": 50 }
            ]
        }),
    );
    assert_eq!(saved["failures"], json!([]));
    assert_eq!(
        positions_by_student(&saved),
        vec![
            ("Ada".to_string(), "1st".to_string()),
            ("Chi".to_string(), "1st".to_string()),
            ("Dayo".to_string(), "1st".to_string()),
            ("Bayo".to_string(), "4th".to_string()),
        ]
    );
    let first = &saved["results"][0];
    assert_eq!(first["grandTotal"], 90.0);
    assert_eq!(first["average"], "90.00");
    assert_eq!(first["scores"]["Mathematics"]["grade"], "A");
}

#[test]
fn totals_and_averages_span_subjects_and_missing_entries_do_not_count() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let ids = open_class(
        &mut stdin,
        &mut reader,
        "resultsd-ranking-multi",
        &["Mathematics", "English"],
        &[("Ada", "A1"), ("Bayo", "A2"), ("Chi", "A3"), ("Dayo", "A4")],
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "results.save",
        json!({
            "className": "JSS1",
            "subject": "Mathematics",
            "rows": [
                { "studentId": ids[0], "test": 30, "exam": 60 },
                { "studentId": ids[1], "test": 30, "exam": 60 },
                { "studentId": ids[2], "test": 20, "exam": 60 },
                { "studentId": ids[3], "test": 30, "exam": 60 }
            ]
        }),
    );
    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "results.save",
        json!({
            "className": "JSS1",
            "subject": "English",
            "rows": [
                { "studentId": ids[0], "test": 10, "exam": 30 },
                { "studentId": ids[1], "test": 20, "exam": 50 },
                { "studentId": ids[2], "test": 30, "exam": 60 }
            ]
        }),
    );

    let results = saved["results"].as_array().expect("results");
    let by_name = |name: &str| {
        results
            .iter()
            .find(|r| r["studentName"] == name)
            .cloned()
            .expect("student result")
    };
    let chi = by_name("Chi");
    assert_eq!(chi["grandTotal"], 170.0);
    assert_eq!(chi["average"], "85.00");
    assert_eq!(chi["position"], "1st");

    let bayo = by_name("Bayo");
    assert_eq!(bayo["grandTotal"], 160.0);
    assert_eq!(bayo["average"], "80.00");
    assert_eq!(bayo["position"], "2nd");

    let ada = by_name("Ada");
    assert_eq!(ada["grandTotal"], 130.0);
    assert_eq!(ada["average"], "65.00");
    assert_eq!(ada["position"], "3rd");
    assert_eq!(ada["scores"]["English"]["grade"], "E");

    // One subject only: average over what was entered.
    let dayo = by_name("Dayo");
    assert_eq!(dayo["grandTotal"], 90.0);
    assert_eq!(dayo["average"], "90.00");
    assert_eq!(dayo["position"], "4th");
}

#[test]
fn recompute_is_idempotent_and_list_returns_persisted_order() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let ids = open_class(
        &mut stdin,
        &mut reader,
        "resultsd-ranking-recompute",
        &["Mathematics"],
        &[("Ada", "A1"), ("Bayo", "A2"), ("Chi", "A3")],
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "results.save",
        json!({
            "className": "JSS1",
            "subject": "Mathematics",
            "rows": [
                { "studentId": ids[0], "test": 10, "exam": 40 },
                { "studentId": ids[1], "test": 20, "exam": 60 },
                { "studentId": ids[2], "test": 10, "exam": 40 }
            ]
        }),
    );

    let once = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "results.recompute",
        json!({ "className": "JSS1" }),
    );
    let twice = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.recompute",
        json!({ "className": "JSS1", "term": "1st Term" }),
    );
    assert_eq!(once, twice);
    assert_eq!(
        positions_by_student(&once),
        vec![
            ("Bayo".to_string(), "1st".to_string()),
            ("Ada".to_string(), "2nd".to_string()),
            ("Chi".to_string(), "2nd".to_string()),
        ]
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "results.list",
        json!({ "className": "JSS1" }),
    );
    assert_eq!(positions_by_student(&listed), positions_by_student(&once));
}

#[test]
fn terms_are_ranked_independently() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let ids = open_class(
        &mut stdin,
        &mut reader,
        "resultsd-ranking-terms",
        &["Mathematics"],
        &[("Ada", "A1"), ("Bayo", "A2")],
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "results.save",
        json!({
            "className": "JSS1",
            "subject": "Mathematics",
            "rows": [
                { "studentId": ids[0], "test": 30, "exam": 60 },
                { "studentId": ids[1], "test": 10, "exam": 20 }
            ]
        }),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "results.save",
        json!({
            "className": "JSS1",
            "subject": "Mathematics",
            "term": "2nd Term",
            "rows": [
                { "studentId": ids[0], "test": 5, "exam": 5 },
                { "studentId": ids[1], "test": 30, "exam": 40 }
            ]
        }),
    );
    assert_eq!(
        positions_by_student(&second),
        vec![
            ("Bayo".to_string(), "1st".to_string()),
            ("Ada".to_string(), "2nd".to_string()),
        ]
    );

    let first_term = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "results.list",
        json!({ "className": "JSS1", "term": "1st Term" }),
    );
    assert_eq!(
        positions_by_student(&first_term),
        vec![
            ("Ada".to_string(), "1st".to_string()),
            ("Bayo".to_string(), "2nd".to_string()),
        ]
    );

    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "results.recompute",
        json!({ "className": "JSS1", "term": "3rd Term" }),
    );
    assert_eq!(empty["results"], json!([]));
}
