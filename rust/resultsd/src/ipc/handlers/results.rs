use crate::calc::{sanitize_score_input, ScoreEntry, StudentResult, MAX_SUBJECT_SCORE};
use crate::grading;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::handlers::catalog::name_exists;
use crate::ipc::handlers::students::{students_in_class, StudentRow};
use crate::ipc::helpers::{db_conn, required_str, term_param};
use crate::ipc::types::{AppState, Request};
use crate::store::{recompute_class_term, RecomputeSummary, SqliteResultStore};
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::info;

/// Blank and missing inputs count as 0; numeric strings go through the same
/// cleanup as the entry form.
fn parse_score_param(v: Option<&Value>, key: &str) -> Result<f64, String> {
    match v {
        None | Some(Value::Null) => Ok(0.0),
        Some(Value::Number(n)) => {
            let x = n.as_f64().unwrap_or(f64::NAN);
            if !x.is_finite() || !(0.0..=MAX_SUBJECT_SCORE).contains(&x) {
                return Err(format!("{} must be between 0 and 100", key));
            }
            Ok(x)
        }
        Some(Value::String(s)) => Ok(sanitize_score_input(s)),
        Some(_) => Err(format!("{} must be a number", key)),
    }
}

fn check_class_and_subject(
    conn: &Connection,
    req: &Request,
    class_name: &str,
    subject: Option<&str>,
) -> Result<(), Value> {
    match name_exists(conn, "classes", class_name) {
        Ok(true) => {}
        Ok(false) => {
            return Err(err(
                &req.id,
                "not_found",
                "class not found",
                Some(json!({ "className": class_name })),
            ))
        }
        Err(e) => return Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
    if let Some(subject) = subject {
        match name_exists(conn, "subjects", subject) {
            Ok(true) => {}
            Ok(false) => {
                return Err(err(
                    &req.id,
                    "not_found",
                    "subject not found",
                    Some(json!({ "subject": subject })),
                ))
            }
            Err(e) => return Err(err(&req.id, "db_query_failed", e.to_string(), None)),
        }
    }
    Ok(())
}

fn result_rows(results: &[StudentResult], students: &[StudentRow]) -> Vec<Value> {
    let by_id: HashMap<&str, &StudentRow> = students.iter().map(|s| (s.id.as_str(), s)).collect();
    results
        .iter()
        .map(|r| {
            let mut v = json!(r);
            if let Some(s) = by_id.get(r.student_id.as_str()) {
                v["studentName"] = json!(s.name);
                v["admNo"] = json!(s.adm_no);
            }
            v
        })
        .collect()
}

fn summary_response(
    req: &Request,
    conn: &Connection,
    class_name: &str,
    summary: RecomputeSummary,
) -> Value {
    let students = match students_in_class(conn, class_name) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "results": result_rows(&summary.results, &students),
            "failures": summary.failures
        }),
    )
}

fn handle_results_sheet(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_name = match required_str(req, "className") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject = match required_str(req, "subject") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = term_param(req);
    if let Err(e) = check_class_and_subject(conn, req, &class_name, Some(subject.as_str())) {
        return e;
    }

    let students = match students_in_class(conn, &class_name) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let store = SqliteResultStore::new(conn);
    let mut rows = Vec::with_capacity(students.len());
    for s in &students {
        let existing = match store.find_for_student(&s.id, &term) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let entry = existing.and_then(|r| r.scores.get(&subject).cloned());
        rows.push(match entry {
            Some(e) => json!({
                "studentId": s.id,
                "name": s.name,
                "admNo": s.adm_no,
                "test": e.test,
                "exam": e.exam,
                "total": e.total,
                "grade": e.grade
            }),
            None => json!({
                "studentId": s.id,
                "name": s.name,
                "admNo": s.adm_no,
                "test": null,
                "exam": null,
                "total": 0,
                "grade": "-"
            }),
        });
    }

    ok(
        &req.id,
        json!({
            "className": class_name,
            "subject": subject,
            "term": term,
            "rows": rows
        }),
    )
}

fn handle_results_save(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_name = match required_str(req, "className") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject = match required_str(req, "subject") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = term_param(req);
    let Some(raw_rows) = req.params.get("rows").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "rows must be an array", None);
    };
    if let Err(e) = check_class_and_subject(conn, req, &class_name, Some(subject.as_str())) {
        return e;
    }

    let bands = match grading::load_bands(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let enrolled: HashMap<String, StudentRow> = match students_in_class(conn, &class_name) {
        Ok(v) => v.into_iter().map(|s| (s.id.clone(), s)).collect(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Validate every row before writing any of them.
    let mut entries: Vec<(String, ScoreEntry)> = Vec::with_capacity(raw_rows.len());
    for (i, row) in raw_rows.iter().enumerate() {
        let Some(student_id) = row.get("studentId").and_then(|v| v.as_str()) else {
            return err(
                &req.id,
                "bad_params",
                format!("rows[{}].studentId missing", i),
                None,
            );
        };
        if !enrolled.contains_key(student_id) {
            return err(
                &req.id,
                "bad_params",
                format!("rows[{}] student is not in {}", i, class_name),
                Some(json!({ "studentId": student_id })),
            );
        }
        let scores = parse_score_param(row.get("test"), "test")
            .and_then(|t| parse_score_param(row.get("exam"), "exam").map(|e| (t, e)));
        let (test, exam) = match scores {
            Ok(v) => v,
            Err(msg) => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("rows[{}]: {}", i, msg),
                    Some(json!({ "studentId": student_id })),
                )
            }
        };
        let entry = match ScoreEntry::graded(test, exam, &bands) {
            Ok(e) => e,
            Err(mut e) => {
                e.details = Some(json!({ "studentId": student_id, "test": test, "exam": exam }));
                return calc_err(&req.id, e);
            }
        };
        entries.push((student_id.to_string(), entry));
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    {
        let store = SqliteResultStore::new(&tx);
        for (student_id, entry) in entries {
            if let Err(e) =
                store.upsert_subject_entry(&student_id, &class_name, &term, &subject, entry)
            {
                return err(
                    &req.id,
                    "db_update_failed",
                    e.to_string(),
                    Some(json!({ "table": "results", "studentId": student_id })),
                );
            }
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    info!(class = %class_name, subject = %subject, term = %term, rows = raw_rows.len(), "scores saved");

    let mut store = SqliteResultStore::new(conn);
    match recompute_class_term(&mut store, &class_name, &term) {
        Ok(summary) => summary_response(req, conn, &class_name, summary),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_results_recompute(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_name = match required_str(req, "className") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = term_param(req);

    let mut store = SqliteResultStore::new(conn);
    match recompute_class_term(&mut store, &class_name, &term) {
        Ok(summary) => summary_response(req, conn, &class_name, summary),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_results_list(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_name = match required_str(req, "className") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = term_param(req);

    let results = match SqliteResultStore::new(conn).list_ranked(&class_name, &term) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    summary_response(
        req,
        conn,
        &class_name,
        RecomputeSummary {
            results,
            failures: Vec::new(),
        },
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "results.sheet" => Some(handle_results_sheet(state, req)),
        "results.save" => Some(handle_results_save(state, req)),
        "results.recompute" => Some(handle_results_recompute(state, req)),
        "results.list" => Some(handle_results_list(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_params_accept_blank_numbers_and_form_strings() {
        assert_eq!(parse_score_param(None, "test"), Ok(0.0));
        assert_eq!(parse_score_param(Some(&Value::Null), "test"), Ok(0.0));
        assert_eq!(parse_score_param(Some(&json!(35)), "test"), Ok(35.0));
        assert_eq!(parse_score_param(Some(&json!("35")), "test"), Ok(35.0));
        assert_eq!(parse_score_param(Some(&json!("")), "test"), Ok(0.0));
        assert_eq!(parse_score_param(Some(&json!("150")), "test"), Ok(100.0));
    }

    #[test]
    fn score_params_reject_out_of_range_numbers() {
        assert!(parse_score_param(Some(&json!(-1)), "exam").is_err());
        assert!(parse_score_param(Some(&json!(100.5)), "exam").is_err());
        assert!(parse_score_param(Some(&json!(true)), "exam").is_err());
    }
}
