use crate::calc::{StudentResult, MAX_SUBJECT_SCORE};
use crate::grading::{self, resolve_grade, GradingBand};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup::load_school;
use crate::ipc::handlers::students::{find_student_by_adm_no, students_in_class, StudentRow};
use crate::ipc::helpers::{db_conn, required_str, term_param};
use crate::ipc::types::{AppState, Request};
use crate::store::SqliteResultStore;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Shared inputs for every sheet rendered in one request.
struct SheetContext {
    school: Value,
    bands: Vec<GradingBand>,
    class_count: usize,
}

fn subject_rows(result: &StudentResult, bands: &[GradingBand]) -> Vec<Value> {
    // BTreeMap iteration is already name order.
    result
        .scores
        .iter()
        .map(|(subject, entry)| {
            let info = resolve_grade(entry.total, bands);
            json!({
                "subject": subject,
                "test": entry.test,
                "exam": entry.exam,
                "total": entry.total,
                "grade": entry.grade,
                "remark": info.remark
            })
        })
        .collect()
}

fn sheet_model(ctx: &SheetContext, student: &StudentRow, result: &StudentResult) -> Value {
    json!({
        "school": ctx.school,
        "student": {
            "name": student.name,
            "admNo": student.adm_no,
            "className": student.class_name,
            "photo": student.photo
        },
        "term": result.term,
        "subjects": subject_rows(result, &ctx.bands),
        "summary": {
            "grandTotal": result.grand_total,
            "average": result.average,
            "position": result.position,
            "classCount": ctx.class_count,
            "obtainable": result.scores.len() as f64 * MAX_SUBJECT_SCORE
        }
    })
}

fn load_context(
    conn: &rusqlite::Connection,
    req: &Request,
    class_count: usize,
) -> Result<SheetContext, Value> {
    let school = load_school(conn).map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let bands =
        grading::load_bands(conn).map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    Ok(SheetContext {
        school,
        bands,
        class_count,
    })
}

fn handle_student_sheet(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let adm_no = match required_str(req, "admNo") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = term_param(req);

    let student = match find_student_by_adm_no(conn, &adm_no) {
        Ok(Some(s)) => s,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "no student with that admission number",
                Some(json!({ "admNo": adm_no })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let result = match SqliteResultStore::new(conn).find_for_student(&student.id, &term) {
        Ok(Some(r)) => r,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "no results recorded for this term",
                Some(json!({ "admNo": adm_no, "term": term })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let class_count = match students_in_class(conn, &student.class_name) {
        Ok(v) => v.len(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let ctx = match load_context(conn, req, class_count) {
        Ok(c) => c,
        Err(e) => return e,
    };

    ok(&req.id, sheet_model(&ctx, &student, &result))
}

fn handle_class_sheets(state: &mut AppState, req: &Request) -> Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let class_name = match required_str(req, "className") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term = term_param(req);

    let students = match students_in_class(conn, &class_name) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let results = match SqliteResultStore::new(conn).list_ranked(&class_name, &term) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let by_id: HashMap<&str, &StudentRow> = students.iter().map(|s| (s.id.as_str(), s)).collect();
    let pairs: Vec<(&StudentRow, &StudentResult)> = results
        .iter()
        .filter_map(|r| by_id.get(r.student_id.as_str()).map(|s| (*s, r)))
        .collect();
    if pairs.is_empty() {
        return err(
            &req.id,
            "not_found",
            "no results recorded for this class and term",
            Some(json!({ "className": class_name, "term": term })),
        );
    }

    let ctx = match load_context(conn, req, students.len()) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let sheets: Vec<Value> = pairs
        .into_iter()
        .map(|(s, r)| sheet_model(&ctx, s, r))
        .collect();
    ok(
        &req.id,
        json!({ "className": class_name, "term": term, "sheets": sheets }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "reports.studentSheet" => Some(handle_student_sheet(state, req)),
        "reports.classSheets" => Some(handle_class_sheets(state, req)),
        _ => None,
    }
}
