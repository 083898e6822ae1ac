use crate::db;
use crate::ipc::error::{calc_err, err, ok};
use crate::ipc::handlers::catalog::name_exists;
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::store::{recompute_class_term, SqliteResultStore};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use tracing::info;
use uuid::Uuid;

const MAX_PHOTO_LEN: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRow {
    pub id: String,
    pub name: String,
    pub adm_no: String,
    pub class_name: String,
    pub photo: Option<String>,
}

fn student_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentRow> {
    Ok(StudentRow {
        id: r.get(0)?,
        name: r.get(1)?,
        adm_no: r.get(2)?,
        class_name: r.get(3)?,
        photo: r.get(4)?,
    })
}

pub fn students_in_class(conn: &Connection, class_name: &str) -> rusqlite::Result<Vec<StudentRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, adm_no, class_name, photo
         FROM students
         WHERE class_name = ?
         ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([class_name], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn all_students(conn: &Connection) -> rusqlite::Result<Vec<StudentRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, adm_no, class_name, photo
         FROM students
         ORDER BY rowid",
    )?;
    let rows = stmt
        .query_map([], student_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn find_student(conn: &Connection, student_id: &str) -> rusqlite::Result<Option<StudentRow>> {
    conn.query_row(
        "SELECT id, name, adm_no, class_name, photo FROM students WHERE id = ?",
        [student_id],
        student_from_row,
    )
    .optional()
}

pub fn find_student_by_adm_no(
    conn: &Connection,
    adm_no: &str,
) -> rusqlite::Result<Option<StudentRow>> {
    conn.query_row(
        "SELECT id, name, adm_no, class_name, photo FROM students WHERE adm_no = ?",
        [adm_no],
        student_from_row,
    )
    .optional()
}

fn matches_query(s: &StudentRow, query: &str) -> bool {
    let q = query.to_lowercase();
    s.name.to_lowercase().contains(&q) || s.adm_no.to_lowercase().contains(&q)
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };
    let class_name = optional_str(req, "className");
    let query = optional_str(req, "query");

    let rows = match class_name.as_deref() {
        Some(c) => students_in_class(conn, c),
        None => all_students(conn),
    };
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let students: Vec<StudentRow> = match query.as_deref() {
        Some(q) => rows.into_iter().filter(|s| matches_query(s, q)).collect(),
        None => rows,
    };
    ok(&req.id, json!({ "students": students }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let adm_no = match required_str(req, "admNo") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_name = match required_str(req, "className") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let photo = optional_str(req, "photo");
    if photo.as_ref().map(|p| p.len() > MAX_PHOTO_LEN).unwrap_or(false) {
        return err(&req.id, "bad_params", "photo is too large", None);
    }

    match name_exists(conn, "classes", &class_name) {
        Ok(true) => {}
        Ok(false) => {
            return err(
                &req.id,
                "not_found",
                "class not found",
                Some(json!({ "className": class_name })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    match find_student_by_adm_no(conn, &adm_no) {
        Ok(None) => {}
        Ok(Some(_)) => {
            return err(
                &req.id,
                "duplicate",
                "admission number already registered",
                Some(json!({ "admNo": adm_no })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, name, adm_no, class_name, photo, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &name,
            &adm_no,
            &class_name,
            &photo,
            db::now_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    info!(student_id = %student_id, class = %class_name, "student registered");
    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match find_student(conn, &student_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let affected: BTreeSet<(String, String)> =
        match SqliteResultStore::new(conn).list_for_student(&student_id) {
            Ok(rows) => rows
                .into_iter()
                .map(|r| (r.class_name, r.term))
                .collect(),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM results WHERE student_id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "results" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    // Remaining classmates move up.
    let mut store = SqliteResultStore::new(conn);
    let mut failures = Vec::new();
    for (class_name, term) in &affected {
        match recompute_class_term(&mut store, class_name, term) {
            Ok(summary) => failures.extend(summary.failures),
            Err(e) => return calc_err(&req.id, e),
        }
    }

    info!(student_id = %student_id, recomputed = affected.len(), "student deleted");
    ok(
        &req.id,
        json!({ "ok": true, "recomputed": affected.len(), "failures": failures }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
