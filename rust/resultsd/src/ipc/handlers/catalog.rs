use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

/// The two flat name lists schools maintain: classes and subjects.
#[derive(Clone, Copy)]
enum Catalog {
    Classes,
    Subjects,
}

impl Catalog {
    fn table(self) -> &'static str {
        match self {
            Catalog::Classes => "classes",
            Catalog::Subjects => "subjects",
        }
    }
}

pub fn name_exists(conn: &Connection, table: &str, name: &str) -> rusqlite::Result<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE name = ?", table);
    let found: Option<i64> = conn.query_row(&sql, [name], |r| r.get(0)).optional()?;
    Ok(found.is_some())
}

fn handle_list(catalog: Catalog, state: &mut AppState, req: &Request) -> serde_json::Value {
    let key = catalog.table();
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ key: [] }));
    };

    let sql = format!("SELECT name FROM {} ORDER BY rowid", key);
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(names) => ok(&req.id, json!({ key: names })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_create(catalog: Catalog, state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match name_exists(conn, catalog.table(), &name) {
        Ok(true) => {
            return err(
                &req.id,
                "duplicate",
                format!("{} already exists", name),
                Some(json!({ "table": catalog.table() })),
            )
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let sql = format!("INSERT INTO {}(id, name) VALUES(?, ?)", catalog.table());
    if let Err(e) = conn.execute(&sql, (Uuid::new_v4().to_string(), &name)) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": catalog.table() })),
        );
    }

    info!(table = catalog.table(), name = %name, "created");
    ok(&req.id, json!({ "name": name }))
}

fn handle_delete(catalog: Catalog, state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match name_exists(conn, catalog.table(), &name) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", format!("{} not found", name), None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    if let Catalog::Classes = catalog {
        let enrolled: i64 = match conn.query_row(
            "SELECT COUNT(*) FROM students WHERE class_name = ?",
            [&name],
            |r| r.get(0),
        ) {
            Ok(n) => n,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if enrolled > 0 {
            return err(
                &req.id,
                "in_use",
                "class still has registered students",
                Some(json!({ "studentCount": enrolled })),
            );
        }
    }

    // Subject scores already recorded under a deleted subject stay on the
    // result records and keep counting towards totals.
    let sql = format!("DELETE FROM {} WHERE name = ?", catalog.table());
    if let Err(e) = conn.execute(&sql, [&name]) {
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": catalog.table() })),
        );
    }

    info!(table = catalog.table(), name = %name, "deleted");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_list(Catalog::Classes, state, req)),
        "classes.create" => Some(handle_create(Catalog::Classes, state, req)),
        "classes.delete" => Some(handle_delete(Catalog::Classes, state, req)),
        "subjects.list" => Some(handle_list(Catalog::Subjects, state, req)),
        "subjects.create" => Some(handle_create(Catalog::Subjects, state, req)),
        "subjects.delete" => Some(handle_delete(Catalog::Subjects, state, req)),
        _ => None,
    }
}
