use rusqlite::Connection;

use crate::calc::DEFAULT_TERM;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

/// Trimmed, non-empty string param.
pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    let v = req
        .params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))?;
    if v.is_empty() {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must not be empty", key),
            None,
        ));
    }
    Ok(v)
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn term_param(req: &Request) -> String {
    optional_str(req, "term").unwrap_or_else(|| DEFAULT_TERM.to_string())
}
