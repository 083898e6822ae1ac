use crate::db;
use crate::grading::{self, GRADING_SETTINGS_KEY};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::db_conn;
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

const MAX_LOGO_LEN: usize = 2 * 1024 * 1024;

#[derive(Clone, Copy, Debug)]
enum SetupSection {
    School,
    Grading,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "school" => Some(Self::School),
            "grading" => Some(Self::Grading),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::School => "setup.school",
            Self::Grading => GRADING_SETTINGS_KEY,
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::School => json!({
            "schoolName": "Demo High School",
            "address": "123 Education Lane",
            "motto": "Knowledge is Power",
            "session": "2025/2026",
            "logo": null
        }),
        SetupSection::Grading => json!({
            "bands": []
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_nullable_string_max(v: &Value, key: &str, max_len: usize) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let s = parse_string_max(v, key, max_len)?;
    Ok(Value::String(s))
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::School => match k.as_str() {
                "schoolName" | "address" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 200)?));
                }
                "motto" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 120)?));
                }
                "session" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 32)?));
                }
                "logo" => {
                    obj.insert(k.clone(), parse_nullable_string_max(v, k, MAX_LOGO_LEN)?);
                }
                _ => return Err(format!("unknown school field: {}", k)),
            },
            SetupSection::Grading => match k.as_str() {
                "bands" => {
                    let bands = grading::parse_bands(v)?;
                    let normalized = serde_json::to_value(&bands).map_err(|e| e.to_string())?;
                    obj.insert(k.clone(), normalized);
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
        }
    }
    Ok(())
}

/// School identity with defaults applied, as shown on result sheets.
pub(crate) fn load_school(conn: &rusqlite::Connection) -> anyhow::Result<Value> {
    load_section(conn, SetupSection::School)
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values must not block the settings screen.
            if let Err(msg) = merge_section_patch(section, &mut current, saved_obj) {
                warn!(section = ?section, error = %msg, "ignoring malformed saved settings");
                current = default_section(section);
            }
        }
    }
    Ok(current)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let school = match load_section(conn, SetupSection::School) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let grading_section = match load_section(conn, SetupSection::Grading) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "school": school,
            "grading": grading_section,
            "defaultGradingBands": grading::default_bands()
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    info!(section = section_raw, "settings updated");
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
