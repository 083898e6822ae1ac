use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::db;

pub const GRADING_SETTINGS_KEY: &str = "setup.grading";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingBand {
    pub min: f64,
    pub max: f64,
    pub grade: String,
    #[serde(default)]
    pub remark: String,
}

impl GradingBand {
    fn new(min: f64, max: f64, grade: &str, remark: &str) -> Self {
        Self {
            min,
            max,
            grade: grade.to_string(),
            remark: remark.to_string(),
        }
    }

    fn contains(&self, score: f64) -> bool {
        score >= self.min && score <= self.max
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GradeInfo {
    pub grade: String,
    pub remark: String,
}

impl GradeInfo {
    fn unknown() -> Self {
        Self {
            grade: "?".to_string(),
            remark: "N/A".to_string(),
        }
    }
}

/// Used whenever a workspace has no grading table configured.
pub fn default_bands() -> Vec<GradingBand> {
    vec![
        GradingBand::new(70.0, 100.0, "A", "Excellent"),
        GradingBand::new(60.0, 69.0, "B", "Very Good"),
        GradingBand::new(50.0, 59.0, "C", "Good"),
        GradingBand::new(45.0, 49.0, "D", "Fair"),
        GradingBand::new(40.0, 44.0, "E", "Pass"),
        GradingBand::new(0.0, 39.0, "F", "Fail"),
    ]
}

/// First band (in table order) whose inclusive range holds `score`.
pub fn resolve_grade(score: f64, bands: &[GradingBand]) -> GradeInfo {
    let defaults;
    let table = if bands.is_empty() {
        defaults = default_bands();
        &defaults[..]
    } else {
        bands
    };
    table
        .iter()
        .find(|b| b.contains(score))
        .map(|b| GradeInfo {
            grade: b.grade.clone(),
            remark: b.remark.clone(),
        })
        .unwrap_or_else(GradeInfo::unknown)
}

pub fn parse_bands(v: &Value) -> Result<Vec<GradingBand>, String> {
    if v.is_null() {
        return Ok(Vec::new());
    }
    let bands: Vec<GradingBand> = serde_json::from_value(v.clone())
        .map_err(|e| format!("bands must be a list of {{min, max, grade, remark}}: {}", e))?;
    validate_bands(&bands)?;
    Ok(bands)
}

/// Checks a table before it is saved. Resolution itself never validates.
pub fn validate_bands(bands: &[GradingBand]) -> Result<(), String> {
    for (i, b) in bands.iter().enumerate() {
        if !b.min.is_finite() || !b.max.is_finite() {
            return Err(format!("bands[{}] min/max must be numbers", i));
        }
        if b.min < 0.0 || b.max > 100.0 || b.min > b.max {
            return Err(format!("bands[{}] must satisfy 0 <= min <= max <= 100", i));
        }
        if b.grade.trim().is_empty() {
            return Err(format!("bands[{}] grade must not be empty", i));
        }
        if b.grade.len() > 8 || b.remark.len() > 64 {
            return Err(format!("bands[{}] grade/remark too long", i));
        }
    }
    for (i, a) in bands.iter().enumerate() {
        for (j, b) in bands.iter().enumerate().skip(i + 1) {
            if a.min <= b.max && b.min <= a.max {
                return Err(format!("bands[{}] overlaps bands[{}]", i, j));
            }
        }
    }
    Ok(())
}

/// Configured grading table for the workspace; empty when unset or unreadable.
pub fn load_bands(conn: &Connection) -> anyhow::Result<Vec<GradingBand>> {
    let Some(saved) = db::settings_get_json(conn, GRADING_SETTINGS_KEY)? else {
        return Ok(Vec::new());
    };
    let raw = saved.get("bands").cloned().unwrap_or(Value::Null);
    match parse_bands(&raw) {
        Ok(bands) => Ok(bands),
        Err(msg) => {
            warn!(error = %msg, "ignoring malformed grading table");
            Ok(Vec::new())
        }
    }
}
