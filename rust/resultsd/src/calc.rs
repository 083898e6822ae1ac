use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::grading::{resolve_grade, GradingBand};

pub const DEFAULT_TERM: &str = "1st Term";
pub const MAX_SUBJECT_SCORE: f64 = 100.0;

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// One subject's marks for a student in a term.
///
/// Stored scores come from older form inputs and may hold numeric strings,
/// blanks or garbage; every numeric field reads leniently and falls back to 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    #[serde(default, alias = "testScore", deserialize_with = "lenient_f64")]
    pub test: f64,
    #[serde(default, alias = "examScore", deserialize_with = "lenient_f64")]
    pub exam: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub total: f64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub grade: String,
}

impl ScoreEntry {
    /// Builds a graded entry. `test + exam` above 100 is an input error.
    pub fn graded(test: f64, exam: f64, bands: &[GradingBand]) -> Result<Self, CalcError> {
        let total = test + exam;
        if total > MAX_SUBJECT_SCORE {
            return Err(CalcError::new(
                "bad_params",
                format!("test + exam must not exceed 100 (got {})", total),
            )
            .with_details(serde_json::json!({ "test": test, "exam": exam })));
        }
        Ok(Self {
            test,
            exam,
            total,
            grade: resolve_grade(total, bands).grade,
        })
    }
}

/// A student's results for one term. `grand_total`, `average` and `position`
/// are derived by `aggregate` and `rank`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentResult {
    pub id: String,
    pub student_id: String,
    pub class_name: String,
    pub term: String,
    #[serde(default)]
    pub scores: BTreeMap<String, ScoreEntry>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub grand_total: f64,
    #[serde(default = "zero_average", deserialize_with = "lenient_average")]
    pub average: String,
    #[serde(default)]
    pub position: String,
}

impl StudentResult {
    pub fn new(id: String, student_id: String, class_name: String, term: String) -> Self {
        Self {
            id,
            student_id,
            class_name,
            term,
            scores: BTreeMap::new(),
            grand_total: 0.0,
            average: zero_average(),
            position: String::new(),
        }
    }
}

fn zero_average() -> String {
    format_average(0.0)
}

/// Reads a JSON number or a numeric string prefix; anything else is 0.
pub fn coerce_number(v: &Value) -> f64 {
    let n = match v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => parse_leading_float(s).unwrap_or(0.0),
        _ => 0.0,
    };
    if n.is_finite() {
        n
    } else {
        0.0
    }
}

/// Parses the longest `[+-]digits[.digits][e[+-]digits]` prefix, ignoring
/// leading whitespace.
fn parse_leading_float(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }
    let mut seen_digit = false;
    let mut seen_dot = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => seen_digit = true,
            b'.' if !seen_dot => seen_dot = true,
            _ => break,
        }
        end += 1;
    }
    if !seen_digit {
        return None;
    }
    let mantissa_end = end;
    if matches!(bytes.get(end), Some(b'e') | Some(b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+') | Some(b'-')) {
            exp += 1;
        }
        let digits_start = exp;
        while matches!(bytes.get(exp), Some(b'0'..=b'9')) {
            exp += 1;
        }
        if exp > digits_start {
            end = exp;
        }
    }
    let text = if end == mantissa_end {
        s[..end].trim_end_matches('.')
    } else {
        &s[..end]
    };
    text.parse::<f64>().ok()
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(deserializer)?;
    Ok(v.as_ref().map(coerce_number).unwrap_or(0.0))
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(deserializer)?;
    Ok(match v {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    })
}

fn lenient_average<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(deserializer)?;
    Ok(format_average(v.as_ref().map(coerce_number).unwrap_or(0.0)))
}

/// Form input cleanup: strips everything but digits and dots, keeps the first
/// dot, and clamps to 0..=100. Unparseable input becomes 0.
pub fn sanitize_score_input(raw: &str) -> f64 {
    let mut cleaned = String::with_capacity(raw.len());
    let mut seen_dot = false;
    for c in raw.chars() {
        if c.is_ascii_digit() {
            cleaned.push(c);
        } else if c == '.' && !seen_dot {
            seen_dot = true;
            cleaned.push(c);
        }
    }
    let score = parse_leading_float(&cleaned).unwrap_or(0.0);
    if !score.is_finite() || score < 0.0 {
        0.0
    } else {
        score.min(MAX_SUBJECT_SCORE)
    }
}

pub fn round_off_2_decimal(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn format_average(x: f64) -> String {
    format!("{:.2}", round_off_2_decimal(x))
}

/// 1 -> "1st", 2 -> "2nd", 11 -> "11th", 21 -> "21st".
pub fn ordinal(n: usize) -> String {
    let suffix = match (n % 100, n % 10) {
        (11..=13, _) => "th",
        (_, 1) => "st",
        (_, 2) => "nd",
        (_, 3) => "rd",
        _ => "th",
    };
    format!("{}{}", n, suffix)
}

/// Fills `grand_total` and `average` for every record of one class+term.
pub fn aggregate(mut results: Vec<StudentResult>) -> Vec<StudentResult> {
    for r in &mut results {
        let mut total = 0.0_f64;
        for entry in r.scores.values() {
            if entry.total.is_finite() {
                total += entry.total;
            }
        }
        // Decimal marks must not split equal totals at rank time.
        let total = round_off_2_decimal(total);
        let count = r.scores.len();
        r.grand_total = total;
        r.average = if count > 0 {
            format_average(total / (count as f64))
        } else {
            zero_average()
        };
    }
    results
}

/// Orders by grand total (highest first) and assigns positions.
///
/// Equal totals keep their input order and copy the position of the slot
/// above them; the next distinct total takes its sequential index, so
/// `[90, 90, 90, 80]` ranks as 1st, 1st, 1st, 4th.
pub fn rank(mut results: Vec<StudentResult>) -> Vec<StudentResult> {
    results.sort_by(|a, b| {
        b.grand_total
            .partial_cmp(&a.grand_total)
            .unwrap_or(Ordering::Equal)
    });
    for i in 0..results.len() {
        let position = if i > 0 && results[i].grand_total == results[i - 1].grand_total {
            results[i - 1].position.clone()
        } else {
            ordinal(i + 1)
        };
        results[i].position = position;
    }
    results
}
