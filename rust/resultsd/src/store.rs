use anyhow::anyhow;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::calc::{self, CalcError, ScoreEntry, StudentResult};
use crate::db;

/// The derived columns a recompute writes back for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedFields {
    pub grand_total: f64,
    pub average: String,
    pub position: String,
}

impl From<&StudentResult> for DerivedFields {
    fn from(r: &StudentResult) -> Self {
        Self {
            grand_total: r.grand_total,
            average: r.average.clone(),
            position: r.position.clone(),
        }
    }
}

/// Where the ranking engine reads a class+term from and writes positions to.
pub trait ResultStore {
    /// All records for the class+term, in the order they were created.
    fn load_class_term(&self, class_name: &str, term: &str) -> anyhow::Result<Vec<StudentResult>>;

    /// Updates grand total, average and position of one record. Scores and
    /// identity fields are left alone.
    fn write_derived(&mut self, result_id: &str, derived: &DerivedFields) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFailure {
    pub result_id: String,
    pub student_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeSummary {
    pub results: Vec<StudentResult>,
    pub failures: Vec<WriteFailure>,
}

/// Aggregates and ranks one class+term, then writes every record back.
///
/// A rejected write is collected in `failures` and the remaining records are
/// still written.
pub fn recompute_class_term<S: ResultStore + ?Sized>(
    store: &mut S,
    class_name: &str,
    term: &str,
) -> Result<RecomputeSummary, CalcError> {
    let records = store
        .load_class_term(class_name, term)
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    if records.is_empty() {
        return Ok(RecomputeSummary::default());
    }

    let ranked = calc::rank(calc::aggregate(records));
    let mut failures = Vec::new();
    for r in &ranked {
        if let Err(e) = store.write_derived(&r.id, &DerivedFields::from(r)) {
            warn!(result_id = %r.id, error = %e, "failed to write derived result fields");
            failures.push(WriteFailure {
                result_id: r.id.clone(),
                student_id: r.student_id.clone(),
                message: e.to_string(),
            });
        }
    }

    info!(
        class = class_name,
        term,
        ranked = ranked.len(),
        failed = failures.len(),
        "recomputed class positions"
    );
    Ok(RecomputeSummary {
        results: ranked,
        failures,
    })
}

pub struct SqliteResultStore<'a> {
    conn: &'a Connection,
}

const RESULT_COLUMNS: &str =
    "id, student_id, class_name, term, scores_json, grand_total, average, position";

fn result_from_row(r: &Row<'_>) -> rusqlite::Result<(StudentResult, String)> {
    let scores_json: String = r.get(4)?;
    let result = StudentResult {
        id: r.get(0)?,
        student_id: r.get(1)?,
        class_name: r.get(2)?,
        term: r.get(3)?,
        scores: BTreeMap::new(),
        grand_total: r.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
        average: r
            .get::<_, Option<String>>(6)?
            .unwrap_or_else(|| calc::format_average(0.0)),
        position: r.get::<_, Option<String>>(7)?.unwrap_or_default(),
    };
    Ok((result, scores_json))
}

fn attach_scores(pair: (StudentResult, String)) -> StudentResult {
    let (mut result, scores_json) = pair;
    let raw: serde_json::Value = serde_json::from_str(&scores_json).unwrap_or_else(|e| {
        warn!(result_id = %result.id, error = %e, "unreadable scores_json; treating as empty");
        serde_json::Value::Null
    });
    if let serde_json::Value::Object(map) = raw {
        for (subject, v) in map {
            let entry = serde_json::from_value(v).unwrap_or_default();
            result.scores.insert(subject, entry);
        }
    }
    result
}

impl<'a> SqliteResultStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn find_for_student(
        &self,
        student_id: &str,
        term: &str,
    ) -> anyhow::Result<Option<StudentResult>> {
        let sql = format!(
            "SELECT {} FROM results WHERE student_id = ? AND term = ?",
            RESULT_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, (student_id, term), result_from_row)
            .optional()?;
        Ok(row.map(attach_scores))
    }

    pub fn list_for_student(&self, student_id: &str) -> anyhow::Result<Vec<StudentResult>> {
        let sql = format!(
            "SELECT {} FROM results WHERE student_id = ? ORDER BY rowid",
            RESULT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([student_id], result_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(attach_scores).collect())
    }

    /// Positions as last persisted, best first.
    pub fn list_ranked(&self, class_name: &str, term: &str) -> anyhow::Result<Vec<StudentResult>> {
        let mut rows = self.load_class_term(class_name, term)?;
        rows.sort_by(|a, b| {
            b.grand_total
                .partial_cmp(&a.grand_total)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(rows)
    }

    /// Sets one subject entry on the student's record for `term`, creating the
    /// record on first save. Returns the record id.
    pub fn upsert_subject_entry(
        &self,
        student_id: &str,
        class_name: &str,
        term: &str,
        subject: &str,
        entry: ScoreEntry,
    ) -> anyhow::Result<String> {
        let now = db::now_rfc3339();
        match self.find_for_student(student_id, term)? {
            Some(mut existing) => {
                existing.scores.insert(subject.to_string(), entry);
                self.conn.execute(
                    "UPDATE results SET scores_json = ?, updated_at = ? WHERE id = ?",
                    (serde_json::to_string(&existing.scores)?, &now, &existing.id),
                )?;
                Ok(existing.id)
            }
            None => {
                let mut created = StudentResult::new(
                    Uuid::new_v4().to_string(),
                    student_id.to_string(),
                    class_name.to_string(),
                    term.to_string(),
                );
                created.scores.insert(subject.to_string(), entry);
                self.conn.execute(
                    "INSERT INTO results(id, student_id, class_name, term, scores_json, updated_at)
                     VALUES(?, ?, ?, ?, ?, ?)",
                    (
                        &created.id,
                        &created.student_id,
                        &created.class_name,
                        &created.term,
                        serde_json::to_string(&created.scores)?,
                        &now,
                    ),
                )?;
                Ok(created.id)
            }
        }
    }
}

impl ResultStore for SqliteResultStore<'_> {
    fn load_class_term(&self, class_name: &str, term: &str) -> anyhow::Result<Vec<StudentResult>> {
        let sql = format!(
            "SELECT {} FROM results WHERE class_name = ? AND term = ? ORDER BY rowid",
            RESULT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map((class_name, term), result_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(attach_scores).collect())
    }

    fn write_derived(&mut self, result_id: &str, derived: &DerivedFields) -> anyhow::Result<()> {
        let changed = self.conn.execute(
            "UPDATE results SET grand_total = ?, average = ?, position = ? WHERE id = ?",
            (
                derived.grand_total,
                &derived.average,
                &derived.position,
                result_id,
            ),
        )?;
        if changed == 0 {
            return Err(anyhow!("result not found: {}", result_id));
        }
        Ok(())
    }
}
