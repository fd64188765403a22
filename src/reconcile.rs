// src/reconcile.rs
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::HashSet;

use crate::pms_client::TimesheetRecord;

/// Dates the portal already records with non-zero hours for the configured
/// (project, task) pair.
///
/// Matching is best-effort: a record that names both ids must match both;
/// a record with no breakdown at all counts regardless of task, because
/// some portal variants return global fill-state only. Derived fresh from
/// a remote read each run — this set is never cached.
pub fn filled_dates(
    records: &[TimesheetRecord],
    project_id: i64,
    task_id: i64,
) -> HashSet<NaiveDate> {
    let mut filled = HashSet::new();
    for record in records {
        if record.hours <= Decimal::ZERO {
            continue;
        }
        let matches = match (record.project_id, record.task_id) {
            (Some(p), Some(t)) => p == project_id && t == task_id,
            (Some(p), None) => p == project_id,
            (None, Some(t)) => t == task_id,
            (None, None) => true,
        };
        if matches {
            filled.insert(record.date);
        }
    }
    filled
}

/// The dates still needing submission: `window` minus `filled`, window
/// order preserved. Pure; an empty result is the pipeline's short-circuit
/// success, not an error.
pub fn reconcile(window: &[NaiveDate], filled: &HashSet<NaiveDate>) -> Vec<NaiveDate> {
    window
        .iter()
        .copied()
        .filter(|date| !filled.contains(date))
        .collect()
}
