// src/submit.rs
use chrono::NaiveDate;
use rand::{Rng, RngCore};
use serde::Serialize;
use tracing::{info, warn};

use crate::pms_client::{PortalApi, PortalSession};
use crate::store::WorkConfig;

/// Aggregate result of one reconciliation-and-submission run: the produced
/// interface for both the scheduled task and the manual trigger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub success_count: usize,
    pub fail_count: usize,
    pub total_count: usize,
    pub success_dates: Vec<NaiveDate>,
    pub fail_dates: Vec<NaiveDate>,
    pub message: String,
}

impl RunReport {
    /// The short-circuit outcome when reconciliation finds nothing open.
    pub fn no_outstanding() -> Self {
        Self {
            success_count: 0,
            fail_count: 0,
            total_count: 0,
            success_dates: Vec::new(),
            fail_dates: Vec::new(),
            message: "no outstanding dates, every workday in the window is already filled"
                .to_string(),
        }
    }

    /// A run that stopped before reaching the submission loop.
    pub fn aborted(message: String) -> Self {
        Self {
            success_count: 0,
            fail_count: 0,
            total_count: 0,
            success_dates: Vec::new(),
            fail_dates: Vec::new(),
            message,
        }
    }

    /// A run counts as successful when nothing was outstanding or at least
    /// one submission went through.
    pub fn is_success(&self) -> bool {
        self.total_count == 0 || self.success_count > 0
    }
}

/// Note text for a single submission. Pools with more than one entry draw
/// uniformly from the injected rng so consecutive dates don't all carry the
/// same note; tests seed the rng to pin the selection.
fn pick_description(work: &WorkConfig, pool: &[String], rng: &mut dyn RngCore) -> String {
    match pool.len() {
        0 => work.description.clone().unwrap_or_default(),
        1 => pool[0].clone(),
        n => pool[rng.gen_range(0..n)].clone(),
    }
}

/// Submits every outstanding date, one call per date.
///
/// Sequential on purpose: the portal session is stateful and the API does
/// not tolerate bursts. A failed date (usually "already filled") is
/// recorded and the loop continues — one bad day must not starve the rest
/// of the batch. No date is retried within the same run; the next cycle
/// picks up whatever is still open.
pub async fn submit_all(
    portal: &dyn PortalApi,
    session: &PortalSession,
    work: &WorkConfig,
    descriptions: &[String],
    outstanding: &[NaiveDate],
    rng: &mut (dyn RngCore + Send),
) -> RunReport {
    let mut success_dates = Vec::new();
    let mut fail_dates = Vec::new();

    for date in outstanding {
        let description = pick_description(work, descriptions, rng);
        match portal.save_timesheet(session, *date, work, &description).await {
            Ok(()) => {
                info!("filled {} with {} hours", date, work.hours);
                success_dates.push(*date);
            }
            Err(e) => {
                warn!("submission for {} failed: {}", date, e);
                fail_dates.push(*date);
            }
        }
    }

    // `outstanding` is most recent first, so first/last bound the range.
    let message = match (outstanding.first(), outstanding.last()) {
        (Some(newest), Some(oldest)) => format!(
            "filled {}/{} outstanding workdays between {} and {}",
            success_dates.len(),
            outstanding.len(),
            oldest,
            newest
        ),
        _ => "no outstanding dates, every workday in the window is already filled".to_string(),
    };

    RunReport {
        success_count: success_dates.len(),
        fail_count: fail_dates.len(),
        total_count: outstanding.len(),
        success_dates,
        fail_dates,
        message,
    }
}
