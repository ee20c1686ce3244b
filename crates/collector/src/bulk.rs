use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hometax_auth::Session;
use hometax_contracts::{DateRange, ReportCategory, ReportQuery, group_rows_by_period};
use serde::Serialize;
use serde_json::Value;
use ulid::Ulid;

use crate::pacing::PacingController;
use crate::reports::{ReportResult, collect};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkPlan {
    pub targets: Vec<String>,
    pub categories: Vec<ReportCategory>,
    pub range: DateRange,
}

impl BulkPlan {
    pub fn queries(&self) -> impl Iterator<Item = ReportQuery> + '_ {
        self.targets.iter().flat_map(move |target| {
            self.categories
                .iter()
                .map(move |category| ReportQuery::new(*category, target.clone(), self.range))
        })
    }

    pub fn len(&self) -> usize {
        self.targets.len() * self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkFailure {
    pub category: ReportCategory,
    pub target_id: String,
    pub range: String,
    pub code: String,
    pub description: String,
}

#[derive(Debug)]
pub struct BulkOutcome {
    pub run_id: String,
    pub successes: Vec<ReportResult>,
    pub failures: Vec<BulkFailure>,
    /// Successful rows per category, regrouped by filing period.
    pub periods: BTreeMap<ReportCategory, BTreeMap<String, Vec<Value>>>,
    /// True when a stop was requested before every query ran.
    pub stopped_early: bool,
}

impl BulkOutcome {
    pub fn total_rows(&self) -> usize {
        self.successes.iter().map(ReportResult::row_count).sum()
    }
}

/// Runs every target × category query of a plan in sequence. A failed query
/// is recorded and the run moves on.
#[derive(Clone)]
pub struct BulkRunner {
    pacing: PacingController,
    stop: Arc<AtomicBool>,
}

impl BulkRunner {
    pub fn new(pacing: PacingController) -> Self {
        Self {
            pacing,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the flag stops the run before its next query; an in-flight
    /// query is not interrupted.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub async fn run(&self, session: &Session, plan: &BulkPlan) -> BulkOutcome {
        let run_id = Ulid::new().to_string();
        if plan.is_empty() {
            tracing::warn!(run_id = %run_id, "collector.bulk_empty_plan");
        }
        tracing::info!(
            run_id = %run_id,
            queries = plan.len(),
            range = %plan.range,
            "collector.bulk_started"
        );

        let mut outcome = BulkOutcome {
            run_id,
            successes: Vec::new(),
            failures: Vec::new(),
            periods: BTreeMap::new(),
            stopped_early: false,
        };

        for query in plan.queries() {
            if self.stop.load(Ordering::SeqCst) {
                outcome.stopped_early = true;
                break;
            }

            let result = collect(session, &self.pacing, query).await;
            match &result.error {
                None => {
                    let groups = outcome.periods.entry(result.query.category).or_default();
                    for (period, rows) in group_rows_by_period(&result.rows) {
                        groups.entry(period).or_default().extend(rows);
                    }
                    outcome.successes.push(result);
                }
                Some(err) => {
                    outcome.failures.push(BulkFailure {
                        category: result.query.category,
                        target_id: result.query.target_id.clone(),
                        range: result.query.range.to_string(),
                        code: err.code().to_string(),
                        description: result.describe_failure().unwrap_or_default(),
                    });
                }
            }
        }

        tracing::info!(
            run_id = %outcome.run_id,
            successes = outcome.successes.len(),
            failures = outcome.failures.len(),
            rows = outcome.total_rows(),
            stopped_early = outcome.stopped_early,
            "collector.bulk_finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_expands_targets_then_categories() {
        let plan = BulkPlan {
            targets: vec!["A".to_string(), "B".to_string()],
            categories: vec![ReportCategory::Vat, ReportCategory::Withholding],
            range: DateRange::month(2025, 6).expect("valid month"),
        };
        let queries = plan.queries().collect::<Vec<_>>();
        assert_eq!(plan.len(), 4);
        assert_eq!(queries.len(), 4);
        assert_eq!(queries[0].target_id, "A");
        assert_eq!(queries[1].category, ReportCategory::Withholding);
        assert_eq!(queries[2].target_id, "B");
        assert!(queries.iter().all(|q| q.page == 1));
    }

    #[test]
    fn plan_without_targets_is_empty() {
        let plan = BulkPlan {
            targets: Vec::new(),
            categories: ReportCategory::ALL.to_vec(),
            range: DateRange::month(2025, 6).expect("valid month"),
        };
        assert!(plan.is_empty());
        assert_eq!(plan.queries().count(), 0);
    }
}
