//! Per-run statistics and tune-time classification

use crate::constants::{FAST_THRESHOLD_MS, MEDIUM_THRESHOLD_MS};
use crate::store::{CellOutcome, ResultsTable, RunColumn};

/// Colour class of a single time cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuneClass {
    Fast,
    Medium,
    Slow,
    Failed,
}

impl TuneClass {
    pub fn css_class(&self) -> &'static str {
        match self {
            TuneClass::Fast => "fast",
            TuneClass::Medium => "medium",
            TuneClass::Slow => "slow",
            TuneClass::Failed => "fail",
        }
    }
}

/// Classifies a recorded outcome. Pure; used by both renderers.
pub fn classify(outcome: &CellOutcome) -> TuneClass {
    match outcome.elapsed_ms() {
        Some(ms) => classify_ms(ms as f64),
        None => TuneClass::Failed,
    }
}

pub fn classify_ms(ms: f64) -> TuneClass {
    if ms < FAST_THRESHOLD_MS as f64 {
        TuneClass::Fast
    } else if ms < MEDIUM_THRESHOLD_MS as f64 {
        TuneClass::Medium
    } else {
        TuneClass::Slow
    }
}

/// Aggregates for one run column
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub label: String,
    /// Mean over tuned channels only
    pub average_ms: Option<f64>,
    pub tuned: usize,
    pub failed: usize,
}

impl RunSummary {
    fn from_run(run: &RunColumn) -> Self {
        let mut total = 0u64;
        let (mut tuned, mut failed) = (0, 0);
        for (_, cell) in run.cells() {
            match cell.outcome.elapsed_ms() {
                Some(ms) => {
                    total += ms;
                    tuned += 1;
                }
                None => failed += 1,
            }
        }
        Self {
            label: run.label.clone(),
            average_ms: (tuned > 0).then(|| total as f64 / tuned as f64),
            tuned,
            failed,
        }
    }

    /// First line of the label
    pub fn name(&self) -> &str {
        run_name(&self.label)
    }

    pub fn class(&self) -> TuneClass {
        self.average_ms.map(classify_ms).unwrap_or(TuneClass::Failed)
    }
}

/// Summaries for every run in a table, in column order
pub struct StatsManager {
    summaries: Vec<RunSummary>,
}

impl StatsManager {
    pub fn from_table(table: &ResultsTable) -> Self {
        Self {
            summaries: table.runs().iter().map(RunSummary::from_run).collect(),
        }
    }

    pub fn get(&self, label: &str) -> Option<&RunSummary> {
        self.summaries.iter().find(|s| s.label == label)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RunSummary> {
        self.summaries.iter()
    }

    /// Fastest average first; runs without a single tuned channel last
    pub fn ranked(&self) -> Vec<&RunSummary> {
        let mut ranked: Vec<&RunSummary> = self.summaries.iter().collect();
        ranked.sort_by(|a, b| match (a.average_ms, b.average_ms) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        ranked
    }
}

/// Splits `"name\ndate"` run labels.
pub fn split_label(label: &str) -> (&str, &str) {
    label.split_once('\n').unwrap_or((label, ""))
}

pub fn run_name(label: &str) -> &str {
    split_label(label).0
}
