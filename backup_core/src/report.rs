//! Per-configuration run reports.

use std::time::Duration;

use comfy_table::Table;
use tracing::{info, warn};

use crate::job::{JobOutcome, JobStatus};
use crate::pool::PoolRun;

/// A comfy_table style that uses single ASCII lines for all borders with plusses at intersections.
const TABLE_STYLE_SINGLE_LINE_BORDERS: &str = "||--+-++|    ++++++";

/// The final word on one configuration run.
#[derive(Debug)]
pub struct Report {
    pub config_name: String,
    pub outcomes: Vec<JobOutcome>,
    pub wall_time: Duration,
    pub workers: usize,
    pub efficiency_pct: f64,
    pub mean_job_wall: Duration,
}

impl Report {
    /// Builds the report from a pool run plus the outcomes that never
    /// reached the pool (obsolete fields, empty ranges).
    pub fn new(config_name: &str, pre_skipped: Vec<JobOutcome>, run: PoolRun) -> Self {
        let mut outcomes = pre_skipped;
        outcomes.extend(run.outcomes);
        Self {
            config_name: config_name.to_string(),
            outcomes,
            wall_time: run.wall,
            workers: run.workers,
            efficiency_pct: run.efficiency_pct,
            mean_job_wall: run.mean_job_wall,
        }
    }

    /// A report for a run that never got to start any job.
    pub fn empty(config_name: &str) -> Self {
        Self {
            config_name: config_name.to_string(),
            outcomes: Vec::new(),
            wall_time: Duration::ZERO,
            workers: 0,
            efficiency_pct: 100.0,
            mean_job_wall: Duration::ZERO,
        }
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn has_failures(&self) -> bool {
        self.count(JobStatus::Failed) > 0
    }

    pub fn records_written(&self) -> u64 {
        self.outcomes.iter().map(|o| o.records_written).sum()
    }

    /// One log record per run, with the headline numbers.
    pub fn log_summary(&self) {
        info!(
            config = %self.config_name,
            succeeded = self.count(JobStatus::Success),
            skipped = self.count(JobStatus::Skipped),
            failed = self.count(JobStatus::Failed),
            records = self.records_written(),
            wall = %humantime::format_duration(round_to_millis(self.wall_time)),
            workers = self.workers,
            efficiency = %format!("{:.0}%", self.efficiency_pct),
            "backup run finished"
        );
        if self.has_failures() {
            warn!(
                config = %self.config_name,
                failed = self.count(JobStatus::Failed),
                "some fields failed; their watermarks are unchanged and the next run will retry"
            );
        }
    }

    /// Renders the per-field outcomes as a bordered table for the CLI.
    pub fn to_table(&self) -> Table {
        let mut table = Table::new();
        table.load_preset(TABLE_STYLE_SINGLE_LINE_BORDERS);
        table.set_header(vec![
            "Measurement",
            "Field",
            "Status",
            "Read",
            "Written",
            "Attempts",
            "Duration",
            "Error",
        ]);
        for outcome in &self.outcomes {
            let status = match (outcome.status, outcome.partial) {
                (JobStatus::Success, true) => "Success (partial)".to_string(),
                (status, _) => format!("{:?}", status),
            };
            table.add_row(vec![
                outcome.field.measurement.clone(),
                outcome.field.field.clone(),
                status,
                outcome.records_read.to_string(),
                outcome.records_written.to_string(),
                outcome.attempts.to_string(),
                humantime::format_duration(round_to_millis(outcome.duration)).to_string(),
                outcome.error.clone().unwrap_or_default(),
            ]);
        }
        table
    }
}

fn round_to_millis(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}
