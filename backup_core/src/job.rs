//! The per-field backup job.
//!
//! One job owns one `(measurement, field)` pair end to end: it resolves its
//! resume point from the destination, walks the remaining range window by
//! window, streams each window from the source and writes it to the
//! destination in batches. Nothing is shared with sibling jobs beyond the
//! two clients, so a failing field never poisons its neighbours.

use std::sync::Arc;
use std::time::{Duration, Instant};

use snafu::{ResultExt, Snafu};
use tracing::{debug, info, warn};

use backup_config::BackupMode;
use influxdb1_client::Point;

use crate::catalog::FieldRef;
use crate::influx::{ClientError, InfluxDb};
use crate::shutdown::ShutdownFlag;
use crate::watermark::resolve_resume;
use crate::window::{TimeWindow, Windows};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("error resolving resume point: {}", source))]
    Resolve { source: ClientError },

    #[snafu(display("error querying window [{}, {}): {}", start, end, source))]
    Query {
        start: i64,
        end: i64,
        source: ClientError,
    },

    #[snafu(display("error writing batch to destination: {}", source))]
    Write { source: ClientError },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Terminal state of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Success,
    Skipped,
    Failed,
}

/// What one job did, reported to the orchestrator.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub field: FieldRef,
    pub status: JobStatus,
    pub records_read: u64,
    pub records_written: u64,
    /// Total write attempts, including the client's internal retries.
    pub attempts: u64,
    pub duration: Duration,
    /// Set when the job stopped at a cancellation point before draining all
    /// of its windows.
    pub partial: bool,
    pub error: Option<String>,
}

impl JobOutcome {
    /// An outcome for a field that was never started (obsolete or empty
    /// range).
    pub fn skipped(field: FieldRef) -> Self {
        Self {
            field,
            status: JobStatus::Skipped,
            records_read: 0,
            records_written: 0,
            attempts: 0,
            duration: Duration::ZERO,
            partial: false,
            error: None,
        }
    }
}

#[derive(Debug, Default)]
struct Progress {
    records_read: u64,
    records_written: u64,
    attempts: u64,
    partial: bool,
    skipped: bool,
}

/// One unit of work for the pool.
#[derive(Debug, Clone)]
pub struct FieldBackupJob {
    pub field: FieldRef,
    pub destination_db: String,
    pub mode: BackupMode,
    /// Job end for incremental mode, stamped once per run so every field of
    /// a run shares the same upper bound.
    pub now_ns: i64,
    pub span_ns: i64,
    pub batch_size: usize,
    pub group_by: Option<String>,
}

impl FieldBackupJob {
    /// Runs the job to a terminal state. Errors become a `Failed` outcome
    /// here; they never propagate to the pool.
    pub async fn run(
        self,
        source: Arc<dyn InfluxDb>,
        destination: Arc<dyn InfluxDb>,
        shutdown: ShutdownFlag,
    ) -> JobOutcome {
        let started = Instant::now();
        let field = self.field.clone();
        let mut progress = Progress::default();

        let result = self
            .execute(source.as_ref(), destination.as_ref(), &shutdown, &mut progress)
            .await;
        let duration = started.elapsed();

        match result {
            Ok(()) if progress.skipped => {
                debug!(field = %field, "nothing to copy");
                JobOutcome {
                    field,
                    status: JobStatus::Skipped,
                    records_read: progress.records_read,
                    records_written: progress.records_written,
                    attempts: progress.attempts,
                    duration,
                    partial: false,
                    error: None,
                }
            }
            Ok(()) => {
                info!(
                    field = %field,
                    records = progress.records_written,
                    partial = progress.partial,
                    "field backup complete"
                );
                JobOutcome {
                    field,
                    status: JobStatus::Success,
                    records_read: progress.records_read,
                    records_written: progress.records_written,
                    attempts: progress.attempts,
                    duration,
                    partial: progress.partial,
                    error: None,
                }
            }
            Err(error) => {
                warn!(field = %field, error = %error, "field backup failed");
                JobOutcome {
                    field,
                    status: JobStatus::Failed,
                    records_read: progress.records_read,
                    records_written: progress.records_written,
                    attempts: progress.attempts,
                    duration,
                    partial: false,
                    error: Some(error.to_string()),
                }
            }
        }
    }

    async fn execute(
        &self,
        source: &dyn InfluxDb,
        destination: &dyn InfluxDb,
        shutdown: &ShutdownFlag,
        progress: &mut Progress,
    ) -> Result<()> {
        let resume = resolve_resume(
            source,
            destination,
            &self.field,
            &self.destination_db,
            self.mode,
        )
        .await
        .context(ResolveSnafu)?;

        let resume = match resume {
            Some(resume) => resume,
            None => {
                progress.skipped = true;
                return Ok(());
            }
        };

        let job_end = match self.mode {
            BackupMode::Incremental => self.now_ns,
            BackupMode::Range { end_ns, .. } => end_ns,
        };
        if resume.effective_start() >= job_end {
            progress.skipped = true;
            return Ok(());
        }

        let (start, exclusive) = resume.bound();
        for window in Windows::new(start, exclusive, job_end, self.span_ns) {
            if shutdown.is_set() {
                progress.partial = true;
                break;
            }
            self.copy_window(source, destination, shutdown, window, progress)
                .await?;
            debug!(field = %self.field, start = window.start, end = window.end, "window done");
        }
        Ok(())
    }

    /// Streams one window, flushing batches of at most `batch_size` points.
    /// A cancellation mid-window flushes what has already been streamed, so
    /// the next run's watermark reflects everything acknowledged by the
    /// destination.
    async fn copy_window(
        &self,
        source: &dyn InfluxDb,
        destination: &dyn InfluxDb,
        shutdown: &ShutdownFlag,
        window: TimeWindow,
        progress: &mut Progress,
    ) -> Result<()> {
        let mut chunks = source
            .query_field_window(
                &self.field.database,
                &self.field.measurement,
                &self.field.field,
                self.field.field_type,
                window,
                self.group_by.as_deref(),
            )
            .await
            .context(QuerySnafu {
                start: window.start,
                end: window.end,
            })?;

        let mut batch: Vec<Point> = Vec::with_capacity(self.batch_size);
        loop {
            if shutdown.is_set() {
                progress.partial = true;
                break;
            }
            let points = match chunks.next_batch().await.context(QuerySnafu {
                start: window.start,
                end: window.end,
            })? {
                Some(points) => points,
                None => break,
            };
            for point in points {
                progress.records_read += 1;
                batch.push(point);
                if batch.len() >= self.batch_size {
                    self.flush(destination, &mut batch, progress).await?;
                }
            }
        }
        self.flush(destination, &mut batch, progress).await?;
        Ok(())
    }

    async fn flush(
        &self,
        destination: &dyn InfluxDb,
        batch: &mut Vec<Point>,
        progress: &mut Progress,
    ) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let attempts = destination
            .write_points(&self.destination_db, &self.field.measurement, batch)
            .await
            .context(WriteSnafu)?;
        progress.attempts += attempts as u64;
        progress.records_written += batch.len() as u64;
        batch.clear();
        Ok(())
    }
}
