//! Bounded parallel execution of field jobs.
//!
//! A fixed set of workers pulls jobs off a shared queue, so at most
//! `parallel_workers` fields are in flight and a given field is only ever
//! touched by one worker. Outcomes stream back over a channel as they
//! complete and are logged immediately.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn, Instrument};

use crate::influx::InfluxDb;
use crate::job::{FieldBackupJob, JobOutcome, JobStatus};
use crate::shutdown::ShutdownFlag;

/// Parallel efficiency below this is reported as a warning: the pool spent
/// more than half of its worker-seconds idle.
const EFFICIENCY_WARN_PCT: f64 = 50.0;

/// What one pool run produced, plus its utilisation metrics.
#[derive(Debug)]
pub struct PoolRun {
    pub outcomes: Vec<JobOutcome>,
    pub wall: Duration,
    pub workers: usize,
    /// `(Σ per-job wall) / (run wall × workers)`, as a percentage.
    pub efficiency_pct: f64,
    pub mean_job_wall: Duration,
}

/// A bounded pool of backup workers.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Runs every job to completion and returns the outcomes in completion
    /// order.
    pub async fn run(
        &self,
        config_name: &str,
        jobs: Vec<FieldBackupJob>,
        source: Arc<dyn InfluxDb>,
        destination: Arc<dyn InfluxDb>,
        shutdown: ShutdownFlag,
    ) -> PoolRun {
        let started = Instant::now();
        let workers = self.workers.min(jobs.len().max(1));
        let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));
        let (tx, mut rx) = mpsc::unbounded_channel::<JobOutcome>();

        let mut handles = Vec::with_capacity(workers);
        for slot in 0..workers {
            let tag = format!("T{:02}", slot + 1);
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let source = source.clone();
            let destination = destination.clone();
            let shutdown = shutdown.clone();
            let span = info_span!("worker", config = %config_name, worker = %tag);
            handles.push(tokio::spawn(
                async move {
                    loop {
                        let job = queue.lock().pop_front();
                        let job = match job {
                            Some(job) => job,
                            None => break,
                        };
                        let outcome = job
                            .run(
                                source.clone(),
                                destination.clone(),
                                shutdown.clone(),
                            )
                            .await;
                        if tx.send(outcome).is_err() {
                            break;
                        }
                    }
                }
                .instrument(span),
            ));
        }
        drop(tx);

        let mut outcomes = Vec::new();
        while let Some(outcome) = rx.recv().await {
            match outcome.status {
                JobStatus::Success => info!(
                    config = %config_name,
                    field = %outcome.field,
                    records = outcome.records_written,
                    partial = outcome.partial,
                    "job finished"
                ),
                JobStatus::Skipped => info!(
                    config = %config_name,
                    field = %outcome.field,
                    "job skipped"
                ),
                JobStatus::Failed => warn!(
                    config = %config_name,
                    field = %outcome.field,
                    error = outcome.error.as_deref().unwrap_or(""),
                    "job failed"
                ),
            }
            outcomes.push(outcome);
        }
        for handle in handles {
            if let Err(join_error) = handle.await {
                error!(config = %config_name, error = %join_error, "worker task died");
            }
        }

        let wall = started.elapsed();
        let busy: Duration = outcomes.iter().map(|o| o.duration).sum();
        let capacity = wall.as_secs_f64() * workers as f64;
        let efficiency_pct = if capacity > 0.0 {
            (busy.as_secs_f64() / capacity) * 100.0
        } else {
            100.0
        };
        if efficiency_pct < EFFICIENCY_WARN_PCT && outcomes.len() > workers {
            warn!(
                config = %config_name,
                efficiency = %format!("{:.0}%", efficiency_pct),
                workers,
                "low parallel efficiency"
            );
        }
        let mean_job_wall = if outcomes.is_empty() {
            Duration::ZERO
        } else {
            busy / outcomes.len() as u32
        };

        PoolRun {
            outcomes,
            wall,
            workers,
            efficiency_pct,
            mean_job_wall,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FieldRef;
    use crate::mock::MockInflux;
    use backup_config::BackupMode;
    use influxdb1_client::{FieldType, Point, ScalarValue};

    const DAY: i64 = 86_400_000_000_000;

    fn seeded_job(source: &MockInflux, field_name: &str, timestamps: &[i64]) -> FieldBackupJob {
        let points = timestamps
            .iter()
            .map(|ts| Point {
                timestamp: *ts,
                tags: Default::default(),
                field: field_name.to_string(),
                value: ScalarValue::Float(1.0),
            })
            .collect();
        source.add_points("db", "weather", field_name, points);
        FieldBackupJob {
            field: FieldRef {
                database: "db".to_string(),
                measurement: "weather".to_string(),
                field: field_name.to_string(),
                field_type: FieldType::Float,
            },
            destination_db: "db_bak".to_string(),
            mode: BackupMode::Incremental,
            now_ns: DAY,
            span_ns: 7 * DAY,
            batch_size: 5_000,
            group_by: None,
        }
    }

    #[tokio::test]
    async fn all_jobs_complete_even_with_fewer_workers() {
        let source = Arc::new(MockInflux::new());
        let destination = Arc::new(MockInflux::new());
        let jobs: Vec<_> = (0..8)
            .map(|i| seeded_job(&source, &format!("f{}", i), &[100 + i, 200 + i]))
            .collect();

        let run = WorkerPool::new(2)
            .run(
                "test",
                jobs,
                source.clone(),
                destination.clone(),
                ShutdownFlag::new(),
            )
            .await;

        assert_eq!(run.workers, 2);
        assert_eq!(run.outcomes.len(), 8);
        assert!(run.outcomes.iter().all(|o| o.status == JobStatus::Success));
        assert_eq!(destination.written("db_bak", "weather").len(), 16);
    }

    #[tokio::test]
    async fn one_failing_field_does_not_poison_the_rest() {
        let source = Arc::new(MockInflux::new());
        let destination = Arc::new(MockInflux::new());
        let jobs = vec![
            seeded_job(&source, "bad", &[100]),
            seeded_job(&source, "good", &[100, 200]),
        ];
        destination.fail_writes_of_field("bad");

        let run = WorkerPool::new(2)
            .run(
                "test",
                jobs,
                source.clone(),
                destination.clone(),
                ShutdownFlag::new(),
            )
            .await;

        assert_eq!(run.outcomes.len(), 2);
        let by_field = |name: &str| {
            run.outcomes
                .iter()
                .find(|o| o.field.field == name)
                .unwrap()
        };
        assert_eq!(by_field("bad").status, JobStatus::Failed);
        assert_eq!(by_field("good").status, JobStatus::Success);
        assert_eq!(by_field("good").records_written, 2);
    }

    #[tokio::test]
    async fn pool_of_more_workers_than_jobs_shrinks() {
        let source = Arc::new(MockInflux::new());
        let destination = Arc::new(MockInflux::new());
        let jobs = vec![seeded_job(&source, "only", &[100])];

        let run = WorkerPool::new(8)
            .run(
                "test",
                jobs,
                source.clone(),
                destination.clone(),
                ShutdownFlag::new(),
            )
            .await;
        assert_eq!(run.workers, 1);
        assert_eq!(run.outcomes.len(), 1);
    }

    #[tokio::test]
    async fn empty_job_list_returns_an_empty_run() {
        let source = Arc::new(MockInflux::new());
        let destination = Arc::new(MockInflux::new());
        let run = WorkerPool::new(4)
            .run(
                "test",
                Vec::new(),
                source.clone(),
                destination.clone(),
                ShutdownFlag::new(),
            )
            .await;
        assert!(run.outcomes.is_empty());
        assert_eq!(run.mean_job_wall, Duration::ZERO);
    }
}
