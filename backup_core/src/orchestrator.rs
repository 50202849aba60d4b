//! Per-configuration orchestration: connectivity, database pairing, catalog
//! resolution, job fan-out and the incremental schedule loop.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::Utc;
use snafu::{ResultExt, Snafu};
use tokio::sync::mpsc;
use tracing::{info, warn};

use backup_config::{to_nanos, BackupConfig};

use crate::catalog::{self, CatalogPlan};
use crate::influx::{ClientError, InfluxDb};
use crate::job::{FieldBackupJob, JobOutcome};
use crate::pool::WorkerPool;
use crate::report::Report;
use crate::shutdown::ShutdownFlag;
use crate::window::span_nanos;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "{} endpoint {} unreachable after {} attempts: {}",
        role,
        url,
        attempts,
        source
    ))]
    Unreachable {
        role: String,
        url: String,
        attempts: usize,
        source: ClientError,
    },

    #[snafu(display("configuration error: {}", source))]
    Config { source: backup_config::Error },

    #[snafu(display("error listing source databases: {}", source))]
    ListDatabases { source: ClientError },

    #[snafu(display("error creating destination database {}: {}", database, source))]
    EnsureDatabase {
        database: String,
        source: ClientError,
    },

    #[snafu(display("error resolving field catalog for {}: {}", database, source))]
    Catalog {
        database: String,
        source: catalog::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether this failure means an endpoint never became reachable.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

/// The resolved work for one database pair.
#[derive(Debug)]
pub struct DatabasePlan {
    pub source_db: String,
    pub destination_db: String,
    pub catalog: CatalogPlan,
}

/// Runs one configuration against one source and one destination endpoint.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<BackupConfig>,
    source: Arc<dyn InfluxDb>,
    destination: Arc<dyn InfluxDb>,
    shutdown: ShutdownFlag,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        config: BackupConfig,
        source: Arc<dyn InfluxDb>,
        destination: Arc<dyn InfluxDb>,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            config: Arc::new(config),
            source,
            destination,
            shutdown,
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Waits for both endpoints to answer a ping. Boot-order races with a
    /// sidecar InfluxDB are the normal case here, so failures back off by
    /// `initial_connection_retry_delay` until the attempt budget runs out.
    pub async fn connect(&self) -> Result<()> {
        self.wait_for_endpoint("source", self.source.as_ref(), &self.config.source.url)
            .await?;
        self.wait_for_endpoint(
            "destination",
            self.destination.as_ref(),
            &self.config.destination.url,
        )
        .await
    }

    async fn wait_for_endpoint(
        &self,
        role: &str,
        client: &dyn InfluxDb,
        url: &str,
    ) -> Result<()> {
        let budget = self.config.options.retries.max(1);
        let delay = self.config.options.initial_connection_retry_delay();
        let mut attempt = 1;
        loop {
            match client.ping().await {
                Ok(()) => {
                    info!(config = %self.config.name, role, url, "endpoint reachable");
                    return Ok(());
                }
                Err(error) if attempt < budget && !self.shutdown.is_set() => {
                    warn!(
                        config = %self.config.name,
                        role,
                        url,
                        attempt,
                        error = %error,
                        "endpoint not reachable yet, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(Error::Unreachable {
                        role: role.to_string(),
                        url: url.to_string(),
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    /// Resolves the database pairs to process: the configured list, or every
    /// source database decorated with the configured prefix/suffix.
    async fn database_pairs(&self) -> Result<Vec<(String, String)>> {
        if self.config.source.databases.is_empty() {
            let databases = self
                .source
                .list_databases()
                .await
                .context(ListDatabasesSnafu)?;
            Ok(databases
                .into_iter()
                .map(|db| {
                    let destination = self.config.destination_name(&db);
                    (db, destination)
                })
                .collect())
        } else {
            Ok(self
                .config
                .source
                .databases
                .iter()
                .map(|pair| {
                    let destination = pair
                        .destination
                        .clone()
                        .filter(|name| !name.is_empty())
                        .unwrap_or_else(|| self.config.destination_name(&pair.name));
                    (pair.name.clone(), destination)
                })
                .collect())
        }
    }

    /// Creates destination databases and resolves the catalog per pair.
    pub async fn plan(&self, now_ns: i64) -> Result<Vec<DatabasePlan>> {
        let mut plans = Vec::new();
        for (source_db, destination_db) in self.database_pairs().await? {
            self.destination
                .ensure_database(&destination_db)
                .await
                .context(EnsureDatabaseSnafu {
                    database: destination_db.clone(),
                })?;
            let catalog = catalog::resolve(self.source.as_ref(), &self.config, &source_db, now_ns)
                .await
                .context(CatalogSnafu {
                    database: source_db.clone(),
                })?;
            info!(
                config = %self.config.name,
                source_db = %source_db,
                destination_db = %destination_db,
                fields = catalog.fields.len(),
                obsolete = catalog.obsolete.len(),
                "catalog resolved"
            );
            plans.push(DatabasePlan {
                source_db,
                destination_db,
                catalog,
            });
        }
        Ok(plans)
    }

    /// One full pass over every configured pair.
    pub async fn run_once(&self) -> Result<Report> {
        let now_ns = now_nanos();
        let plans = self.plan(now_ns).await?;
        let mode = self.config.mode().context(ConfigSnafu)?;
        let span_ns = span_nanos(self.config.options.days_of_pagination);
        let group_by = self.config.group_by().map(str::to_string);

        let mut jobs = Vec::new();
        let mut pre_skipped = Vec::new();
        for plan in plans {
            for field in plan.catalog.fields {
                jobs.push(FieldBackupJob {
                    field,
                    destination_db: plan.destination_db.clone(),
                    mode,
                    now_ns,
                    span_ns,
                    batch_size: self.config.options.batch_size,
                    group_by: group_by.clone(),
                });
            }
            for field in plan.catalog.obsolete {
                pre_skipped.push(JobOutcome::skipped(field));
            }
        }

        let run = WorkerPool::new(self.config.options.parallel_workers)
            .run(
                &self.config.name,
                jobs,
                Arc::clone(&self.source),
                Arc::clone(&self.destination),
                self.shutdown.clone(),
            )
            .await;
        let report = Report::new(&self.config.name, pre_skipped, run);
        report.log_summary();
        Ok(report)
    }

    /// Runs the configuration: once, or on its cron schedule until shutdown.
    pub async fn run(&self) -> Result<Report> {
        self.connect().await?;
        match self.config.schedule().context(ConfigSnafu)? {
            None => self.run_once().await,
            Some(schedule) => self.run_scheduled(schedule).await,
        }
    }

    /// The schedule loop. A single `running` flag guards against overlapping
    /// ticks: a tick that fires while the previous run is still going is
    /// skipped with a warning, so no field can ever have two workers.
    async fn run_scheduled(&self, schedule: cron::Schedule) -> Result<Report> {
        let running = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::unbounded_channel::<Result<Report>>();
        let mut last: Option<Result<Report>> = None;

        while !self.shutdown.is_set() {
            let now = Utc::now();
            let next = match schedule.after(&now).next() {
                Some(next) => next,
                None => break,
            };
            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if !begin_tick(&running) {
                        warn!(
                            config = %self.config.name,
                            "previous run still in progress, skipping this tick"
                        );
                        continue;
                    }
                    info!(config = %self.config.name, "scheduled run starting");
                    let orchestrator = self.clone();
                    let running = Arc::clone(&running);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let report = orchestrator.run_once().await;
                        // send before clearing the flag so the drain below
                        // always observes the report of a finished run
                        let _ = tx.send(report);
                        running.store(false, Ordering::SeqCst);
                    });
                }
                report = rx.recv() => {
                    if let Some(report) = report {
                        last = Some(report);
                    }
                }
                _ = self.shutdown.wait() => break,
            }
        }

        // let an in-flight run drain its current batches before returning
        if running.load(Ordering::SeqCst) {
            info!(config = %self.config.name, "waiting for the in-flight run to drain");
            if let Some(report) = rx.recv().await {
                last = Some(report);
            }
        }
        while let Ok(report) = rx.try_recv() {
            last = Some(report);
        }

        match last {
            Some(result) => result,
            None => Ok(Report::empty(&self.config.name)),
        }
    }
}

/// Tick admission: true when no run is in flight, atomically claiming the
/// slot for this tick.
fn begin_tick(running: &AtomicBool) -> bool {
    !running.swap(true, Ordering::SeqCst)
}

fn now_nanos() -> i64 {
    to_nanos(&Utc::now()).unwrap_or(i64::MAX)
}
