//! Per-field resume points.
//!
//! There is no watermark store: the destination database *is* the watermark.
//! Every job derives its own resume point at start-of-job from the
//! destination's newest non-null value of its field, so no two fields ever
//! share watermark state and a crash can never leave a stale cache behind.

use backup_config::BackupMode;
use tracing::debug;

use crate::catalog::FieldRef;
use crate::influx::{ClientResult, InfluxDb};

/// Where one field's backup resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    /// The destination already holds this field up to (and including) this
    /// timestamp; copy strictly newer rows.
    After(i64),
    /// Nothing on the destination yet; copy from this timestamp on.
    From(i64),
}

impl ResumePoint {
    /// The lower bound as `(start, exclusive)` for window construction.
    pub fn bound(&self) -> (i64, bool) {
        match self {
            Self::After(ts) => (*ts, true),
            Self::From(ts) => (*ts, false),
        }
    }

    /// The first timestamp this resume point can actually copy. Saturates at
    /// the top of the range, where an exclusive bound has nothing left.
    pub fn effective_start(&self) -> i64 {
        match self {
            Self::After(ts) => ts.saturating_add(1),
            Self::From(ts) => *ts,
        }
    }
}

/// Derives the resume point for `field`, or `None` when there is nothing to
/// copy (incremental mode and the field has no source data at all).
///
/// The lookup is scoped to the field by the non-null predicate the client
/// applies, so concurrent backups of sibling fields — even ones writing the
/// same timestamps under the same tag sets — cannot move this field's resume
/// point.
pub async fn resolve_resume(
    source: &dyn InfluxDb,
    destination: &dyn InfluxDb,
    field: &FieldRef,
    destination_db: &str,
    mode: BackupMode,
) -> ClientResult<Option<ResumePoint>> {
    if let Some(last) = destination
        .last_field_write_time(destination_db, &field.measurement, &field.field)
        .await?
    {
        debug!(field = %field, last, "resuming after destination watermark");
        return Ok(Some(ResumePoint::After(last)));
    }

    match mode {
        BackupMode::Range { start_ns, .. } => Ok(Some(ResumePoint::From(start_ns))),
        BackupMode::Incremental => {
            let first = source
                .first_field_write_time(&field.database, &field.measurement, &field.field)
                .await?;
            match first {
                Some(ts) => Ok(Some(ResumePoint::From(ts))),
                None => {
                    debug!(field = %field, "field has no source data");
                    Ok(None)
                }
            }
        }
    }
}
