//! The seam between the backup engine and the InfluxDB HTTP client.
//!
//! The engine only ever talks to [`InfluxDb`], so tests can drive the whole
//! pipeline against an in-memory implementation (see [`crate::mock`]).

use async_trait::async_trait;
use influxdb1_client::{Client, FieldKey, FieldType, Point};

use crate::window::TimeWindow;

pub type ClientError = influxdb1_client::Error;
pub type ClientResult<T> = Result<T, ClientError>;

/// A stream of point batches from one window query. Pulling batch by batch
/// keeps the per-window memory bounded by the server-side chunk size.
#[async_trait]
pub trait PointBatches: Send {
    /// The next batch, or `None` once the window is drained.
    async fn next_batch(&mut self) -> ClientResult<Option<Vec<Point>>>;
}

/// The InfluxDB operations the backup engine needs. Implementations must be
/// safe to share across workers; every call is an independent request.
#[async_trait]
pub trait InfluxDb: Send + Sync {
    async fn ping(&self) -> ClientResult<()>;

    async fn ensure_database(&self, db: &str) -> ClientResult<()>;

    async fn list_databases(&self) -> ClientResult<Vec<String>>;

    async fn list_measurements(&self, db: &str) -> ClientResult<Vec<String>>;

    async fn list_field_keys(&self, db: &str, measurement: &str) -> ClientResult<Vec<FieldKey>>;

    /// Timestamp of the newest non-null value of `field`, or `None` when the
    /// field was never written. Implementations must scope the answer to the
    /// named field alone; this is what keeps one field's watermark out of
    /// reach of its neighbours' writes.
    async fn last_field_write_time(
        &self,
        db: &str,
        measurement: &str,
        field: &str,
    ) -> ClientResult<Option<i64>>;

    /// Timestamp of the oldest non-null value of `field`.
    async fn first_field_write_time(
        &self,
        db: &str,
        measurement: &str,
        field: &str,
    ) -> ClientResult<Option<i64>>;

    async fn query_field_window(
        &self,
        db: &str,
        measurement: &str,
        field: &str,
        field_type: FieldType,
        window: TimeWindow,
        group_by: Option<&str>,
    ) -> ClientResult<Box<dyn PointBatches>>;

    /// Writes one batch, returning the number of attempts used.
    async fn write_points(
        &self,
        db: &str,
        measurement: &str,
        points: &[Point],
    ) -> ClientResult<usize>;
}

#[async_trait]
impl PointBatches for influxdb1_client::ChunkedQuery {
    async fn next_batch(&mut self) -> ClientResult<Option<Vec<Point>>> {
        Self::next_batch(self).await
    }
}

#[async_trait]
impl InfluxDb for Client {
    async fn ping(&self) -> ClientResult<()> {
        Self::ping(self).await
    }

    async fn ensure_database(&self, db: &str) -> ClientResult<()> {
        Self::ensure_database(self, db).await
    }

    async fn list_databases(&self) -> ClientResult<Vec<String>> {
        Self::list_databases(self).await
    }

    async fn list_measurements(&self, db: &str) -> ClientResult<Vec<String>> {
        Self::list_measurements(self, db).await
    }

    async fn list_field_keys(&self, db: &str, measurement: &str) -> ClientResult<Vec<FieldKey>> {
        Self::list_field_keys(self, db, measurement).await
    }

    async fn last_field_write_time(
        &self,
        db: &str,
        measurement: &str,
        field: &str,
    ) -> ClientResult<Option<i64>> {
        Self::last_field_write_time(self, db, measurement, field).await
    }

    async fn first_field_write_time(
        &self,
        db: &str,
        measurement: &str,
        field: &str,
    ) -> ClientResult<Option<i64>> {
        Self::first_field_write_time(self, db, measurement, field).await
    }

    async fn query_field_window(
        &self,
        db: &str,
        measurement: &str,
        field: &str,
        field_type: FieldType,
        window: TimeWindow,
        group_by: Option<&str>,
    ) -> ClientResult<Box<dyn PointBatches>> {
        let chunks = Self::query_field_window(
            self,
            db,
            measurement,
            field,
            field_type,
            window.start,
            window.open_start,
            window.end,
            group_by,
        )
        .await?;
        Ok(Box::new(chunks))
    }

    async fn write_points(
        &self,
        db: &str,
        measurement: &str,
        points: &[Point],
    ) -> ClientResult<usize> {
        Self::write_points(self, db, measurement, points).await
    }
}
