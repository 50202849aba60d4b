//! An in-memory [`InfluxDb`] for tests.
//!
//! The mock plays either endpoint role: seeded measurements, field keys,
//! points and last-write times serve the source side; recorded writes that
//! feed back into `last_field_write_time` serve the destination side, so a
//! second backup run observes the watermark the first one produced.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use influxdb1_client::{Error as ClientError, FieldKey, FieldType, Point};

use crate::influx::{ClientResult, InfluxDb, PointBatches};
use crate::window::TimeWindow;

type SeriesKey = (String, String, String);

#[derive(Debug, Default)]
struct State {
    measurements: BTreeMap<String, Vec<(String, Vec<FieldKey>)>>,
    points: BTreeMap<SeriesKey, Vec<Point>>,
    last_times: BTreeMap<SeriesKey, i64>,
    first_times: BTreeMap<SeriesKey, i64>,
    written: BTreeMap<(String, String), Vec<Point>>,
    write_batches: usize,
    last_write_queries: usize,
    window_queries: Vec<(String, String, TimeWindow)>,
    failing_pings: usize,
    failing_writes: usize,
    fatal_writes: bool,
    fatal_fields: Vec<String>,
}

/// See the module docs.
#[derive(Debug, Default)]
pub struct MockInflux {
    state: Mutex<State>,
}

fn key(db: &str, measurement: &str, field: &str) -> SeriesKey {
    (db.to_string(), measurement.to_string(), field.to_string())
}

fn retriable_error() -> ClientError {
    ClientError::Http {
        url: "http://mock:8086".to_string(),
        status: influxdb1_client::StatusCode::SERVICE_UNAVAILABLE,
        text: "try again".to_string(),
    }
}

fn fatal_error() -> ClientError {
    ClientError::Http {
        url: "http://mock:8086".to_string(),
        status: influxdb1_client::StatusCode::BAD_REQUEST,
        text: "field type conflict".to_string(),
    }
}

impl MockInflux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a measurement and its field keys.
    pub fn add_measurement(&self, db: &str, measurement: &str, fields: Vec<FieldKey>) {
        self.state
            .lock()
            .measurements
            .entry(db.to_string())
            .or_default()
            .push((measurement.to_string(), fields));
    }

    /// Seeds the queryable points of one field and derives its first/last
    /// write times from them.
    pub fn add_points(&self, db: &str, measurement: &str, field: &str, points: Vec<Point>) {
        let mut state = self.state.lock();
        let series = key(db, measurement, field);
        if let Some(min) = points.iter().map(|p| p.timestamp).min() {
            let first = state.first_times.entry(series.clone()).or_insert(min);
            *first = (*first).min(min);
        }
        if let Some(max) = points.iter().map(|p| p.timestamp).max() {
            let last = state.last_times.entry(series.clone()).or_insert(max);
            *last = (*last).max(max);
        }
        state.points.entry(series).or_default().extend(points);
    }

    /// Overrides the last write time of one field.
    pub fn set_last(&self, db: &str, measurement: &str, field: &str, ts: i64) {
        self.state.lock().last_times.insert(key(db, measurement, field), ts);
    }

    /// Makes the next `n` pings fail with a retriable error.
    pub fn fail_next_pings(&self, n: usize) {
        self.state.lock().failing_pings = n;
    }

    /// Makes the next `n` writes fail with a retriable error.
    pub fn fail_next_writes(&self, n: usize) {
        self.state.lock().failing_writes = n;
    }

    /// Makes every write fail with a permanent error (schema conflict).
    pub fn fail_writes_fatally(&self) {
        self.state.lock().fatal_writes = true;
    }

    /// Makes writes containing `field` fail permanently, as a destination
    /// with a conflicting stored type for that one field would.
    pub fn fail_writes_of_field(&self, field: &str) {
        self.state.lock().fatal_fields.push(field.to_string());
    }

    /// Every point written to `(db, measurement)` so far, in write order.
    pub fn written(&self, db: &str, measurement: &str) -> Vec<Point> {
        self.state
            .lock()
            .written
            .get(&(db.to_string(), measurement.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Number of write batches accepted.
    pub fn write_batches(&self) -> usize {
        self.state.lock().write_batches
    }

    /// Number of `last_field_write_time` lookups served.
    pub fn last_write_queries(&self) -> usize {
        self.state.lock().last_write_queries
    }

    /// Every window queried so far as `(measurement, field, window)`.
    pub fn window_queries(&self) -> Vec<(String, String, TimeWindow)> {
        self.state.lock().window_queries.clone()
    }
}

/// A pre-sliced window result, handed back one batch at a time.
#[derive(Debug)]
pub struct MockBatches {
    batches: Vec<Vec<Point>>,
}

#[async_trait]
impl PointBatches for MockBatches {
    async fn next_batch(&mut self) -> ClientResult<Option<Vec<Point>>> {
        if self.batches.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.batches.remove(0)))
        }
    }
}

#[async_trait]
impl InfluxDb for MockInflux {
    async fn ping(&self) -> ClientResult<()> {
        let mut state = self.state.lock();
        if state.failing_pings > 0 {
            state.failing_pings -= 1;
            return Err(retriable_error());
        }
        Ok(())
    }

    async fn ensure_database(&self, _db: &str) -> ClientResult<()> {
        Ok(())
    }

    async fn list_databases(&self) -> ClientResult<Vec<String>> {
        Ok(self.state.lock().measurements.keys().cloned().collect())
    }

    async fn list_measurements(&self, db: &str) -> ClientResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .measurements
            .get(db)
            .map(|ms| ms.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default())
    }

    async fn list_field_keys(&self, db: &str, measurement: &str) -> ClientResult<Vec<FieldKey>> {
        Ok(self
            .state
            .lock()
            .measurements
            .get(db)
            .and_then(|ms| {
                ms.iter()
                    .find(|(name, _)| name == measurement)
                    .map(|(_, fields)| fields.clone())
            })
            .unwrap_or_default())
    }

    async fn last_field_write_time(
        &self,
        db: &str,
        measurement: &str,
        field: &str,
    ) -> ClientResult<Option<i64>> {
        let mut state = self.state.lock();
        state.last_write_queries += 1;
        Ok(state.last_times.get(&key(db, measurement, field)).copied())
    }

    async fn first_field_write_time(
        &self,
        db: &str,
        measurement: &str,
        field: &str,
    ) -> ClientResult<Option<i64>> {
        Ok(self
            .state
            .lock()
            .first_times
            .get(&key(db, measurement, field))
            .copied())
    }

    async fn query_field_window(
        &self,
        db: &str,
        measurement: &str,
        field: &str,
        _field_type: FieldType,
        window: TimeWindow,
        _group_by: Option<&str>,
    ) -> ClientResult<Box<dyn PointBatches>> {
        let mut state = self.state.lock();
        state
            .window_queries
            .push((measurement.to_string(), field.to_string(), window));
        let mut points: Vec<Point> = state
            .points
            .get(&key(db, measurement, field))
            .map(|all| {
                all.iter()
                    .filter(|p| window.contains(p.timestamp))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        points.sort_by_key(|p| p.timestamp);
        let batches = if points.is_empty() {
            Vec::new()
        } else {
            vec![points]
        };
        Ok(Box::new(MockBatches { batches }))
    }

    async fn write_points(
        &self,
        db: &str,
        measurement: &str,
        points: &[Point],
    ) -> ClientResult<usize> {
        let mut state = self.state.lock();
        if state.fatal_writes
            || points
                .iter()
                .any(|p| state.fatal_fields.iter().any(|f| f == &p.field))
        {
            return Err(fatal_error());
        }
        let mut attempts = 1;
        if state.failing_writes > 0 {
            // the real client retries internally; model that by consuming the
            // injected failures as extra attempts of this call
            attempts += state.failing_writes;
            state.failing_writes = 0;
        }
        state.write_batches += 1;
        for point in points {
            let series = key(db, measurement, &point.field);
            let last = state.last_times.entry(series.clone()).or_insert(point.timestamp);
            *last = (*last).max(point.timestamp);
            let first = state.first_times.entry(series).or_insert(point.timestamp);
            *first = (*first).min(point.timestamp);
        }
        state
            .written
            .entry((db.to_string(), measurement.to_string()))
            .or_default()
            .extend(points.iter().cloned());
        Ok(attempts)
    }
}
