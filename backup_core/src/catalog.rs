//! Field discovery and filtering.
//!
//! The catalog turns one source database into the ordered list of
//! `(measurement, field)` units to back up, applying the measurement-level
//! and field-level include/exclude lists, the type-class filter and the
//! obsolescence filter.

use std::fmt;

use snafu::{ResultExt, Snafu};
use tracing::debug;

use backup_config::BackupConfig;
use influxdb1_client::FieldType;

use crate::influx::{ClientError, InfluxDb};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("error listing measurements in {}: {}", database, source))]
    ListMeasurements {
        database: String,
        source: ClientError,
    },

    #[snafu(display("error listing fields of {}.{}: {}", database, measurement, source))]
    ListFields {
        database: String,
        measurement: String,
        source: ClientError,
    },

    #[snafu(display(
        "error reading last write time of {}.{}.{}: {}",
        database,
        measurement,
        field,
        source
    ))]
    LastWrite {
        database: String,
        measurement: String,
        field: String,
        source: ClientError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One `(database, measurement, field)` unit: the grain of parallelism and
/// of watermarking.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct FieldRef {
    pub database: String,
    pub measurement: String,
    pub field: String,
    pub field_type: FieldType,
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.database, self.measurement, self.field)
    }
}

/// The resolved work plan for one database pair.
#[derive(Debug, Default)]
pub struct CatalogPlan {
    /// Fields to back up, sorted by `(measurement, field)`.
    pub fields: Vec<FieldRef>,
    /// Fields dropped by the obsolescence filter. Reported as skipped so an
    /// operator can see what a threshold silently turned off.
    pub obsolete: Vec<FieldRef>,
}

/// Resolves the work plan for `database` against the source endpoint.
pub async fn resolve(
    source: &dyn InfluxDb,
    config: &BackupConfig,
    database: &str,
    now_ns: i64,
) -> Result<CatalogPlan> {
    let threshold = config
        .obsolete_threshold()
        .ok()
        .flatten()
        .and_then(|d| d.num_nanoseconds());
    let cutoff_ns = threshold.map(|ns| now_ns.saturating_sub(ns));

    let mut measurements = source
        .list_measurements(database)
        .await
        .context(ListMeasurementsSnafu { database })?;
    measurements.retain(|m| measurement_selected(config, m));
    measurements.sort();

    let mut plan = CatalogPlan::default();
    for measurement in &measurements {
        let field_keys = source
            .list_field_keys(database, measurement)
            .await
            .context(ListFieldsSnafu {
                database,
                measurement: measurement.as_str(),
            })?;

        for key in field_keys {
            if !field_selected(config, measurement, &key.name, key.field_type) {
                continue;
            }
            let field_ref = FieldRef {
                database: database.to_string(),
                measurement: measurement.clone(),
                field: key.name,
                field_type: key.field_type,
            };
            match cutoff_ns {
                Some(cutoff) => {
                    let last = source
                        .last_field_write_time(database, measurement, &field_ref.field)
                        .await
                        .context(LastWriteSnafu {
                            database,
                            measurement: measurement.as_str(),
                            field: field_ref.field.clone(),
                        })?;
                    match last {
                        Some(ts) if ts >= cutoff => plan.fields.push(field_ref),
                        _ => {
                            debug!(
                                field = %field_ref,
                                "newest source write is older than the obsolescence threshold"
                            );
                            plan.obsolete.push(field_ref);
                        }
                    }
                }
                None => plan.fields.push(field_ref),
            }
        }
    }

    plan.fields
        .sort_by(|a, b| (&a.measurement, &a.field).cmp(&(&b.measurement, &b.field)));
    plan.obsolete
        .sort_by(|a, b| (&a.measurement, &a.field).cmp(&(&b.measurement, &b.field)));
    Ok(plan)
}

/// Measurement-level selection: a non-empty include list names the candidate
/// set, otherwise every measurement is a candidate; the exclude list is
/// subtracted afterwards.
fn measurement_selected(config: &BackupConfig, measurement: &str) -> bool {
    let filters = &config.measurements;
    if !filters.include.is_empty() && !filters.include.iter().any(|m| m == measurement) {
        return false;
    }
    !filters.exclude.iter().any(|m| m == measurement)
}

/// Field-level selection for one measurement, combining the per-measurement
/// include/exclude lists with the allowed type classes.
fn field_selected(
    config: &BackupConfig,
    measurement: &str,
    field: &str,
    field_type: FieldType,
) -> bool {
    let filter = config
        .measurements
        .specific
        .get(measurement)
        .map(|spec| &spec.fields);

    if let Some(filter) = filter {
        if !filter.include.is_empty() && !filter.include.iter().any(|f| f == field) {
            return false;
        }
        if filter.exclude.iter().any(|f| f == field) {
            return false;
        }
        if !filter.types.is_empty() && !filter.types.contains(&field_type.class()) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockInflux;
    use influxdb1_client::FieldKey;

    fn config(yaml: &str) -> BackupConfig {
        let mut config: BackupConfig = serde_yaml::from_str(yaml).expect("valid yaml");
        config.name = "test".to_string();
        config
    }

    const BASE: &str = r#"
source:
  url: http://src:8086
destination:
  url: http://dst:8086
"#;

    fn keys(names: &[(&str, FieldType)]) -> Vec<FieldKey> {
        names
            .iter()
            .map(|(name, field_type)| FieldKey {
                name: name.to_string(),
                field_type: *field_type,
            })
            .collect()
    }

    #[tokio::test]
    async fn plan_is_sorted_by_measurement_then_field() {
        let mock = MockInflux::new();
        mock.add_measurement("db", "zulu", keys(&[("b", FieldType::Float), ("a", FieldType::Float)]));
        mock.add_measurement("db", "alpha", keys(&[("z", FieldType::Float)]));

        let plan = resolve(&mock, &config(BASE), "db", 0).await.unwrap();
        let names: Vec<String> = plan.fields.iter().map(|f| f.to_string()).collect();
        assert_eq!(names, vec!["db.alpha.z", "db.zulu.a", "db.zulu.b"]);
    }

    #[tokio::test]
    async fn measurement_include_wins_over_enumeration() {
        let yaml = format!(
            "{}measurements:\n  include: [keep]\n  exclude: [keep, drop]\n",
            BASE
        );
        let mock = MockInflux::new();
        mock.add_measurement("db", "keep", keys(&[("f", FieldType::Float)]));
        mock.add_measurement("db", "drop", keys(&[("f", FieldType::Float)]));
        mock.add_measurement("db", "other", keys(&[("f", FieldType::Float)]));

        let plan = resolve(&mock, &config(&yaml), "db", 0).await.unwrap();
        // `keep` is in both lists; the exclude subtraction applies after the
        // include selection, so nothing survives from the overlap.
        assert!(plan.fields.is_empty());
    }

    #[tokio::test]
    async fn exclude_subtracts_when_no_include_given() {
        let yaml = format!("{}measurements:\n  exclude: [noise]\n", BASE);
        let mock = MockInflux::new();
        mock.add_measurement("db", "noise", keys(&[("f", FieldType::Float)]));
        mock.add_measurement("db", "signal", keys(&[("f", FieldType::Float)]));

        let plan = resolve(&mock, &config(&yaml), "db", 0).await.unwrap();
        assert_eq!(plan.fields.len(), 1);
        assert_eq!(plan.fields[0].measurement, "signal");
    }

    #[tokio::test]
    async fn field_filters_and_type_classes_apply_per_measurement() {
        let yaml = format!(
            "{}measurements:\n  specific:\n    weather:\n      fields:\n        exclude: [comment]\n        types: [numeric]\n",
            BASE
        );
        let mock = MockInflux::new();
        mock.add_measurement(
            "db",
            "weather",
            keys(&[
                ("temperature", FieldType::Float),
                ("pulses", FieldType::Integer),
                ("comment", FieldType::String),
                ("ok", FieldType::Boolean),
            ]),
        );

        let plan = resolve(&mock, &config(&yaml), "db", 0).await.unwrap();
        let names: Vec<&str> = plan.fields.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(names, vec!["pulses", "temperature"]);
    }

    #[tokio::test]
    async fn obsolete_fields_are_set_aside_not_dropped() {
        let yaml = format!("{}options:\n  field_obsolete_threshold: 30d\n", BASE);
        let now_ns = 100 * 86_400_000_000_000;
        let mock = MockInflux::new();
        mock.add_measurement(
            "db",
            "weather",
            keys(&[("fresh", FieldType::Float), ("stale", FieldType::Float)]),
        );
        mock.set_last("db", "weather", "fresh", now_ns - 86_400_000_000_000);
        mock.set_last("db", "weather", "stale", now_ns - 40 * 86_400_000_000_000);

        let plan = resolve(&mock, &config(&yaml), "db", now_ns).await.unwrap();
        assert_eq!(plan.fields.len(), 1);
        assert_eq!(plan.fields[0].field, "fresh");
        assert_eq!(plan.obsolete.len(), 1);
        assert_eq!(plan.obsolete[0].field, "stale");
    }

    #[tokio::test]
    async fn never_written_field_counts_as_obsolete_under_threshold() {
        let yaml = format!("{}options:\n  field_obsolete_threshold: 30d\n", BASE);
        let mock = MockInflux::new();
        mock.add_measurement("db", "weather", keys(&[("ghost", FieldType::Float)]));

        let plan = resolve(&mock, &config(&yaml), "db", 0).await.unwrap();
        assert!(plan.fields.is_empty());
        assert_eq!(plan.obsolete.len(), 1);
    }

    #[tokio::test]
    async fn no_threshold_means_no_last_write_lookups() {
        let mock = MockInflux::new();
        mock.add_measurement("db", "weather", keys(&[("temperature", FieldType::Float)]));

        let plan = resolve(&mock, &config(BASE), "db", 0).await.unwrap();
        assert_eq!(plan.fields.len(), 1);
        assert_eq!(mock.last_write_queries(), 0);
    }
}
