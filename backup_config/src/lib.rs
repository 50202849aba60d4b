#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

//! Configuration model for one backup process.
//!
//! One YAML file describes one backup process: a source endpoint, a
//! destination endpoint, measurement/field filters and the transport and
//! scheduling options. Loading validates everything that can be validated
//! without touching the network; anything wrong here is permanent and the
//! caller should exit rather than retry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use influxdb1_client::TypeClass;

pub mod duration;

pub use duration::parse_threshold;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("error reading config file {}: {}", path.display(), source))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("error parsing config file {}: {}", path.display(), source))]
    ParseFile {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[snafu(display("invalid configuration `{}`: {}", name, reason))]
    Invalid { name: String, reason: String },

    #[snafu(display("invalid duration `{}`: {}", value, reason))]
    InvalidDuration { value: String, reason: String },

    #[snafu(display("invalid cron expression `{}`: {}", expression, source))]
    InvalidCron {
        expression: String,
        source: cron::error::Error,
    },

    #[snafu(display("no configuration files found under {}", path.display()))]
    NoConfigs { path: PathBuf },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One `name -> destination` database mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabasePairConfig {
    pub name: String,
    /// Defaults to the source name decorated with the configured
    /// prefix/suffix when omitted.
    #[serde(default)]
    pub destination: Option<String>,
}

/// The source endpoint and what to read from it.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Explicit database pairs. Empty means "enumerate every database on the
    /// source and decorate the destination names with prefix/suffix".
    #[serde(default)]
    pub databases: Vec<DatabasePairConfig>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    /// Optional downsampling interval for reads, e.g. `"30s"`. Empty means
    /// raw reads.
    #[serde(default)]
    pub group_by: String,
}

/// The destination endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationConfig {
    pub url: String,
    #[serde(default)]
    pub ssl: bool,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

/// Per-measurement field filter.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FieldFilterConfig {
    /// Missing or empty means "all fields".
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Allowed type classes; empty means all three.
    pub types: Vec<TypeClass>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MeasurementSpecificConfig {
    pub fields: FieldFilterConfig,
}

/// Measurement selection for a whole configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MeasurementsConfig {
    /// Measurement-level include list; empty means all. When both include
    /// and exclude name a measurement, include wins.
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// Field filters keyed by measurement name.
    pub specific: BTreeMap<String, MeasurementSpecificConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupModeConfig {
    Incremental,
    Range,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RangeConfig {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IncrementalConfig {
    /// Cron expression; empty means run once.
    pub schedule: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct OptionsConfig {
    pub backup_mode: BackupModeConfig,
    pub range: RangeConfig,
    pub incremental: IncrementalConfig,
    /// Per-request timeout, seconds.
    pub timeout_client: u64,
    /// Attempt budget for retriable transport failures.
    pub retries: usize,
    /// Fixed delay between attempts, seconds.
    pub retry_delay: u64,
    /// Startup-only backoff while the endpoints come up, seconds.
    pub initial_connection_retry_delay: u64,
    /// Window length for time pagination, days.
    pub days_of_pagination: u32,
    pub parallel_workers: usize,
    /// Drop fields whose newest source write is older than this; empty
    /// disables the filter.
    pub field_obsolete_threshold: String,
    /// Write batch ceiling, points.
    pub batch_size: usize,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            backup_mode: BackupModeConfig::Incremental,
            range: RangeConfig::default(),
            incremental: IncrementalConfig::default(),
            timeout_client: 30,
            retries: 3,
            retry_delay: 5,
            initial_connection_retry_delay: 60,
            days_of_pagination: 7,
            parallel_workers: 4,
            field_obsolete_threshold: String::new(),
            batch_size: 5_000,
        }
    }
}

impl OptionsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_client)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }

    pub fn initial_connection_retry_delay(&self) -> Duration {
        Duration::from_secs(self.initial_connection_retry_delay)
    }
}

/// The resolved backup mode with range bounds already converted to
/// nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    Incremental,
    Range { start_ns: i64, end_ns: i64 },
}

/// One whole backup process configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupConfig {
    /// Derived from the file stem at load time; names every log record of
    /// this process.
    #[serde(skip)]
    pub name: String,
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    #[serde(default)]
    pub measurements: MeasurementsConfig,
    #[serde(default)]
    pub options: OptionsConfig,
}

impl BackupConfig {
    /// Loads and validates one configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        let mut config: Self =
            serde_yaml::from_str(&raw).context(ParseFileSnafu { path })?;
        config.name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "backup".to_string());
        config.validate()?;
        Ok(config)
    }

    /// Everything that can be checked without the network.
    pub fn validate(&self) -> Result<()> {
        if self.source.url.trim().is_empty() {
            return self.invalid("source.url must not be empty");
        }
        if self.destination.url.trim().is_empty() {
            return self.invalid("destination.url must not be empty");
        }
        if self.options.parallel_workers == 0 {
            return self.invalid("options.parallel_workers must be at least 1");
        }
        if self.options.days_of_pagination == 0 {
            return self.invalid("options.days_of_pagination must be at least 1");
        }
        if self.options.batch_size == 0 {
            return self.invalid("options.batch_size must be at least 1");
        }
        if self.options.retries == 0 {
            return self.invalid("options.retries must be at least 1");
        }
        for pair in &self.source.databases {
            if pair.name.trim().is_empty() {
                return self.invalid("source.databases entries must carry a name");
            }
        }
        self.mode()?;
        self.schedule()?;
        parse_threshold(&self.options.field_obsolete_threshold)?;
        Ok(())
    }

    /// The resolved mode. Range mode requires both bounds, ordered, and
    /// representable in nanoseconds.
    pub fn mode(&self) -> Result<BackupMode> {
        match self.options.backup_mode {
            BackupModeConfig::Incremental => Ok(BackupMode::Incremental),
            BackupModeConfig::Range => {
                let (start, end) = match (
                    self.options.range.start_date,
                    self.options.range.end_date,
                ) {
                    (Some(start), Some(end)) => (start, end),
                    _ => {
                        return self.invalid(
                            "range mode requires options.range.start_date and end_date",
                        )
                    }
                };
                if start >= end {
                    return self
                        .invalid("options.range.start_date must precede end_date");
                }
                let start_ns = to_nanos(&start).ok_or_else(|| self.invalid_err(
                    "options.range.start_date is outside the nanosecond-representable range",
                ))?;
                let end_ns = to_nanos(&end).ok_or_else(|| self.invalid_err(
                    "options.range.end_date is outside the nanosecond-representable range",
                ))?;
                Ok(BackupMode::Range { start_ns, end_ns })
            }
        }
    }

    /// The parsed schedule, or `None` for a one-shot run.
    pub fn schedule(&self) -> Result<Option<cron::Schedule>> {
        let expression = self.options.incremental.schedule.trim();
        if expression.is_empty() || self.options.backup_mode != BackupModeConfig::Incremental {
            return Ok(None);
        }
        cron_schedule(expression).map(Some)
    }

    /// The parsed obsolescence threshold.
    pub fn obsolete_threshold(&self) -> Result<Option<chrono::Duration>> {
        parse_threshold(&self.options.field_obsolete_threshold)
    }

    /// The destination database name for one source database.
    pub fn destination_name(&self, source_db: &str) -> String {
        format!("{}{}{}", self.source.prefix, source_db, self.source.suffix)
    }

    /// The configured read-downsampling interval, if any.
    pub fn group_by(&self) -> Option<&str> {
        let interval = self.source.group_by.trim();
        (!interval.is_empty()).then(|| interval)
    }

    fn invalid<T>(&self, reason: &str) -> Result<T> {
        Err(self.invalid_err(reason))
    }

    fn invalid_err(&self, reason: &str) -> Error {
        InvalidSnafu {
            name: self.name.clone(),
            reason,
        }
        .build()
    }
}

/// Parses a cron expression. Standard five-field crontab lines are accepted
/// by pinning the seconds field to zero; six/seven-field expressions pass
/// through unchanged.
pub fn cron_schedule(expression: &str) -> Result<cron::Schedule> {
    let expression = expression.trim();
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    };
    cron::Schedule::from_str(&normalized).context(InvalidCronSnafu { expression })
}

/// Nanoseconds since the epoch, or `None` outside the i64 range
/// (roughly years 1677–2262).
pub fn to_nanos(ts: &DateTime<Utc>) -> Option<i64> {
    let nanos = i64::from(ts.timestamp_subsec_nanos());
    ts.timestamp()
        .checked_mul(1_000_000_000)?
        .checked_add(nanos)
}

/// Configuration files under `path`: the file itself, or every `*.yaml` /
/// `*.yml` directly inside a directory, sorted for reproducible fan-out.
pub fn discover(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let entries = std::fs::read_dir(path).context(ReadFileSnafu { path })?;
    let mut configs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
        })
        .collect();
    configs.sort();
    if configs.is_empty() {
        return NoConfigsSnafu { path }.fail();
    }
    Ok(configs)
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
source:
  url: http://localhost:8086
destination:
  url: http://localhost:8087
"#;

    fn load_str(yaml: &str) -> Result<BackupConfig> {
        let mut config: BackupConfig = serde_yaml::from_str(yaml)
            .map_err(|source| Error::ParseFile {
                path: PathBuf::from("test.yaml"),
                source,
            })?;
        config.name = "test".to_string();
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_config_defaults() {
        let config = load_str(MINIMAL).unwrap();
        assert_eq!(config.options.parallel_workers, 4);
        assert_eq!(config.options.days_of_pagination, 7);
        assert_eq!(config.options.batch_size, 5_000);
        assert_eq!(config.mode().unwrap(), BackupMode::Incremental);
        assert!(config.schedule().unwrap().is_none());
        assert!(config.obsolete_threshold().unwrap().is_none());
        assert!(config.group_by().is_none());
        assert!(config.source.verify_ssl);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let yaml = format!("{}\nbananas: 3\n", MINIMAL);
        assert!(matches!(load_str(&yaml), Err(Error::ParseFile { .. })));
    }

    #[test]
    fn range_mode_requires_ordered_bounds() {
        let yaml = r#"
source:
  url: http://localhost:8086
destination:
  url: http://localhost:8087
options:
  backup_mode: range
  range:
    start_date: 2023-12-31T00:00:00Z
    end_date: 2023-01-01T00:00:00Z
"#;
        assert!(matches!(load_str(yaml), Err(Error::Invalid { .. })));
    }

    #[test]
    fn range_mode_resolves_nanoseconds() {
        let yaml = r#"
source:
  url: http://localhost:8086
destination:
  url: http://localhost:8087
options:
  backup_mode: range
  range:
    start_date: 2023-01-01T00:00:00Z
    end_date: 2023-12-31T23:59:59Z
"#;
        let config = load_str(yaml).unwrap();
        match config.mode().unwrap() {
            BackupMode::Range { start_ns, end_ns } => {
                assert_eq!(start_ns, 1_672_531_200_000_000_000);
                assert!(end_ns > start_ns);
            }
            other => panic!("expected range mode, got {:?}", other),
        }
    }

    #[test]
    fn five_field_cron_expressions_are_accepted() {
        let yaml = r#"
source:
  url: http://localhost:8086
destination:
  url: http://localhost:8087
options:
  incremental:
    schedule: "*/5 * * * *"
"#;
        let config = load_str(yaml).unwrap();
        assert!(config.schedule().unwrap().is_some());
    }

    #[test]
    fn broken_cron_expression_is_fatal() {
        let yaml = r#"
source:
  url: http://localhost:8086
destination:
  url: http://localhost:8087
options:
  incremental:
    schedule: "not a schedule"
"#;
        assert!(matches!(load_str(yaml), Err(Error::InvalidCron { .. })));
    }

    #[test]
    fn schedule_is_ignored_in_range_mode() {
        let yaml = r#"
source:
  url: http://localhost:8086
destination:
  url: http://localhost:8087
options:
  backup_mode: range
  range:
    start_date: 2023-01-01T00:00:00Z
    end_date: 2023-06-01T00:00:00Z
  incremental:
    schedule: "*/5 * * * *"
"#;
        let config = load_str(yaml).unwrap();
        assert!(config.schedule().unwrap().is_none());
    }

    #[test]
    fn destination_names_are_decorated() {
        let yaml = r#"
source:
  url: http://localhost:8086
  prefix: "bak_"
  suffix: "_v1"
destination:
  url: http://localhost:8087
"#;
        let config = load_str(yaml).unwrap();
        assert_eq!(config.destination_name("telemetry"), "bak_telemetry_v1");
    }

    #[test]
    fn specific_measurement_filters_deserialize() {
        let yaml = r#"
source:
  url: http://localhost:8086
destination:
  url: http://localhost:8087
measurements:
  include: [weather]
  specific:
    weather:
      fields:
        exclude: [comment]
        types: [numeric, boolean]
"#;
        let config = load_str(yaml).unwrap();
        let spec = config.measurements.specific.get("weather").unwrap();
        assert_eq!(spec.fields.exclude, vec!["comment".to_string()]);
        assert_eq!(
            spec.fields.types,
            vec![TypeClass::Numeric, TypeClass::Boolean]
        );
    }

    #[test]
    fn zero_workers_is_invalid() {
        let yaml = r#"
source:
  url: http://localhost:8086
destination:
  url: http://localhost:8087
options:
  parallel_workers: 0
"#;
        assert!(matches!(load_str(yaml), Err(Error::Invalid { .. })));
    }

    #[test]
    fn load_reads_name_from_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plant_a.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = BackupConfig::load(&path).unwrap();
        assert_eq!(config.name, "plant_a");
    }

    #[test]
    fn discover_sorts_yaml_files_and_skips_others() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.yaml", "a.yml", "notes.txt"] {
            std::fs::File::create(dir.path().join(name))
                .unwrap()
                .write_all(b"{}")
                .unwrap();
        }
        let found = discover(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.yml".to_string(), "b.yaml".to_string()]);
    }

    #[test]
    fn discover_of_empty_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            discover(dir.path()),
            Err(Error::NoConfigs { .. })
        ));
    }
}
