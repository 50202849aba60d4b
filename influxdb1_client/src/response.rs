//! Deserialization of InfluxDB 1.x `/query` response bodies.
//!
//! A plain response is a single JSON document; a chunked response is a
//! newline-delimited sequence of documents with the same shape, each carrying
//! a slice of the result set.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::line_protocol::{Point, ScalarValue};
use crate::{FieldType, UnexpectedResponseSnafu};

#[derive(Debug, Deserialize)]
pub(crate) struct QueryResponse {
    #[serde(default)]
    pub results: Vec<StatementResult>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatementResult {
    #[serde(default)]
    pub series: Vec<Series>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Series {
    #[serde(default)]
    pub name: String,
    /// Tag set of this series, present when the query groups by tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub columns: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<serde_json::Value>>,
}

impl QueryResponse {
    /// First error reported by any statement in the response, if any.
    pub(crate) fn error(&self) -> Option<&str> {
        self.results.iter().find_map(|r| r.error.as_deref())
    }

    fn all_series(&self) -> impl Iterator<Item = &Series> {
        self.results.iter().flat_map(|r| r.series.iter())
    }

    /// Collects one string column across every series, e.g. the `name`
    /// column of `SHOW DATABASES` / `SHOW MEASUREMENTS`.
    pub(crate) fn string_column(&self, column: &str) -> crate::Result<Vec<String>> {
        let mut out = Vec::new();
        for series in self.all_series() {
            let idx = column_index(series, column)?;
            for row in &series.values {
                if let Some(value) = row.get(idx).and_then(|v| v.as_str()) {
                    out.push(value.to_string());
                }
            }
        }
        Ok(out)
    }

    /// Pairs of (fieldKey, fieldType) from a `SHOW FIELD KEYS` response.
    pub(crate) fn field_key_rows(&self) -> crate::Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for series in self.all_series() {
            let key_idx = column_index(series, "fieldKey")?;
            let type_idx = column_index(series, "fieldType")?;
            for row in &series.values {
                match (
                    row.get(key_idx).and_then(|v| v.as_str()),
                    row.get(type_idx).and_then(|v| v.as_str()),
                ) {
                    (Some(key), Some(ty)) => out.push((key.to_string(), ty.to_string())),
                    _ => {
                        return UnexpectedResponseSnafu {
                            context: "non-string entry in SHOW FIELD KEYS row",
                        }
                        .fail()
                    }
                }
            }
        }
        Ok(out)
    }

    /// The timestamp of the single row selected by `SELECT FIRST(..)` /
    /// `SELECT LAST(..)`, or `None` when the measurement or field holds no
    /// data. Requires the request to have been made with `epoch=ns`.
    pub(crate) fn single_row_time(&self) -> crate::Result<Option<i64>> {
        let series = match self.all_series().next() {
            Some(series) => series,
            None => return Ok(None),
        };
        let idx = column_index(series, "time")?;
        match series.values.first() {
            Some(row) => match row.get(idx).and_then(|v| v.as_i64()) {
                Some(ts) => Ok(Some(ts)),
                None => UnexpectedResponseSnafu {
                    context: "time column is not an integer; was epoch=ns set?",
                }
                .fail(),
            },
            None => Ok(None),
        }
    }

    /// Converts every series row into a [`Point`], keeping the tag set the
    /// server attached per series (`GROUP BY *`). Rows whose value is null
    /// are dropped, as are empty-string tags the server emits for series
    /// that never set a given tag key.
    pub(crate) fn points(&self, field: &str, field_type: FieldType) -> crate::Result<Vec<Point>> {
        let mut out = Vec::new();
        for series in self.all_series() {
            let time_idx = column_index(series, "time")?;
            // Aggregated reads rename the value column (e.g. `mean`), so take
            // the first non-time column rather than looking the field up by name.
            let value_idx = series
                .columns
                .iter()
                .position(|c| c != "time")
                .ok_or_else(|| {
                    UnexpectedResponseSnafu {
                        context: "series has no value column",
                    }
                    .build()
                })?;

            let tags: BTreeMap<String, String> = series
                .tags
                .iter()
                .filter(|(_, v)| !v.is_empty())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            for row in &series.values {
                let timestamp = match row.get(time_idx).and_then(|v| v.as_i64()) {
                    Some(ts) => ts,
                    None => {
                        return UnexpectedResponseSnafu {
                            context: "time column is not an integer; was epoch=ns set?",
                        }
                        .fail()
                    }
                };
                let value = match row.get(value_idx) {
                    None | Some(serde_json::Value::Null) => continue,
                    Some(value) => scalar_from_json(value, field_type)?,
                };
                out.push(Point {
                    timestamp,
                    tags: tags.clone(),
                    field: field.to_string(),
                    value,
                });
            }
        }
        Ok(out)
    }
}

fn column_index(series: &Series, column: &str) -> crate::Result<usize> {
    series
        .columns
        .iter()
        .position(|c| c == column)
        .ok_or_else(|| {
            UnexpectedResponseSnafu {
                context: format!("missing column `{}` in series `{}`", column, series.name),
            }
            .build()
        })
}

/// Converts a JSON value into a [`ScalarValue`], guided by the declared field
/// type so a float field holding a whole number stays a float end to end.
/// Downsampled reads of integer fields come back as JSON floats and are kept
/// as floats.
fn scalar_from_json(value: &serde_json::Value, field_type: FieldType) -> crate::Result<ScalarValue> {
    let converted = match field_type {
        FieldType::Float => value.as_f64().map(ScalarValue::Float),
        FieldType::Integer => value
            .as_i64()
            .map(ScalarValue::Integer)
            .or_else(|| value.as_f64().map(ScalarValue::Float)),
        FieldType::String => value.as_str().map(|s| ScalarValue::Text(s.to_string())),
        FieldType::Boolean => value.as_bool().map(ScalarValue::Boolean),
    };
    converted.ok_or_else(|| {
        UnexpectedResponseSnafu {
            context: format!("value `{}` does not match field type {:?}", value, field_type),
        }
        .build()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> QueryResponse {
        serde_json::from_str(body).expect("valid query response")
    }

    #[test]
    fn show_measurements_column() {
        let response = parse(
            r#"{"results":[{"statement_id":0,"series":[{"name":"measurements","columns":["name"],"values":[["weather"],["power"]]}]}]}"#,
        );
        assert_eq!(
            response.string_column("name").unwrap(),
            vec!["weather".to_string(), "power".to_string()]
        );
    }

    #[test]
    fn field_key_rows_pair_names_and_types() {
        let response = parse(
            r#"{"results":[{"statement_id":0,"series":[{"name":"weather","columns":["fieldKey","fieldType"],"values":[["temperature","float"],["station","string"]]}]}]}"#,
        );
        assert_eq!(
            response.field_key_rows().unwrap(),
            vec![
                ("temperature".to_string(), "float".to_string()),
                ("station".to_string(), "string".to_string())
            ]
        );
    }

    #[test]
    fn last_time_from_selector_row() {
        let response = parse(
            r#"{"results":[{"statement_id":0,"series":[{"name":"weather","columns":["time","last"],"values":[[1701426600000000000,21.5]]}]}]}"#,
        );
        assert_eq!(
            response.single_row_time().unwrap(),
            Some(1_701_426_600_000_000_000)
        );
    }

    #[test]
    fn last_time_absent_when_no_series() {
        let response = parse(r#"{"results":[{"statement_id":0}]}"#);
        assert_eq!(response.single_row_time().unwrap(), None);
    }

    #[test]
    fn points_carry_series_tags_and_skip_nulls() {
        let response = parse(
            r#"{"results":[{"statement_id":0,"series":[
                {"name":"weather","tags":{"station":"A","empty":""},"columns":["time","temperature"],"values":[[100,21.5],[200,null],[300,22.0]]},
                {"name":"weather","tags":{"station":"B"},"columns":["time","temperature"],"values":[[150,19.0]]}
            ]}]}"#,
        );
        let points = response.points("temperature", FieldType::Float).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].timestamp, 100);
        assert_eq!(points[0].tags.get("station").map(String::as_str), Some("A"));
        assert!(!points[0].tags.contains_key("empty"));
        assert_eq!(points[2].timestamp, 150);
        assert_eq!(points[2].value, ScalarValue::Float(19.0));
    }

    #[test]
    fn integer_field_values_keep_their_suffix_type() {
        let response = parse(
            r#"{"results":[{"statement_id":0,"series":[{"name":"power","columns":["time","pulses"],"values":[[100,42]]}]}]}"#,
        );
        let points = response.points("pulses", FieldType::Integer).unwrap();
        assert_eq!(points[0].value, ScalarValue::Integer(42));
    }

    #[test]
    fn float_field_with_integral_value_stays_float() {
        let response = parse(
            r#"{"results":[{"statement_id":0,"series":[{"name":"weather","columns":["time","temperature"],"values":[[100,21]]}]}]}"#,
        );
        let points = response.points("temperature", FieldType::Float).unwrap();
        assert_eq!(points[0].value, ScalarValue::Float(21.0));
    }

    #[test]
    fn downsampled_integer_field_comes_back_as_float() {
        let response = parse(
            r#"{"results":[{"statement_id":0,"series":[{"name":"power","columns":["time","mean"],"values":[[100,42.5]]}]}]}"#,
        );
        let points = response.points("pulses", FieldType::Integer).unwrap();
        assert_eq!(points[0].value, ScalarValue::Float(42.5));
    }

    #[test]
    fn statement_error_is_surfaced() {
        let response = parse(r#"{"results":[{"statement_id":0,"error":"database not found: nope"}]}"#);
        assert_eq!(response.error(), Some("database not found: nope"));
    }
}
