//! Line protocol encoding for InfluxDB 1.x writes.
//!
//! Writes carry nanosecond timestamps and one field per line. Tags are kept
//! in lexicographic order, which is the ordering the server ingests fastest.

use std::collections::BTreeMap;
use std::fmt;

/// Delimiters that must be escaped in a measurement name.
const MEASUREMENT_DELIMITERS: &[char] = &[',', ' '];

/// Delimiters that must be escaped in tag keys, tag values and field keys.
const TAG_DELIMITERS: &[char] = &[',', '=', ' '];

/// A single scalar field value.
///
/// InfluxDB fields are dynamically typed per series; queries hand back any of
/// these four shapes and the encoder renders each with the type marker the
/// write endpoint expects (`i` suffix for integers, quotes for strings,
/// `t`/`f` for booleans, bare for floats).
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    /// A 64-bit floating point number
    Float(f64),
    /// A 64-bit signed integer number
    Integer(i64),
    /// A string value
    Text(String),
    /// A true or false value
    Boolean(bool),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{}", v),
            Self::Integer(v) => write!(f, "{}i", v),
            Self::Text(v) => write!(f, r#""{}""#, escape_string_value(v)),
            Self::Boolean(v) => write!(f, "{}", if *v { "t" } else { "f" }),
        }
    }
}

/// One row returned by a single-field query: the unit the backup pipeline
/// moves between databases.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Nanoseconds since the UNIX epoch.
    pub timestamp: i64,
    /// Tag set of the series the row belongs to. A `BTreeMap` keeps the
    /// encoder's tag order lexicographic.
    pub tags: BTreeMap<String, String>,
    /// Name of the field this point carries a value for.
    pub field: String,
    /// The field value.
    pub value: ScalarValue,
}

/// Appends one point to `out` as a line of line protocol.
pub fn encode_point(measurement: &str, point: &Point, out: &mut String) {
    escape_into(measurement, MEASUREMENT_DELIMITERS, out);
    for (key, value) in &point.tags {
        out.push(',');
        escape_into(key, TAG_DELIMITERS, out);
        out.push('=');
        escape_into(value, TAG_DELIMITERS, out);
    }
    out.push(' ');
    escape_into(&point.field, TAG_DELIMITERS, out);
    out.push('=');
    out.push_str(&point.value.to_string());
    out.push(' ');
    out.push_str(&point.timestamp.to_string());
    out.push('\n');
}

/// Renders a batch of points for one measurement as a `/write` request body.
pub fn encode_batch(measurement: &str, points: &[Point]) -> String {
    // 64 bytes per line is a conservative lower bound, enough to avoid most
    // reallocations for typical numeric series.
    let mut out = String::with_capacity(points.len() * 64);
    for point in points {
        encode_point(measurement, point, &mut out);
    }
    out
}

fn escape_into(value: &str, delimiters: &[char], out: &mut String) {
    let mut last = 0;
    for (idx, delim) in value.match_indices(delimiters) {
        out.push_str(&value[last..idx]);
        out.push('\\');
        out.push_str(delim);
        last = idx + delim.len();
    }
    out.push_str(&value[last..]);
}

fn escape_string_value(value: &str) -> String {
    value.replace('\\', r"\\").replace('"', r#"\""#)
}
