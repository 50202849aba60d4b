#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr,
    clippy::future_not_send
)]

//! # influxdb1_client
//!
//! A small HTTP client for the InfluxDB [1.x API]: `/ping`, `/query` and
//! `/write`. Reads are issued with `epoch=ns` and, for window queries,
//! `chunked=true`, so large result sets stream instead of buffering.
//!
//! [1.x API]: https://docs.influxdata.com/influxdb/v1.8/tools/api/

use std::time::Duration;

use reqwest::Method;
pub use reqwest::StatusCode;
use snafu::{ResultExt, Snafu};
use tracing::warn;

pub mod line_protocol;
mod response;

pub use line_protocol::{Point, ScalarValue};

use response::QueryResponse;

/// Number of rows the server packs into one chunk of a chunked response.
const CHUNK_SIZE: usize = 10_000;

/// Errors returned by [`Client`] operations.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("error talking to {}: {}", url, source))]
    Transport { url: String, source: reqwest::Error },

    #[snafu(display("HTTP request to {} returned {}: {}", url, status, text))]
    Http {
        url: String,
        status: StatusCode,
        text: String,
    },

    #[snafu(display("query failed: {}", message))]
    QueryFailed { message: String },

    #[snafu(display("unexpected response shape: {}", context))]
    UnexpectedResponse { context: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether retrying the request may help. Timeouts, connection failures,
    /// 408, 429 and server errors are transient; everything else is treated
    /// as permanent (bad credentials, malformed lines, schema conflicts).
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Http { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::QueryFailed { .. } | Self::UnexpectedResponse { .. } => false,
        }
    }
}

/// The data type of a field, as reported by `SHOW FIELD KEYS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FieldType {
    Float,
    Integer,
    String,
    Boolean,
}

impl FieldType {
    pub(crate) fn from_show_field_keys(value: &str) -> Option<Self> {
        match value {
            "float" => Some(Self::Float),
            "integer" => Some(Self::Integer),
            "string" => Some(Self::String),
            "boolean" => Some(Self::Boolean),
            _ => None,
        }
    }

    /// The coarse class used by configuration filters: float and integer
    /// collapse into numeric.
    pub fn class(&self) -> TypeClass {
        match self {
            Self::Float | Self::Integer => TypeClass::Numeric,
            Self::String => TypeClass::String,
            Self::Boolean => TypeClass::Boolean,
        }
    }
}

/// The coarse field-type classes a backup can be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeClass {
    Numeric,
    String,
    Boolean,
}

/// A field name together with its type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldKey {
    pub name: String,
    pub field_type: FieldType,
}

/// Builder for [`Client`].
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    url: String,
    ssl: bool,
    verify_ssl: bool,
    credentials: Option<(String, String)>,
    timeout: Duration,
    retries: usize,
    retry_delay: Duration,
}

impl ClientBuilder {
    /// Starts a builder for the endpoint at `url`. The URL may omit the
    /// scheme, in which case [`ClientBuilder::ssl`] picks it.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ssl: false,
            verify_ssl: true,
            credentials: None,
            timeout: Duration::from_secs(30),
            retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }

    /// Use HTTPS when the URL carries no scheme of its own.
    pub fn ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    /// Whether to validate the server certificate.
    pub fn verify_ssl(mut self, verify: bool) -> Self {
        self.verify_ssl = verify;
        self
    }

    /// HTTP basic credentials. Empty user means anonymous access.
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        let user = user.into();
        if !user.is_empty() {
            self.credentials = Some((user, password.into()));
        }
        self
    }

    /// Per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attempt budget for retriable failures; the minimum is one attempt.
    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = retries.max(1);
        self
    }

    /// Fixed delay between attempts.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Builds the client.
    pub fn build(self) -> Result<Client> {
        let url = if self.url.contains("://") {
            self.url.trim_end_matches('/').to_string()
        } else {
            let scheme = if self.ssl { "https" } else { "http" };
            format!("{}://{}", scheme, self.url.trim_end_matches('/'))
        };
        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(!self.verify_ssl)
            .build()
            .context(TransportSnafu { url: url.clone() })?;
        Ok(Client {
            url,
            http,
            credentials: self.credentials,
            retries: self.retries,
            retry_delay: self.retry_delay,
        })
    }
}

/// Client for one InfluxDB 1.x endpoint.
///
/// The client keeps no state between calls, so a single instance can be
/// shared freely across concurrent tasks.
#[derive(Debug, Clone)]
pub struct Client {
    url: String,
    http: reqwest::Client,
    credentials: Option<(String, String)>,
    retries: usize,
    retry_delay: Duration,
}

impl Client {
    /// The base URL this client talks to.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.request(method, format!("{}{}", self.url, path));
        if let Some((user, password)) = &self.credentials {
            req = req.basic_auth(user, Some(password));
        }
        req
    }

    async fn send_once(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = req.send().await.context(TransportSnafu {
            url: self.url.clone(),
        })?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let text = response.text().await.unwrap_or_default();
            HttpSnafu {
                url: self.url.clone(),
                status,
                text,
            }
            .fail()
        }
    }

    /// Sends the request, retrying retriable failures with a fixed delay.
    /// Returns the response together with the number of attempts used.
    async fn send_with_retries(
        &self,
        op: &str,
        req: reqwest::RequestBuilder,
    ) -> Result<(reqwest::Response, usize)> {
        let mut attempt = 1;
        loop {
            let this_try = req.try_clone().ok_or_else(|| {
                UnexpectedResponseSnafu {
                    context: "request body is not replayable",
                }
                .build()
            })?;
            match self.send_once(this_try).await {
                Ok(response) => return Ok((response, attempt)),
                Err(error) if error.is_retriable() && attempt < self.retries => {
                    warn!(
                        op,
                        attempt,
                        error = %error,
                        "retriable request failure, backing off"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn query(&self, db: Option<&str>, q: &str) -> Result<QueryResponse> {
        let mut req = self
            .request(Method::GET, "/query")
            .query(&[("q", q), ("epoch", "ns")]);
        if let Some(db) = db {
            req = req.query(&[("db", db)]);
        }
        let (response, _) = self.send_with_retries("query", req).await?;
        let body: QueryResponse = response.json().await.context(TransportSnafu {
            url: self.url.clone(),
        })?;
        if let Some(message) = body.error() {
            return QueryFailedSnafu { message }.fail();
        }
        Ok(body)
    }

    /// Health probe. A single attempt; callers own any startup backoff.
    pub async fn ping(&self) -> Result<()> {
        self.send_once(self.request(Method::GET, "/ping")).await?;
        Ok(())
    }

    /// Creates `db` if it does not exist. `CREATE DATABASE` is idempotent on
    /// the server side, so this is safe to call on every run.
    pub async fn ensure_database(&self, db: &str) -> Result<()> {
        let q = format!("CREATE DATABASE {}", quote_ident(db));
        let req = self.request(Method::POST, "/query").query(&[("q", q.as_str())]);
        let (response, _) = self.send_with_retries("create database", req).await?;
        let body: QueryResponse = response.json().await.context(TransportSnafu {
            url: self.url.clone(),
        })?;
        if let Some(message) = body.error() {
            return QueryFailedSnafu { message }.fail();
        }
        Ok(())
    }

    /// All databases on the endpoint, minus the server-internal one.
    pub async fn list_databases(&self) -> Result<Vec<String>> {
        let response = self.query(None, "SHOW DATABASES").await?;
        Ok(response
            .string_column("name")?
            .into_iter()
            .filter(|name| name != "_internal")
            .collect())
    }

    /// Measurement names in `db`.
    pub async fn list_measurements(&self, db: &str) -> Result<Vec<String>> {
        let response = self.query(Some(db), "SHOW MEASUREMENTS").await?;
        response.string_column("name")
    }

    /// Field keys and types of one measurement. Unknown types reported by
    /// the server fail the call rather than being silently dropped.
    pub async fn list_field_keys(&self, db: &str, measurement: &str) -> Result<Vec<FieldKey>> {
        let q = format!("SHOW FIELD KEYS FROM {}", quote_ident(measurement));
        let response = self.query(Some(db), &q).await?;
        response
            .field_key_rows()?
            .into_iter()
            .map(|(name, ty)| {
                let field_type = FieldType::from_show_field_keys(&ty).ok_or_else(|| {
                    UnexpectedResponseSnafu {
                        context: format!("unknown field type `{}` for field `{}`", ty, name),
                    }
                    .build()
                })?;
                Ok(FieldKey { name, field_type })
            })
            .collect()
    }

    /// Timestamp of the newest row in which `field` is non-null, in
    /// nanoseconds, or `None` when the field has never been written.
    ///
    /// The `IS NOT NULL` predicate keeps rows that only populate *other*
    /// fields of the measurement out of the answer; it is what isolates one
    /// field's resume point from its neighbours' writes.
    pub async fn last_field_write_time(
        &self,
        db: &str,
        measurement: &str,
        field: &str,
    ) -> Result<Option<i64>> {
        let q = format!(
            "SELECT LAST({field}) FROM {m} WHERE {field} IS NOT NULL",
            field = quote_ident(field),
            m = quote_ident(measurement),
        );
        self.query(Some(db), &q).await?.single_row_time()
    }

    /// Timestamp of the oldest row in which `field` is non-null.
    pub async fn first_field_write_time(
        &self,
        db: &str,
        measurement: &str,
        field: &str,
    ) -> Result<Option<i64>> {
        let q = format!(
            "SELECT FIRST({field}) FROM {m} WHERE {field} IS NOT NULL",
            field = quote_ident(field),
            m = quote_ident(measurement),
        );
        self.query(Some(db), &q).await?.single_row_time()
    }

    /// Streams one field over `[start, end)` — or `(start, end)` when
    /// `start_exclusive` — as a chunked query. `GROUP BY *` keeps each
    /// series' tag set attached to its rows. A non-empty `group_by` interval
    /// downsamples the read with `MEAN` over `time(<interval>)` buckets.
    pub async fn query_field_window(
        &self,
        db: &str,
        measurement: &str,
        field: &str,
        field_type: FieldType,
        start: i64,
        start_exclusive: bool,
        end: i64,
        group_by: Option<&str>,
    ) -> Result<ChunkedQuery> {
        let q = build_window_query(measurement, field, start, start_exclusive, end, group_by);
        let chunk_size = CHUNK_SIZE.to_string();
        let req = self.request(Method::GET, "/query").query(&[
            ("db", db),
            ("q", q.as_str()),
            ("epoch", "ns"),
            ("chunked", "true"),
            ("chunk_size", chunk_size.as_str()),
        ]);
        let (response, _) = self.send_with_retries("query window", req).await?;
        Ok(ChunkedQuery {
            response,
            url: self.url.clone(),
            field: field.to_string(),
            field_type,
            buf: Vec::new(),
            done: false,
        })
    }

    /// Writes a batch of single-field points to `db` with nanosecond
    /// precision. Returns the number of attempts the write took, so callers
    /// can report how often the destination pushed back.
    pub async fn write_points(
        &self,
        db: &str,
        measurement: &str,
        points: &[Point],
    ) -> Result<usize> {
        let body = line_protocol::encode_batch(measurement, points);
        let req = self
            .request(Method::POST, "/write")
            .query(&[("db", db), ("precision", "ns")])
            .body(body);
        let (_, attempts) = self.send_with_retries("write", req).await?;
        Ok(attempts)
    }
}

/// A chunked `/query` response being consumed incrementally. Each call to
/// [`ChunkedQuery::next_batch`] parses at most one chunk, so memory stays
/// bounded by the server-side chunk size regardless of the window's row count.
#[derive(Debug)]
pub struct ChunkedQuery {
    response: reqwest::Response,
    url: String,
    field: String,
    field_type: FieldType,
    buf: Vec<u8>,
    done: bool,
}

impl ChunkedQuery {
    /// The next batch of points, or `None` when the response is drained.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Point>>> {
        loop {
            if let Some(line) = take_line(&mut self.buf) {
                let points = parse_chunk(&line, &self.field, self.field_type)?;
                if points.is_empty() {
                    continue;
                }
                return Ok(Some(points));
            }
            if self.done {
                return Ok(None);
            }
            match self.response.chunk().await.context(TransportSnafu {
                url: self.url.clone(),
            })? {
                Some(bytes) => self.buf.extend_from_slice(&bytes),
                None => {
                    self.done = true;
                    if !self.buf.is_empty() {
                        let rest = std::mem::take(&mut self.buf);
                        let points = parse_chunk(&rest, &self.field, self.field_type)?;
                        if !points.is_empty() {
                            return Ok(Some(points));
                        }
                    }
                    return Ok(None);
                }
            }
        }
    }
}

/// Splits one newline-terminated document off the front of `buf`.
fn take_line(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let mut line: Vec<u8> = buf.drain(..=pos).collect();
    line.pop();
    Some(line)
}

fn parse_chunk(line: &[u8], field: &str, field_type: FieldType) -> Result<Vec<Point>> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let body: QueryResponse = serde_json::from_slice(line).map_err(|e| {
        UnexpectedResponseSnafu {
            context: format!("malformed chunk: {}", e),
        }
        .build()
    })?;
    if let Some(message) = body.error() {
        return QueryFailedSnafu { message }.fail();
    }
    body.points(field, field_type)
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\\\""))
}

/// The InfluxQL statement for one window of one field.
///
/// Every window query carries the same `IS NOT NULL` predicate the watermark
/// lookups use: a row where only *other* fields of the measurement are set
/// must never surface here, or a sibling field's writes could bleed into
/// this field's backup.
fn build_window_query(
    measurement: &str,
    field: &str,
    start: i64,
    start_exclusive: bool,
    end: i64,
    group_by: Option<&str>,
) -> String {
    let bounds = format!(
        "time {} {} AND time < {}",
        if start_exclusive { ">" } else { ">=" },
        start,
        end
    );
    match group_by {
        None => format!(
            "SELECT {field} FROM {m} WHERE {field} IS NOT NULL AND {bounds} GROUP BY * ORDER BY time ASC",
            field = quote_ident(field),
            m = quote_ident(measurement),
            bounds = bounds,
        ),
        Some(interval) => format!(
            "SELECT MEAN({field}) FROM {m} WHERE {field} IS NOT NULL AND {bounds} GROUP BY time({interval}), * fill(none) ORDER BY time ASC",
            field = quote_ident(field),
            m = quote_ident(measurement),
            bounds = bounds,
            interval = interval,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_double_quoted() {
        assert_eq!(quote_ident("weather"), "\"weather\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\\\"ird\"");
    }

    #[test]
    fn builder_applies_scheme_only_when_missing() {
        let client = ClientBuilder::new("influx:8086").ssl(true).build().unwrap();
        assert_eq!(client.url(), "https://influx:8086");

        let client = ClientBuilder::new("http://influx:8086/")
            .ssl(true)
            .build()
            .unwrap();
        assert_eq!(client.url(), "http://influx:8086");
    }

    #[test]
    fn server_errors_are_retriable_client_errors_are_not() {
        let retriable = Error::Http {
            url: "http://x".into(),
            status: StatusCode::SERVICE_UNAVAILABLE,
            text: String::new(),
        };
        assert!(retriable.is_retriable());

        let throttled = Error::Http {
            url: "http://x".into(),
            status: StatusCode::TOO_MANY_REQUESTS,
            text: String::new(),
        };
        assert!(throttled.is_retriable());

        let fatal = Error::Http {
            url: "http://x".into(),
            status: StatusCode::UNAUTHORIZED,
            text: String::new(),
        };
        assert!(!fatal.is_retriable());

        let schema_conflict = Error::Http {
            url: "http://x".into(),
            status: StatusCode::BAD_REQUEST,
            text: "field type conflict".into(),
        };
        assert!(!schema_conflict.is_retriable());
    }

    #[test]
    fn field_type_classes_collapse_numerics() {
        assert_eq!(FieldType::Float.class(), TypeClass::Numeric);
        assert_eq!(FieldType::Integer.class(), TypeClass::Numeric);
        assert_eq!(FieldType::String.class(), TypeClass::String);
        assert_eq!(FieldType::Boolean.class(), TypeClass::Boolean);
    }

    #[test]
    fn window_queries_always_filter_nulls_and_order_by_time() {
        let q = build_window_query("weather", "temperature", 100, false, 200, None);
        assert_eq!(
            q,
            "SELECT \"temperature\" FROM \"weather\" WHERE \"temperature\" IS NOT NULL \
             AND time >= 100 AND time < 200 GROUP BY * ORDER BY time ASC"
        );
    }

    #[test]
    fn resumed_window_uses_an_exclusive_lower_bound() {
        let q = build_window_query("weather", "temperature", 100, true, 200, None);
        assert!(q.contains("time > 100 AND time < 200"));
        assert!(!q.contains("time >= 100"));
    }

    #[test]
    fn grouped_window_downsamples_with_mean() {
        let q = build_window_query("weather", "temperature", 100, false, 200, Some("30s"));
        assert!(q.starts_with("SELECT MEAN(\"temperature\")"));
        assert!(q.contains("\"temperature\" IS NOT NULL"));
        assert!(q.contains("GROUP BY time(30s), * fill(none)"));
    }

    #[test]
    fn take_line_splits_on_newline_only() {
        let mut buf = b"{\"a\":1}\n{\"b\":".to_vec();
        assert_eq!(take_line(&mut buf).unwrap(), b"{\"a\":1}".to_vec());
        assert!(take_line(&mut buf).is_none());
        assert_eq!(buf, b"{\"b\":".to_vec());
    }

    #[test]
    fn parse_chunk_collects_points_across_series() {
        let line = br#"{"results":[{"statement_id":0,"series":[{"name":"weather","tags":{"station":"A"},"columns":["time","temperature"],"values":[[100,1.5],[200,2.5]]}]}]}"#;
        let points = parse_chunk(line, "temperature", FieldType::Float).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].timestamp, 200);
    }

    #[test]
    fn parse_chunk_surfaces_statement_errors() {
        let line = br#"{"results":[{"statement_id":0,"error":"shard is locked"}]}"#;
        let err = parse_chunk(line, "temperature", FieldType::Float).unwrap_err();
        assert!(matches!(err, Error::QueryFailed { .. }));
        assert!(!err.is_retriable());
    }

    #[test]
    fn blank_chunk_lines_are_ignored() {
        assert!(parse_chunk(b"  ", "f", FieldType::Float)
            .unwrap()
            .is_empty());
    }
}
