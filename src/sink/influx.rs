use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::io::Write as _;

use anyhow::{bail, Context, Result};

use super::{RawKeySet, SeriesFilter, Sink, TimeRange, FIELD_RAW_TS, FIELD_TICK};
use crate::config::InfluxConfig;
use crate::model::{ns_to_iso_utc, FieldValue, Point};

/// Look-back used for provenance and last-value queries.
const LOOKBACK: &str = "-3650d";

/// InfluxDB v2 sink over the HTTP API.
///
/// Writes line protocol at nanosecond precision, optionally gzip-compressed.
/// Queries are Flux scripts answered as plain CSV.
pub struct InfluxSink {
    cfg: InfluxConfig,
    client: reqwest::Client,
}

impl InfluxSink {
    pub fn new(cfg: InfluxConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self { cfg, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.cfg.url.trim_end_matches('/'), path)
    }

    fn auth(&self) -> String {
        format!("Token {}", self.cfg.token)
    }

    /// Runs a Flux query and returns CSV records keyed by column name.
    async fn query(&self, flux: &str) -> Result<Vec<HashMap<String, String>>> {
        let body = serde_json::json!({
            "query": flux,
            "type": "flux",
            "dialect": {
                "header": true,
                "annotations": [],
                "delimiter": ",",
            },
        });
        let body = serde_json::to_vec(&body).context("serializing influx query")?;

        let resp = self
            .client
            .post(self.endpoint("/api/v2/query"))
            .query(&[("org", self.cfg.org.as_str())])
            .header("Authorization", self.auth())
            .header("Accept", "application/csv")
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .context("sending influx query")?;

        let status = resp.status();
        let text = resp.text().await.context("reading influx query response")?;
        if !status.is_success() {
            bail!("influx query unexpected status: {status}: {}", text.trim());
        }

        Ok(parse_csv_records(&text))
    }
}

impl Sink for InfluxSink {
    fn name(&self) -> &str {
        "influx"
    }

    async fn write(&self, points: &[Point]) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }

        let body = encode_lines(points);
        let raw_len = body.len();

        let mut request = self
            .client
            .post(self.endpoint("/api/v2/write"))
            .query(&[
                ("org", self.cfg.org.as_str()),
                ("bucket", self.cfg.bucket.as_str()),
                ("precision", "ns"),
            ])
            .header("Authorization", self.auth())
            .header("Content-Type", "text/plain; charset=utf-8");

        request = if self.cfg.gzip {
            let compressed = compress_gzip(body.as_bytes()).context("compressing line protocol")?;
            request.header("Content-Encoding", "gzip").body(compressed)
        } else {
            request.body(body)
        };

        let resp = request
            .send()
            .await
            .context("sending influx write request")?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("influx write unexpected status: {status}: {}", text.trim());
        }

        tracing::debug!(points = points.len(), bytes = raw_len, "wrote batch to influx");

        Ok(())
    }

    async fn query_existing_timestamps(
        &self,
        series: &SeriesFilter,
        field: &str,
        range: TimeRange,
    ) -> Result<HashSet<i64>> {
        let Some(flux) = flux_existing_timestamps(&self.cfg.bucket, series, field, range) else {
            return Ok(HashSet::new());
        };

        let records = self.query(&flux).await?;
        Ok(records
            .iter()
            .filter_map(|r| r.get("_value"))
            .filter_map(|v| parse_int(v))
            .collect())
    }

    async fn query_existing_raw(
        &self,
        series: &SeriesFilter,
        raw_min: i64,
        raw_max: i64,
    ) -> Result<RawKeySet> {
        let flux = flux_existing_raw(&self.cfg.bucket, series, raw_min, raw_max);
        let records = self.query(&flux).await?;

        let mut out = RawKeySet::default();
        for r in &records {
            let Some(raw) = r.get(FIELD_RAW_TS).and_then(|v| parse_int(v)) else {
                continue;
            };
            let tick = r.get(FIELD_TICK).and_then(|v| parse_int(v));
            out.insert(raw, tick);
        }
        Ok(out)
    }

    async fn last_value(&self, series: &SeriesFilter, field: &str) -> Result<Option<FieldValue>> {
        let flux = flux_last_value(&self.cfg.bucket, series, field);
        let records = self.query(&flux).await?;

        Ok(records
            .iter()
            .filter_map(|r| r.get("_value"))
            .find_map(|v| parse_field_value(v)))
    }
}

// --- Line protocol ---

/// Encodes points as newline-separated line protocol.
pub fn encode_lines(points: &[Point]) -> String {
    let mut out = String::with_capacity(points.len() * 96);
    for p in points {
        if p.fields.is_empty() {
            continue;
        }

        out.push_str(&escape_measurement(&p.measurement));
        for (k, v) in &p.tags {
            if v.is_empty() {
                continue;
            }
            out.push(',');
            out.push_str(&escape_key(k));
            out.push('=');
            out.push_str(&escape_key(v));
        }

        for (i, (k, v)) in p.fields.iter().enumerate() {
            out.push(if i == 0 { ' ' } else { ',' });
            out.push_str(&escape_key(k));
            out.push('=');
            let _ = write!(out, "{v}");
        }

        let _ = writeln!(out, " {}", p.timestamp_ns);
    }
    out
}

fn escape_measurement(s: &str) -> String {
    escape(s, &[',', ' '])
}

/// Escaping for tag keys, tag values and field keys.
fn escape_key(s: &str) -> String {
    escape(s, &[',', '=', ' '])
}

fn escape(s: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("gzip write")?;
    encoder.finish().context("gzip finish")
}

// --- Flux ---

/// JSON string literal, which Flux accepts verbatim.
fn quote(s: &str) -> String {
    serde_json::Value::from(s).to_string()
}

fn push_filters(flux: &mut String, series: &SeriesFilter) {
    let _ = writeln!(
        flux,
        "  |> filter(fn: (r) => r._measurement == {})",
        quote(&series.measurement)
    );
    for (k, v) in &series.tags {
        let _ = writeln!(flux, "  |> filter(fn: (r) => r[{}] == {})", quote(k), quote(v));
    }
}

/// Timestamps of `field` points within `range`. `None` when the range
/// cannot be rendered as RFC3339.
pub fn flux_existing_timestamps(
    bucket: &str,
    series: &SeriesFilter,
    field: &str,
    range: TimeRange,
) -> Option<String> {
    let start = ns_to_iso_utc(range.start_ns)?;
    let stop = ns_to_iso_utc(range.stop_ns)?;

    let mut flux = format!("from(bucket: {})\n", quote(bucket));
    let _ = writeln!(
        flux,
        "  |> range(start: time(v: {}), stop: time(v: {}))",
        quote(&start),
        quote(&stop)
    );
    push_filters(&mut flux, series);
    let _ = writeln!(flux, "  |> filter(fn: (r) => r._field == {})", quote(field));
    flux.push_str("  |> map(fn: (r) => ({ r with _value: uint(v: r._time) }))\n");
    flux.push_str("  |> keep(columns: [\"_value\"])");
    Some(flux)
}

/// Provenance fields with `node_ts_raw_ns` in `[raw_min, raw_max]`.
pub fn flux_existing_raw(bucket: &str, series: &SeriesFilter, raw_min: i64, raw_max: i64) -> String {
    let mut flux = format!("from(bucket: {})\n", quote(bucket));
    let _ = writeln!(flux, "  |> range(start: {LOOKBACK})");
    push_filters(&mut flux, series);
    let _ = writeln!(
        flux,
        "  |> filter(fn: (r) => r._field == {} or r._field == {})",
        quote(FIELD_RAW_TS),
        quote(FIELD_TICK)
    );
    flux.push_str("  |> pivot(rowKey: [\"_time\"], columnKey: [\"_field\"], valueColumn: \"_value\")\n");
    let _ = writeln!(flux, "  |> filter(fn: (r) => exists r.{FIELD_RAW_TS})");
    let _ = writeln!(
        flux,
        "  |> filter(fn: (r) => float(v: r.{FIELD_RAW_TS}) >= {raw_min}.0 and float(v: r.{FIELD_RAW_TS}) <= {raw_max}.0)"
    );
    let _ = write!(flux, "  |> keep(columns: [{}, {}])", quote(FIELD_RAW_TS), quote(FIELD_TICK));
    flux
}

/// Most recent `field` value in the series.
pub fn flux_last_value(bucket: &str, series: &SeriesFilter, field: &str) -> String {
    let mut flux = format!("from(bucket: {})\n", quote(bucket));
    let _ = writeln!(flux, "  |> range(start: {LOOKBACK})");
    push_filters(&mut flux, series);
    let _ = writeln!(flux, "  |> filter(fn: (r) => r._field == {})", quote(field));
    flux.push_str("  |> group()\n");
    flux.push_str("  |> last()\n");
    flux.push_str("  |> keep(columns: [\"_value\"])");
    flux
}

// --- CSV response parsing ---

/// Parses a headered CSV response into records.
///
/// A blank line ends a table; the next non-blank line is a new header.
pub fn parse_csv_records(text: &str) -> Vec<HashMap<String, String>> {
    let mut out = Vec::new();
    let mut header: Option<Vec<String>> = None;

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            header = None;
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        let cells = split_csv_line(line);
        match &header {
            None => header = Some(cells),
            Some(cols) => {
                let record = cols
                    .iter()
                    .zip(cells)
                    .filter(|(k, _)| !k.is_empty())
                    .map(|(k, v)| (k.clone(), v))
                    .collect();
                out.push(record);
            }
        }
    }

    out
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                cur.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => cells.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    cells.push(cur);
    cells
}

/// Integer cell, accepting float renderings such as "1.7e+18".
fn parse_int(v: &str) -> Option<i64> {
    let v = v.trim();
    if v.is_empty() {
        return None;
    }
    v.parse::<i64>()
        .ok()
        .or_else(|| v.parse::<u64>().ok().and_then(|u| i64::try_from(u).ok()))
        .or_else(|| {
            v.parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(|f| f as i64)
        })
}

fn parse_field_value(v: &str) -> Option<FieldValue> {
    let v = v.trim();
    if let Ok(i) = v.parse::<i64>() {
        return Some(FieldValue::Int(i));
    }
    v.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .map(FieldValue::Float)
}
