//! Generation of plottable per-host load series for the web dashboard.
//!
//! Each invocation runs the external query tool (`sonalyze load`) over the
//! requested window, parses its host-bucketed free-CSV output, reshapes
//! every host's samples into a JSON envelope of four relative-utilization
//! series, and rewrites that host's file atomically.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::freecsv::{self, Row};
use crate::window::DATE_TIME_FORMAT;

/// Column schema requested from the query tool. `csvnamed` makes every
/// field self-describing; `host` must be in-record, not a group header.
const OUTPUT_FIELDS: &str = "csvnamed,datetime,cpu,mem,gpu,gpumem,rcpu,rmem,rgpu,rgpumem,gpus,host";

/// Timestamp format of the plot points; the year is dropped for axis
/// labeling.
const POINT_TIME_FORMAT: &str = "%m-%d %H:%M";

/// Sample bucketing requested from the query tool. The assembled argument
/// vector always carries exactly one of the two flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucketing {
    Hourly,
    Daily,
}

impl Bucketing {
    fn flag(self) -> &'static str {
        match self {
            Bucketing::Hourly => "--hourly",
            Bucketing::Daily => "--daily",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Bucketing::Hourly => "hourly",
            Bucketing::Daily => "daily",
        }
    }
}

/// Options for the load-report verb, handed down from the CLI.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Root of the data store, passed through to the query tool.
    pub data_path: PathBuf,
    /// Path to the query tool executable.
    pub sonalyze: PathBuf,
    /// Host hardware configuration, passed through to the query tool.
    pub config_file: PathBuf,
    /// Directory receiving the per-host JSON files.
    pub output_path: PathBuf,
    /// Optional suffix for the generated filenames.
    pub tag: String,
    /// Raw `--from` specifier, forwarded verbatim.
    pub from: String,
    /// Raw `--to` specifier; absent means the invocation date.
    pub to: Option<String>,
    pub bucketing: Bucketing,
}

/// One parsed load sample.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadDatum {
    pub datetime: DateTime<Utc>,
    pub rcpu: f64,
    pub rmem: f64,
    pub rgpu: f64,
    pub rgpumem: f64,
    /// GPU devices in use: `None` when the set is unknown, otherwise the
    /// (possibly empty) list of device indices.
    pub gpus: Option<Vec<u32>>,
}

/// One plot point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub x: String,
    pub y: f64,
}

/// The per-host envelope uploaded to the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadEnvelope {
    pub hostname: String,
    pub tag: String,
    pub bucketing: &'static str,
    pub date: String,
    pub rcpu: Vec<Point>,
    pub rmem: Vec<Point>,
    pub rgpu: Vec<Point>,
    pub rgpumem: Vec<Point>,
}

/// Run the load-report verb: query, reshape per host, publish.
pub fn run(opts: &LoadOptions, now: DateTime<Utc>) -> Result<()> {
    let stdout = run_sonalyze(opts, now)?;
    let rows = freecsv::parse_free_csv(stdout.as_bytes())?;
    let hosts = bucket_by_host(&rows);
    debug!(hosts = hosts.len(), "parsed load query output");

    for (hostname, data) in &hosts {
        let envelope = build_envelope(hostname, &opts.tag, opts.bucketing, now, data);
        write_envelope(&opts.output_path, &envelope)?;
    }
    Ok(())
}

/// The argument vector for the query subprocess.
fn sonalyze_args(opts: &LoadOptions, now: DateTime<Utc>) -> Vec<String> {
    let to = opts
        .to
        .clone()
        .unwrap_or_else(|| now.format("%Y-%m-%d").to_string());
    vec![
        "load".to_string(),
        "--data-path".to_string(),
        opts.data_path.display().to_string(),
        "--config-file".to_string(),
        opts.config_file.display().to_string(),
        "--from".to_string(),
        opts.from.clone(),
        "--to".to_string(),
        to,
        format!("--fmt={OUTPUT_FIELDS}"),
        opts.bucketing.flag().to_string(),
    ]
}

/// Spawn the query tool and capture its output. Spawn failure and
/// non-zero exit are fatal; the child's stderr is folded into the error.
fn run_sonalyze(opts: &LoadOptions, now: DateTime<Utc>) -> Result<String> {
    let args = sonalyze_args(opts, now);
    debug!(tool = %opts.sonalyze.display(), ?args, "running load query");

    let output = Command::new(&opts.sonalyze)
        .args(&args)
        .output()
        .with_context(|| format!("spawning {}", opts.sonalyze.display()))?;

    if !output.status.success() {
        bail!(
            "{} load failed ({}): {}",
            opts.sonalyze.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn parse_row(row: &Row) -> Option<(String, LoadDatum)> {
    let host = freecsv::get_str(row, "host")?.to_string();
    let datum = LoadDatum {
        datetime: freecsv::get_date_time(row, "datetime")?,
        rcpu: freecsv::get_f64(row, "rcpu")?,
        rmem: freecsv::get_f64(row, "rmem")?,
        rgpu: freecsv::get_f64(row, "rgpu")?,
        rgpumem: freecsv::get_f64(row, "rgpumem")?,
        gpus: parse_gpus(freecsv::get_str(row, "gpus")?)?,
    };
    Some((host, datum))
}

/// Decode the `gpus` column: `unknown` (unknown set), `none` (empty set),
/// or a comma-separated list of device indices. The outer `None` is a
/// parse failure and drops the row.
fn parse_gpus(field: &str) -> Option<Option<Vec<u32>>> {
    match field {
        "unknown" => Some(None),
        "none" => Some(Some(Vec::new())),
        _ => {
            let mut devices = Vec::new();
            for part in field.split(',') {
                devices.push(part.parse().ok()?);
            }
            Some(Some(devices))
        }
    }
}

/// Bucket rows per host in one linear pass. The query output is sorted by
/// host and then by time, so a host change opens a new bucket and each
/// bucket stays time-ascending. Unparseable rows are dropped.
fn bucket_by_host(rows: &[Row]) -> Vec<(String, Vec<LoadDatum>)> {
    let mut hosts: Vec<(String, Vec<LoadDatum>)> = Vec::new();
    for row in rows {
        let Some((host, datum)) = parse_row(row) else {
            continue;
        };
        match hosts.last_mut() {
            Some((current, data)) if *current == host => data.push(datum),
            _ => hosts.push((host, vec![datum])),
        }
    }
    hosts
}

fn build_envelope(
    hostname: &str,
    tag: &str,
    bucketing: Bucketing,
    now: DateTime<Utc>,
    data: &[LoadDatum],
) -> LoadEnvelope {
    let series = |value: fn(&LoadDatum) -> f64| -> Vec<Point> {
        data.iter()
            .map(|datum| Point {
                x: datum.datetime.format(POINT_TIME_FORMAT).to_string(),
                y: value(datum),
            })
            .collect()
    };
    LoadEnvelope {
        hostname: hostname.to_string(),
        tag: tag.to_string(),
        bucketing: bucketing.label(),
        date: now.format(DATE_TIME_FORMAT).to_string(),
        rcpu: series(|d| d.rcpu),
        rmem: series(|d| d.rmem),
        rgpu: series(|d| d.rgpu),
        rgpumem: series(|d| d.rgpumem),
    }
}

fn envelope_filename(hostname: &str, tag: &str) -> String {
    if tag.is_empty() {
        format!("{hostname}.json")
    } else {
        format!("{hostname}-{tag}.json")
    }
}

/// Write one host's envelope atomically: temp file in the destination
/// directory, then rename over the target.
fn write_envelope(output_path: &Path, envelope: &LoadEnvelope) -> Result<()> {
    let dest = output_path.join(envelope_filename(&envelope.hostname, &envelope.tag));
    let tmp = NamedTempFile::new_in(output_path)
        .with_context(|| format!("creating temp file in {}", output_path.display()))?;
    serde_json::to_writer(tmp.as_file(), envelope)
        .with_context(|| format!("writing {}", dest.display()))?;
    tmp.persist(&dest)
        .map_err(|err| err.error)
        .with_context(|| format!("renaming temp file over {}", dest.display()))?;
    debug!(file = %dest.display(), "wrote load series");
    Ok(())
}
