//! The cpuhog report: jobs that use a lot of CPU and no GPU.
//!
//! The lower-level scan appends candidate violations to daily `cpuhog.csv`
//! logs on every pass, so the same job shows up many times. This verb
//! folds the window's rows into one record per job, reconciles them
//! against `cpuhog-state.csv`, and announces each offending job exactly
//! once, as text paragraphs or a JSON array.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::enumerate;
use crate::freecsv::{self, Row};
use crate::report::{self, JobReport, ReportOptions};
use crate::state::{self, JobKey, JobStates};
use crate::window::{Window, DATE_TIME_FORMAT};

const STATE_FILE: &str = "cpuhog-state.csv";
const LOG_PATTERN: &str = "cpuhog.csv";
const TAG: &str = "cpuhog";

/// One job's view across every log record seen for it in the window.
///
/// The numeric fields are the element-wise maximum across records; the
/// scan has a limited window of its own, so its view of a job changes
/// from day to day and only the running max is meaningful.
#[derive(Debug, Clone, PartialEq)]
pub struct CpuhogJob {
    pub id: u32,
    pub host: String,
    pub user: String,
    pub cmd: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub cpu_peak: f64,
    pub gpu_peak: f64,
    pub rcpu_avg: f64,
    pub rcpu_peak: f64,
    pub rmem_avg: f64,
    pub rmem_peak: f64,
}

/// One announcement, shaped for the JSON report surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuhogEvent {
    pub hostname: String,
    pub id: u32,
    pub user: String,
    pub cmd: String,
    #[serde(rename = "started-on-or-before")]
    pub started_on_or_before: String,
    #[serde(rename = "first-violation")]
    pub first_violation: String,
    #[serde(rename = "cpu-peak")]
    pub cpu_peak: u32,
    #[serde(rename = "rcpu-avg")]
    pub rcpu_avg: u32,
    #[serde(rename = "rcpu-peak")]
    pub rcpu_peak: u32,
    #[serde(rename = "rmem-avg")]
    pub rmem_avg: u32,
    #[serde(rename = "rmem-peak")]
    pub rmem_peak: u32,
}

/// Run the cpuhog verb end to end: ingest, reconcile, report, persist.
pub fn run(opts: &ReportOptions, now: DateTime<Utc>) -> Result<()> {
    let window = Window::resolve(&opts.from, opts.to.as_deref(), now)?;
    let mut state = state::read_job_state_or_empty(&opts.data_path, STATE_FILE)?;
    let jobs = ingest(&opts.data_path, &window)?;

    let mut candidates = 0usize;
    for job in jobs.values() {
        if state::ensure_job(&mut state, job.id, &job.host, job.start, now, job.last_seen) {
            candidates += 1;
        }
    }
    debug!(candidates, "new violation candidates");

    let purged = state::purge_jobs(&mut state, window.from, window.to);
    debug!(purged, "expired state entries purged");

    let events = announce(&mut state, &jobs);
    if opts.json {
        println!("{}", serde_json::to_string(&events)?);
    } else {
        let mut reports: Vec<JobReport> = events.iter().map(format_event).collect();
        report::sort_reports(&mut reports);
        print!("{}", report::render_text(&reports));
    }

    state::write_job_state(&opts.data_path, STATE_FILE, &state)
}

/// Read the window's cpuhog logs and fold them into one record per key.
/// An unreadable day file contributes nothing; malformed rows and rows
/// with a foreign tag are dropped.
pub fn ingest(data_path: &Path, window: &Window) -> Result<HashMap<JobKey, CpuhogJob>> {
    let files = enumerate::enumerate_files(data_path, window, LOG_PATTERN)?;

    let mut jobs = HashMap::new();
    for rel in files {
        let rows = match freecsv::read_free_csv(&data_path.join(&rel)) {
            Ok(rows) => rows,
            Err(err) => {
                debug!(file = %rel.display(), %err, "skipping unreadable log file");
                continue;
            }
        };
        for row in &rows {
            let Some(record) = parse_row(row) else {
                continue;
            };
            fold(&mut jobs, record);
        }
    }
    Ok(jobs)
}

fn parse_row(row: &Row) -> Option<CpuhogJob> {
    if freecsv::get_str(row, "tag")? != TAG {
        return None;
    }
    let now = freecsv::get_date_time(row, "now")?;
    Some(CpuhogJob {
        id: freecsv::get_job_id(row, "jobm")?,
        host: freecsv::get_str(row, "host")?.to_string(),
        user: freecsv::get_str(row, "user")?.to_string(),
        cmd: freecsv::get_str(row, "cmd")?.to_string(),
        first_seen: now,
        last_seen: now,
        start: freecsv::get_date_time(row, "start")?,
        end: freecsv::get_date_time(row, "end")?,
        cpu_peak: freecsv::get_f64(row, "cpu-peak")?,
        gpu_peak: freecsv::get_f64(row, "gpu-peak")?,
        rcpu_avg: freecsv::get_f64(row, "rcpu-avg")?,
        rcpu_peak: freecsv::get_f64(row, "rcpu-peak")?,
        rmem_avg: freecsv::get_f64(row, "rmem-avg")?,
        rmem_peak: freecsv::get_f64(row, "rmem-peak")?,
    })
}

fn fold(jobs: &mut HashMap<JobKey, CpuhogJob>, record: CpuhogJob) {
    let key = JobKey {
        id: record.id,
        host: record.host.clone(),
    };
    match jobs.entry(key) {
        Entry::Occupied(mut occupied) => {
            let job = occupied.get_mut();
            // Identity fields keep the first record's values. cmd in
            // particular can drift across records of one logical job as
            // processes come and go; first record wins, a known
            // imprecision.
            job.first_seen = job.first_seen.min(record.first_seen);
            job.last_seen = job.last_seen.max(record.last_seen);
            job.start = job.start.min(record.start);
            job.end = job.end.max(record.end);
            job.cpu_peak = job.cpu_peak.max(record.cpu_peak);
            job.gpu_peak = job.gpu_peak.max(record.gpu_peak);
            job.rcpu_avg = job.rcpu_avg.max(record.rcpu_avg);
            job.rcpu_peak = job.rcpu_peak.max(record.rcpu_peak);
            job.rmem_avg = job.rmem_avg.max(record.rmem_avg);
            job.rmem_peak = job.rmem_peak.max(record.rmem_peak);
        }
        Entry::Vacant(vacant) => {
            vacant.insert(record);
        }
    }
}

/// Flip every unreported state row and build its announcement, in
/// (host, id) order. A row whose key is missing from the current window's
/// aggregate still announces, with empty identity and zero measurements.
pub fn announce(state: &mut JobStates, jobs: &HashMap<JobKey, CpuhogJob>) -> Vec<CpuhogEvent> {
    state::take_unreported(state)
        .into_iter()
        .map(|entry| {
            let job = jobs.get(&entry.key());
            CpuhogEvent {
                hostname: entry.host.clone(),
                id: entry.id,
                user: job.map(|j| j.user.clone()).unwrap_or_default(),
                cmd: job.map(|j| j.cmd.clone()).unwrap_or_default(),
                started_on_or_before: entry
                    .started_on_or_before
                    .format(DATE_TIME_FORMAT)
                    .to_string(),
                first_violation: entry.first_violation.format(DATE_TIME_FORMAT).to_string(),
                // Whole cores; the log reports percent where 100 is one
                // full core.
                cpu_peak: job.map_or(0, |j| (j.cpu_peak / 100.0) as u32),
                rcpu_avg: job.map_or(0, |j| j.rcpu_avg as u32),
                rcpu_peak: job.map_or(0, |j| j.rcpu_peak as u32),
                rmem_avg: job.map_or(0, |j| j.rmem_avg as u32),
                rmem_peak: job.map_or(0, |j| j.rmem_peak as u32),
            }
        })
        .collect()
}

/// Render one announcement as its text paragraph.
pub fn format_event(event: &CpuhogEvent) -> JobReport {
    let mut body = String::new();
    let _ = writeln!(
        body,
        "New CPU hog detected (uses a lot of CPU and no GPU) on host \"{}\":",
        event.hostname
    );
    let _ = writeln!(body, "  Job#: {}", event.id);
    let _ = writeln!(body, "  User: {}", event.user);
    let _ = writeln!(body, "  Command: {}", event.cmd);
    let _ = writeln!(body, "  Started on or before: {}", event.started_on_or_before);
    let _ = writeln!(body, "  Violation first detected: {}", event.first_violation);
    let _ = writeln!(body, "  Observed data:");
    let _ = writeln!(body, "    CPU peak = {} cores", event.cpu_peak);
    let _ = writeln!(
        body,
        "    CPU utilization avg/peak = {}%, {}%",
        event.rcpu_avg, event.rcpu_peak
    );
    let _ = writeln!(
        body,
        "    Memory utilization avg/peak = {}%, {}%",
        event.rmem_avg, event.rmem_peak
    );
    JobReport {
        id: event.id,
        host: event.hostname.clone(),
        body,
    }
}
