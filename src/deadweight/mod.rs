//! The deadweight report: zombie, defunct, and otherwise hung jobs that
//! hold resources without doing work.
//!
//! Same pipeline as the cpuhog report, over `deadweight.csv` logs and
//! `deadweight-state.csv`: fold the window's redundant rows per job,
//! reconcile against the persistent state, announce each job once.

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

const STATE_FILE: &str = "deadweight-state.csv";
const LOG_PATTERN: &str = "deadweight.csv";
const TAG: &str = "deadweight";

/// One job's view across every log record seen for it in the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadweightJob {
    pub id: u32,
    pub host: String,
    pub user: String,
    pub cmd: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// One announcement, shaped for the JSON report surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadweightEvent {
    pub hostname: String,
    pub id: u32,
    pub user: String,
    pub cmd: String,
    #[serde(rename = "started-on-or-before")]
    pub started_on_or_before: String,
    #[serde(rename = "first-violation")]
    pub first_violation: String,
    #[serde(rename = "last-seen")]
    pub last_seen: String,
}

/// Run the deadweight verb end to end: ingest, reconcile, report, persist.
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

/// Read the window's deadweight logs and fold them into one record per
/// key, dropping malformed and foreign-tag rows.
pub fn ingest(data_path: &Path, window: &Window) -> Result<HashMap<JobKey, DeadweightJob>> {
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

fn parse_row(row: &Row) -> Option<DeadweightJob> {
    if freecsv::get_str(row, "tag")? != TAG {
        return None;
    }
    let now = freecsv::get_date_time(row, "now")?;
    Some(DeadweightJob {
        id: freecsv::get_job_id(row, "jobm")?,
        host: freecsv::get_str(row, "host")?.to_string(),
        user: freecsv::get_str(row, "user")?.to_string(),
        cmd: freecsv::get_str(row, "cmd")?.to_string(),
        first_seen: now,
        last_seen: now,
        start: freecsv::get_date_time(row, "start")?,
        end: freecsv::get_date_time(row, "end")?,
    })
}

fn fold(jobs: &mut HashMap<JobKey, DeadweightJob>, record: DeadweightJob) {
    let key = JobKey {
        id: record.id,
        host: record.host.clone(),
    };
    match jobs.entry(key) {
        Entry::Occupied(mut occupied) => {
            let job = occupied.get_mut();
            // Identity fields keep the first record's values; see the
            // cpuhog fold for the cmd caveat.
            job.first_seen = job.first_seen.min(record.first_seen);
            job.last_seen = job.last_seen.max(record.last_seen);
            job.start = job.start.min(record.start);
            job.end = job.end.max(record.end);
        }
        Entry::Vacant(vacant) => {
            vacant.insert(record);
        }
    }
}

/// Flip every unreported state row and build its announcement, in
/// (host, id) order. `last-seen` comes from the state row, which the
/// insert/update pass has already refreshed from the current window.
pub fn announce(
    state: &mut JobStates,
    jobs: &HashMap<JobKey, DeadweightJob>,
) -> Vec<DeadweightEvent> {
    state::take_unreported(state)
        .into_iter()
        .map(|entry| {
            let job = jobs.get(&entry.key());
            DeadweightEvent {
                hostname: entry.host.clone(),
                id: entry.id,
                user: job.map(|j| j.user.clone()).unwrap_or_default(),
                cmd: job.map(|j| j.cmd.clone()).unwrap_or_default(),
                started_on_or_before: entry
                    .started_on_or_before
                    .format(DATE_TIME_FORMAT)
                    .to_string(),
                first_violation: entry.first_violation.format(DATE_TIME_FORMAT).to_string(),
                last_seen: entry.last_seen.format(DATE_TIME_FORMAT).to_string(),
            }
        })
        .collect()
}

/// Render one announcement as its text paragraph.
pub fn format_event(event: &DeadweightEvent) -> JobReport {
    let mut body = String::new();
    let _ = writeln!(
        body,
        "New pointless job detected (zombie, defunct, or hung) on host \"{}\":",
        event.hostname
    );
    let _ = writeln!(body, "  Job#: {}", event.id);
    let _ = writeln!(body, "  User: {}", event.user);
    let _ = writeln!(body, "  Command: {}", event.cmd);
    let _ = writeln!(body, "  Started on or before: {}", event.started_on_or_before);
    let _ = writeln!(body, "  Violation first detected: {}", event.first_violation);
    let _ = writeln!(body, "  Last seen: {}", event.last_seen);
    JobReport {
        id: event.id,
        host: event.hostname.clone(),
        body,
    }
}
