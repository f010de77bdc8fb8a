//! Persistent per-job reporting state.
//!
//! One row per job key that has ever been reported or is pending report,
//! kept in free-CSV form so the data stay textual, diffable, and tolerant
//! of schema growth. Reading drops bogus rows silently; writing is atomic
//! and emits the canonical column order with rows sorted by key.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Duration, SecondsFormat, Utc};

use crate::freecsv::{self, Row};

/// `(job id, host)` identifies a job uniquely on these systems: job
/// numbers are not coordinated across hosts and no job spans hosts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub id: u32,
    pub host: String,
}

impl Ord for JobKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.host.cmp(&other.host).then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for JobKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One persistent row. Everything else needed for a report is looked up in
/// the current window's aggregated log data for the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobState {
    pub id: u32,
    pub host: String,
    /// Earliest `start` ever seen for the key; only ever moves earlier.
    pub started_on_or_before: DateTime<Utc>,
    /// Wall clock of the run in which the key first entered the state.
    pub first_violation: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// False until announced; never reverts.
    pub is_reported: bool,
}

impl JobState {
    pub fn key(&self) -> JobKey {
        JobKey {
            id: self.id,
            host: self.host.clone(),
        }
    }
}

pub type JobStates = HashMap<JobKey, JobState>;

/// Canonical on-disk column order.
pub const STATE_FIELDS: [&str; 6] = [
    "id",
    "host",
    "startedOnOrBefore",
    "firstViolation",
    "lastSeen",
    "isReported",
];

/// Read the state file, dropping rows that fail to parse.
pub fn read_job_state(data_path: &Path, filename: &str) -> Result<JobStates> {
    let rows = freecsv::read_free_csv(&data_path.join(filename))?;
    let mut state = JobStates::new();
    for row in &rows {
        let Some(entry) = parse_state_row(row) else {
            continue;
        };
        state.insert(entry.key(), entry);
    }
    Ok(state)
}

/// Like [`read_job_state`], but an absent state file is an empty state
/// rather than an error. The first invocation ever runs against nothing.
pub fn read_job_state_or_empty(data_path: &Path, filename: &str) -> Result<JobStates> {
    match read_job_state(data_path, filename) {
        Ok(state) => Ok(state),
        Err(err) => match err.downcast_ref::<io::Error>() {
            Some(io_err) if io_err.kind() == io::ErrorKind::NotFound => Ok(JobStates::new()),
            _ => Err(err),
        },
    }
}

fn parse_state_row(row: &Row) -> Option<JobState> {
    Some(JobState {
        id: freecsv::get_u32(row, "id")?,
        host: freecsv::get_str(row, "host")?.to_string(),
        started_on_or_before: freecsv::get_rfc3339(row, "startedOnOrBefore")?,
        first_violation: freecsv::get_rfc3339(row, "firstViolation")?,
        last_seen: freecsv::get_rfc3339(row, "lastSeen")?,
        is_reported: freecsv::get_bool(row, "isReported")?,
    })
}

/// Write the state atomically, rows sorted by key so files can be diffed.
pub fn write_job_state(data_path: &Path, filename: &str, state: &JobStates) -> Result<()> {
    let mut entries: Vec<&JobState> = state.values().collect();
    entries.sort_by(|a, b| a.host.cmp(&b.host).then(a.id.cmp(&b.id)));

    let rows: Vec<Row> = entries.into_iter().map(state_row).collect();
    freecsv::write_free_csv(&data_path.join(filename), &STATE_FIELDS, &rows)
}

fn state_row(entry: &JobState) -> Row {
    let rfc3339 = |t: DateTime<Utc>| t.to_rfc3339_opts(SecondsFormat::Secs, true);
    let mut row = Row::new();
    row.insert("id".to_string(), entry.id.to_string());
    row.insert("host".to_string(), entry.host.clone());
    row.insert(
        "startedOnOrBefore".to_string(),
        rfc3339(entry.started_on_or_before),
    );
    row.insert("firstViolation".to_string(), rfc3339(entry.first_violation));
    row.insert("lastSeen".to_string(), rfc3339(entry.last_seen));
    row.insert("isReported".to_string(), entry.is_reported.to_string());
    row
}

/// Fold one aggregated job into the state. A new key is inserted
/// unreported with `first_violation` stamped from the invocation clock
/// and counts as a candidate (returns true); an existing key refreshes
/// `last_seen` and tightens `started_on_or_before`.
pub fn ensure_job(
    state: &mut JobStates,
    id: u32,
    host: &str,
    start: DateTime<Utc>,
    now: DateTime<Utc>,
    last_seen: DateTime<Utc>,
) -> bool {
    let key = JobKey {
        id,
        host: host.to_string(),
    };
    match state.get_mut(&key) {
        Some(entry) => {
            entry.last_seen = last_seen;
            entry.started_on_or_before = entry.started_on_or_before.min(start);
            false
        }
        None => {
            state.insert(
                key,
                JobState {
                    id,
                    host: host.to_string(),
                    started_on_or_before: start,
                    first_violation: now,
                    last_seen,
                    is_reported: false,
                },
            );
            true
        }
    }
}

/// Remove rows that have been reported and not seen since the cutoff
/// `min(from, to - 2 days)`, bounding state growth while keeping ID reuse
/// at bay. Unreported rows are retained regardless of age so a job seen
/// once at the window edge is still announced. Returns the purge count.
pub fn purge_jobs(state: &mut JobStates, from: DateTime<Utc>, to: DateTime<Utc>) -> usize {
    let cutoff = from.min(to - Duration::days(2));
    let before = state.len();
    state.retain(|_, entry| !(entry.is_reported && entry.last_seen < cutoff));
    before - state.len()
}

/// Mark every unreported row as reported and return copies of them in
/// (host, id) order; these are the announcements of this run.
pub fn take_unreported(state: &mut JobStates) -> Vec<JobState> {
    let mut keys: Vec<JobKey> = state
        .iter()
        .filter(|(_, entry)| !entry.is_reported)
        .map(|(key, _)| key.clone())
        .collect();
    keys.sort();

    let mut announced = Vec::with_capacity(keys.len());
    for key in &keys {
        if let Some(entry) = state.get_mut(key) {
            entry.is_reported = true;
            announced.push(entry.clone());
        }
    }
    announced
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn sample_state() -> JobState {
        JobState {
            id: 10,
            host: "hello".to_string(),
            started_on_or_before: utc(2023, 6, 14, 16, 0, 0),
            first_violation: utc(2023, 6, 15, 10, 20, 30),
            last_seen: utc(2023, 9, 11, 15, 37, 0),
            is_reported: false,
        }
    }

    #[test]
    fn test_write_emits_canonical_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let entry = sample_state();
        let mut state = JobStates::new();
        state.insert(entry.key(), entry);

        write_job_state(dir.path(), "jobstate.csv", &state).expect("write");
        let contents = fs::read_to_string(dir.path().join("jobstate.csv")).expect("read");
        assert_eq!(
            contents,
            "id=10,host=hello,startedOnOrBefore=2023-06-14T16:00:00Z,\
             firstViolation=2023-06-15T10:20:30Z,lastSeen=2023-09-11T15:37:00Z,isReported=false\n"
        );
    }

    #[test]
    fn test_round_trip_preserves_all_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let entry = sample_state();
        let mut state = JobStates::new();
        state.insert(entry.key(), entry);

        write_job_state(dir.path(), "jobstate.csv", &state).expect("write");
        let read_back = read_job_state(dir.path(), "jobstate.csv").expect("read");
        assert_eq!(read_back, state);
    }

    #[test]
    fn test_rows_are_written_in_key_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut state = JobStates::new();
        for (id, host) in [(7u32, "zeta"), (12, "alpha"), (3, "alpha")] {
            let entry = JobState {
                id,
                host: host.to_string(),
                ..sample_state()
            };
            state.insert(entry.key(), entry);
        }
        write_job_state(dir.path(), "jobstate.csv", &state).expect("write");
        let contents = fs::read_to_string(dir.path().join("jobstate.csv")).expect("read");
        let ids: Vec<&str> = contents
            .lines()
            .map(|line| line.split(',').next().unwrap())
            .collect();
        assert_eq!(ids, vec!["id=3", "id=12", "id=7"]);
    }

    #[test]
    fn test_bogus_rows_are_dropped() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("jobstate.csv"),
            "id=10,host=hello,startedOnOrBefore=2023-06-14T16:00:00Z,\
             firstViolation=2023-06-15T10:20:30Z,lastSeen=2023-09-11T15:37:00Z,isReported=false\n\
             id=notanumber,host=bad\n",
        )
        .expect("seed");
        let state = read_job_state(dir.path(), "jobstate.csv").expect("read");
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_missing_state_file_is_empty_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = read_job_state_or_empty(dir.path(), "cpuhog-state.csv").expect("read");
        assert!(state.is_empty());
        // A plain read still reports the error.
        assert!(read_job_state(dir.path(), "cpuhog-state.csv").is_err());
    }

    #[test]
    fn test_ensure_job_inserts_unreported_candidate() {
        let mut state = JobStates::new();
        let now = utc(2023, 9, 10, 12, 0, 0);
        let inserted = ensure_job(
            &mut state,
            42,
            "ml3",
            utc(2023, 9, 9, 7, 35, 0),
            now,
            utc(2023, 9, 9, 12, 0, 0),
        );
        assert!(inserted);
        let entry = &state[&JobKey { id: 42, host: "ml3".to_string() }];
        assert_eq!(entry.first_violation, now);
        assert_eq!(entry.started_on_or_before, utc(2023, 9, 9, 7, 35, 0));
        assert!(!entry.is_reported);
    }

    #[test]
    fn test_ensure_job_updates_and_tightens() {
        let mut state = JobStates::new();
        let now1 = utc(2023, 9, 10, 12, 0, 0);
        ensure_job(
            &mut state,
            42,
            "ml3",
            utc(2023, 9, 9, 7, 35, 0),
            now1,
            utc(2023, 9, 9, 12, 0, 0),
        );
        let now2 = utc(2023, 9, 11, 12, 0, 0);
        let inserted = ensure_job(
            &mut state,
            42,
            "ml3",
            utc(2023, 9, 8, 6, 0, 0),
            now2,
            utc(2023, 9, 11, 10, 0, 0),
        );
        assert!(!inserted);
        let entry = &state[&JobKey { id: 42, host: "ml3".to_string() }];
        // firstViolation is pinned to the run that first saw the key.
        assert_eq!(entry.first_violation, now1);
        assert_eq!(entry.started_on_or_before, utc(2023, 9, 8, 6, 0, 0));
        assert_eq!(entry.last_seen, utc(2023, 9, 11, 10, 0, 0));
    }

    #[test]
    fn test_purge_reported_and_stale_only() {
        let mut state = JobStates::new();
        let mut add = |id: u32, last_seen, is_reported| {
            let entry = JobState {
                id,
                last_seen,
                is_reported,
                ..sample_state()
            };
            state.insert(entry.key(), entry);
        };
        // Reported and stale: purged (scenario from the purge boundary).
        add(1, utc(2023, 6, 1, 0, 0, 0), true);
        // Reported but recent: kept.
        add(2, utc(2023, 6, 10, 0, 0, 0), true);
        // Stale but unreported: kept.
        add(3, utc(2023, 6, 1, 0, 0, 0), false);

        let purged = purge_jobs(
            &mut state,
            utc(2023, 6, 9, 0, 0, 0),
            utc(2023, 6, 11, 0, 0, 0),
        );
        assert_eq!(purged, 1);
        assert!(!state.contains_key(&JobKey { id: 1, host: "hello".to_string() }));
        assert!(state.contains_key(&JobKey { id: 2, host: "hello".to_string() }));
        assert!(state.contains_key(&JobKey { id: 3, host: "hello".to_string() }));
    }

    #[test]
    fn test_purge_cutoff_is_bounded_by_from() {
        let mut state = JobStates::new();
        let entry = JobState {
            last_seen: utc(2023, 6, 5, 0, 0, 0),
            is_reported: true,
            ..sample_state()
        };
        state.insert(entry.key(), entry);

        // Seeding with an early from keeps rows the 2-day rule would drop.
        let purged = purge_jobs(
            &mut state,
            utc(2023, 6, 1, 0, 0, 0),
            utc(2023, 6, 11, 0, 0, 0),
        );
        assert_eq!(purged, 0);
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_take_unreported_flips_and_orders() {
        let mut state = JobStates::new();
        for (id, host, is_reported) in [
            (7u32, "zeta", false),
            (12, "alpha", false),
            (3, "alpha", false),
            (1, "alpha", true),
        ] {
            let entry = JobState {
                id,
                host: host.to_string(),
                is_reported,
                ..sample_state()
            };
            state.insert(entry.key(), entry);
        }

        let announced = take_unreported(&mut state);
        let keys: Vec<(String, u32)> = announced
            .iter()
            .map(|e| (e.host.clone(), e.id))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("alpha".to_string(), 3),
                ("alpha".to_string(), 12),
                ("zeta".to_string(), 7),
            ]
        );
        assert!(state.values().all(|e| e.is_reported));

        // Second pass announces nothing.
        assert!(take_unreported(&mut state).is_empty());
    }

    fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
        // Positive epoch seconds well inside the representable range.
        (0i64..4_000_000_000).prop_map(|secs| Utc.timestamp_opt(secs, 0).unwrap())
    }

    fn arb_state() -> impl Strategy<Value = JobState> {
        (
            any::<u32>(),
            "[a-z][a-z0-9.-]{0,12}",
            arb_timestamp(),
            arb_timestamp(),
            arb_timestamp(),
            any::<bool>(),
        )
            .prop_map(|(id, host, a, b, c, is_reported)| JobState {
                id,
                host,
                started_on_or_before: a,
                first_violation: b,
                last_seen: c,
                is_reported,
            })
    }

    proptest! {
        #[test]
        fn prop_state_round_trip(entries in proptest::collection::vec(arb_state(), 0..8)) {
            let dir = tempfile::tempdir().expect("tempdir");
            let mut state = JobStates::new();
            for entry in entries {
                state.insert(entry.key(), entry);
            }
            write_job_state(dir.path(), "state.csv", &state).expect("write");
            let read_back = read_job_state(dir.path(), "state.csv").expect("read");
            prop_assert_eq!(read_back, state);
        }

        #[test]
        fn prop_purge_correctness(
            entries in proptest::collection::vec(arb_state(), 0..16),
            from in arb_timestamp(),
            to in arb_timestamp(),
        ) {
            let mut state = JobStates::new();
            for entry in entries {
                state.insert(entry.key(), entry);
            }
            let unreported_before: Vec<JobKey> = state
                .values()
                .filter(|e| !e.is_reported)
                .map(JobState::key)
                .collect();

            purge_jobs(&mut state, from, to);

            let cutoff = from.min(to - Duration::days(2));
            for entry in state.values() {
                prop_assert!(!(entry.is_reported && entry.last_seen < cutoff));
            }
            for key in &unreported_before {
                prop_assert!(state.contains_key(key));
            }
        }

        #[test]
        fn prop_each_key_announced_exactly_once(
            entries in proptest::collection::vec(arb_state(), 0..16),
        ) {
            let mut state = JobStates::new();
            for mut entry in entries {
                entry.is_reported = false;
                state.insert(entry.key(), entry);
            }
            let expected = state.len();

            let mut announced = 0usize;
            // Repeated reconciliation passes over an unchanging job set.
            for _ in 0..3 {
                announced += take_unreported(&mut state).len();
            }
            prop_assert_eq!(announced, expected);
        }
    }
}
