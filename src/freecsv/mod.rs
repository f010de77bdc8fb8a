//! Reader, writer, and typed field accessors for "free CSV" files: CSV
//! syntax, but every field is `name=value`, rows may be arbitrarily wide
//! and uneven, and column order carries no meaning.
//!
//! I/O errors are propagated to the caller. Rows and fields that are
//! illegal on input are silently dropped; the logs evolve over time and a
//! new or missing column must never abort a file.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use tempfile::NamedTempFile;

use crate::window::DATE_TIME_FORMAT;

/// One row, as an order-insensitive mapping from field name to raw value.
pub type Row = HashMap<String, String>;

/// Read a free-CSV file into a list of row mappings.
pub fn read_free_csv(path: &Path) -> Result<Vec<Row>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    parse_free_csv(BufReader::new(file))
}

/// Parse free-CSV from any byte stream (a file, or subprocess stdout).
pub fn parse_free_csv<R: Read>(input: R) -> Result<Vec<Row>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(input);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(err) if err.is_io_error() => {
                return Err(err).context("reading free-CSV input");
            }
            // Undecodable record, drop it.
            Err(_) => continue,
        };

        let mut row = Row::new();
        for field in record.iter() {
            // A field without `=` is illegal syntax; drop the field.
            if let Some((name, value)) = field.split_once('=') {
                row.insert(name.to_string(), value.to_string());
            }
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Write rows as free-CSV. Of each row, only the columns named in `fields`
/// are written, in that order; rows containing none of them are skipped.
///
/// The file is replaced atomically: the bytes go to a temp file in the
/// destination directory which is then renamed over the target, so readers
/// and crash recovery always observe a complete previous or current file.
pub fn write_free_csv(path: &Path, fields: &[&str], rows: &[Row]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;

    {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(tmp.as_file());
        for row in rows {
            let mut record = Vec::new();
            for name in fields {
                if let Some(value) = row.get(*name) {
                    record.push(format!("{name}={value}"));
                }
            }
            if !record.is_empty() {
                writer
                    .write_record(&record)
                    .with_context(|| format!("writing {}", path.display()))?;
            }
        }
        writer
            .flush()
            .with_context(|| format!("writing {}", path.display()))?;
    }

    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("renaming temp file over {}", path.display()))?;
    Ok(())
}

// Typed accessors. Each returns `None` on a missing field or parse error;
// callers chain them with `?` in a per-row parse function and drop the row
// when any accessor fails.

pub fn get_str<'a>(row: &'a Row, name: &str) -> Option<&'a str> {
    row.get(name).map(String::as_str)
}

pub fn get_u32(row: &Row, name: &str) -> Option<u32> {
    row.get(name)?.parse().ok()
}

pub fn get_f64(row: &Row, name: &str) -> Option<f64> {
    row.get(name)?.parse().ok()
}

pub fn get_bool(row: &Row, name: &str) -> Option<bool> {
    row.get(name)?.parse().ok()
}

/// RFC3339 timestamp, normalized to UTC.
pub fn get_rfc3339(row: &Row, name: &str) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(row.get(name)?).ok()?;
    Some(parsed.with_timezone(&Utc))
}

/// `YYYY-MM-DD HH:MM` wall-clock timestamp, interpreted as UTC.
pub fn get_date_time(row: &Row, name: &str) -> Option<DateTime<Utc>> {
    let parsed = NaiveDateTime::parse_from_str(row.get(name)?, DATE_TIME_FORMAT).ok()?;
    Some(parsed.and_utc())
}

/// Job id with an optional trailing `<`, `>`, or `!` marker indicating
/// liveness at the window edges. The marker is stripped.
pub fn get_job_id(row: &Row, name: &str) -> Option<u32> {
    row.get(name)?.trim_end_matches(['<', '>', '!']).parse().ok()
}
