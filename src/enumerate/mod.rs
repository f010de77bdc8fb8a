//! Enumeration of daily log files under a `root/YYYY/MM/DD/` tree.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Datelike;
use glob::Pattern;

use crate::window::Window;

/// Find the files matching `pattern` in the day directories of the window,
/// one UTC day at a time. `pattern` is a glob over file names only, no
/// path components. Matches within a day come in lexicographic name order;
/// days with no directory contribute nothing. The returned paths are
/// relative to `root` and must be re-joined with it before opening.
pub fn enumerate_files(root: &Path, window: &Window, pattern: &str) -> Result<Vec<PathBuf>> {
    let pattern =
        Pattern::new(pattern).with_context(|| format!("invalid file pattern {pattern:?}"))?;

    let mut files = Vec::new();
    let mut day = window.from.date_naive();
    let end = window.to.date_naive();
    while day < end {
        let rel = format!("{:04}/{:02}/{:02}", day.year(), day.month(), day.day());
        if let Ok(entries) = fs::read_dir(root.join(&rel)) {
            let mut names: Vec<String> = entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().into_string().ok())
                .filter(|name| pattern.matches(name))
                .collect();
            names.sort();
            files.extend(names.into_iter().map(|name| PathBuf::from(&rel).join(name)));
        }
        day = day.succ_opt().context("window end out of calendar range")?;
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::{TimeZone, Utc};

    use super::*;

    fn window(from: (i32, u32, u32), to: (i32, u32, u32)) -> Window {
        Window {
            from: Utc.with_ymd_and_hms(from.0, from.1, from.2, 0, 0, 0).unwrap(),
            to: Utc.with_ymd_and_hms(to.0, to.1, to.2, 0, 0, 0).unwrap(),
        }
    }

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        fs::write(&path, b"").expect("touch");
    }

    #[test]
    fn test_enumerates_days_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "2023/09/03/cpuhog.csv");
        touch(dir.path(), "2023/09/04/cpuhog.csv");
        touch(dir.path(), "2023/09/05/cpuhog.csv");

        let files = enumerate_files(dir.path(), &window((2023, 9, 3), (2023, 9, 5)), "cpuhog.csv")
            .expect("enumerate");
        assert_eq!(
            files,
            vec![
                PathBuf::from("2023/09/03/cpuhog.csv"),
                PathBuf::from("2023/09/04/cpuhog.csv"),
            ]
        );
    }

    #[test]
    fn test_missing_day_directories_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "2023/09/03/cpuhog.csv");
        touch(dir.path(), "2023/09/06/cpuhog.csv");

        let files = enumerate_files(dir.path(), &window((2023, 9, 1), (2023, 9, 7)), "cpuhog.csv")
            .expect("enumerate");
        assert_eq!(
            files,
            vec![
                PathBuf::from("2023/09/03/cpuhog.csv"),
                PathBuf::from("2023/09/06/cpuhog.csv"),
            ]
        );
    }

    #[test]
    fn test_glob_pattern_and_name_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "2023/05/30/ml8.example.org.csv");
        touch(dir.path(), "2023/05/30/ml6.example.org.csv");
        touch(dir.path(), "2023/05/30/notes.txt");

        let files = enumerate_files(dir.path(), &window((2023, 5, 30), (2023, 5, 31)), "ml*.csv")
            .expect("enumerate");
        assert_eq!(
            files,
            vec![
                PathBuf::from("2023/05/30/ml6.example.org.csv"),
                PathBuf::from("2023/05/30/ml8.example.org.csv"),
            ]
        );
    }

    #[test]
    fn test_month_and_day_are_zero_padded() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "2023/01/05/x.csv");
        // A non-padded sibling must not match.
        touch(dir.path(), "2023/1/5/x.csv");

        let files = enumerate_files(dir.path(), &window((2023, 1, 5), (2023, 1, 6)), "*.csv")
            .expect("enumerate");
        assert_eq!(files, vec![PathBuf::from("2023/01/05/x.csv")]);
    }

    #[test]
    fn test_empty_window_yields_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        touch(dir.path(), "2023/09/03/cpuhog.csv");
        let files = enumerate_files(dir.path(), &window((2023, 9, 3), (2023, 9, 3)), "cpuhog.csv")
            .expect("enumerate");
        assert!(files.is_empty());
    }

    #[test]
    fn test_bad_pattern_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(enumerate_files(dir.path(), &window((2023, 9, 3), (2023, 9, 4)), "[").is_err());
    }
}
