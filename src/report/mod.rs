//! Shared surface for the violation report verbs: common options and the
//! sortable collection of per-job text paragraphs.

use std::path::PathBuf;

/// Options common to the violation report verbs, handed down from the CLI.
#[derive(Debug, Clone)]
pub struct ReportOptions {
    /// Root of the data store, absolute.
    pub data_path: PathBuf,
    /// Raw `--from` specifier.
    pub from: String,
    /// Raw `--to` specifier, absent means now.
    pub to: Option<String>,
    /// Emit the report as a JSON array instead of text paragraphs.
    pub json: bool,
}

/// One report paragraph tagged with its job key for sorting.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub id: u32,
    pub host: String,
    pub body: String,
}

/// Order by ascending host name first and job id second. The sort is
/// stable, so entries sharing a key keep their insertion order.
pub fn sort_reports(reports: &mut [JobReport]) {
    reports.sort_by(|a, b| a.host.cmp(&b.host).then(a.id.cmp(&b.id)));
}

/// Render the paragraphs with one blank line between them. Bodies end in
/// a newline of their own.
pub fn render_text(reports: &[JobReport]) -> String {
    reports
        .iter()
        .map(|report| report.body.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: u32, host: &str, body: &str) -> JobReport {
        JobReport {
            id,
            host: host.to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_sort_by_host_then_id() {
        let mut reports = vec![
            report(7, "zeta", "z7\n"),
            report(12, "alpha", "a12\n"),
            report(3, "alpha", "a3\n"),
        ];
        sort_reports(&mut reports);
        let order: Vec<(&str, u32)> = reports.iter().map(|r| (r.host.as_str(), r.id)).collect();
        assert_eq!(order, vec![("alpha", 3), ("alpha", 12), ("zeta", 7)]);
    }

    #[test]
    fn test_sort_is_stable_for_equal_keys() {
        let mut reports = vec![
            report(3, "alpha", "first\n"),
            report(3, "alpha", "second\n"),
        ];
        sort_reports(&mut reports);
        assert_eq!(reports[0].body, "first\n");
        assert_eq!(reports[1].body, "second\n");
    }

    #[test]
    fn test_render_separates_paragraphs_with_blank_line() {
        let reports = vec![report(1, "a", "one\n"), report(2, "a", "two\n")];
        assert_eq!(render_text(&reports), "one\n\ntwo\n");
    }

    #[test]
    fn test_render_empty_is_empty() {
        assert_eq!(render_text(&[]), "");
    }
}
