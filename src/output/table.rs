use chrono::{DateTime, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::importer::ImportJob;
use crate::indexer::{BuildReport, IndexStats};
use crate::search::SearchResults;
use crate::sync::{AccountStatus, SyncOutcome};

const FROM_WIDTH: usize = 24;
const SUBJECT_WIDTH: usize = 48;
const DATE_WIDTH: usize = 12;
const PATH_WIDTH: usize = 40;
const ACCOUNT_WIDTH: usize = 36;

pub fn format_search_results(results: &SearchResults) -> String {
    if results.hits.is_empty() {
        return match results.total {
            0 => "No emails found.".to_string(),
            total => format!("No emails on this page ({total} matches, offset {}).", results.offset),
        };
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<date$}  {:<from$}  {:<subject$}  {}\n",
        "Date",
        "From",
        "Subject",
        "Path",
        date = DATE_WIDTH,
        from = FROM_WIDTH,
        subject = SUBJECT_WIDTH,
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}\n",
        "-".repeat(DATE_WIDTH),
        "-".repeat(FROM_WIDTH),
        "-".repeat(SUBJECT_WIDTH),
        "-".repeat(PATH_WIDTH)
    ));

    for hit in &results.hits {
        let date = hit
            .date
            .as_ref()
            .map(relative_date)
            .unwrap_or_else(|| "-".to_string());
        let from = if hit.from.is_empty() { "(unknown)" } else { &hit.from };
        let subject = if hit.subject.is_empty() {
            "(no subject)"
        } else {
            &hit.subject
        };

        out.push_str(&format!(
            "{}  {}  {}  {}\n",
            pad(&truncate_for_width(&date, DATE_WIDTH), DATE_WIDTH),
            pad(&truncate_for_width(from, FROM_WIDTH), FROM_WIDTH),
            pad(&truncate_for_width(subject, SUBJECT_WIDTH), SUBJECT_WIDTH),
            truncate_for_width(&hit.path, PATH_WIDTH)
        ));
        if let Some(snippet) = &hit.snippet {
            out.push_str(&format!("    {}\n", truncate_for_width(snippet, 100)));
        }
    }

    let shown_from = results.offset + 1;
    let shown_to = results.offset + results.hits.len();
    out.push_str(&format!(
        "\n{shown_from}-{shown_to} of {} matches\n",
        results.total
    ));
    out
}

pub fn format_status(statuses: &[AccountStatus]) -> String {
    if statuses.is_empty() {
        return "No accounts configured.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!(
        "{:<account$}  {:<6}  {:<10}  {:<12}  {:>5}  {}\n",
        "Account",
        "Proto",
        "State",
        "Last sync",
        "New",
        "Detail",
        account = ACCOUNT_WIDTH,
    ));
    out.push_str(&format!(
        "{}  ------  ----------  ------------  -----  ------\n",
        "-".repeat(ACCOUNT_WIDTH)
    ));

    for status in statuses {
        let state = if status.syncing {
            "syncing".to_string()
        } else if !status.enabled {
            "disabled".to_string()
        } else {
            status
                .last_status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "never".to_string())
        };
        let detail = if status.syncing {
            status.progress.clone().unwrap_or_default()
        } else {
            status.last_error.clone().unwrap_or_default()
        };

        out.push_str(&format!(
            "{}  {:<6}  {:<10}  {:<12}  {:>5}  {}\n",
            pad(&truncate_for_width(&status.email, ACCOUNT_WIDTH), ACCOUNT_WIDTH),
            status.protocol.to_string(),
            state,
            status
                .last_sync
                .as_ref()
                .map(relative_date)
                .unwrap_or_else(|| "-".to_string()),
            status
                .new_messages
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string()),
            truncate_for_width(&detail, 60)
        ));
    }

    out
}

pub fn format_sync_outcomes(outcomes: &[SyncOutcome]) -> String {
    if outcomes.is_empty() {
        return "Nothing to sync.".to_string();
    }

    let mut out = String::new();
    for outcome in outcomes {
        out.push_str(&format!(
            "{}: {} ({} new, {} skipped, {} folders",
            outcome.account_id,
            outcome.status,
            outcome.report.new_messages,
            outcome.report.skipped,
            outcome.report.folders
        ));
        if !outcome.report.errors.is_empty() {
            out.push_str(&format!(", {} item errors", outcome.report.errors.len()));
        }
        out.push(')');
        if let Some(error) = &outcome.error {
            out.push_str(&format!("\n    {error}"));
        }
        out.push('\n');
    }
    out
}

pub fn format_import(job: &ImportJob) -> String {
    let mut out = String::new();
    out.push_str(&format!("Import:  {}\n", job.filename));
    out.push_str(&format!("Job:     {}\n", job.id));
    if let Some(account_id) = &job.account_id {
        out.push_str(&format!("Account: {account_id}\n"));
    }
    out.push_str(&format!("Phase:   {} ({}/{})\n", job.phase, job.current, job.total));
    if let Some(error) = &job.error {
        out.push_str(&format!("Error:   {error}\n"));
    }
    out
}

pub fn format_build_report(report: &BuildReport) -> String {
    format!(
        "Indexed {} messages in {} ms ({} duplicates, {} unreadable){}\n",
        report.indexed,
        report.elapsed_ms,
        report.duplicates,
        report.errors,
        if report.snapshot_saved {
            ""
        } else {
            "; snapshot not saved"
        }
    )
}

pub fn format_stats(stats: &IndexStats) -> String {
    let mut out = String::new();
    out.push_str("Index Stats\n");
    out.push_str("===========\n");
    out.push_str(&format!("Emails:     {}\n", stats.total_emails));
    out.push_str(&format!(
        "Indexed at: {}\n",
        stats
            .indexed_at
            .map(|at| format!("{} ({})", at.to_rfc3339(), relative_date(&at)))
            .unwrap_or_else(|| "never".to_string())
    ));
    out.push_str(&format!("Archive:    {}\n", stats.archive_dir.display()));
    out.push_str(&format!("Snapshot:   {}\n", stats.snapshot_path.display()));
    out
}

fn relative_date(at: &DateTime<Utc>) -> String {
    let delta = Utc::now().signed_duration_since(*at);
    if delta.num_seconds() < 0 {
        return at.format("%Y-%m-%d").to_string();
    }
    if delta.num_minutes() < 1 {
        return "just now".to_string();
    }
    if delta.num_hours() < 1 {
        return format!("{}m ago", delta.num_minutes());
    }
    if delta.num_hours() < 24 {
        return format!("{}h ago", delta.num_hours());
    }
    if delta.num_days() == 1 {
        return "yesterday".to_string();
    }
    if delta.num_days() < 7 {
        return format!("{}d ago", delta.num_days());
    }
    at.format("%Y-%m-%d").to_string()
}

/// Right-pads by display width; `format!` pads by char count.
fn pad(value: &str, width: usize) -> String {
    let used = UnicodeWidthStr::width(value);
    format!("{value}{}", " ".repeat(width.saturating_sub(used)))
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }
    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use unicode_width::UnicodeWidthStr;

    use super::{format_search_results, format_status, truncate_for_width};
    use crate::config::Protocol;
    use crate::db::models::JobStatus;
    use crate::search::{SearchHit, SearchResults};
    use crate::sync::AccountStatus;

    fn results(hits: Vec<SearchHit>, total: usize, offset: usize) -> SearchResults {
        SearchResults {
            query: "meeting".to_string(),
            total,
            offset,
            limit: 10,
            hits,
            indexed_at: None,
        }
    }

    #[test]
    fn search_table_has_headers_and_footer() {
        let hit = SearchHit {
            account_id: None,
            path: "inbox/0123456789abcdef-1.eml".to_string(),
            subject: "Meeting about the quarterly numbers, which runs far past the column".to_string(),
            from: "Alice <alice@example.com>".to_string(),
            to: "bob@example.com".to_string(),
            date: Some(Utc::now() - Duration::hours(2)),
            size: 100,
            snippet: Some("Meeting about".to_string()),
        };
        let rendered = format_search_results(&results(vec![hit], 3, 0));
        assert!(rendered.contains("Subject"));
        assert!(rendered.contains("2h ago"));
        assert!(rendered.contains("…"));
        assert!(rendered.contains("1-1 of 3 matches"));
    }

    #[test]
    fn empty_pages_say_why() {
        assert_eq!(format_search_results(&results(vec![], 0, 0)), "No emails found.");
        assert!(format_search_results(&results(vec![], 4, 10)).contains("4 matches"));
    }

    #[test]
    fn status_table_shows_failures() {
        let rendered = format_status(&[AccountStatus {
            account_id: "a1".to_string(),
            protocol: Protocol::Imap,
            email: "me@example.com".to_string(),
            enabled: true,
            syncing: false,
            progress: None,
            started_at: None,
            last_sync: Some(Utc::now() - Duration::days(3)),
            last_status: Some(JobStatus::Failed),
            new_messages: Some(4),
            last_error: Some("sync cancelled".to_string()),
        }]);
        assert!(rendered.contains("failed"));
        assert!(rendered.contains("3d ago"));
        assert!(rendered.contains("sync cancelled"));
    }

    #[test]
    fn truncation_respects_wide_chars() {
        let truncated = truncate_for_width("日本語のメール件名", 7);
        assert!(UnicodeWidthStr::width(truncated.as_str()) <= 7);
        assert!(truncated.ends_with('…'));
    }
}
