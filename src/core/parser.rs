//! Scrapers for duplicity's human-readable output.
//!
//! The patterns track duplicity's text format, so callers go through
//! [`OutputParser`] and never see a regex.

use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;
use tracing::{debug, warn};

use super::models::{FileEntry, StatusReport};

/// Normalised form of chain timestamps.
pub const CHAIN_TIME_FORMAT: &str = "%Y-%m-%d %H:%M";

// ctime layout after whitespace is collapsed: "Mon Jan 1 00:00:00 2024"
const CTIME_FORMAT: &str = "%a %b %d %H:%M:%S %Y";

// "<weekday> <month> <day time year> <path>"
static LISTING_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[a-zA-Z]{3} [a-zA-Z]{3} [0-9 :]+(.*)$").expect("valid listing pattern")
});

static CHAIN_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Chain start time: ([^\n]+)").expect("valid pattern"));
static CHAIN_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Chain end time: ([^\n]+)").expect("valid pattern"));
static BACKUP_SETS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Number of contained backup sets: ([0-9]+)").expect("valid pattern")
});
static SOURCE_FILES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"SourceFiles ([0-9]+)").expect("valid pattern"));
static SOURCE_FILE_SIZE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"SourceFileSize [0-9]+ \(([^)]+)\)").expect("valid pattern"));
static BACKUP_VOLUMES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Total number of contained volumes: ([0-9]+)").expect("valid pattern")
});

/// Turns captured stdout into structured results.
pub trait OutputParser: Send + Sync {
    fn parse_file_list(&self, stdout: &str) -> Vec<FileEntry>;
    fn parse_status(&self, stdout: &str) -> StatusReport;
}

/// Parser for the text format of duplicity 0.7/0.8.
#[derive(Debug, Clone, Copy, Default)]
pub struct DuplicityParser;

impl OutputParser for DuplicityParser {
    fn parse_file_list(&self, stdout: &str) -> Vec<FileEntry> {
        LISTING_LINE
            .captures_iter(stdout)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().trim_end_matches('\r'))
            .filter(|path| *path != "." && *path != "..")
            .map(FileEntry::from_path)
            .collect()
    }

    fn parse_status(&self, stdout: &str) -> StatusReport {
        StatusReport {
            chain_start_time: first_capture(&CHAIN_START, stdout)
                .map(normalize_chain_time)
                .unwrap_or_default(),
            chain_end_time: first_capture(&CHAIN_END, stdout)
                .map(normalize_chain_time)
                .unwrap_or_default(),
            backup_sets: first_capture(&BACKUP_SETS, stdout).unwrap_or_default().into(),
            backup_volumes: first_capture(&BACKUP_VOLUMES, stdout)
                .unwrap_or_default()
                .into(),
            source_files: first_capture(&SOURCE_FILES, stdout).unwrap_or_default().into(),
            source_file_size: first_capture(&SOURCE_FILE_SIZE, stdout)
                .unwrap_or_default()
                .into(),
        }
    }
}

fn first_capture<'a>(re: &Regex, haystack: &'a str) -> Option<&'a str> {
    let found = re
        .captures(haystack)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str());
    if found.is_none() {
        debug!(pattern = re.as_str(), "No match in status output");
    }
    found
}

/// Reformat a ctime-style timestamp as `YYYY-MM-DD HH:MM`. Unparseable input yields "".
pub fn normalize_chain_time(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    match NaiveDateTime::parse_from_str(&collapsed, CTIME_FORMAT) {
        Ok(ts) => ts.format(CHAIN_TIME_FORMAT).to_string(),
        Err(e) => {
            warn!(raw, error = %e, "Unrecognised chain timestamp");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLLECTION_STATUS: &str = "\
Local and Remote metadata are synchronized, no sync needed.
Last full backup date: Mon Jan  1 00:00:00 2024
Collection Status
-----------------
Connecting with backend: BackendWrapper
Archive dir: /root/.cache/duplicity/abc

Found 0 secondary backup chains.

Found primary backup chain with matching signature chain:
-------------------------
Chain start time: Mon Jan  1 00:00:00 2024
Chain end time: Sat Mar 16 14:05:09 2024
Number of contained backup sets: 3
Total number of contained volumes: 7
 Type of backup set:                            Time:      Num volumes:
                Full         Mon Jan  1 00:00:00 2024                 5
         Incremental         Fri Feb  2 10:00:00 2024                 1
         Incremental         Sat Mar 16 14:05:09 2024                 1
-------------------------
No orphaned or incomplete backup sets found.
--------------[ Backup Statistics ]--------------
StartTime 1710597909.51 (Sat Mar 16 14:05:09 2024)
SourceFiles 1289
SourceFileSize 52428800 (50.0 MB)
NewFiles 0
";

    #[test]
    fn listing_skips_dot_entries() {
        let stdout = "Mon Jan  1 00:00:00 2024 some/dir/file.txt\nMon Jan  1 00:00:00 2024 .\n";
        let entries = DuplicityParser.parse_file_list(stdout);
        assert_eq!(entries, vec![FileEntry {
            path: "some/dir/file.txt".into(),
            dir: "some/dir".into(),
            name: "file.txt".into(),
        }]);
    }

    #[test]
    fn listing_ignores_noise_lines() {
        let stdout = "\
Local and Remote metadata are synchronized, no sync needed.
Last full backup date: Mon Jan  1 00:00:00 2024
Mon Jan  1 00:00:00 2024 .
Tue Jan  2 12:30:00 2024 docs
Tue Jan  2 12:30:00 2024 docs/report.pdf
Wed Jan 10 08:15:42 2024 notes.txt
Wed Jan 10 08:15:42 2024 ..
";
        let entries = DuplicityParser.parse_file_list(stdout);
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["docs", "docs/report.pdf", "notes.txt"]);
        assert_eq!(entries[0].dir, ".");
        assert_eq!(entries[1].dir, "docs");
        assert_eq!(entries[1].name, "report.pdf");
    }

    #[test]
    fn listing_tolerates_crlf() {
        let entries = DuplicityParser.parse_file_list("Mon Jan  1 00:00:00 2024 a/b\r\n");
        assert_eq!(entries[0].name, "b");
    }

    #[test]
    fn status_extracts_every_field() {
        let report = DuplicityParser.parse_status(COLLECTION_STATUS);
        assert_eq!(report, StatusReport {
            chain_start_time: "2024-01-01 00:00".into(),
            chain_end_time: "2024-03-16 14:05".into(),
            backup_sets: "3".into(),
            backup_volumes: "7".into(),
            source_files: "1289".into(),
            source_file_size: "50.0 MB".into(),
        });
    }

    #[test]
    fn status_minimal_lines() {
        let stdout = "Chain start time: Mon Jan  1 00:00:00 2024\nNumber of contained backup sets: 3\n";
        let report = DuplicityParser.parse_status(stdout);
        assert_eq!(report.backup_sets, "3");
        assert_eq!(report.chain_start_time, "2024-01-01 00:00");
        assert_eq!(report.chain_end_time, "");
    }

    #[test]
    fn status_without_matches_is_all_empty() {
        let report = DuplicityParser.parse_status("nothing to see here\n");
        assert_eq!(report, StatusReport::default());
    }

    #[test]
    fn first_match_wins() {
        let stdout = "SourceFiles 10\nSourceFiles 20\n";
        assert_eq!(DuplicityParser.parse_status(stdout).source_files, "10");
    }

    #[test]
    fn bad_timestamp_normalizes_to_empty() {
        assert_eq!(normalize_chain_time("not a date"), "");
        assert_eq!(normalize_chain_time("Thu Dec 31 23:59:01 2099"), "2099-12-31 23:59");
    }
}
