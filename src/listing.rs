//! Mirror directory-listing parser.
//!
//! The BLS LABSTAT mirror serves a bare HTML page per series:
//!
//! ```text
//! 1/29/2026  8:30 AM      1234567 <A HREF="/pub/time.series/pr/pr.data.0.Current">pr.data.0.Current</A><br>
//! ```
//!
//! Parsing is deliberately permissive: extra whitespace and `-` as "no size"
//! are tolerated, and rows that do not match are skipped (and counted) rather
//! than failing the whole listing.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use regex::Regex;

use crate::models::RemoteFile;

/// A parsed listing plus how many rows were dropped on the floor.
#[derive(Debug, Default)]
pub struct Listing {
    pub files: Vec<RemoteFile>,
    pub skipped_rows: usize,
}

/// Parse a directory-listing page into remote files.
///
/// Unparseable rows are skipped and counted; this never fails. Bracketed
/// pseudo-entries like `[To Parent Directory]` are dropped.
pub fn parse_directory_listing(html: &str) -> Listing {
    // M/D/YYYY  H:MM AM|PM   size|-   <A HREF="...">filename</A>
    let row = Regex::new(
        r#"(?i)(\d{1,2}/\d{1,2}/\d{4})\s+(\d{1,2}:\d{2}\s+[AP]M)\s+(\d+|-)\s+<A\s+HREF="[^"]+">([^<]+)</A>"#,
    )
    .expect("listing row pattern is valid");
    let anchor = Regex::new(r#"(?i)<A\s+HREF="[^"]+">"#).expect("anchor pattern is valid");

    let total_rows = anchor.find_iter(html).count();
    let mut files = Vec::new();

    for caps in row.captures_iter(html) {
        let filename = caps[4].trim().to_string();
        if filename.is_empty() || (filename.starts_with('[') && filename.ends_with(']')) {
            continue;
        }
        let size = caps[3].parse::<u64>().unwrap_or(0);
        files.push(RemoteFile {
            filename,
            timestamp: format!("{} {}", &caps[1], &caps[2]),
            size,
        });
    }

    Listing {
        skipped_rows: total_rows.saturating_sub(files.len()),
        files,
    }
}

/// Parse a mirror listing timestamp: `1/29/2026  8:30 AM`.
///
/// Locale-free fixed format. Failure is a hard error — a selected file with
/// an unreadable timestamp must not be silently treated as changed or
/// unchanged.
pub fn parse_listing_timestamp(raw: &str) -> Result<NaiveDateTime> {
    let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    NaiveDateTime::parse_from_str(&cleaned, "%m/%d/%Y %I:%M %p")
        .with_context(|| format!("unparseable listing timestamp: {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};

    const SAMPLE: &str = r#"<html><body><pre>
 1/29/2026  8:30 AM        12345 <A HREF="/pub/time.series/pr/pr.data.0.Current">pr.data.0.Current</A><br>
12/05/2025 10:01 AM            - <A HREF="/pub/time.series/pr/pr.series">pr.series</A><br>
 1/29/2026  8:30 AM     98765432 <A HREF="/pub/time.series/pr/pr.data.1.AllData">pr.data.1.AllData</A><br>
 1/29/2026  8:30 AM        &lt;dir&gt; garbage row without an anchor
 6/14/2024  1:15 PM          512 <A HREF="/pub/time.series/pr/">[To Parent Directory]</A><br>
</pre></body></html>"#;

    #[test]
    fn test_parses_rows_and_sizes() {
        let listing = parse_directory_listing(SAMPLE);
        assert_eq!(listing.files.len(), 3);

        let current = &listing.files[0];
        assert_eq!(current.filename, "pr.data.0.Current");
        assert_eq!(current.timestamp, "1/29/2026 8:30 AM");
        assert_eq!(current.size, 12345);

        // "-" means no size, parsed as zero.
        assert_eq!(listing.files[1].filename, "pr.series");
        assert_eq!(listing.files[1].size, 0);
    }

    #[test]
    fn test_counts_skipped_rows() {
        let listing = parse_directory_listing(SAMPLE);
        // The bracketed pseudo-entry is an anchor that produced no file.
        assert_eq!(listing.skipped_rows, 1);
    }

    #[test]
    fn test_empty_listing() {
        let listing = parse_directory_listing("");
        assert!(listing.files.is_empty());
        assert_eq!(listing.skipped_rows, 0);
    }

    #[test]
    fn test_timestamp_parse() {
        let ts = parse_listing_timestamp("1/29/2026  8:30 AM").unwrap();
        assert_eq!(ts.date(), NaiveDate::from_ymd_opt(2026, 1, 29).unwrap());
        assert_eq!((ts.hour(), ts.minute()), (8, 30));

        let pm = parse_listing_timestamp("12/5/2025 1:07 PM").unwrap();
        assert_eq!((pm.hour(), pm.minute()), (13, 7));
    }

    #[test]
    fn test_timestamp_parse_failure_is_error() {
        assert!(parse_listing_timestamp("2026-01-29 08:30").is_err());
        assert!(parse_listing_timestamp("").is_err());
    }
}
