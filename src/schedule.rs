//! Scraper for published release-schedule pages.
//!
//! BLS publishes "Schedule of News Releases" pages per program listing future
//! release dates and times, rendered in Eastern Time. This module turns those
//! pages into [`ScheduledRelease`] events with UTC timestamps.
//!
//! The pages are hand-maintained HTML, so parsing is deliberately forgiving:
//! the schedule table is found by its headers, rows with unparseable dates or
//! times (including "TBD") are dropped, and a page that fails to fetch only
//! loses its own series.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use scraper::{Html, Selector};

use crate::config::ScheduleConfig;
use crate::http::HttpClient;
use crate::models::ScheduledRelease;

pub const SCHEDULE_BASE_URL: &str = "https://www.bls.gov/schedule/news_release";

/// One schedule page to scrape for a series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSource {
    pub series: String,
    pub release: String,
    pub url: String,
}

fn builtin(series: &str, release: &str, page: &str) -> (String, ScheduleSource) {
    (
        series.to_string(),
        ScheduleSource {
            series: series.to_string(),
            release: release.to_string(),
            url: format!("{SCHEDULE_BASE_URL}/{page}"),
        },
    )
}

/// Built-in schedule pages for the common high-signal releases. `ce` and `ln`
/// both come out of the Employment Situation.
pub fn default_sources() -> BTreeMap<String, ScheduleSource> {
    BTreeMap::from([
        builtin("cu", "Consumer Price Index", "cpi.htm"),
        builtin("ce", "Employment Situation", "empsit.htm"),
        builtin("ln", "Employment Situation", "empsit.htm"),
        builtin("jt", "Job Openings and Labor Turnover Survey", "jolts.htm"),
        builtin("ci", "Employment Cost Index", "eci.htm"),
        builtin("pr", "Productivity and Costs", "prod2.htm"),
    ])
}

/// Schedule sources for the given series: config overrides win over the
/// built-ins, series with neither are silently absent.
pub fn schedule_sources(series: &[String], config: &ScheduleConfig) -> Vec<ScheduleSource> {
    let defaults = default_sources();
    let mut out = Vec::new();
    for id in series {
        if let Some(override_src) = config.sources.get(id) {
            out.push(ScheduleSource {
                series: id.clone(),
                release: override_src.release.clone().unwrap_or_else(|| id.clone()),
                url: override_src.url.clone(),
            });
        } else if let Some(builtin) = defaults.get(id) {
            out.push(builtin.clone());
        }
    }
    out
}

fn normalize_header(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                ' '
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn weekday_prefix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^(monday|tuesday|wednesday|thursday|friday|saturday|sunday),\s+").unwrap()
    })
}

fn ordinal_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(\d{1,2})(st|nd|rd|th)\b").unwrap())
}

fn time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?P<h>\d{1,2})(?::(?P<m>\d{2}))?\s*(?P<ampm>a\.?m\.?|p\.?m\.?)").unwrap()
    })
}

/// Parse a schedule-page date cell. `None` for blanks, "TBD", and anything
/// that matches no known format.
pub fn parse_schedule_date(raw: &str) -> Option<NaiveDate> {
    let cleaned = collapse_whitespace(raw);
    if cleaned.is_empty() {
        return None;
    }
    let lowered = cleaned.to_lowercase();
    if lowered == "tbd" || lowered == "to be determined" {
        return None;
    }

    let cleaned = weekday_prefix_re().replace(&cleaned, "");
    let cleaned = ordinal_suffix_re().replace_all(&cleaned, "$1");
    // "Sept." defeats the three-letter abbreviation format.
    let cleaned = cleaned.replace("Sept.", "Sep.");

    const FORMATS: [&str; 6] = [
        "%B %d, %Y",
        "%b. %d, %Y",
        "%b %d, %Y",
        "%B %d %Y",
        "%m/%d/%Y",
        "%Y-%m-%d",
    ];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&cleaned, fmt).ok())
}

/// Parse a schedule-page time cell into (hour, minute), 24-hour clock.
pub fn parse_schedule_time(raw: &str) -> Option<(u32, u32)> {
    let captures = time_re().captures(raw)?;
    let mut hour: u32 = captures.name("h")?.as_str().parse().ok()?;
    let minute: u32 = captures
        .name("m")
        .map_or(Some(0), |m| m.as_str().parse().ok())?;
    if hour > 12 || minute > 59 {
        return None;
    }

    let is_pm = captures
        .name("ampm")?
        .as_str()
        .to_lowercase()
        .starts_with('p');
    if hour == 12 && !is_pm {
        hour = 0;
    } else if hour != 12 && is_pm {
        hour += 12;
    }
    Some((hour, minute))
}

/// Extract every HTML table as rows of cell text, whitespace-collapsed.
/// Rows with no non-empty cell are dropped.
fn extract_tables(html: &str) -> Vec<Vec<Vec<String>>> {
    let document = Html::parse_document(html);
    let table_sel = Selector::parse("table").unwrap();
    let row_sel = Selector::parse("tr").unwrap();
    let cell_sel = Selector::parse("th, td").unwrap();

    let mut tables = Vec::new();
    for table in document.select(&table_sel) {
        let mut rows = Vec::new();
        for row in table.select(&row_sel) {
            let cells: Vec<String> = row
                .select(&cell_sel)
                .map(|cell| collapse_whitespace(&cell.text().collect::<String>()))
                .collect();
            if cells.iter().any(|c| !c.is_empty()) {
                rows.push(cells);
            }
        }
        if !rows.is_empty() {
            tables.push(rows);
        }
    }
    tables
}

/// Pick the most likely schedule table: the first one whose header row has
/// both a date column and a time column.
fn select_schedule_table(tables: &[Vec<Vec<String>>]) -> Option<(&Vec<Vec<String>>, usize, usize)> {
    for table in tables {
        let header = table.first()?;
        let norms: Vec<String> = header.iter().map(|h| normalize_header(h)).collect();

        let date_idx = norms
            .iter()
            .position(|h| h.contains("release date") || h == "date");
        let mut time_idx = norms
            .iter()
            .position(|h| h.contains("release time") || h == "time");
        // Some pages omit "Release" and use a bare "... Time" header.
        if date_idx.is_some() && time_idx.is_none() {
            time_idx = norms.iter().position(|h| h.ends_with("time"));
        }

        if let (Some(date_idx), Some(time_idx)) = (date_idx, time_idx) {
            return Some((table, date_idx, time_idx));
        }
    }
    None
}

/// Parse one schedule page into scheduled releases.
///
/// Local times that don't exist in the page's timezone (spring-forward gaps)
/// are dropped; ambiguous times resolve to the earlier instant.
pub fn parse_schedule_page(html: &str, source: &ScheduleSource, tz: Tz) -> Vec<ScheduledRelease> {
    let tables = extract_tables(html);
    let Some((table, date_idx, time_idx)) = select_schedule_table(&tables) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for row in &table[1..] {
        let Some(date_raw) = row.get(date_idx) else {
            continue;
        };
        let time_raw = row.get(time_idx).map(String::as_str).unwrap_or("");

        let Some(date) = parse_schedule_date(date_raw) else {
            continue;
        };
        let Some((hour, minute)) = parse_schedule_time(time_raw) else {
            continue;
        };

        let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
            continue;
        };
        let Some(local) = tz.from_local_datetime(&naive).earliest() else {
            continue;
        };

        out.push(ScheduledRelease {
            series: source.series.clone(),
            release: source.release.clone(),
            url: source.url.clone(),
            scheduled_time: local.with_timezone(&Utc),
            scheduled_time_local: local.to_rfc3339(),
            time_zone: tz.name().to_string(),
        });
    }
    out
}

/// Fetch and parse schedule pages for the given series, keeping releases
/// inside `[start, end]`, sorted by scheduled time.
///
/// A page that fails to fetch is logged and skipped; its series simply
/// contributes no scheduled releases.
pub async fn load_scheduled_releases(
    http: &HttpClient,
    config: &ScheduleConfig,
    user_agent: &str,
    series: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<ScheduledRelease> {
    let tz: Tz = config
        .time_zone
        .parse()
        .unwrap_or(chrono_tz::America::New_York);

    let mut scheduled = Vec::new();
    for source in schedule_sources(series, config) {
        let html = match http
            .fetch_text(&source.url, &[("User-Agent", user_agent)])
            .await
        {
            Ok(html) => html,
            Err(e) => {
                tracing::warn!(series = %source.series, url = %source.url, error = %e, "schedule page fetch failed");
                continue;
            }
        };
        scheduled.extend(parse_schedule_page(&html, &source, tz));
    }

    scheduled.retain(|r| r.scheduled_time >= start && r.scheduled_time <= end);
    scheduled.sort_by_key(|r| r.scheduled_time);
    scheduled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleSourceConfig;
    use chrono::Timelike;

    const SAMPLE_PAGE: &str = r#"
<html><body>
<table><tr><td>Navigation junk</td></tr></table>
<table>
  <tr><th>Release Date</th><th>Reference Month</th><th>Release Time</th></tr>
  <tr><td>Friday, February 6, 2026</td><td>January</td><td>8:30 a.m.</td></tr>
  <tr><td>Sept. 4, 2026</td><td>August</td><td>8:30 a.m.</td></tr>
  <tr><td>TBD</td><td>September</td><td>8:30 a.m.</td></tr>
  <tr><td>December 4, 2026</td><td>November</td><td>TBD</td></tr>
</table>
</body></html>
"#;

    fn source() -> ScheduleSource {
        ScheduleSource {
            series: "ce".to_string(),
            release: "Employment Situation".to_string(),
            url: format!("{SCHEDULE_BASE_URL}/empsit.htm"),
        }
    }

    #[test]
    fn test_parse_schedule_date_variants() {
        let expected = NaiveDate::from_ymd_opt(2026, 2, 6).unwrap();
        assert_eq!(parse_schedule_date("February 6, 2026"), Some(expected));
        assert_eq!(
            parse_schedule_date("Friday, February 6th, 2026"),
            Some(expected)
        );
        assert_eq!(parse_schedule_date("Feb. 6, 2026"), Some(expected));
        assert_eq!(parse_schedule_date("2/6/2026"), Some(expected));
        assert_eq!(parse_schedule_date("2026-02-06"), Some(expected));
        assert_eq!(
            parse_schedule_date("Sept. 4, 2026"),
            NaiveDate::from_ymd_opt(2026, 9, 4)
        );
        assert_eq!(parse_schedule_date("TBD"), None);
        assert_eq!(parse_schedule_date(""), None);
        assert_eq!(parse_schedule_date("sometime soon"), None);
    }

    #[test]
    fn test_parse_schedule_time_variants() {
        assert_eq!(parse_schedule_time("8:30 a.m."), Some((8, 30)));
        assert_eq!(parse_schedule_time("8:30 AM"), Some((8, 30)));
        assert_eq!(parse_schedule_time("10 a.m. ET"), Some((10, 0)));
        assert_eq!(parse_schedule_time("12:00 p.m."), Some((12, 0)));
        assert_eq!(parse_schedule_time("12:01 a.m."), Some((0, 1)));
        assert_eq!(parse_schedule_time("1:15 pm"), Some((13, 15)));
        assert_eq!(parse_schedule_time("TBD"), None);
        assert_eq!(parse_schedule_time(""), None);
    }

    #[test]
    fn test_parse_schedule_page_converts_to_utc() {
        let releases = parse_schedule_page(SAMPLE_PAGE, &source(), chrono_tz::America::New_York);
        // TBD date and TBD time rows are dropped.
        assert_eq!(releases.len(), 2);

        // 8:30 ET in February is 13:30 UTC (EST).
        let first = &releases[0];
        assert_eq!(first.series, "ce");
        assert_eq!(
            first.scheduled_time,
            Utc.with_ymd_and_hms(2026, 2, 6, 13, 30, 0).unwrap()
        );
        assert_eq!(first.time_zone, "America/New_York");
        assert!(first.scheduled_time_local.starts_with("2026-02-06T08:30:00"));

        // 8:30 ET in September is 12:30 UTC (EDT).
        assert_eq!(releases[1].scheduled_time.hour(), 12);
    }

    #[test]
    fn test_page_without_schedule_table_yields_nothing() {
        let releases = parse_schedule_page(
            "<table><tr><th>Foo</th></tr><tr><td>bar</td></tr></table>",
            &source(),
            chrono_tz::UTC,
        );
        assert!(releases.is_empty());
    }

    #[test]
    fn test_sources_merge_overrides_over_builtins() {
        let mut config = ScheduleConfig::default();
        config.sources.insert(
            "pr".to_string(),
            ScheduleSourceConfig {
                url: "https://example.com/custom.htm".to_string(),
                release: None,
            },
        );

        let series = vec!["pr".to_string(), "cu".to_string(), "zz".to_string()];
        let sources = schedule_sources(&series, &config);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].url, "https://example.com/custom.htm");
        // No release name configured: fall back to the series id.
        assert_eq!(sources[0].release, "pr");
        assert_eq!(sources[1].release, "Consumer Price Index");
    }
}
