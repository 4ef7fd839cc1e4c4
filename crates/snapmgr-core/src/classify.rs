//! Chain-status and age classification for flattened snapshots.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use snapmgr_common::{ChainStatus, SnapshotRecord};

/// Snapshots older than this many business days get highlighted as stale.
pub const STALE_THRESHOLD_BUSINESS_DAYS: i64 = 3;

/// Timestamp renderings the upstream servers are known to produce.
const CREATED_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.fZ",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub chain: ChainStatus,
    /// Business days between creation and now, inclusive of both endpoint
    /// dates. `None` when the creation timestamp did not parse.
    pub business_days: Option<i64>,
    /// `None` when age could not be determined; age classification is
    /// skipped for unparseable timestamps, not faked.
    pub stale: Option<bool>,
}

pub fn chain_status(has_children: bool, is_child: bool) -> ChainStatus {
    match (has_children, is_child) {
        (false, false) => ChainStatus::Independent,
        (false, true) => ChainStatus::Child,
        (true, false) => ChainStatus::HasChildrenOnly,
        (true, true) => ChainStatus::ChainMiddle,
    }
}

/// Parses a server-rendered creation timestamp, trying each known format.
/// Returns `None` rather than failing the pipeline on an unrecognized
/// rendering; the raw string stays available for display.
pub fn parse_created(raw: &str) -> Option<NaiveDateTime> {
    for format in CREATED_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(parsed);
        }
    }
    // Some servers append fractional seconds without the trailing Z.
    if let Some((head, _)) = raw.split_once('.') {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(head, "%Y-%m-%dT%H:%M:%S") {
            return Some(parsed);
        }
    }
    None
}

/// Counts Monday-Friday days between two dates, inclusive of both endpoints.
/// Each calendar day contributes at most once regardless of time of day;
/// a span that starts after it ends counts zero.
pub fn business_days_between(start: NaiveDate, end: NaiveDate) -> i64 {
    let mut current = start;
    let mut days = 0;
    while current <= end {
        if current.weekday().number_from_monday() <= 5 {
            days += 1;
        }
        match current.succ_opt() {
            Some(next) => current = next,
            None => break,
        }
    }
    days
}

/// Pure function of the record's flags and the two timestamps.
pub fn classify(record: &SnapshotRecord, now: DateTime<Utc>) -> Classification {
    let chain = chain_status(record.has_children, record.is_child);
    let business_days = record
        .created_at
        .map(|created| business_days_between(created.date_naive(), now.date_naive()));
    let stale = business_days.map(|days| days > STALE_THRESHOLD_BUSINESS_DAYS);
    Classification {
        chain,
        business_days,
        stale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapmgr_common::{SnapshotRef, VmRef};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(has_children: bool, is_child: bool, created: &str) -> SnapshotRecord {
        SnapshotRecord {
            vm_name: "web-01".to_string(),
            server: "vc01.example.net".to_string(),
            name: "Monthly Patching".to_string(),
            created: created.to_string(),
            created_at: parse_created(created).map(|t| t.and_utc()),
            snapshot: SnapshotRef("snap-1".to_string()),
            vm: VmRef("vm-1".to_string()),
            has_children,
            is_child,
        }
    }

    #[test]
    fn test_chain_status_mapping() {
        assert_eq!(chain_status(false, false), ChainStatus::Independent);
        assert_eq!(chain_status(false, true), ChainStatus::Child);
        assert_eq!(chain_status(true, false), ChainStatus::HasChildrenOnly);
        assert_eq!(chain_status(true, true), ChainStatus::ChainMiddle);
    }

    #[test]
    fn test_eligibility_follows_chain_status() {
        for has_children in [false, true] {
            for is_child in [false, true] {
                let status = chain_status(has_children, is_child);
                assert_eq!(
                    status.eligible_for_deletion(),
                    status == ChainStatus::Independent
                );
            }
        }
    }

    #[test]
    fn test_business_days_same_monday() {
        // 2026-08-03 is a Monday; midnight to 23:59 is still one business day.
        let monday = date(2026, 8, 3);
        assert_eq!(business_days_between(monday, monday), 1);
    }

    #[test]
    fn test_business_days_friday_to_monday() {
        // Friday 2026-08-07 through Monday 2026-08-10 skips the weekend.
        assert_eq!(business_days_between(date(2026, 8, 7), date(2026, 8, 10)), 2);
    }

    #[test]
    fn test_business_days_weekend_only() {
        // Saturday through Sunday.
        assert_eq!(business_days_between(date(2026, 8, 8), date(2026, 8, 9)), 0);
    }

    #[test]
    fn test_business_days_inverted_span() {
        assert_eq!(business_days_between(date(2026, 8, 10), date(2026, 8, 3)), 0);
    }

    #[test]
    fn test_stale_monday_to_thursday() {
        // Created Monday 2026-08-03, now Thursday 2026-08-06:
        // Mon, Tue, Wed, Thu = 4 business days, past the threshold of 3.
        let rec = record(false, false, "2026-08-03 09:15");
        let now = date(2026, 8, 6).and_hms_opt(12, 0, 0).unwrap().and_utc();
        let classification = classify(&rec, now);
        assert_eq!(classification.business_days, Some(4));
        assert_eq!(classification.stale, Some(true));
    }

    #[test]
    fn test_not_stale_within_threshold() {
        // Monday -> Wednesday of the same week: 3 business days, not stale.
        let rec = record(false, false, "2026-08-03 09:15");
        let now = date(2026, 8, 5).and_hms_opt(12, 0, 0).unwrap().and_utc();
        let classification = classify(&rec, now);
        assert_eq!(classification.business_days, Some(3));
        assert_eq!(classification.stale, Some(false));
    }

    #[test]
    fn test_classification_is_deterministic() {
        let rec = record(true, false, "2026-08-03 09:15");
        let now = date(2026, 8, 14).and_hms_opt(8, 30, 0).unwrap().and_utc();
        assert_eq!(classify(&rec, now), classify(&rec, now));
    }

    #[test]
    fn test_parse_created_formats() {
        assert!(parse_created("2026-08-03 09:15").is_some());
        assert!(parse_created("2026-08-03T09:15:42").is_some());
        assert!(parse_created("2026-08-03T09:15:42.123456Z").is_some());
        assert!(parse_created("2026-08-03T09:15:42.123456").is_some());
        assert!(parse_created("last tuesday").is_none());
        assert!(parse_created("").is_none());
    }

    #[test]
    fn test_unparseable_created_skips_age() {
        let rec = record(false, false, "not-a-timestamp");
        assert_eq!(rec.created, "not-a-timestamp");
        let now = date(2026, 8, 14).and_hms_opt(8, 30, 0).unwrap().and_utc();
        let classification = classify(&rec, now);
        assert_eq!(classification.business_days, None);
        assert_eq!(classification.stale, None);
        assert_eq!(classification.chain, ChainStatus::Independent);
    }
}
