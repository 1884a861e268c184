//! Date ranges and sort order

use crate::error::CoreError;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Whether a range's upper bound is part of the range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EndBound {
    #[default]
    Inclusive,
    Exclusive,
}

/// Closed-open or closed time range in UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub end_bound: EndBound,
}

impl DateRange {
    /// Inclusive range; fails when `start > end`
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, CoreError> {
        Self::with_bound(start, end, EndBound::Inclusive)
    }

    pub fn with_bound(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        end_bound: EndBound,
    ) -> Result<Self, CoreError> {
        let range = Self {
            start,
            end,
            end_bound,
        };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let ordered = match self.end_bound {
            EndBound::Inclusive => self.start <= self.end,
            EndBound::Exclusive => self.start < self.end,
        };
        if ordered {
            Ok(())
        } else {
            Err(CoreError::InvalidDateRange {
                start: self.start.to_rfc3339(),
                end: self.end.to_rfc3339(),
            })
        }
    }

    /// Parse `YYYY-MM-DD` or RFC 3339 bounds
    ///
    /// A date-only end expands to the last millisecond of that day.
    pub fn parse(start: &str, end: &str) -> Result<Self, CoreError> {
        let start = parse_bound(start, false)?;
        let end = parse_bound(end, true)?;
        Self::new(start, end)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start
            && match self.end_bound {
                EndBound::Inclusive => at <= self.end,
                EndBound::Exclusive => at < self.end,
            }
    }

    /// Range widened on both sides; always inclusive
    pub fn padded(&self, padding: Duration) -> Self {
        Self {
            start: self.start - padding,
            end: self.end + padding,
            end_bound: EndBound::Inclusive,
        }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

fn parse_bound(raw: &str, is_end: bool) -> Result<DateTime<Utc>, CoreError> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| CoreError::invalid_request(format!("Unparsable date: '{}'", raw)))?;
    let time = if is_end {
        NaiveTime::from_hms_milli_opt(23, 59, 59, 999)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .ok_or_else(|| CoreError::invalid_request("Invalid time of day"))?;
    Ok(Utc.from_utc_datetime(&date.and_time(time)))
}

/// Sort direction for turns and rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn apply(self, ordering: std::cmp::Ordering) -> std::cmp::Ordering {
        match self {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    }
}

impl FromStr for SortOrder {
    type Err = CoreError;

    /// Accepts `asc`/`ascending`/`1` and `desc`/`descending`/`-1`, any case
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "asc" | "ascending" | "1" => Ok(SortOrder::Asc),
            "desc" | "descending" | "-1" => Ok(SortOrder::Desc),
            other => Err(CoreError::invalid_request(format!(
                "Unknown sort order '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_sort_order_parses() {
        assert_eq!("asc".parse::<SortOrder>().unwrap(), SortOrder::Asc);
        assert_eq!("Descending".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        assert_eq!("-1".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        let err = "sideways".parse::<SortOrder>().unwrap_err();
        assert!(matches!(err, CoreError::InvalidRequest { .. }));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let err = DateRange::new(ts(2024, 2, 1), ts(2024, 1, 1)).unwrap_err();
        assert!(matches!(err, CoreError::InvalidDateRange { .. }));
    }

    #[test]
    fn test_empty_exclusive_range_rejected() {
        assert!(DateRange::with_bound(ts(2024, 1, 1), ts(2024, 1, 1), EndBound::Exclusive).is_err());
        assert!(DateRange::new(ts(2024, 1, 1), ts(2024, 1, 1)).is_ok());
    }

    #[test]
    fn test_parse_date_only_end_is_end_of_day() {
        let range = DateRange::parse("2024-01-15", "2024-02-15").unwrap();
        assert_eq!(range.start, ts(2024, 1, 15));
        assert!(range.contains(Utc.with_ymd_and_hms(2024, 2, 15, 23, 59, 59).unwrap()));
        assert!(!range.contains(ts(2024, 2, 16)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DateRange::parse("soon", "2024-01-01").is_err());
    }

    #[test]
    fn test_contains_respects_bound() {
        let exclusive =
            DateRange::with_bound(ts(2024, 1, 1), ts(2024, 2, 1), EndBound::Exclusive).unwrap();
        assert!(!exclusive.contains(ts(2024, 2, 1)));
        let inclusive = DateRange::new(ts(2024, 1, 1), ts(2024, 2, 1)).unwrap();
        assert!(inclusive.contains(ts(2024, 2, 1)));
    }

    #[test]
    fn test_padded_widens_both_sides() {
        let range = DateRange::new(ts(2024, 1, 1), ts(2024, 1, 2)).unwrap();
        let padded = range.padded(Duration::minutes(5));
        assert_eq!(padded.start, ts(2024, 1, 1) - Duration::minutes(5));
        assert_eq!(padded.end, ts(2024, 1, 2) + Duration::minutes(5));
    }
}
