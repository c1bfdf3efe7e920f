//! Derived metric helpers.
//!
//! All division is safe against zero and non-finite denominators and yields
//! `0.0` instead of NaN / Infinity. Text parsers return `None` for anything
//! they cannot read; callers skip those values rather than counting zeros.

use chrono::{NaiveDateTime, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;

use super::types::Cell;

/// Round to 2 decimal places (`(x * 100.0).round() / 100.0`).
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `numerator / denominator` rounded to 2 decimals; `0.0` when the
/// denominator is zero or either side is not a finite number.
pub fn safe_divide(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 || !denominator.is_finite() || !numerator.is_finite() {
        0.0
    } else {
        round2(numerator / denominator)
    }
}

/// Mean of the finite values, or `None` when there are none.
pub fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values
        .into_iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

// ---------------------------------------------------------------------------
// Free-text numbers
// ---------------------------------------------------------------------------

/// Keep only digits, `.` and `-`, then parse. `"1,250 m"` → `1250.0`.
pub fn strip_numeric(raw: &str) -> Option<f64> {
    let kept: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if kept.is_empty() {
        return None;
    }
    kept.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Coerce a fetched cell to a nullable number.
pub fn coerce_numeric(cell: &Cell) -> Cell {
    match cell {
        Cell::Int(i) => Cell::Real(*i as f64),
        Cell::Real(r) if r.is_finite() => Cell::Real(*r),
        Cell::Text(s) => strip_numeric(s).map_or(Cell::Null, Cell::Real),
        _ => Cell::Null,
    }
}

// ---------------------------------------------------------------------------
// Travel time
// ---------------------------------------------------------------------------

static HMS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2}):(\d{1,2}):(\d{1,2})").expect("h:m:s regex"));

/// Seconds from a loosely formatted travel time.
///
/// Accepts `H:M:S` anywhere in the text, a bare 1-6 digit `HHMMSS` run
/// (zero-padded on the left, so `"013045"` and `"13045"` are both 01:30:45),
/// or a plain number of seconds.
pub fn parse_travel_seconds(raw: &str) -> Option<i64> {
    let s = raw.trim();
    if s.is_empty() || matches!(s.to_ascii_lowercase().as_str(), "nan" | "nat" | "none") {
        return None;
    }

    if let Some(caps) = HMS_RE.captures(s) {
        let part = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<i64>().ok());
        if let (Some(h), Some(m), Some(sec)) = (part(1), part(2), part(3)) {
            return Some(h * 3600 + m * 60 + sec);
        }
    }

    let digits: String = s.chars().filter(char::is_ascii_digit).collect();
    if (1..=6).contains(&digits.len()) {
        let padded = format!("{digits:0>6}");
        let field = |r: std::ops::Range<usize>| padded[r].parse::<i64>().ok();
        if let (Some(h), Some(m), Some(sec)) = (field(0..2), field(2..4), field(4..6)) {
            return Some(h * 3600 + m * 60 + sec);
        }
    }

    s.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(|v| v.trunc() as i64)
}

/// Travel seconds of a cell: numbers are seconds, text goes through
/// [`parse_travel_seconds`].
pub fn travel_seconds_of(cell: &Cell) -> Option<i64> {
    match cell {
        Cell::Null => None,
        Cell::Text(s) => parse_travel_seconds(s),
        other => other.as_text().as_deref().and_then(parse_travel_seconds),
    }
}

// ---------------------------------------------------------------------------
// Visit timestamps and durations
// ---------------------------------------------------------------------------

/// A visit timestamp as stored: either a full datetime or a time of day.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VisitInstant {
    At(NaiveDateTime),
    TimeOfDay(NaiveTime),
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];

pub fn parse_visit_instant(raw: &str) -> Option<VisitInstant> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .map(VisitInstant::At)
        .or_else(|| {
            TIME_FORMATS
                .iter()
                .find_map(|f| NaiveTime::parse_from_str(s, f).ok())
                .map(VisitInstant::TimeOfDay)
        })
}

/// Seconds from `first` to `last`; `None` when the two are of different
/// shapes or `last` precedes `first`.
pub fn elapsed_seconds(first: VisitInstant, last: VisitInstant) -> Option<i64> {
    let secs = match (first, last) {
        (VisitInstant::At(a), VisitInstant::At(b)) => (b - a).num_seconds(),
        (VisitInstant::TimeOfDay(a), VisitInstant::TimeOfDay(b)) => (b - a).num_seconds(),
        _ => return None,
    };
    (secs >= 0).then_some(secs)
}

/// `HH:MM:SS`, with hours allowed past 24.
pub fn format_hms(total_seconds: i64) -> String {
    let total = total_seconds.max(0);
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}

/// Working time between two stored visit timestamps, blank when either end
/// is missing or unreadable.
pub fn working_time(first: &str, last: &str) -> String {
    match (parse_visit_instant(first), parse_visit_instant(last)) {
        (Some(a), Some(b)) => elapsed_seconds(a, b).map(format_hms).unwrap_or_default(),
        _ => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
