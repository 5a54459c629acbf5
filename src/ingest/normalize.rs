//! Field normalization: date representations into canonical `YYYY-MM-DD HH:MM:SS` text.
//!
//! Only columns classified as date-like are touched. Values that match none of
//! the recognized forms pass through unchanged.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use std::sync::OnceLock;

use super::record::RawValue;
use crate::store::ColumnDescriptor;

/// Output format for every normalized date
pub const CANONICAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Spreadsheet serials accepted as dates: 1950-01-01 ..= 2100-01-01
const SERIAL_MIN: f64 = 18264.0;
const SERIAL_MAX: f64 = 73051.0;

/// Column name fragments that mark a column as date-like
const DATE_NAME_TOKENS: &[&str] = &[
    "date", "time", "created", "updated", "modified", "deleted", "_at", "dob", "birth", "fecha",
    "datum", "data_", "jour",
];

/// Declared type fragments that mark a column as date-like
const DATE_TYPE_TOKENS: &[&str] = &["date", "time", "year"];

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

const MONTH_NAMES: [&str; 12] = [
    "january", "february", "march", "april", "may", "june", "july", "august", "september",
    "october", "november", "december",
];

/// Optional trailing time of day, shared by every pattern
const TIME_SUFFIX: &str = r"(?:[ T]+(\d{1,2}):(\d{2})(?::(\d{2})(?:\.\d+)?)?)?";

struct Patterns {
    canonical: Regex,
    day_first: Regex,
    iso_slash: Regex,
    day_month_name: Regex,
    month_name_day: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let build = |body: &str| {
            Regex::new(&format!(r"(?i)^{}{}(?:Z|[+-]\d{{2}}:?\d{{2}})?$", body, TIME_SUFFIX))
                .expect("Invalid date pattern")
        };
        Patterns {
            canonical: build(r"(\d{4})-(\d{1,2})-(\d{1,2})"),
            day_first: build(r"(\d{1,2})[/-](\d{1,2})[/-](\d{4})"),
            iso_slash: build(r"(\d{4})/(\d{1,2})/(\d{1,2})"),
            day_month_name: build(r"(\d{1,2})[- ]([a-z]{3,})\.?[- ,]+(\d{4}|\d{2})"),
            month_name_day: build(r"([a-z]{3,})\.?[ -]+(\d{1,2})(?:st|nd|rd|th)?,?[ -]+(\d{4}|\d{2})"),
        }
    })
}

/// Whether values of this column are candidates for date normalization
pub fn is_date_like_column(column: &ColumnDescriptor) -> bool {
    let declared = column.declared_type.to_lowercase();
    if DATE_TYPE_TOKENS.iter().any(|t| declared.contains(t)) {
        return true;
    }
    let name = column.name.to_lowercase();
    DATE_NAME_TOKENS.iter().any(|t| name.contains(t))
}

/// Normalize one cell. Blank is always null; non-date-like values are untouched.
pub fn normalize(value: &RawValue, is_date_like: bool) -> RawValue {
    if value.is_blank() {
        return RawValue::Null;
    }
    if !is_date_like {
        return value.clone();
    }

    let parsed = match value {
        RawValue::Integer(_) | RawValue::Float(_) => value.as_f64().and_then(from_serial),
        RawValue::Text(text) => parse_date_text(text.trim()),
        RawValue::Null => None,
    };

    match parsed {
        Some(dt) => RawValue::Text(dt.format(CANONICAL_FORMAT).to_string()),
        None => value.clone(),
    }
}

fn parse_date_text(text: &str) -> Option<NaiveDateTime> {
    let p = patterns();

    if let Some(c) = p.canonical.captures(text) {
        return build(num(&c, 1)?, num(&c, 2)?, num(&c, 3)?, &c);
    }

    if let Some(c) = p.day_first.captures(text) {
        let (first, second, year) = (num(&c, 1)?, num(&c, 2)?, num(&c, 3)?);
        // Day-first wins; month-first only when the day-first reading is not a date
        return build(year, second, first, &c).or_else(|| build(year, first, second, &c));
    }

    if let Some(c) = p.iso_slash.captures(text) {
        return build(num(&c, 1)?, num(&c, 2)?, num(&c, 3)?, &c);
    }

    if let Some(c) = p.day_month_name.captures(text) {
        let month = month_number(c.get(2)?.as_str())?;
        return build(expand_year(c.get(3)?.as_str())?, month, num(&c, 1)?, &c);
    }

    if let Some(c) = p.month_name_day.captures(text) {
        let month = month_number(c.get(1)?.as_str())?;
        return build(expand_year(c.get(3)?.as_str())?, month, num(&c, 2)?, &c);
    }

    text.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(from_serial)
}

fn num(caps: &regex::Captures<'_>, idx: usize) -> Option<u32> {
    caps.get(idx)?.as_str().parse().ok()
}

/// Date from year/month/day plus the optional time captured in groups 4..=6
fn build(year: u32, month: u32, day: u32, caps: &regex::Captures<'_>) -> Option<NaiveDateTime> {
    let date = NaiveDate::from_ymd_opt(year as i32, month, day)?;
    let hour = num(caps, 4).unwrap_or(0);
    let minute = num(caps, 5).unwrap_or(0);
    let second = num(caps, 6).unwrap_or(0);
    let time = NaiveTime::from_hms_opt(hour, minute, second)?;
    Some(date.and_time(time))
}

/// Month from its abbreviation, "sept", or its full name; any other word is not a month
fn month_number(name: &str) -> Option<u32> {
    let name = name.to_ascii_lowercase();
    if name == "sept" {
        return Some(9);
    }
    MONTHS
        .iter()
        .zip(MONTH_NAMES.iter())
        .position(|(short, full)| name == *short || name == *full)
        .map(|idx| idx as u32 + 1)
}

/// Two-digit years pivot at 50: above is 19xx, otherwise 20xx
fn expand_year(text: &str) -> Option<u32> {
    let year: u32 = text.parse().ok()?;
    Some(match text.len() {
        2 if year > 50 => 1900 + year,
        2 => 2000 + year,
        _ => year,
    })
}

/// Spreadsheet serial day number (epoch 1899-12-30) to a timestamp rounded to the second
pub fn from_serial(serial: f64) -> Option<NaiveDateTime> {
    if !(SERIAL_MIN..=SERIAL_MAX).contains(&serial) {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let seconds = (serial * 86_400.0).round() as i64;
    epoch.checked_add_signed(Duration::seconds(seconds))
}
