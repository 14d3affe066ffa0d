//! Locale-aware date formatting behind `_internals.formatDateTime`.

use std::fmt::Write;

use chrono::{DateTime, Local, Locale, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Why a date could not be formatted. Surfaces as a `RangeError` in the sandbox.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DateFormatError {
    #[error("invalid date: {0:?}")]
    InvalidDate(String),
    #[error("invalid time zone: {0:?}")]
    InvalidTimeZone(String),
    #[error("invalid format pattern: {0:?}")]
    InvalidPattern(String),
    #[error("invalid {field} value: {value:?}")]
    InvalidStyle { field: &'static str, value: String },
}

/// Formatting options, mirroring the common subset of `Intl.DateTimeFormat`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DateFormatOptions {
    pub date_style: Option<String>,
    pub time_style: Option<String>,
    /// `"UTC"` or `"local"`; host local time when absent.
    pub time_zone: Option<String>,
    /// strftime pattern overriding the styles.
    pub pattern: Option<String>,
}

enum Zone {
    Utc,
    Local,
}

/// Format `input` (an ISO 8601 date or date-time) for `locale`.
pub fn format_date_time(
    input: &str,
    locale: Option<&str>,
    options: &DateFormatOptions,
) -> Result<String, DateFormatError> {
    let instant = parse_instant(input)?;
    let locale = locale.and_then(parse_locale).unwrap_or_else(host_locale);
    let pattern = pattern_for(options)?;

    let zone = match options.time_zone.as_deref() {
        None => Zone::Local,
        Some(tz) if tz.eq_ignore_ascii_case("utc") => Zone::Utc,
        Some(tz) if tz.eq_ignore_ascii_case("local") => Zone::Local,
        Some(tz) => return Err(DateFormatError::InvalidTimeZone(tz.to_string())),
    };

    // An unknown strftime specifier makes `Display` fail; write instead of
    // `to_string()` so it becomes an error rather than a panic.
    let mut formatted = String::new();
    let written = match zone {
        Zone::Utc => write!(formatted, "{}", instant.format_localized(&pattern, locale)),
        Zone::Local => write!(
            formatted,
            "{}",
            instant.with_timezone(&Local).format_localized(&pattern, locale)
        ),
    };
    written.map_err(|_| DateFormatError::InvalidPattern(pattern.clone()))?;
    Ok(formatted.trim().to_string())
}

fn parse_instant(input: &str) -> Result<DateTime<Utc>, DateFormatError> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Date-time without offset is host local time.
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| DateFormatError::InvalidDate(input.to_string()));
        }
    }
    // Date-only is UTC midnight.
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(DateFormatError::InvalidDate(input.to_string()))
}

fn date_pattern(style: &str) -> Result<&'static str, DateFormatError> {
    match style {
        "full" => Ok("%A, %-d %B %Y"),
        "long" => Ok("%-d %B %Y"),
        "medium" => Ok("%-d %b %Y"),
        "short" => Ok("%x"),
        other => Err(DateFormatError::InvalidStyle {
            field: "dateStyle",
            value: other.to_string(),
        }),
    }
}

fn time_pattern(style: &str) -> Result<&'static str, DateFormatError> {
    match style {
        "full" | "long" => Ok("%X %Z"),
        "medium" => Ok("%X"),
        "short" => Ok("%H:%M"),
        other => Err(DateFormatError::InvalidStyle {
            field: "timeStyle",
            value: other.to_string(),
        }),
    }
}

fn pattern_for(options: &DateFormatOptions) -> Result<String, DateFormatError> {
    if let Some(pattern) = &options.pattern {
        return Ok(pattern.clone());
    }
    let date = options.date_style.as_deref().map(date_pattern).transpose()?;
    let time = options.time_style.as_deref().map(time_pattern).transpose()?;
    Ok(match (date, time) {
        (Some(d), Some(t)) => format!("{d} {t}"),
        (Some(d), None) => d.to_string(),
        (None, Some(t)) => t.to_string(),
        (None, None) => "%x".to_string(),
    })
}

/// Parse `en-US`, `en_US` or `en_US.UTF-8`.
fn parse_locale(name: &str) -> Option<Locale> {
    let base = name.split(['.', '@']).next().unwrap_or(name).replace('-', "_");
    if base.is_empty() {
        return None;
    }
    Locale::try_from(base.as_str()).ok()
}

/// Host locale from the environment, POSIX when unset or unknown.
pub fn host_locale() -> Locale {
    ["LC_ALL", "LC_TIME", "LANG"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .find_map(|value| parse_locale(&value))
        .unwrap_or(Locale::POSIX)
}
