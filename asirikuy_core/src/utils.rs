// asirikuy_core/src/utils.rs

//! Utility functions shared across the bridge.
//! Date parsing for configuration values, timestamp formatting and lot normalization.

use anyhow::Context;

/// Converts a string representation of a date and time into a `chrono::DateTime<chrono::Utc>`.
///
/// # Arguments
/// * `string` - The date-time string to parse (e.g., "2025-07-08 15:30:00").
/// * `format` - The expected format of the input string (e.g., "%Y-%m-%d %H:%M:%S").
///
/// # Returns
/// * `anyhow::Result<chrono::DateTime<chrono::Utc>>` - The parsed UTC date-time on success.
pub fn string_to_date_time(string: &str, format: &str) -> anyhow::Result<chrono::DateTime<chrono::Utc>> {
    let dt = chrono::NaiveDateTime::parse_from_str(string, format)
        .with_context(|| format!("Invalid date '{}' for format '{}'", string, format))?;

    anyhow::Ok(chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(dt, chrono::Utc))
}

/// Parses a run window boundary. Accepts `dd/mm/yy`, `dd/mm/yyyy`, `YYYY-MM-DD`
/// and `YYYY-MM-DD HH:MM:SS`; plain dates resolve to midnight UTC.
///
/// # Returns
/// * `anyhow::Result<i64>` - unix seconds.
pub fn parse_run_date(value: &str) -> anyhow::Result<i64> {
    let trimmed = value.trim();
    if let Ok(dt) = string_to_date_time(trimmed, "%Y-%m-%d %H:%M:%S") {
        return anyhow::Ok(dt.timestamp());
    }

    for format in ["%d/%m/%y", "%d/%m/%Y", "%Y-%m-%d"] {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(trimmed, format) {
            let midnight = date
                .and_hms_opt(0, 0, 0)
                .with_context(|| format!("Invalid midnight for '{}'", trimmed))?;
            return anyhow::Ok(midnight.and_utc().timestamp());
        }
    }

    anyhow::bail!("Unrecognised date '{}'. Use dd/mm/yy or YYYY-MM-DD", value)
}

pub fn timestamp_to_date_time(time: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::<chrono::Utc>::from_timestamp(time, 0).unwrap_or_default()
}

/// `%Y-%m-%d %H:%M:%S` rendering used by every report file.
pub fn format_timestamp(time: i64) -> String {
    timestamp_to_date_time(time).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Day of week with Sunday = 0, as `tm_wday`.
pub fn weekday(time: i64) -> u32 {
    use chrono::Datelike;
    timestamp_to_date_time(time).weekday().num_days_from_sunday()
}

/// Rounds a lot size down to a whole number of `min_lot` steps.
/// Returns 0 when the request is below one step.
pub fn normalize_lots(lots: f64, min_lot: f64) -> f64 {
    if min_lot <= 0.0 {
        return lots.max(0.0);
    }
    let steps = (lots / min_lot + 1e-9).floor();
    if steps < 1.0 {
        return 0.0;
    }
    let precision = (-min_lot.log10()).ceil().max(0.0) as i32;
    let factor = 10f64.powi(precision);
    (steps * min_lot * factor).round() / factor
}
