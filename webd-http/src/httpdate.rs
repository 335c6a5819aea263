//! RFC 1123 Date header cache.
//!
//! Formatting a date per response is measurable at high request rates, so
//! a process-wide string is cached and refreshed at most once per second.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

static WEEKDAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
static MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

static CACHE: Lazy<RwLock<(u64, String)>> = Lazy::new(|| RwLock::new((0, String::new())));

/// The current time as an RFC 1123 GMT string, e.g.
/// `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date_now() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    {
        let cached = CACHE.read();
        if cached.0 == now && !cached.1.is_empty() {
            return cached.1.clone();
        }
    }

    let formatted = format_http_date(now);
    *CACHE.write() = (now, formatted.clone());
    formatted
}

/// Formats a unix timestamp as an RFC 1123 GMT date.
pub fn format_http_date(unix_secs: u64) -> String {
    let days = unix_secs / 86_400;
    let secs_of_day = unix_secs % 86_400;
    let weekday = ((days + 4) % 7) as usize; // 1970-01-01 was a Thursday

    let (year, month, day) = civil_from_days(days as i64);

    format!(
        "{}, {:02} {} {} {:02}:{:02}:{:02} GMT",
        WEEKDAYS[weekday],
        day,
        MONTHS[(month - 1) as usize],
        year,
        secs_of_day / 3600,
        (secs_of_day % 3600) / 60,
        secs_of_day % 60,
    )
}

/// Days-since-epoch to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = if month <= 2 { year + 1 } else { year };
    (year, month, day)
}
