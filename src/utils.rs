use chrono::{Local, TimeZone};
use std::convert::TryFrom;

static DATE_FORMAT: &str = "%a %b %e %k:%M %Y";
static UNITS: &[u8] = b" KMGTPE";

/// Human readable size that fits into five characters: `512`, `10M`, `1.50M`, `10.0K`.
pub fn nicenum(num: u64) -> String {
    let mut n = num;
    let mut index = 0;
    while n >= 1024 {
        n /= 1024;
        index += 1;
    }
    let unit = char::from(UNITS[index]);
    if index == 0 {
        return format!("{}", n);
    }
    let mask = (1_u64 << (10 * index)) - 1;
    if num & mask == 0 {
        return format!("{}{}", n, unit);
    }
    // Close to an order of magnitude (10239 is 9.999K) only a single place fits.
    let value = num as f64 / (1_u64 << (10 * index)) as f64;
    let mut ret = String::new();
    for precision in (0..=2).rev() {
        ret = format!("{:.*}{}", precision, value, unit);
        if ret.len() <= 5 {
            break;
        }
    }
    ret
}

/// Compression ratio stored in hundredths: `250` becomes `2.50x`.
pub fn ratio(hundredths: u64) -> String { format!("{}.{:02}x", hundredths / 100, hundredths % 100) }

/// Format seconds since epoch the way `zfs get creation` does. Falls back to the raw number if it
/// can't be represented as a local time.
pub fn format_time(secs: u64) -> String {
    match i64::try_from(secs).ok().and_then(|secs| Local.timestamp_opt(secs, 0).single()) {
        Some(time) => time.format(DATE_FORMAT).to_string(),
        None => format!("{}", secs),
    }
}

/// `on`/`off` rendering of booleans.
pub fn nicebool(val: bool) -> &'static str {
    if val {
        "on"
    } else {
        "off"
    }
}
