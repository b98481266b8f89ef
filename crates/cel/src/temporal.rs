//! Timestamps and durations. Timestamps are UTC unless a getter names a fixed offset.

use chrono::{DateTime, Datelike, Duration, FixedOffset, SecondsFormat, TimeZone, Timelike, Utc};

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// `0001-01-01T00:00:00Z` and `9999-12-31T23:59:59.999999999Z` in unix seconds.
const MIN_UNIX: i64 = -62_135_596_800;
const MAX_UNIX: i64 = 253_402_300_799;

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    let ts = DateTime::parse_from_rfc3339(s)
        .map_err(|e| format!("invalid timestamp {:?}: {}", s, e))?
        .with_timezone(&Utc);
    check_range(ts)
}

pub fn timestamp_from_unix(secs: i64) -> Result<DateTime<Utc>, String> {
    if !(MIN_UNIX..=MAX_UNIX).contains(&secs) {
        return Err(format!("timestamp out of range: {}", secs));
    }
    Utc.timestamp_opt(secs, 0).single().ok_or_else(|| format!("timestamp out of range: {}", secs))
}

fn check_range(ts: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    if (MIN_UNIX..=MAX_UNIX).contains(&ts.timestamp()) {
        Ok(ts)
    } else {
        Err(format!("timestamp out of range: {}", format_timestamp(&ts)))
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Go-style duration text: an optional sign, then one or more `<decimal><unit>` pairs
/// with units `h`, `m`, `s`, `ms`, `us`, `µs` and `ns`.
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let bad = || format!("invalid duration {:?}", src);
    let (neg, mut rest) = match src.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, src.strip_prefix('+').unwrap_or(src)),
    };
    if rest == "0" {
        return Ok(Duration::zero());
    }
    if rest.is_empty() {
        return Err(bad());
    }
    let mut total: i128 = 0;
    while !rest.is_empty() {
        let num_end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).ok_or_else(bad)?;
        let (num, tail) = rest.split_at(num_end);
        if num.is_empty() || num == "." {
            return Err(bad());
        }
        let unit_end = tail.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        let scale: i128 = match unit {
            "h" => 3600 * NANOS_PER_SEC,
            "m" => 60 * NANOS_PER_SEC,
            "s" => NANOS_PER_SEC,
            "ms" => 1_000_000,
            "us" | "µs" => 1_000,
            "ns" => 1,
            _ => return Err(bad()),
        };
        let (whole, frac) = num.split_once('.').unwrap_or((num, ""));
        let whole: i128 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| bad())? };
        let mut part = whole.checked_mul(scale).ok_or_else(bad)?;
        let mut denom: i128 = 1;
        let mut digits: i128 = 0;
        for d in frac.chars().take(18) {
            digits = digits * 10 + i128::from(d.to_digit(10).ok_or_else(bad)?);
            denom *= 10;
        }
        part += digits * scale / denom;
        total = total.checked_add(part).ok_or_else(bad)?;
        rest = tail;
    }
    let nanos = i64::try_from(if neg { -total } else { total }).map_err(|_| format!("duration out of range: {}", src))?;
    Ok(Duration::nanoseconds(nanos))
}

/// Seconds with a trimmed fraction, e.g. `3600s` or `-1.5s`.
pub fn format_duration(d: &Duration) -> String {
    let nanos = i128::from(d.num_nanoseconds().unwrap_or(i64::MAX));
    let sign = if nanos < 0 { "-" } else { "" };
    let abs = nanos.abs();
    let (secs, frac) = (abs / NANOS_PER_SEC, abs % NANOS_PER_SEC);
    if frac == 0 {
        return format!("{}{}s", sign, secs);
    }
    let frac = format!("{:09}", frac);
    format!("{}{}.{}s", sign, secs, frac.trim_end_matches('0'))
}

pub fn add(ts: &DateTime<Utc>, d: &Duration) -> Result<DateTime<Utc>, String> {
    ts.checked_add_signed(*d).ok_or_else(|| "timestamp overflow".to_string()).and_then(check_range)
}

pub fn sub(ts: &DateTime<Utc>, d: &Duration) -> Result<DateTime<Utc>, String> {
    ts.checked_sub_signed(*d).ok_or_else(|| "timestamp overflow".to_string()).and_then(check_range)
}

pub fn between(a: &DateTime<Utc>, b: &DateTime<Utc>) -> Result<Duration, String> {
    let d = a.signed_duration_since(*b);
    d.num_nanoseconds().map(|_| d).ok_or_else(|| "duration overflow".to_string())
}

/// `UTC`, `Z` or a fixed `±HH:MM` offset.
fn offset(tz: Option<&str>) -> Result<FixedOffset, String> {
    let utc = FixedOffset::east_opt(0).ok_or("invalid offset")?;
    let Some(tz) = tz else { return Ok(utc) };
    if tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return Ok(utc);
    }
    let (sign, hm) = match tz.as_bytes().first() {
        Some(b'+') => (1, &tz[1..]),
        Some(b'-') => (-1, &tz[1..]),
        _ => return Err(format!("unsupported time zone {:?}", tz)),
    };
    let (h, m) = hm.split_once(':').ok_or_else(|| format!("unsupported time zone {:?}", tz))?;
    let h: i32 = h.parse().map_err(|_| format!("unsupported time zone {:?}", tz))?;
    let m: i32 = m.parse().map_err(|_| format!("unsupported time zone {:?}", tz))?;
    FixedOffset::east_opt(sign * (h * 3600 + m * 60)).ok_or_else(|| format!("unsupported time zone {:?}", tz))
}

/// Calendar accessors. Month, day of month and day of year are zero-based, `getDate` is not.
pub fn timestamp_part(func: &str, ts: &DateTime<Utc>, tz: Option<&str>) -> Result<i64, String> {
    let local = ts.with_timezone(&offset(tz)?);
    Ok(match func {
        "getFullYear" => i64::from(local.year()),
        "getMonth" => i64::from(local.month0()),
        "getDayOfMonth" => i64::from(local.day0()),
        "getDate" => i64::from(local.day()),
        "getDayOfWeek" => i64::from(local.weekday().num_days_from_sunday()),
        "getDayOfYear" => i64::from(local.ordinal0()),
        "getHours" => i64::from(local.hour()),
        "getMinutes" => i64::from(local.minute()),
        "getSeconds" => i64::from(local.second()),
        "getMilliseconds" => i64::from(local.nanosecond() % 1_000_000_000 / 1_000_000),
        other => return Err(format!("no such overload: timestamp.{}", other)),
    })
}

/// Whole units contained in the duration.
pub fn duration_part(func: &str, d: &Duration) -> Result<i64, String> {
    Ok(match func {
        "getHours" => d.num_hours(),
        "getMinutes" => d.num_minutes(),
        "getSeconds" => d.num_seconds(),
        "getMilliseconds" => d.num_milliseconds(),
        other => return Err(format!("no such overload: duration.{}", other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_like_go() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::minutes(90));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::milliseconds(1500));
        assert_eq!(parse_duration("-300ms").unwrap(), Duration::milliseconds(-300));
        assert_eq!(parse_duration("2us3ns").unwrap(), Duration::nanoseconds(2003));
        assert_eq!(parse_duration("0").unwrap(), Duration::zero());
        for bad in ["", "1", "1d", "h", "1..5s", "-"] {
            assert!(parse_duration(bad).is_err(), "{bad}");
        }
        assert_eq!(format_duration(&Duration::minutes(60)), "3600s");
        assert_eq!(format_duration(&Duration::milliseconds(-1500)), "-1.5s");
    }

    #[test]
    fn timestamps_and_calendar_parts() {
        let ts = parse_timestamp("2024-03-01T23:30:00.250-01:00").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-03-02T00:30:00.250Z");
        assert_eq!(timestamp_part("getMonth", &ts, None).unwrap(), 2);
        assert_eq!(timestamp_part("getDate", &ts, None).unwrap(), 2);
        assert_eq!(timestamp_part("getDate", &ts, Some("-01:00")).unwrap(), 1);
        assert_eq!(timestamp_part("getMilliseconds", &ts, None).unwrap(), 250);
        assert!(timestamp_part("getHours", &ts, Some("Mars/Olympus")).is_err());
        assert!(parse_timestamp("2024-13-01T00:00:00Z").is_err());
        assert!(timestamp_from_unix(MAX_UNIX + 1).is_err());
    }
}
