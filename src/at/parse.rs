//! Parsers for the modem response formats the connectivity core consumes.
//!
//! All parsers take the captured response line (or lines) and return `None` when the
//! format does not match; callers treat that as "no data" and keep their previous value.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

/// Raw CSQ value meaning "not known or not detectable"
pub const RSSI_UNKNOWN: i32 = 99;

/// Text after `prefix` on the line containing it
fn after<'a>(response: &'a str, prefix: &str) -> Option<&'a str> {
    let start = response.find(prefix)? + prefix.len();
    let rest = &response[start..];
    let end = rest.find(['\r', '\n']).unwrap_or(rest.len());
    Some(rest[..end].trim())
}

fn unquote(field: &str) -> &str {
    field.trim().trim_matches('"')
}

/// `+CSQ: <rssi>,<ber>` → dBm, or [`RSSI_UNKNOWN`] when the modem reports 99
pub fn signal_rssi(response: &str) -> Option<i32> {
    let body = after(response, "+CSQ:")?;
    let raw: i32 = body.split(',').next()?.trim().parse().ok()?;
    if raw == RSSI_UNKNOWN {
        Some(RSSI_UNKNOWN)
    } else {
        Some(-113 + raw * 2)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub tech: String,
    pub operator: String,
    pub channel: String,
}

pub fn no_service(response: &str) -> bool {
    response.contains("No Service")
}

/// `+QNWINFO: "eMTC","24001","LTE BAND 20",6300`
pub fn network_info(response: &str) -> Option<NetworkInfo> {
    let body = after(response, "+QNWINFO:")?;
    let fields: Vec<&str> = body.split(',').map(unquote).collect();
    if fields.len() < 4 || fields[0].is_empty() {
        return None;
    }
    Some(NetworkInfo {
        tech: fields[0].to_string(),
        operator: fields[1].to_string(),
        channel: format!("{} {}", fields[2], fields[3]),
    })
}

/// `+QIACT: 1,1,1,"10.64.12.7"`
pub fn pdp_address(response: &str) -> Option<String> {
    let body = after(response, "+QIACT:")?;
    let ip = unquote(body.split(',').nth(3)?);
    (!ip.is_empty()).then(|| ip.to_string())
}

/// `+QCCID: 89462046...`
pub fn ccid(response: &str) -> Option<String> {
    let id = after(response, "+QCCID:")?;
    (!id.is_empty()).then(|| id.to_string())
}

/// Registration status from `+CREG:`, `+CGREG:` or `+CEREG:` with URC mode 2.
/// Home (1) and roaming (5) both count as registered.
pub fn registered(response: &str, prefix: &str) -> bool {
    let Some(body) = after(response, prefix) else {
        return false;
    };
    matches!(body.split(',').nth(1).map(str::trim), Some("1") | Some("5"))
}

/// An entry of an `AT+COPS=?` scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedOperator {
    pub long_name: String,
    pub short_name: String,
}

/// Available (1) and current (2) operators from an `AT+COPS=?` answer.
///
/// The short name is the numeric MCC/MNC, which is what `AT+COPS=1,2,...` selects by.
pub fn scanned_operators(response: &str) -> Vec<ScannedOperator> {
    let mut found = Vec::new();
    let mut rest = response;
    while let Some(open) = rest.find('(') {
        let Some(close) = rest[open..].find(')') else {
            break;
        };
        let group = &rest[open + 1..open + close];
        rest = &rest[open + close + 1..];

        let fields: Vec<&str> = group.split(',').collect();
        if fields.len() < 4 {
            continue;
        }
        if !matches!(fields[0].trim().chars().next(), Some('1') | Some('2')) {
            continue;
        }
        found.push(ScannedOperator {
            long_name: unquote(fields[1]).to_string(),
            short_name: unquote(fields[3]).to_string(),
        });
    }
    found
}

/// `+QNTP: 0,"2024/05/01,12:00:00+08"`; the quarter-hour zone suffix is ignored
pub fn ntp_time(response: &str) -> Option<DateTime<Utc>> {
    let body = after(response, "+QNTP: 0,")?;
    let stamp = body.trim_start_matches('"');
    let stamp = stamp.get(..19)?;
    let naive = NaiveDateTime::parse_from_str(stamp, "%Y/%m/%d,%H:%M:%S").ok()?;
    Some(naive.and_utc())
}

/// Position fix from `AT+QGPSLOC=2`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GnssFix {
    pub time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
}

/// `+QGPSLOC: 123519.0,59.30000,18.00000,1.0,20.0,2,0.0,0.0,0.0,010524,05`
///
/// Time of day is `hhmmss.s` in field 0, date `ddmmyy` in field 9.
pub fn gnss_fix(response: &str) -> Option<GnssFix> {
    let body = after(response, "+QGPSLOC:")?;
    let fields: Vec<&str> = body.split(',').map(str::trim).collect();
    if fields.len() < 10 {
        return None;
    }
    let clock = fields[0];
    let date = fields[9];
    if clock.len() < 6 || date.len() < 6 {
        return None;
    }
    let two = |s: &str, at: usize| s.get(at..at + 2)?.parse::<u32>().ok();
    let time = NaiveTime::from_hms_opt(two(clock, 0)?, two(clock, 2)?, two(clock, 4)?)?;
    let day = NaiveDate::from_ymd_opt(2000 + two(date, 4)? as i32, two(date, 2)?, two(date, 0)?)?;

    Some(GnssFix {
        time: NaiveDateTime::new(day, time).and_utc(),
        latitude: fields[1].parse().ok()?,
        longitude: fields[2].parse().ok()?,
    })
}

/// True when `+QGPSXTRATIME:` reports no injected time (`""`)
pub fn xtra_time_missing(response: &str) -> bool {
    match response.find('"') {
        Some(quote) => response[quote..].contains("\"\""),
        None => false,
    }
}

/// Minutes of validity left from `+QGPSCFG: "xtra_info",<left>,...`
pub fn xtra_time_left(response: &str) -> Option<u32> {
    let body = after(response, "+QGPSCFG:")?;
    body.split(',').nth(1)?.trim().parse().ok()
}

/// Format the modem expects for `AT+QGPSXTRATIME=0,"..."`
pub fn xtra_time_stamp(time: DateTime<Utc>) -> String {
    time.format("%Y/%m/%d,%H:%M:%S").to_string()
}

/// `+QFLST: "firmware.bin",123456`
pub fn file_size(response: &str) -> Option<u32> {
    let body = after(response, "+QFLST:")?;
    body.split(',').nth(1)?.trim().parse().ok()
}

/// `+QFOPEN: 1`
pub fn file_handle(response: &str) -> Option<u32> {
    after(response, "+QFOPEN:")?.parse().ok()
}

/// `+QHTTPGET: 0,200,4711` → 200
pub fn http_status(response: &str) -> Option<u16> {
    let body = after(response, "+QHTTPGET:")?;
    body.split(',').nth(1)?.trim().parse().ok()
}

/// `CONNECT 4096` announcing a raw block
pub fn block_length(line: &str) -> Option<usize> {
    after(line, "CONNECT ")?.parse().ok()
}
