//! Time functions.
//!
//! Timestamps are RFC 3339 strings throughout, matching the format produced
//! by `timestamp()`.

use super::{arg_string, register, Function};
use crate::value::Value;
use chrono::{DateTime, Duration, FixedOffset, Timelike, Utc};
use std::collections::HashMap;

pub fn install(table: &mut HashMap<String, Function>) {
    register(table, "timestamp", 0, Some(0), |_args| {
        Ok(Value::String(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)))
    });
    register(table, "timeadd", 2, Some(2), |args| {
        let ts = parse_timestamp(&arg_string(args, 0)?)?;
        let duration = parse_duration(&arg_string(args, 1)?)?;
        let shifted = ts + duration;
        Ok(Value::String(shifted.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)))
    });
    register(table, "timecmp", 2, Some(2), |args| {
        let a = parse_timestamp(&arg_string(args, 0)?)?;
        let b = parse_timestamp(&arg_string(args, 1)?)?;
        Ok(Value::from(match a.cmp(&b) {
            std::cmp::Ordering::Less => -1i64,
            std::cmp::Ordering::Equal => 0,
            std::cmp::Ordering::Greater => 1,
        }))
    });
    register(table, "formatdate", 2, Some(2), |args| {
        let spec = arg_string(args, 0)?;
        let ts = parse_timestamp(&arg_string(args, 1)?)?;
        format_date(&spec, &ts).map(Value::String)
    });
}

fn parse_timestamp(s: &str) -> Result<DateTime<FixedOffset>, String> {
    DateTime::parse_from_rfc3339(s).map_err(|e| format!("invalid RFC 3339 timestamp \"{}\": {}", s, e))
}

/// Parse durations of the form `1h30m`, `-10m`, `90s`, `1500ms`.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let (negative, mut rest) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    if rest.is_empty() {
        return Err("empty duration".into());
    }
    let mut total = Duration::zero();
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("duration \"{}\" is missing a unit", s))?;
        let number: f64 = rest[..digits_end]
            .parse()
            .map_err(|_| format!("invalid duration \"{}\"", s))?;
        rest = &rest[digits_end..];
        let (unit, len) = if rest.starts_with("ms") {
            ("ms", 2)
        } else if rest.starts_with("us") {
            ("us", 2)
        } else if rest.starts_with("ns") {
            ("ns", 2)
        } else {
            (&rest[..1], 1)
        };
        let millis = match unit {
            "h" => number * 3_600_000.0,
            "m" => number * 60_000.0,
            "s" => number * 1_000.0,
            "ms" => number,
            "us" => number / 1_000.0,
            "ns" => number / 1_000_000.0,
            other => return Err(format!("unknown duration unit \"{}\"", other)),
        };
        total = total + Duration::milliseconds(millis.round() as i64);
        rest = &rest[len..];
    }
    Ok(if negative { -total } else { total })
}

/// Terraform-style date formatting tokens, with `'...'` literals.
fn format_date(spec: &str, ts: &DateTime<FixedOffset>) -> Result<String, String> {
    let mut out = String::new();
    let chars: Vec<char> = spec.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            let mut j = i + 1;
            while j < chars.len() && chars[j] != '\'' {
                out.push(chars[j]);
                j += 1;
            }
            if j >= chars.len() {
                return Err("unterminated literal in date format".into());
            }
            i = j + 1;
            continue;
        }
        if !c.is_ascii_alphabetic() {
            out.push(c);
            i += 1;
            continue;
        }
        let mut run = 1;
        while i + run < chars.len() && chars[i + run] == c {
            run += 1;
        }
        let token: String = chars[i..i + run].iter().collect();
        let rendered = match token.as_str() {
            "YYYY" => ts.format("%Y").to_string(),
            "YY" => ts.format("%y").to_string(),
            "MMMM" => ts.format("%B").to_string(),
            "MMM" => ts.format("%b").to_string(),
            "MM" => ts.format("%m").to_string(),
            "M" => ts.format("%-m").to_string(),
            "DD" => ts.format("%d").to_string(),
            "D" => ts.format("%-d").to_string(),
            "EEEE" => ts.format("%A").to_string(),
            "EEE" => ts.format("%a").to_string(),
            "hh" => ts.format("%H").to_string(),
            "h" => ts.format("%-H").to_string(),
            "HH" => ts.format("%I").to_string(),
            "H" => ts.format("%-I").to_string(),
            "AA" => ts.format("%p").to_string(),
            "aa" => ts.format("%p").to_string().to_lowercase(),
            "mm" => ts.format("%M").to_string(),
            "m" => ts.format("%-M").to_string(),
            "ss" => ts.format("%S").to_string(),
            "s" => format!("{}", ts.second()),
            "ZZZZZ" => ts.format("%:z").to_string(),
            "ZZZZ" => ts.format("%z").to_string(),
            "Z" => {
                if ts.offset().local_minus_utc() == 0 {
                    "Z".to_string()
                } else {
                    ts.format("%:z").to_string()
                }
            }
            other => return Err(format!("unknown date format token \"{}\"", other)),
        };
        out.push_str(&rendered);
        i += run;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use crate::value::Value;
    use std::path::PathBuf;

    fn call(name: &str, args: &[Value]) -> Result<Value, String> {
        let table = super::super::standard_functions(PathBuf::from("/"));
        table
            .get(name)
            .unwrap()
            .call(name, args)
            .map_err(|d| d.to_string())
    }

    #[test]
    fn test_timeadd() {
        assert_eq!(
            call("timeadd", &["2024-05-01T00:00:00Z".into(), "1h30m".into()]).unwrap(),
            Value::from("2024-05-01T01:30:00Z")
        );
        assert_eq!(
            call("timeadd", &["2024-05-01T00:00:00Z".into(), "-10m".into()]).unwrap(),
            Value::from("2024-04-30T23:50:00Z")
        );
    }

    #[test]
    fn test_timecmp() {
        assert_eq!(
            call(
                "timecmp",
                &["2024-05-01T00:00:00Z".into(), "2024-05-02T00:00:00Z".into()]
            )
            .unwrap(),
            Value::from(-1)
        );
        assert_eq!(
            call(
                "timecmp",
                &["2024-05-01T01:00:00+01:00".into(), "2024-05-01T00:00:00Z".into()]
            )
            .unwrap(),
            Value::from(0)
        );
    }

    #[test]
    fn test_formatdate() {
        assert_eq!(
            call(
                "formatdate",
                &["YYYY-MM-DD'T'hh:mm:ss".into(), "2024-05-01T13:09:05Z".into()]
            )
            .unwrap(),
            Value::from("2024-05-01T13:09:05")
        );
        assert_eq!(
            call("formatdate", &["D MMM YYYY".into(), "2024-05-01T00:00:00Z".into()]).unwrap(),
            Value::from("1 May 2024")
        );
    }

    #[test]
    fn test_timestamp_is_rfc3339() {
        let ts = call("timestamp", &[]).unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts.as_str().unwrap()).is_ok());
    }
}
