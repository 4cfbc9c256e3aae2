pub mod config;
pub mod feed;
pub mod poll;
pub mod run;
pub mod vote;

use chrono::{DateTime, Duration, Utc};
use pollster_core::{Config, PollService};
use serde::Serialize;

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Load the config and open the service it describes.
pub fn open_service() -> Result<(Config, PollService), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let service = PollService::open(&config)?;
    Ok((config, service))
}

pub fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse an RFC 3339 timestamp or an offset from now such as `+90s`, `+5m`, `+2h`, `+1d`.
pub fn parse_time(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    if let Some(offset) = input.strip_prefix('+') {
        let split = offset
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(offset.len());
        let (digits, unit) = offset.split_at(split);
        let invalid = || format!("invalid offset '{input}'");
        let amount: i64 = digits.parse().map_err(|_| invalid())?;
        let delta = match unit {
            "" | "s" => Duration::try_seconds(amount),
            "m" => Duration::try_minutes(amount),
            "h" => Duration::try_hours(amount),
            "d" => Duration::try_days(amount),
            _ => return Err(format!("unknown unit '{unit}' in '{input}' (use s, m, h or d)")),
        };
        return delta
            .and_then(|delta| now.checked_add_signed(delta))
            .ok_or_else(invalid);
    }
    DateTime::parse_from_rfc3339(input)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid time '{input}': {e}"))
}
