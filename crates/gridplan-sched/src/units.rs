//! Time and memory unit normalisation.
//!
//! Canonical units are megabytes for memory (what Slurm reads in
//! `--mem-per-cpu`) and seconds for wall-clock time. Memory capacities round
//! down and time values round up: a converted value never overstates what a
//! node offers, and never understates how long a job asked to run.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PlanError, PlanResult};

/// Scaling factor between adjacent memory units.
const BINARY_STEP: u64 = 1024;

const SECONDS_PER_MINUTE: u64 = 60;
const SECONDS_PER_HOUR: u64 = 60 * SECONDS_PER_MINUTE;
const SECONDS_PER_DAY: u64 = 24 * SECONDS_PER_HOUR;

/// Memory unit used in operator configuration and on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemoryUnit {
    #[serde(rename = "K", alias = "k")]
    Kilobytes,
    #[serde(rename = "M", alias = "m")]
    Megabytes,
    #[default]
    #[serde(rename = "G", alias = "g")]
    Gigabytes,
    #[serde(rename = "T", alias = "t")]
    Terabytes,
    #[serde(rename = "P", alias = "p")]
    Petabytes,
}

impl MemoryUnit {
    /// Single-letter suffix for this unit.
    pub fn suffix(&self) -> &'static str {
        match self {
            MemoryUnit::Kilobytes => "K",
            MemoryUnit::Megabytes => "M",
            MemoryUnit::Gigabytes => "G",
            MemoryUnit::Terabytes => "T",
            MemoryUnit::Petabytes => "P",
        }
    }

    /// Parse a unit suffix such as `G`, `gb` or `MB`.
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        let upper = suffix.trim().to_ascii_uppercase();
        let letter = upper.strip_suffix('B').unwrap_or(&upper);
        match letter {
            "K" => Some(MemoryUnit::Kilobytes),
            "M" => Some(MemoryUnit::Megabytes),
            "G" => Some(MemoryUnit::Gigabytes),
            "T" => Some(MemoryUnit::Terabytes),
            "P" => Some(MemoryUnit::Petabytes),
            _ => None,
        }
    }

    /// Megabytes per unit; `None` for units smaller than a megabyte.
    fn megabytes(&self) -> Option<u64> {
        match self {
            MemoryUnit::Kilobytes => None,
            MemoryUnit::Megabytes => Some(1),
            MemoryUnit::Gigabytes => Some(BINARY_STEP),
            MemoryUnit::Terabytes => Some(BINARY_STEP * BINARY_STEP),
            MemoryUnit::Petabytes => Some(BINARY_STEP * BINARY_STEP * BINARY_STEP),
        }
    }
}

impl FromStr for MemoryUnit {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MemoryUnit::from_suffix(s)
            .ok_or_else(|| PlanError::unit("memory unit", s, "expected one of K, M, G, T, P"))
    }
}

impl std::fmt::Display for MemoryUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Convert a memory value to megabytes.
///
/// `value` is either a bare number in `unit` or a number carrying its own
/// suffix (`20G`, `512MB`, `1.5t`). Results round down.
pub fn to_canonical_memory(value: &str, unit: MemoryUnit) -> PlanResult<u64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(PlanError::unit("memory", value, "empty value"));
    }
    if trimmed.starts_with('-') {
        return Err(PlanError::unit("memory", value, "must not be negative"));
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, suffix) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(PlanError::unit("memory", value, "not a number"));
    }

    let unit = if suffix.trim().is_empty() {
        unit
    } else {
        MemoryUnit::from_suffix(suffix).ok_or_else(|| {
            PlanError::unit("memory", value, format!("unknown unit '{}'", suffix.trim()))
        })?
    };

    scale_to_megabytes(number, unit)
        .ok_or_else(|| PlanError::unit("memory", value, "not a representable size"))
}

fn scale_to_megabytes(number: &str, unit: MemoryUnit) -> Option<u64> {
    if let Ok(whole) = number.parse::<u64>() {
        return match unit.megabytes() {
            Some(factor) => whole.checked_mul(factor),
            None => Some(whole / BINARY_STEP),
        };
    }

    let fractional: f64 = number.parse().ok()?;
    let megabytes = match unit.megabytes() {
        Some(factor) => fractional * factor as f64,
        None => fractional / BINARY_STEP as f64,
    };
    if !megabytes.is_finite() || megabytes < 0.0 || megabytes >= u64::MAX as f64 {
        return None;
    }
    Some(megabytes.floor() as u64)
}

/// Express a megabyte count in `unit`, rounding down.
pub fn from_megabytes(megabytes: u64, unit: MemoryUnit) -> u64 {
    match unit.megabytes() {
        Some(factor) => megabytes / factor,
        None => megabytes.saturating_mul(BINARY_STEP),
    }
}

/// Share a memory total across slots, rounding up so no slot is short.
pub fn split_across_slots(total_megabytes: u64, slots: u32) -> u64 {
    total_megabytes.div_ceil(u64::from(slots.max(1)))
}

/// How a bare integer time value is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeFormat {
    /// Bare integers are seconds.
    #[default]
    Seconds,
    /// Bare integers are minutes.
    Minutes,
}

impl TimeFormat {
    fn seconds_per_unit(&self) -> u64 {
        match self {
            TimeFormat::Seconds => 1,
            TimeFormat::Minutes => SECONDS_PER_MINUTE,
        }
    }
}

/// Convert a time value to seconds.
///
/// Accepts the Slurm layouts `D-HH:MM:SS`, `D-HH:MM`, `D-HH`, `HH:MM:SS` and
/// `MM:SS`, or a bare number read according to `format`. Fractional seconds
/// round up.
pub fn to_canonical_time(value: &str, format: TimeFormat) -> PlanResult<u64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(PlanError::unit("time", value, "empty value"));
    }
    if trimmed.starts_with('-') {
        return Err(PlanError::unit("time", value, "must not be negative"));
    }

    if trimmed.contains(':') || trimmed.contains('-') {
        return parse_clock(trimmed).map_err(|reason| PlanError::unit("time", value, reason));
    }

    if let Ok(whole) = trimmed.parse::<u64>() {
        return whole
            .checked_mul(format.seconds_per_unit())
            .ok_or_else(|| PlanError::unit("time", value, "out of range"));
    }

    parse_fraction(trimmed, format.seconds_per_unit())
        .map_err(|reason| PlanError::unit("time", value, reason))
}

fn parse_clock(text: &str) -> Result<u64, String> {
    let (days, rest) = match text.split_once('-') {
        Some((days, rest)) => (Some(parse_whole(days)?), rest),
        None => (None, text),
    };

    let fields: Vec<&str> = rest.split(':').collect();
    let (hours, minutes, seconds) = match (days.is_some(), fields.as_slice()) {
        (true, [h]) => (*h, "0", "0"),
        (true, [h, m]) => (*h, *m, "0"),
        (_, [h, m, s]) => (*h, *m, *s),
        (false, [m, s]) => ("0", *m, *s),
        _ => return Err("expected a [D-]HH:MM:SS layout".to_string()),
    };

    let hours = parse_whole(hours)?;
    let minutes = parse_whole(minutes)?;
    let seconds = parse_fraction(seconds, 1)?;

    days.unwrap_or(0)
        .checked_mul(SECONDS_PER_DAY)
        .and_then(|t| t.checked_add(hours.checked_mul(SECONDS_PER_HOUR)?))
        .and_then(|t| t.checked_add(minutes.checked_mul(SECONDS_PER_MINUTE)?))
        .and_then(|t| t.checked_add(seconds))
        .ok_or_else(|| "out of range".to_string())
}

fn parse_whole(text: &str) -> Result<u64, String> {
    if text.is_empty() || !text.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("'{text}' is not a whole number"));
    }
    text.parse().map_err(|_| format!("'{text}' is out of range"))
}

/// Parse a possibly fractional count of `unit_seconds`, rounding up.
fn parse_fraction(text: &str, unit_seconds: u64) -> Result<u64, String> {
    if text.is_empty() || !text.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(format!("'{text}' is not a number"));
    }
    if let Ok(whole) = text.parse::<u64>() {
        return whole
            .checked_mul(unit_seconds)
            .ok_or_else(|| format!("'{text}' is out of range"));
    }
    let value: f64 = text.parse().map_err(|_| format!("'{text}' is not a number"))?;
    let seconds = (value * unit_seconds as f64).ceil();
    if !seconds.is_finite() || seconds >= u64::MAX as f64 {
        return Err(format!("'{text}' is out of range"));
    }
    Ok(seconds as u64)
}

/// Format seconds in Slurm's `days-hours:minutes:seconds` layout.
pub fn format_slurm_time(seconds: u64) -> String {
    let days = seconds / SECONDS_PER_DAY;
    let hours = (seconds % SECONDS_PER_DAY) / SECONDS_PER_HOUR;
    let minutes = (seconds % SECONDS_PER_HOUR) / SECONDS_PER_MINUTE;
    let secs = seconds % SECONDS_PER_MINUTE;
    format!("{days}-{hours:02}:{minutes:02}:{secs:02}")
}

/// Whole minutes covering `seconds`, rounding up.
pub fn ceil_minutes(seconds: u64) -> u64 {
    seconds.div_ceil(SECONDS_PER_MINUTE)
}
