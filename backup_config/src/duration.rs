//! Parsing of the `<count><unit>` durations used by
//! `field_obsolete_threshold` (e.g. `30d`, `6M`, `1y`).

use chrono::Duration;

use crate::{InvalidDurationSnafu, Result};

/// Seconds per unit. Months and years are fixed-width: `M` is thirty days
/// and `y` is 365 days.
fn unit_seconds(unit: char) -> Option<i64> {
    match unit {
        's' => Some(1),
        'm' => Some(60),
        'h' => Some(3_600),
        'd' => Some(86_400),
        'w' => Some(7 * 86_400),
        'M' => Some(30 * 86_400),
        'y' => Some(365 * 86_400),
        _ => None,
    }
}

/// Parses a threshold like `"6M"`. An empty string disables the filter and
/// parses to `None`.
pub fn parse_threshold(value: &str) -> Result<Option<Duration>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }

    let (count, unit) = value.split_at(value.len() - unit_len(value));
    let unit: char = match unit.chars().next() {
        Some(c) if unit.chars().count() == 1 => c,
        _ => {
            return InvalidDurationSnafu {
                value,
                reason: "expected a single trailing unit out of s m h d w M y",
            }
            .fail()
        }
    };
    let seconds_per_unit = unit_seconds(unit).ok_or_else(|| {
        InvalidDurationSnafu {
            value,
            reason: format!("unknown unit `{}`; expected one of s m h d w M y", unit),
        }
        .build()
    })?;
    let count: i64 = count.parse().map_err(|_| {
        InvalidDurationSnafu {
            value,
            reason: "expected a positive integer count before the unit",
        }
        .build()
    })?;
    if count <= 0 {
        return InvalidDurationSnafu {
            value,
            reason: "count must be positive",
        }
        .fail();
    }
    let seconds = count.checked_mul(seconds_per_unit).ok_or_else(|| {
        InvalidDurationSnafu {
            value,
            reason: "duration overflows",
        }
        .build()
    })?;
    Ok(Some(Duration::seconds(seconds)))
}

/// Length in bytes of the trailing non-digit run of `value`.
fn unit_len(value: &str) -> usize {
    value
        .chars()
        .rev()
        .take_while(|c| !c.is_ascii_digit())
        .map(char::len_utf8)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_threshold_disables_the_filter() {
        assert_eq!(parse_threshold("").unwrap(), None);
        assert_eq!(parse_threshold("  ").unwrap(), None);
    }

    #[test]
    fn plain_units() {
        assert_eq!(parse_threshold("45s").unwrap(), Some(Duration::seconds(45)));
        assert_eq!(parse_threshold("10m").unwrap(), Some(Duration::minutes(10)));
        assert_eq!(parse_threshold("2h").unwrap(), Some(Duration::hours(2)));
        assert_eq!(parse_threshold("30d").unwrap(), Some(Duration::days(30)));
        assert_eq!(parse_threshold("2w").unwrap(), Some(Duration::days(14)));
    }

    #[test]
    fn months_are_thirty_days_years_365() {
        assert_eq!(parse_threshold("6M").unwrap(), Some(Duration::days(180)));
        assert_eq!(parse_threshold("1y").unwrap(), Some(Duration::days(365)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_threshold("6").is_err());
        assert!(parse_threshold("M").is_err());
        assert!(parse_threshold("6q").is_err());
        assert!(parse_threshold("-3d").is_err());
        assert!(parse_threshold("6 M").is_err());
        assert!(parse_threshold("6Mo").is_err());
    }
}
