//! ISO 8601 calendar durations (`P1Y2M3W4DT5H6M7S`).
//!
//! Years and months are calendar-relative and are added with month
//! arithmetic; weeks, days and the time part are fixed-length once the
//! schedule's UTC offset is fixed.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Days, Months, TimeDelta, TimeZone};

use crate::{Error, Result};

const SECS_PER_DAY: i64 = 86_400;

/// A calendar duration with non-negative integer components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct IsoDuration {
    pub years: u32,
    pub months: u32,
    pub weeks: u32,
    pub days: u32,
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl IsoDuration {
    /// Duration with only a seconds component.
    #[must_use]
    pub fn from_secs(seconds: u32) -> Self {
        Self {
            seconds,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Length in seconds when the duration has no calendar (year/month) part.
    #[must_use]
    pub fn fixed_seconds(&self) -> Option<i64> {
        if self.years != 0 || self.months != 0 {
            return None;
        }
        let days = i64::from(self.weeks) * 7 + i64::from(self.days);
        Some(days * SECS_PER_DAY + self.time_seconds())
    }

    fn time_seconds(&self) -> i64 {
        i64::from(self.hours) * 3_600 + i64::from(self.minutes) * 60 + i64::from(self.seconds)
    }

    /// Add this duration to `instant` in the instant's own time zone.
    ///
    /// Months are added first (the day is clamped to the end of a shorter
    /// month), then weeks and days, then hours, minutes and seconds.
    /// Returns `None` on overflow.
    pub fn add_to<Tz: TimeZone>(&self, instant: DateTime<Tz>) -> Option<DateTime<Tz>> {
        let months = self.years.checked_mul(12)?.checked_add(self.months)?;
        let instant = if months > 0 {
            instant.checked_add_months(Months::new(months))?
        } else {
            instant
        };

        let days = u64::from(self.weeks) * 7 + u64::from(self.days);
        let instant = if days > 0 {
            instant.checked_add_days(Days::new(days))?
        } else {
            instant
        };

        instant.checked_add_signed(TimeDelta::try_seconds(self.time_seconds())?)
    }
}

impl fmt::Display for IsoDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("PT0S");
        }
        f.write_str("P")?;
        for (value, unit) in [
            (self.years, 'Y'),
            (self.months, 'M'),
            (self.weeks, 'W'),
            (self.days, 'D'),
        ] {
            if value != 0 {
                write!(f, "{value}{unit}")?;
            }
        }
        if self.time_seconds() != 0 {
            f.write_str("T")?;
            for (value, unit) in [(self.hours, 'H'), (self.minutes, 'M'), (self.seconds, 'S')] {
                if value != 0 {
                    write!(f, "{value}{unit}")?;
                }
            }
        }
        Ok(())
    }
}

impl FromStr for IsoDuration {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let malformed = |reason: String| Error::malformed_schedule(input, reason);

        let body = input
            .strip_prefix('P')
            .ok_or_else(|| malformed("duration must start with 'P'".into()))?;

        let (date_part, time_part) = match body.split_once('T') {
            Some((date, time)) => (date, Some(time)),
            None => (body, None),
        };

        let mut duration = Self::default();
        let mut components = 0;

        for (unit, value) in parse_section(date_part, &['Y', 'M', 'W', 'D']).map_err(malformed)? {
            components += 1;
            match unit {
                'Y' => duration.years = value,
                'M' => duration.months = value,
                'W' => duration.weeks = value,
                _ => duration.days = value,
            }
        }

        if let Some(time_part) = time_part {
            let parsed = parse_section(time_part, &['H', 'M', 'S']).map_err(malformed)?;
            if parsed.is_empty() {
                return Err(malformed("'T' must be followed by a time component".into()));
            }
            for (unit, value) in parsed {
                components += 1;
                match unit {
                    'H' => duration.hours = value,
                    'M' => duration.minutes = value,
                    _ => duration.seconds = value,
                }
            }
        }

        if components == 0 {
            return Err(malformed("duration has no components".into()));
        }
        Ok(duration)
    }
}

/// Split `section` into `(designator, value)` pairs, enforcing that the
/// designators appear at most once and in the order given by `order`.
fn parse_section(section: &str, order: &[char]) -> std::result::Result<Vec<(char, u32)>, String> {
    let mut out = Vec::new();
    let mut digits = String::new();
    let mut last_pos: Option<usize> = None;

    for c in section.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let Some(pos) = order.iter().position(|&u| u == c) else {
            return Err(format!("unexpected character '{c}'"));
        };
        if digits.is_empty() {
            return Err(format!("designator '{c}' has no value"));
        }
        if last_pos.is_some_and(|last| pos <= last) {
            return Err(format!("designator '{c}' is out of order or repeated"));
        }
        let value = digits
            .parse::<u32>()
            .map_err(|_| format!("value for '{c}' is too large: {digits}"))?;
        out.push((c, value));
        last_pos = Some(pos);
        digits.clear();
    }

    if !digits.is_empty() {
        return Err(format!("number {digits} is missing a designator"));
    }
    Ok(out)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, chrono::Utc, rstest::rstest};

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[rstest]
    #[case("P1D", IsoDuration { days: 1, ..Default::default() })]
    #[case("PT10S", IsoDuration::from_secs(10))]
    #[case("P1DT0H0M0S", IsoDuration { days: 1, ..Default::default() })]
    #[case("P1DT10M10S", IsoDuration { days: 1, minutes: 10, seconds: 10, ..Default::default() })]
    #[case("P2W", IsoDuration { weeks: 2, ..Default::default() })]
    #[case("P1Y2M3W4DT5H6M7S", IsoDuration {
        years: 1, months: 2, weeks: 3, days: 4, hours: 5, minutes: 6, seconds: 7,
    })]
    #[case("PT0S", IsoDuration::default())]
    fn parses_valid(#[case] input: &str, #[case] expected: IsoDuration) {
        assert_eq!(input.parse::<IsoDuration>().unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("1D")]
    #[case("P")]
    #[case("PT")]
    #[case("P1")]
    #[case("PD")]
    #[case("P1D1Y")]
    #[case("P1M1M")]
    #[case("PT1D")]
    #[case("P1H")]
    #[case("P1.5D")]
    #[case("P-1D")]
    #[case("p1d")]
    #[case("P99999999999D")]
    fn rejects_malformed(#[case] input: &str) {
        let err = input.parse::<IsoDuration>().unwrap_err();
        assert!(matches!(err, Error::MalformedSchedule { .. }), "{input}: {err}");
    }

    #[test]
    fn minutes_and_months_share_a_letter() {
        let d: IsoDuration = "P1MT1M".parse().unwrap();
        assert_eq!(d.months, 1);
        assert_eq!(d.minutes, 1);
    }

    #[test]
    fn display_is_canonical() {
        let d: IsoDuration = "P1DT0H0M0S".parse().unwrap();
        assert_eq!(d.to_string(), "P1D");
        assert_eq!(IsoDuration::default().to_string(), "PT0S");
        let d: IsoDuration = "P1Y2M3W4DT5H6M7S".parse().unwrap();
        assert_eq!(d.to_string(), "P1Y2M3W4DT5H6M7S");
    }

    #[test]
    fn display_reparses_to_same_value() {
        for input in ["P1D", "PT90M", "P3M", "P1WT1S", "P1Y"] {
            let d: IsoDuration = input.parse().unwrap();
            assert_eq!(d.to_string().parse::<IsoDuration>().unwrap(), d);
        }
    }

    #[test]
    fn fixed_seconds() {
        let d: IsoDuration = "P1WT1H".parse().unwrap();
        assert_eq!(d.fixed_seconds(), Some(7 * 86_400 + 3_600));
        let d: IsoDuration = "P1M".parse().unwrap();
        assert_eq!(d.fixed_seconds(), None);
    }

    #[test]
    fn add_days_and_time() {
        let d: IsoDuration = "P1DT2H".parse().unwrap();
        assert_eq!(
            d.add_to(utc("2024-01-01T00:00:00Z")).unwrap(),
            utc("2024-01-02T02:00:00Z")
        );
    }

    #[test]
    fn add_month_clamps_to_month_end() {
        let d: IsoDuration = "P1M".parse().unwrap();
        assert_eq!(
            d.add_to(utc("2024-01-31T12:00:00Z")).unwrap(),
            utc("2024-02-29T12:00:00Z")
        );
    }

    #[test]
    fn add_year_is_calendar_relative() {
        let d: IsoDuration = "P1Y".parse().unwrap();
        assert_eq!(
            d.add_to(utc("2023-03-01T00:00:00Z")).unwrap(),
            utc("2024-03-01T00:00:00Z")
        );
    }

    #[test]
    fn add_overflow_is_none() {
        let d = IsoDuration {
            years: u32::MAX,
            ..Default::default()
        };
        assert!(d.add_to(utc("2024-01-01T00:00:00Z")).is_none());
    }
}
