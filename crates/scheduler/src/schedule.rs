//! Repeating-interval schedules (`R<n>/<start>/<interval>`) and next-run
//! computation.
//!
//! Everything here is a pure function of its inputs: callers pass the
//! reference instant, nothing reads the wall clock.

use std::{fmt, str::FromStr};

use {
    chrono::{DateTime, FixedOffset, SecondsFormat, TimeDelta, Utc},
    serde::{Deserialize, Serialize},
};

use crate::{Error, Result, duration::IsoDuration};

/// How many more times a job repeats after its next run.
///
/// `R<n>` means n additional occurrences after the first, so `Times(2)`
/// yields three runs in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Repeat {
    Times(u32),
    Indefinite,
}

impl Repeat {
    #[must_use]
    pub fn is_exhausted(self) -> bool {
        self == Self::Times(0)
    }

    /// Consume one repetition. `Indefinite` never changes.
    #[must_use]
    pub fn decrement(self) -> Self {
        match self {
            Self::Times(n) => Self::Times(n.saturating_sub(1)),
            Self::Indefinite => Self::Indefinite,
        }
    }
}

/// A parsed schedule specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSpec {
    pub repeat: Repeat,
    /// First due instant. The offset is kept so calendar units are added in
    /// the author's local time.
    pub start: DateTime<FixedOffset>,
    pub interval: IsoDuration,
}

/// Outcome of asking for the next run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextRun {
    At(DateTime<Utc>),
    Exhausted,
}

impl FromStr for ScheduleSpec {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self> {
        let malformed = |reason: String| Error::malformed_schedule(input, reason);

        let fields: Vec<&str> = input.trim().split('/').collect();
        let [repeat, start, interval] = fields.as_slice() else {
            return Err(malformed(format!(
                "expected 3 '/'-separated fields, found {}",
                fields.len()
            )));
        };

        let count = repeat
            .strip_prefix('R')
            .ok_or_else(|| malformed("repeat field must start with 'R'".into()))?;
        let repeat = if count.is_empty() {
            Repeat::Indefinite
        } else {
            Repeat::Times(
                count
                    .parse()
                    .map_err(|_| malformed(format!("invalid repeat count '{count}'")))?,
            )
        };

        let start = DateTime::parse_from_rfc3339(start)
            .map_err(|e| malformed(format!("invalid start time '{start}': {e}")))?;

        let interval = if interval.is_empty() && repeat == Repeat::Times(0) {
            IsoDuration::default()
        } else {
            interval.parse::<IsoDuration>().map_err(|e| match e {
                Error::MalformedSchedule { reason, .. } => {
                    malformed(format!("invalid interval: {reason}"))
                },
                other => other,
            })?
        };

        if interval.is_zero() && repeat != Repeat::Times(0) {
            return Err(malformed(
                "a repeating schedule needs a non-zero interval".into(),
            ));
        }

        Ok(Self {
            repeat,
            start,
            interval,
        })
    }
}

impl fmt::Display for ScheduleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repeat {
            Repeat::Times(n) => write!(f, "R{n}")?,
            Repeat::Indefinite => f.write_str("R")?,
        }
        write!(
            f,
            "/{}/{}",
            self.start.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            self.interval
        )
    }
}

impl ScheduleSpec {
    #[must_use]
    pub fn start_utc(&self) -> DateTime<Utc> {
        self.start.with_timezone(&Utc)
    }

    /// The first `count` due instants as seen from `now`.
    #[must_use]
    pub fn preview(&self, now: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        if count == 0 {
            return out;
        }
        let first = first_due(Some(self), now);
        out.push(first);

        let mut anchor = self.start_utc();
        let mut remaining = self.repeat;
        let mut reference = first;
        while out.len() < count {
            match advance(self, remaining, anchor, reference) {
                (NextRun::At(next), left) => {
                    out.push(next);
                    anchor = next;
                    reference = next;
                    remaining = left;
                },
                (NextRun::Exhausted, _) => break,
            }
        }
        out
    }
}

/// When a freshly created job should first run: at its start instant if that
/// lies in the future, otherwise immediately.
#[must_use]
pub fn first_due(spec: Option<&ScheduleSpec>, now: DateTime<Utc>) -> DateTime<Utc> {
    match spec.map(ScheduleSpec::start_utc) {
        Some(start) if start > now => start,
        _ => now,
    }
}

/// The first `last_due + k * interval` (k >= 1) strictly after `reference`.
///
/// Occurrences missed while the process was down are skipped rather than
/// replayed. Calendar units are added in `offset`. Returns `None` for a zero
/// interval or on overflow.
#[must_use]
pub fn next_due(
    interval: &IsoDuration,
    offset: FixedOffset,
    last_due: DateTime<Utc>,
    reference: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if interval.is_zero() {
        return None;
    }

    if let Some(step) = interval.fixed_seconds() {
        let step_delta = TimeDelta::try_seconds(step)?;
        let behind = (reference - last_due).num_seconds();
        let steps = if behind < 0 { 1 } else { behind / step + 1 };
        let mut next = last_due.checked_add_signed(TimeDelta::try_seconds(step.checked_mul(steps)?)?)?;
        // Sub-second remainder of `reference` can leave us one step short.
        while next <= reference {
            next = next.checked_add_signed(step_delta)?;
        }
        return Some(next);
    }

    let mut next = last_due.with_timezone(&offset);
    loop {
        next = interval.add_to(next)?;
        let next_utc = next.with_timezone(&Utc);
        if next_utc > reference {
            return Some(next_utc);
        }
    }
}

/// Advance a schedule after a run.
///
/// `anchor` is the grid instant the previous run was scheduled from and
/// `remaining` the repeats left before that run. Returns the next run and
/// the counter to store with it.
#[must_use]
pub fn advance(
    spec: &ScheduleSpec,
    remaining: Repeat,
    anchor: DateTime<Utc>,
    reference: DateTime<Utc>,
) -> (NextRun, Repeat) {
    if remaining.is_exhausted() {
        return (NextRun::Exhausted, remaining);
    }
    match next_due(&spec.interval, *spec.start.offset(), anchor, reference) {
        Some(next) => (NextRun::At(next), remaining.decrement()),
        None => (NextRun::Exhausted, Repeat::Times(0)),
    }
}
