//! Time-interval policy predicate.
//!
//! A constraint holds while `valid_from <= now < valid_until`. An absent bound is
//! unbounded on that side, but a constraint with neither bound, a blank bound, or a
//! bound that does not parse is always a violation: the predicate never fails open.

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Bound {
    ValidFrom,
    ValidUntil,
}

impl Bound {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidFrom => "valid_from",
            Self::ValidUntil => "valid_until",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationKind {
    NotYetValid,
    Expired,
    MalformedBound { bound: Bound, raw: String },
    MissingBounds,
    InvertedInterval,
}

impl ViolationKind {
    /// Malformed or missing input, as opposed to a well-formed interval that does not hold.
    #[must_use]
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::MalformedBound { .. } | Self::MissingBounds | Self::InvertedInterval)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PolicyOutcome {
    Satisfied,
    Violated { violation: ViolationKind },
}

impl PolicyOutcome {
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied)
    }

    #[must_use]
    pub fn violation(&self) -> Option<&ViolationKind> {
        match self {
            Self::Satisfied => None,
            Self::Violated { violation } => Some(violation),
        }
    }

    fn violated(violation: ViolationKind) -> Self {
        Self::Violated { violation }
    }
}

/// A time-bound constraint attached to an agreement. Bounds stay raw so that
/// malformed input reaches the evaluator instead of failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TimeIntervalConstraint {
    pub constraint_id: String,
    #[serde(default)]
    pub valid_from: Option<String>,
    #[serde(default)]
    pub valid_until: Option<String>,
}

impl TimeIntervalConstraint {
    #[must_use]
    pub fn evaluate(&self, now: OffsetDateTime) -> PolicyOutcome {
        evaluate_time_interval(now, self.valid_from.as_deref(), self.valid_until.as_deref())
    }
}

/// Parse an instant as RFC 3339 or as integer seconds since the Unix epoch.
#[must_use]
pub fn parse_instant(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(parsed);
    }
    raw.parse::<i64>().ok().and_then(|seconds| OffsetDateTime::from_unix_timestamp(seconds).ok())
}

#[must_use]
pub fn evaluate_time_interval(
    now: OffsetDateTime,
    valid_from: Option<&str>,
    valid_until: Option<&str>,
) -> PolicyOutcome {
    if valid_from.is_none() && valid_until.is_none() {
        return PolicyOutcome::violated(ViolationKind::MissingBounds);
    }

    let from = match parse_bound(Bound::ValidFrom, valid_from) {
        Ok(from) => from,
        Err(violation) => return PolicyOutcome::violated(violation),
    };
    let until = match parse_bound(Bound::ValidUntil, valid_until) {
        Ok(until) => until,
        Err(violation) => return PolicyOutcome::violated(violation),
    };

    evaluate_interval(now, from, until)
}

/// Evaluate already-parsed bounds. Both `None` is treated as a missing constraint.
#[must_use]
pub fn evaluate_interval(
    now: OffsetDateTime,
    valid_from: Option<OffsetDateTime>,
    valid_until: Option<OffsetDateTime>,
) -> PolicyOutcome {
    match (valid_from, valid_until) {
        (None, None) => PolicyOutcome::violated(ViolationKind::MissingBounds),
        (Some(from), Some(until)) if from >= until => {
            PolicyOutcome::violated(ViolationKind::InvertedInterval)
        }
        (from, until) => {
            if from.is_some_and(|from| now < from) {
                PolicyOutcome::violated(ViolationKind::NotYetValid)
            } else if until.is_some_and(|until| now >= until) {
                PolicyOutcome::violated(ViolationKind::Expired)
            } else {
                PolicyOutcome::Satisfied
            }
        }
    }
}

fn parse_bound(bound: Bound, raw: Option<&str>) -> Result<Option<OffsetDateTime>, ViolationKind> {
    match raw {
        None => Ok(None),
        Some(raw) => parse_instant(raw)
            .map(Some)
            .ok_or_else(|| ViolationKind::MalformedBound { bound, raw: raw.to_string() }),
    }
}
