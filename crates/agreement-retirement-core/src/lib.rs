use std::fmt::{Display, Formatter};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod policy;
pub mod query;
pub mod store;

pub use policy::{
    evaluate_interval, evaluate_time_interval, parse_instant, Bound, PolicyOutcome,
    TimeIntervalConstraint, ViolationKind,
};
pub use query::{
    escape_like, like_matches, CompiledQuery, Criterion, CriterionValue, Operator, Predicate,
    QueryField, QuerySpec, RetirementQuery, SortField, SortOrder, DEFAULT_QUERY_LIMIT,
    MAX_QUERY_LIMIT,
};
pub use store::{InMemoryRetirementStore, RetirementStore};

pub const MANUAL_REASON: &str = "MANUAL";
pub const EXPIRED_REASON: &str = "EXPIRED";
pub const POLICY_VIOLATION_PREFIX: &str = "POLICY_VIOLATION:";
pub const POLICY_MONITOR_ACTOR: &str = "policy-monitor";
pub const RETIREMENT_EVENT_TYPE: &str = "ContractAgreementRetired";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RetirementError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("transient store failure: {0}")]
    TransientStoreFailure(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("external dependency unavailable: {0}")]
    ExternalDependencyUnavailable(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl RetirementError {
    /// Whether a caller may retry the same operation later and expect a different result.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientStoreFailure(_) | Self::ExternalDependencyUnavailable(_))
    }
}

/// Coded interpretation of a free-text retirement reason.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReasonCode {
    Manual,
    PolicyViolation { constraint_id: String },
    Expired,
    Other,
}

impl ReasonCode {
    #[must_use]
    pub fn parse(reason: &str) -> Self {
        let reason = reason.trim();
        if let Some(constraint_id) = reason.strip_prefix(POLICY_VIOLATION_PREFIX) {
            return Self::PolicyViolation { constraint_id: constraint_id.to_string() };
        }
        match reason {
            MANUAL_REASON => Self::Manual,
            EXPIRED_REASON => Self::Expired,
            _ => Self::Other,
        }
    }

    #[must_use]
    pub fn policy_violation_reason(constraint_id: &str) -> String {
        format!("{POLICY_VIOLATION_PREFIX}{constraint_id}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RetirementRecord {
    pub agreement_id: String,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub retired_at: OffsetDateTime,
    pub retired_by: String,
}

impl RetirementRecord {
    /// Build a record stamped at `retired_at`, truncated to millisecond precision.
    #[must_use]
    pub fn new(
        agreement_id: impl Into<String>,
        reason: impl Into<String>,
        retired_by: impl Into<String>,
        retired_at: OffsetDateTime,
    ) -> Self {
        Self {
            agreement_id: agreement_id.into(),
            reason: reason.into(),
            retired_at: truncate_to_millis(retired_at),
            retired_by: retired_by.into(),
        }
    }

    /// Validate the write-side invariants of a retirement record.
    ///
    /// # Errors
    /// Returns [`RetirementError::InvalidArgument`] when the agreement id, reason, or
    /// actor is blank, or when the agreement id carries surrounding whitespace.
    pub fn validate(&self) -> Result<(), RetirementError> {
        if self.agreement_id.trim().is_empty() {
            return Err(RetirementError::InvalidArgument(
                "agreement_id MUST be non-empty".to_string(),
            ));
        }
        if self.agreement_id.trim() != self.agreement_id {
            return Err(RetirementError::InvalidArgument(
                "agreement_id MUST NOT have leading or trailing whitespace".to_string(),
            ));
        }
        if self.reason.trim().is_empty() {
            return Err(RetirementError::InvalidArgument("reason MUST be non-empty".to_string()));
        }
        if self.retired_by.trim().is_empty() {
            return Err(RetirementError::InvalidArgument(
                "retired_by MUST be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn reason_code(&self) -> ReasonCode {
        ReasonCode::parse(&self.reason)
    }

    #[must_use]
    pub fn retired_at_millis(&self) -> i64 {
        unix_millis(self.retired_at)
    }
}

/// Result of a retirement attempt; `was_new` is false when a prior record already existed.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RetirementOutcome {
    pub record: RetirementRecord,
    pub was_new: bool,
}

/// Notification emitted once per newly stored retirement, as
/// `{eventType, agreementId, reason, retiredAt}` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetirementEvent {
    pub event_type: String,
    pub agreement_id: String,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub retired_at: OffsetDateTime,
}

impl From<&RetirementRecord> for RetirementEvent {
    fn from(record: &RetirementRecord) -> Self {
        Self {
            event_type: RETIREMENT_EVENT_TYPE.to_string(),
            agreement_id: record.agreement_id.clone(),
            reason: record.reason.clone(),
            retired_at: record.retired_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgreementStatus {
    Negotiating,
    Finalized,
    Transferring,
    Terminated,
    #[serde(other)]
    Unknown,
}

impl AgreementStatus {
    /// Every state short of termination is re-evaluated by the monitor. An unrecognised
    /// status stays watched so a violation is never skipped.
    #[must_use]
    pub fn is_monitored(self) -> bool {
        !matches!(self, Self::Terminated)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Negotiating => "negotiating",
            Self::Finalized => "finalized",
            Self::Transferring => "transferring",
            Self::Terminated => "terminated",
            Self::Unknown => "unknown",
        }
    }
}

impl Display for AgreementStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transient snapshot of an externally owned agreement, as listed by the agreement source.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MonitoredAgreementView {
    pub agreement_id: String,
    pub status: AgreementStatus,
    #[serde(default)]
    pub constraints: Vec<TimeIntervalConstraint>,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<OffsetDateTime>,
}

impl FixedClock {
    #[must_use]
    pub fn new(now: OffsetDateTime) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: time::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[must_use]
pub fn unix_millis(value: OffsetDateTime) -> i64 {
    let millis = value.unix_timestamp_nanos() / 1_000_000;
    i64::try_from(millis).unwrap_or(if millis < 0 { i64::MIN } else { i64::MAX })
}

/// Inverse of [`unix_millis`].
///
/// # Errors
/// Returns [`RetirementError::Persistence`] when the value is outside the supported range.
pub fn from_unix_millis(millis: i64) -> Result<OffsetDateTime, RetirementError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|err| RetirementError::Persistence(format!("invalid timestamp {millis}: {err}")))
}

#[must_use]
pub fn truncate_to_millis(value: OffsetDateTime) -> OffsetDateTime {
    let nanos = value.nanosecond();
    value.replace_nanosecond(nanos - nanos % 1_000_000).unwrap_or(value)
}
