use std::fmt::{Display, Formatter};
use std::sync::Arc;

use agreement_retirement_core::{ReasonCode, RetirementRecord};
use serde::{Deserialize, Serialize};

use crate::RetirementService;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenyCode {
    AgreementRetiredManual,
    AgreementRetiredPolicyViolation,
    AgreementRetiredExpired,
    AgreementRetired,
    RetirementStatusUnavailable,
    InvalidAgreementId,
}

impl DenyCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgreementRetiredManual => "AGREEMENT_RETIRED_MANUAL",
            Self::AgreementRetiredPolicyViolation => "AGREEMENT_RETIRED_POLICY_VIOLATION",
            Self::AgreementRetiredExpired => "AGREEMENT_RETIRED_EXPIRED",
            Self::AgreementRetired => "AGREEMENT_RETIRED",
            Self::RetirementStatusUnavailable => "RETIREMENT_STATUS_UNAVAILABLE",
            Self::InvalidAgreementId => "INVALID_AGREEMENT_ID",
        }
    }

    #[must_use]
    pub fn for_reason(reason: &ReasonCode) -> Self {
        match reason {
            ReasonCode::Manual => Self::AgreementRetiredManual,
            ReasonCode::PolicyViolation { .. } => Self::AgreementRetiredPolicyViolation,
            ReasonCode::Expired => Self::AgreementRetiredExpired,
            ReasonCode::Other => Self::AgreementRetired,
        }
    }
}

impl Display for DenyCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum EnforcementDecision {
    Allow,
    Deny { code: DenyCode, message: String },
}

impl EnforcementDecision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    #[must_use]
    pub fn deny_code(&self) -> Option<DenyCode> {
        match self {
            Self::Allow => None,
            Self::Deny { code, .. } => Some(*code),
        }
    }

    fn retired(record: &RetirementRecord) -> Self {
        Self::Deny {
            code: DenyCode::for_reason(&record.reason_code()),
            message: format!("Contract Agreement with ID={} has been retired", record.agreement_id),
        }
    }
}

/// Authorization checkpoint consulted before transfers start and by periodic
/// re-validation. Reads only; any failure to read the retirement status denies.
#[derive(Clone)]
pub struct EnforcementAdapter {
    service: Arc<RetirementService>,
}

impl EnforcementAdapter {
    #[must_use]
    pub fn new(service: Arc<RetirementService>) -> Self {
        Self { service }
    }

    #[must_use]
    pub fn check_allowed(&self, agreement_id: &str) -> EnforcementDecision {
        if agreement_id.trim().is_empty() {
            return EnforcementDecision::Deny {
                code: DenyCode::InvalidAgreementId,
                message: "agreement id MUST be non-empty".to_string(),
            };
        }

        match self.service.get(agreement_id) {
            Ok(None) => EnforcementDecision::Allow,
            Ok(Some(record)) => {
                let decision = EnforcementDecision::retired(&record);
                tracing::debug!(agreement_id, reason = %record.reason, "denied retired agreement");
                decision
            }
            Err(err) => {
                tracing::warn!(agreement_id, error = %err, "retirement status unavailable; denying");
                EnforcementDecision::Deny {
                    code: DenyCode::RetirementStatusUnavailable,
                    message: format!(
                        "retirement status of Contract Agreement with ID={agreement_id} is unavailable"
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogAuditSink;
    use agreement_retirement_core::{
        CompiledQuery, FixedClock, InMemoryRetirementStore, RetirementError, RetirementOutcome,
        RetirementStore, EXPIRED_REASON, MANUAL_REASON, POLICY_MONITOR_ACTOR,
    };
    use time::OffsetDateTime;

    struct UnavailableStore;

    impl RetirementStore for UnavailableStore {
        fn insert_if_absent(&self, _record: &RetirementRecord) -> Result<RetirementOutcome, RetirementError> {
            Err(RetirementError::TransientStoreFailure("database is locked".to_string()))
        }

        fn get_by_agreement_id(&self, _agreement_id: &str) -> Result<Option<RetirementRecord>, RetirementError> {
            Err(RetirementError::TransientStoreFailure("database is locked".to_string()))
        }

        fn query(&self, _query: &CompiledQuery) -> Result<Vec<RetirementRecord>, RetirementError> {
            Err(RetirementError::TransientStoreFailure("database is locked".to_string()))
        }
    }

    fn adapter_over(store: Arc<dyn RetirementStore>) -> (EnforcementAdapter, Arc<RetirementService>) {
        let service = Arc::new(RetirementService::new(
            store,
            Arc::new(LogAuditSink),
            Arc::new(FixedClock::new(OffsetDateTime::UNIX_EPOCH)),
        ));
        (EnforcementAdapter::new(Arc::clone(&service)), service)
    }

    #[test]
    fn deny_codes_distinguish_retirement_reasons() -> Result<(), RetirementError> {
        let (adapter, service) = adapter_over(Arc::new(InMemoryRetirementStore::new()));
        service.retire("manual", MANUAL_REASON, "alice")?;
        service.retire("violated", "POLICY_VIOLATION:c-1", POLICY_MONITOR_ACTOR)?;
        service.retire("expired", EXPIRED_REASON, "alice")?;
        service.retire("other", "customer request", "alice")?;

        assert_eq!(adapter.check_allowed("manual").deny_code(), Some(DenyCode::AgreementRetiredManual));
        assert_eq!(
            adapter.check_allowed("violated").deny_code(),
            Some(DenyCode::AgreementRetiredPolicyViolation)
        );
        assert_eq!(adapter.check_allowed("expired").deny_code(), Some(DenyCode::AgreementRetiredExpired));
        assert_eq!(adapter.check_allowed("other").deny_code(), Some(DenyCode::AgreementRetired));
        assert!(adapter.check_allowed("active").is_allowed());
        Ok(())
    }

    #[test]
    fn deny_message_names_the_agreement() -> Result<(), RetirementError> {
        let (adapter, service) = adapter_over(Arc::new(InMemoryRetirementStore::new()));
        service.retire("agreement-7", MANUAL_REASON, "alice")?;
        match adapter.check_allowed("agreement-7") {
            EnforcementDecision::Deny { message, .. } => {
                assert_eq!(message, "Contract Agreement with ID=agreement-7 has been retired");
            }
            EnforcementDecision::Allow => panic!("retired agreement must be denied"),
        }
        Ok(())
    }

    #[test]
    fn store_failure_fails_closed() {
        let (adapter, _service) = adapter_over(Arc::new(UnavailableStore));
        assert_eq!(
            adapter.check_allowed("agreement-1").deny_code(),
            Some(DenyCode::RetirementStatusUnavailable)
        );
    }

    #[test]
    fn blank_agreement_id_is_denied() {
        let (adapter, _service) = adapter_over(Arc::new(InMemoryRetirementStore::new()));
        assert_eq!(adapter.check_allowed(" ").deny_code(), Some(DenyCode::InvalidAgreementId));
    }

    #[test]
    fn decisions_serialize_with_stable_codes() -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(EnforcementDecision::Deny {
            code: DenyCode::AgreementRetiredPolicyViolation,
            message: "m".to_string(),
        })?;
        assert_eq!(value["decision"], "deny");
        assert_eq!(value["code"], "AGREEMENT_RETIRED_POLICY_VIOLATION");
        assert_eq!(serde_json::to_value(EnforcementDecision::Allow)?["decision"], "allow");
        Ok(())
    }
}
