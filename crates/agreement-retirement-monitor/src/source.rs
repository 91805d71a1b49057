use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use agreement_retirement_core::{MonitoredAgreementView, RetirementError};

/// Read access to the agreements owned by the negotiation subsystem.
pub trait AgreementSource: Send + Sync {
    /// # Errors
    /// Returns [`RetirementError::ExternalDependencyUnavailable`] when the listing cannot
    /// be obtained.
    fn list_agreements(&self) -> Result<Vec<MonitoredAgreementView>, RetirementError>;
}

/// Lists agreements from an HTTP endpoint returning a JSON array of agreement views.
#[derive(Debug, Clone)]
pub struct HttpAgreementSource {
    url: String,
    agent: ureq::Agent,
}

impl HttpAgreementSource {
    #[must_use]
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { url: url.into(), agent }
    }
}

impl AgreementSource for HttpAgreementSource {
    fn list_agreements(&self) -> Result<Vec<MonitoredAgreementView>, RetirementError> {
        let unavailable =
            |detail: String| RetirementError::ExternalDependencyUnavailable(format!("{}: {detail}", self.url));
        let response = self.agent.get(&self.url).call().map_err(|err| unavailable(err.to_string()))?;
        response
            .into_json::<Vec<MonitoredAgreementView>>()
            .map_err(|err| unavailable(format!("invalid agreement listing: {err}")))
    }
}

/// Fixed snapshot that tests and local runs can replace between cycles.
#[derive(Debug, Default)]
pub struct StaticAgreementSource {
    agreements: Mutex<Vec<MonitoredAgreementView>>,
}

impl StaticAgreementSource {
    #[must_use]
    pub fn new(agreements: Vec<MonitoredAgreementView>) -> Self {
        Self { agreements: Mutex::new(agreements) }
    }

    pub fn replace(&self, agreements: Vec<MonitoredAgreementView>) {
        *self.agreements.lock().unwrap_or_else(PoisonError::into_inner) = agreements;
    }
}

impl AgreementSource for StaticAgreementSource {
    fn list_agreements(&self) -> Result<Vec<MonitoredAgreementView>, RetirementError> {
        Ok(self.agreements.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}
