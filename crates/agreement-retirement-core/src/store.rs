use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::query::CompiledQuery;
use crate::{RetirementError, RetirementOutcome, RetirementRecord};

/// Durable home of retirement records.
///
/// `insert_if_absent` is the only write primitive. Implementations MUST make it atomic
/// per `agreement_id`: when several callers race, exactly one observes `was_new = true`
/// and every caller receives the winning record.
pub trait RetirementStore: Send + Sync {
    /// # Errors
    /// Returns [`RetirementError::TransientStoreFailure`] for retryable backend failures and
    /// [`RetirementError::Persistence`] for anything else.
    fn insert_if_absent(&self, record: &RetirementRecord) -> Result<RetirementOutcome, RetirementError>;

    /// # Errors
    /// See [`RetirementStore::insert_if_absent`].
    fn get_by_agreement_id(&self, agreement_id: &str) -> Result<Option<RetirementRecord>, RetirementError>;

    /// # Errors
    /// See [`RetirementStore::insert_if_absent`].
    fn query(&self, query: &CompiledQuery) -> Result<Vec<RetirementRecord>, RetirementError>;
}

/// Process-local store. Records live as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryRetirementStore {
    records: Mutex<BTreeMap<String, RetirementRecord>>,
}

impl InMemoryRetirementStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RetirementStore for InMemoryRetirementStore {
    fn insert_if_absent(&self, record: &RetirementRecord) -> Result<RetirementOutcome, RetirementError> {
        record.validate()?;
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = records.get(&record.agreement_id) {
            return Ok(RetirementOutcome { record: existing.clone(), was_new: false });
        }
        records.insert(record.agreement_id.clone(), record.clone());
        Ok(RetirementOutcome { record: record.clone(), was_new: true })
    }

    fn get_by_agreement_id(&self, agreement_id: &str) -> Result<Option<RetirementRecord>, RetirementError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(agreement_id).cloned())
    }

    fn query(&self, query: &CompiledQuery) -> Result<Vec<RetirementRecord>, RetirementError> {
        let snapshot = {
            let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            records.values().filter(|record| query.matches(record)).cloned().collect::<Vec<_>>()
        };
        Ok(query.apply(snapshot))
    }
}
