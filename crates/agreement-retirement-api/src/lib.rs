use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agreement_retirement_core::{
    Clock, QuerySpec, RetirementError, RetirementEvent, RetirementOutcome, RetirementQuery,
    RetirementRecord, RetirementStore,
};
use agreement_retirement_store_sqlite::{
    ExportManifest, ImportSummary, IntegrityReport, SchemaStatus, SqliteStore,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod audit;
pub mod enforcement;
pub mod logging;

pub use audit::{
    AuditError, AuditSink, HttpAuditSink, LogAuditSink, QueuedAuditSink, RecordingAuditSink,
};
pub use enforcement::{DenyCode, EnforcementAdapter, EnforcementDecision};
pub use logging::{init_logging, LogError, LogFormat};

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// Create-retirement body. `agreementId` is the wire name; `agreement_id` is accepted too.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetireRequest {
    #[serde(alias = "agreement_id")]
    pub agreement_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetirementPage {
    pub items: Vec<RetirementRecord>,
    pub offset: u32,
    pub limit: u32,
}

/// Retirement evaluation core: the single write path for retirements, plus the
/// read operations every consumer relies on.
///
/// After a new record commits, exactly one [`RetirementEvent`] is handed to the audit
/// sink. Publication failures are logged and counted; they never fail the retirement.
pub struct RetirementService {
    store: Arc<dyn RetirementStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    audit_failures: AtomicU64,
}

impl RetirementService {
    #[must_use]
    pub fn new(
        store: Arc<dyn RetirementStore>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, audit, clock, audit_failures: AtomicU64::new(0) }
    }

    /// Retire `agreement_id`. Idempotent: an already retired agreement keeps its
    /// original record and the outcome reports `was_new = false`.
    ///
    /// # Errors
    /// Returns [`RetirementError::InvalidArgument`] when any input is blank, and the
    /// store's error when persistence fails. Nothing is written on error.
    pub fn retire(
        &self,
        agreement_id: &str,
        reason: &str,
        actor: &str,
    ) -> Result<RetirementOutcome, RetirementError> {
        let record = RetirementRecord::new(agreement_id, reason, actor, self.clock.now());
        record.validate()?;

        let outcome = self.store.insert_if_absent(&record)?;
        if outcome.was_new {
            tracing::info!(
                agreement_id = %outcome.record.agreement_id,
                reason = %outcome.record.reason,
                retired_by = %outcome.record.retired_by,
                "agreement retired"
            );
            self.publish(&outcome.record);
        } else {
            tracing::debug!(
                agreement_id = %outcome.record.agreement_id,
                existing_reason = %outcome.record.reason,
                "agreement already retired"
            );
        }
        Ok(outcome)
    }

    /// # Errors
    /// Returns the store's error when the lookup fails.
    pub fn is_retired(&self, agreement_id: &str) -> Result<bool, RetirementError> {
        Ok(self.get(agreement_id)?.is_some())
    }

    /// # Errors
    /// Returns the store's error when the lookup fails.
    pub fn get(&self, agreement_id: &str) -> Result<Option<RetirementRecord>, RetirementError> {
        self.store.get_by_agreement_id(agreement_id)
    }

    /// # Errors
    /// Returns [`RetirementError::InvalidArgument`] for out-of-range paging, otherwise the
    /// store's error.
    pub fn find(&self, query: &RetirementQuery) -> Result<RetirementPage, RetirementError> {
        let compiled = query.compile()?;
        let items = self.store.query(&compiled)?;
        Ok(RetirementPage { items, offset: compiled.offset, limit: compiled.limit })
    }

    /// # Errors
    /// Returns [`RetirementError::InvalidArgument`] for invalid criteria, otherwise the
    /// store's error.
    pub fn query(&self, spec: &QuerySpec) -> Result<RetirementPage, RetirementError> {
        let compiled = spec.compile()?;
        let items = self.store.query(&compiled)?;
        Ok(RetirementPage { items, offset: compiled.offset, limit: compiled.limit })
    }

    #[must_use]
    pub fn audit_failures(&self) -> u64 {
        self.audit_failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn publish(&self, record: &RetirementRecord) {
        let event = RetirementEvent::from(record);
        if let Err(err) = self.audit.publish(&event) {
            let failures = self.audit_failures.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(
                agreement_id = %record.agreement_id,
                error = %err,
                failures,
                "retirement notification failed"
            );
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Operator facade over a retirement database file. Each call opens its own connection.
#[derive(Debug, Clone)]
pub struct RetirementAdmin {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl RetirementAdmin {
    #[must_use]
    pub fn new(db_path: PathBuf, busy_timeout: Duration) -> Self {
        Self { db_path, busy_timeout }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path, self.busy_timeout)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.open_store()?.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when integrity probes fail to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// # Errors
    /// Returns an error when the database cannot be migrated or the export cannot be written.
    pub fn export(&self, out_dir: &Path) -> Result<ExportManifest> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.export_snapshot(out_dir)
    }

    /// # Errors
    /// Returns an error when the snapshot does not verify or cannot be applied.
    pub fn import(&self, in_dir: &Path) -> Result<ImportSummary> {
        self.open_store()?.import_snapshot(in_dir)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use agreement_retirement_core::{
        FixedClock, InMemoryRetirementStore, SortOrder, EXPIRED_REASON, MANUAL_REASON,
        RETIREMENT_EVENT_TYPE,
    };
    use agreement_retirement_store_sqlite::{SqliteRetirementStore, SqliteStoreOptions};
    use time::{Duration as TimeDuration, OffsetDateTime};

    struct FailingAuditSink;

    impl AuditSink for FailingAuditSink {
        fn publish(&self, _event: &RetirementEvent) -> Result<(), AuditError> {
            Err(AuditError::Transport("logging service unreachable".to_string()))
        }
    }

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + TimeDuration::seconds(1_700_000_000)
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("agreement-retirement-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn in_memory_service() -> (RetirementService, Arc<RecordingAuditSink>, Arc<FixedClock>) {
        let audit = Arc::new(RecordingAuditSink::new());
        let clock = Arc::new(FixedClock::new(fixture_time()));
        let service = RetirementService::new(
            Arc::new(InMemoryRetirementStore::new()),
            audit.clone(),
            clock.clone(),
        );
        (service, audit, clock)
    }

    // Test IDs: TAPI-001
    #[test]
    fn retire_is_idempotent_and_notifies_once() -> Result<(), RetirementError> {
        let (service, audit, clock) = in_memory_service();

        let first = service.retire("agreement-1", MANUAL_REASON, "alice")?;
        clock.advance(TimeDuration::seconds(30));
        let second = service.retire("agreement-1", EXPIRED_REASON, "bob")?;

        assert!(first.was_new);
        assert!(!second.was_new);
        assert_eq!(second.record, first.record);
        assert_eq!(second.record.retired_at, fixture_time());

        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, RETIREMENT_EVENT_TYPE);
        assert_eq!(events[0].reason, MANUAL_REASON);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn retire_rejects_blank_inputs_without_writing() {
        let (service, audit, _clock) = in_memory_service();

        for (agreement_id, reason, actor) in
            [("", MANUAL_REASON, "alice"), ("a-1", "  ", "alice"), ("a-1", MANUAL_REASON, "")]
        {
            let result = service.retire(agreement_id, reason, actor);
            assert!(matches!(result, Err(RetirementError::InvalidArgument(_))), "{result:?}");
        }
        assert!(matches!(service.is_retired("a-1"), Ok(false)));
        assert!(audit.events().is_empty());
    }

    // Test IDs: TAPI-008
    #[test]
    fn retire_rejects_padded_agreement_id() -> Result<(), RetirementError> {
        let (service, audit, _clock) = in_memory_service();

        let padded = service.retire(" a-1", MANUAL_REASON, "alice");
        assert!(matches!(padded, Err(RetirementError::InvalidArgument(_))), "{padded:?}");
        assert!(service.get(" a-1")?.is_none());

        let enforcement = EnforcementAdapter::new(Arc::new(service));
        assert!(enforcement.check_allowed("a-1").is_allowed());
        assert!(audit.events().is_empty());
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn retirement_survives_failing_audit_sink() -> Result<(), RetirementError> {
        let service = RetirementService::new(
            Arc::new(InMemoryRetirementStore::new()),
            Arc::new(FailingAuditSink),
            Arc::new(FixedClock::new(fixture_time())),
        );

        let outcome = service.retire("agreement-1", MANUAL_REASON, "alice")?;
        assert!(outcome.was_new);
        assert!(service.is_retired("agreement-1")?);
        assert_eq!(service.audit_failures(), 1);

        service.retire("agreement-1", MANUAL_REASON, "alice")?;
        assert_eq!(service.audit_failures(), 1);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn is_retired_never_regresses() -> Result<(), RetirementError> {
        let (service, _audit, clock) = in_memory_service();
        assert!(!service.is_retired("agreement-1")?);
        service.retire("agreement-1", MANUAL_REASON, "alice")?;
        for _ in 0..5 {
            clock.advance(TimeDuration::days(400));
            assert!(service.is_retired("agreement-1")?);
        }
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn find_pages_in_stable_order() -> Result<(), RetirementError> {
        let (service, _audit, clock) = in_memory_service();
        for index in 0..7 {
            service.retire(&format!("agreement-{index}"), MANUAL_REASON, "alice")?;
            if index % 2 == 1 {
                clock.advance(TimeDuration::seconds(1));
            }
        }

        let mut seen = Vec::new();
        for offset in (0..7).step_by(3) {
            let page = service.find(&RetirementQuery {
                offset: Some(offset),
                limit: Some(3),
                ..RetirementQuery::default()
            })?;
            assert_eq!(page.offset, offset);
            seen.extend(page.items.into_iter().map(|record| record.agreement_id));
        }
        assert_eq!(
            seen,
            (0..7).map(|index| format!("agreement-{index}")).collect::<Vec<_>>()
        );

        let newest = service.find(&RetirementQuery {
            order: Some(SortOrder::Desc),
            limit: Some(1),
            ..RetirementQuery::default()
        })?;
        assert_eq!(newest.items[0].agreement_id, "agreement-6");
        Ok(())
    }

    // Test IDs: TAPI-006
    #[test]
    fn concurrent_service_retirements_against_sqlite_notify_once() -> anyhow::Result<()> {
        let db_path = unique_temp_db_path();
        let store = SqliteRetirementStore::open(&db_path, SqliteStoreOptions::default())?;
        let audit = Arc::new(RecordingAuditSink::new());
        let service = Arc::new(RetirementService::new(
            Arc::new(store),
            audit.clone(),
            Arc::new(FixedClock::new(fixture_time())),
        ));

        let threads = 4;
        let barrier = Arc::new(Barrier::new(threads));
        let handles = (0..threads)
            .map(|index| {
                let service = Arc::clone(&service);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    service.retire("contested", MANUAL_REASON, &format!("operator-{index}"))
                })
            })
            .collect::<Vec<_>>();

        let mut winners = 0;
        for handle in handles {
            let Ok(outcome) = handle.join() else {
                panic!("retire thread panicked");
            };
            if outcome?.was_new {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(audit.events().len(), 1);

        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
        Ok(())
    }

    // Test IDs: TAPI-007
    #[test]
    fn admin_migrate_dry_run_reports_pending_versions() -> anyhow::Result<()> {
        let db_path = unique_temp_db_path();
        let admin = RetirementAdmin::new(db_path.clone(), Duration::from_secs(1));

        let planned = admin.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.current_version, 0);
        assert_eq!(planned.would_apply_versions, vec![1, 2]);

        let applied = admin.migrate(false)?;
        assert_eq!(applied.after_version, Some(2));
        assert_eq!(applied.up_to_date, Some(true));
        assert!(admin.integrity_check()?.quick_check_ok);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
