//! Periodic policy-compliance scan.
//!
//! Each cycle lists the agreements known to the negotiation subsystem, re-evaluates
//! the time-interval constraints of every agreement that still carries live
//! entitlements, and retires the agreements that violate one. Retirement goes through
//! the same [`RetirementService::retire`] path as manual retirement, so a repeated
//! violation never produces a second record or notification.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use agreement_retirement_api::RetirementService;
use agreement_retirement_core::{
    AgreementStatus, MonitoredAgreementView, ReasonCode, RetirementError, RetirementOutcome,
    ViolationKind, POLICY_MONITOR_ACTOR,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;

mod source;
mod token;

pub use source::{AgreementSource, HttpAgreementSource, StaticAgreementSource};
pub use token::CancellationToken;

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    pub interval: Duration,
    pub source_timeout: Duration,
    pub store_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SCAN_INTERVAL,
            source_timeout: Duration::from_secs(10),
            store_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    Watching,
    Violated,
    Retired,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WatchEntry {
    pub agreement_id: String,
    pub status: AgreementStatus,
    pub state: WatchState,
    pub constraint_id: Option<String>,
    pub violation: Option<ViolationKind>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_evaluated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScanReport {
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub listed: usize,
    pub evaluated: usize,
    pub violations: usize,
    pub retired: usize,
    pub already_retired: usize,
    pub failures: usize,
    pub removed: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScanOutcome {
    Completed { report: ScanReport },
    SkippedBusy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MonitorStatus {
    pub cycles: u64,
    pub skipped_busy: u64,
    pub aborted: u64,
    pub last_report: Option<ScanReport>,
    pub last_error: Option<String>,
    pub watch: Vec<WatchEntry>,
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PolicyComplianceMonitor {
    service: Arc<RetirementService>,
    source: Arc<dyn AgreementSource>,
    config: MonitorConfig,
    busy: AtomicBool,
    cycles: AtomicU64,
    skipped_busy: AtomicU64,
    aborted: AtomicU64,
    watch: Mutex<BTreeMap<String, WatchEntry>>,
    last_report: Mutex<Option<ScanReport>>,
    last_error: Mutex<Option<String>>,
}

impl PolicyComplianceMonitor {
    #[must_use]
    pub fn new(
        service: Arc<RetirementService>,
        source: Arc<dyn AgreementSource>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            service,
            source,
            config,
            busy: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            skipped_busy: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            watch: Mutex::new(BTreeMap::new()),
            last_report: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> MonitorConfig {
        self.config
    }

    #[must_use]
    pub fn status(&self) -> MonitorStatus {
        MonitorStatus {
            cycles: self.cycles.load(Ordering::Relaxed),
            skipped_busy: self.skipped_busy.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            last_report: self.last_report.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            last_error: self.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            watch: self.watch.lock().unwrap_or_else(PoisonError::into_inner).values().cloned().collect(),
        }
    }

    /// Run scans every `config.interval` until `token` is cancelled. The first scan
    /// starts immediately; ticks missed while a scan runs are skipped.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval = ?self.config.interval, "policy monitor started");

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    match self.scan_once(&token).await {
                        Ok(ScanOutcome::Completed { report }) => tracing::info!(
                            listed = report.listed,
                            evaluated = report.evaluated,
                            violations = report.violations,
                            retired = report.retired,
                            failures = report.failures,
                            cancelled = report.cancelled,
                            "policy scan finished"
                        ),
                        Ok(ScanOutcome::SkippedBusy) => {
                            tracing::debug!("policy scan skipped; previous scan still running");
                        }
                        Err(err) => tracing::warn!(error = %err, "policy scan aborted"),
                    }
                }
            }
        }

        tracing::info!("policy monitor stopped");
    }

    /// Run one scan cycle.
    ///
    /// # Errors
    /// Returns [`RetirementError::ExternalDependencyUnavailable`] when the agreement
    /// source fails or times out; the cycle is abandoned without touching the watch table.
    pub async fn scan_once(&self, token: &CancellationToken) -> Result<ScanOutcome, RetirementError> {
        if self.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            self.skipped_busy.fetch_add(1, Ordering::Relaxed);
            return Ok(ScanOutcome::SkippedBusy);
        }
        let _guard = BusyGuard(&self.busy);

        let mut report =
            ScanReport { started_at: Some(self.service.clock().now()), ..ScanReport::default() };

        let agreements = match self.list_agreements().await {
            Ok(agreements) => agreements,
            Err(err) => {
                self.aborted.fetch_add(1, Ordering::Relaxed);
                *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
                return Err(err);
            }
        };
        report.listed = agreements.len();

        let mut listed_ids = BTreeSet::new();
        for view in agreements {
            if token.is_cancelled() {
                report.cancelled = true;
                break;
            }
            listed_ids.insert(view.agreement_id.clone());
            self.evaluate(view, &mut report).await;
        }

        if !report.cancelled {
            let mut watch = self.watch.lock().unwrap_or_else(PoisonError::into_inner);
            let before = watch.len();
            watch.retain(|agreement_id, _| listed_ids.contains(agreement_id));
            report.removed += before - watch.len();
        }

        report.finished_at = Some(self.service.clock().now());
        self.cycles.fetch_add(1, Ordering::Relaxed);
        *self.last_report.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(ScanOutcome::Completed { report })
    }

    async fn list_agreements(&self) -> Result<Vec<MonitoredAgreementView>, RetirementError> {
        let source = Arc::clone(&self.source);
        let listing = tokio::task::spawn_blocking(move || source.list_agreements());
        match tokio::time::timeout(self.config.source_timeout, listing).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(RetirementError::ExternalDependencyUnavailable(format!(
                "agreement listing task failed: {join_err}"
            ))),
            Err(_) => Err(RetirementError::ExternalDependencyUnavailable(format!(
                "agreement listing timed out after {} ms",
                self.config.source_timeout.as_millis()
            ))),
        }
    }

    async fn evaluate(&self, view: MonitoredAgreementView, report: &mut ScanReport) {
        if !view.status.is_monitored() {
            if self.remove_entry(&view.agreement_id) {
                report.removed += 1;
            }
            return;
        }
        if view.status == AgreementStatus::Unknown {
            tracing::warn!(
                agreement_id = %view.agreement_id,
                "agreement reported an unrecognised status; evaluating it as active"
            );
        }

        if self.entry_state(&view.agreement_id) == Some(WatchState::Retired) {
            return;
        }

        let now = self.service.clock().now();
        report.evaluated += 1;
        let violated = view.constraints.iter().find_map(|constraint| {
            constraint
                .evaluate(now)
                .violation()
                .map(|violation| (constraint.constraint_id.clone(), violation.clone()))
        });

        let Some((constraint_id, violation)) = violated else {
            self.upsert_entry(&view, WatchState::Watching, None, now);
            return;
        };

        report.violations += 1;
        tracing::info!(
            agreement_id = %view.agreement_id,
            constraint_id = %constraint_id,
            violation = ?violation,
            "policy violation detected"
        );
        self.upsert_entry(&view, WatchState::Violated, Some((constraint_id.clone(), violation)), now);

        match self.retire(&view.agreement_id, &constraint_id).await {
            Ok(outcome) => {
                if outcome.was_new {
                    report.retired += 1;
                } else {
                    report.already_retired += 1;
                }
                self.set_state(&view.agreement_id, WatchState::Retired);
            }
            Err(err) => {
                // Left in `Violated`; the next cycle retries.
                report.failures += 1;
                tracing::warn!(
                    agreement_id = %view.agreement_id,
                    constraint_id = %constraint_id,
                    error = %err,
                    transient = err.is_transient(),
                    "retirement of violating agreement failed"
                );
            }
        }
    }

    async fn retire(&self, agreement_id: &str, constraint_id: &str) -> Result<RetirementOutcome, RetirementError> {
        let service = Arc::clone(&self.service);
        let agreement_id = agreement_id.to_string();
        let reason = ReasonCode::policy_violation_reason(constraint_id);
        let call = tokio::task::spawn_blocking(move || {
            service.retire(&agreement_id, &reason, POLICY_MONITOR_ACTOR)
        });
        match tokio::time::timeout(self.config.store_timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                Err(RetirementError::Persistence(format!("retirement task failed: {join_err}")))
            }
            Err(_) => Err(RetirementError::TransientStoreFailure(format!(
                "retirement timed out after {} ms",
                self.config.store_timeout.as_millis()
            ))),
        }
    }

    fn entry_state(&self, agreement_id: &str) -> Option<WatchState> {
        self.watch.lock().unwrap_or_else(PoisonError::into_inner).get(agreement_id).map(|entry| entry.state)
    }

    fn remove_entry(&self, agreement_id: &str) -> bool {
        self.watch.lock().unwrap_or_else(PoisonError::into_inner).remove(agreement_id).is_some()
    }

    fn set_state(&self, agreement_id: &str, state: WatchState) {
        if let Some(entry) = self.watch.lock().unwrap_or_else(PoisonError::into_inner).get_mut(agreement_id) {
            entry.state = state;
        }
    }

    fn upsert_entry(
        &self,
        view: &MonitoredAgreementView,
        state: WatchState,
        violation: Option<(String, ViolationKind)>,
        now: OffsetDateTime,
    ) {
        let (constraint_id, violation) = violation.unzip();
        self.watch.lock().unwrap_or_else(PoisonError::into_inner).insert(
            view.agreement_id.clone(),
            WatchEntry {
                agreement_id: view.agreement_id.clone(),
                status: view.status,
                state,
                constraint_id,
                violation,
                last_evaluated_at: now,
            },
        );
    }
}
