//! Delivery of retirement notifications to the audit/logging service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use agreement_retirement_core::RetirementEvent;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AuditError {
    #[error("audit transport failed: {0}")]
    Transport(String),
    #[error("audit endpoint rejected event with status {0}")]
    Rejected(u16),
    #[error("audit queue is full")]
    QueueFull,
    #[error("audit queue is closed")]
    Closed,
}

pub trait AuditSink: Send + Sync {
    /// # Errors
    /// Returns an [`AuditError`] when the event could not be delivered or enqueued.
    fn publish(&self, event: &RetirementEvent) -> Result<(), AuditError>;
}

/// Emits each event as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn publish(&self, event: &RetirementEvent) -> Result<(), AuditError> {
        tracing::info!(
            event_type = %event.event_type,
            agreement_id = %event.agreement_id,
            reason = %event.reason,
            retired_at = %event.retired_at,
            "audit event"
        );
        Ok(())
    }
}

/// POSTs each event as JSON to the logging service.
#[derive(Debug, Clone)]
pub struct HttpAuditSink {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpAuditSink {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { endpoint: endpoint.into(), agent }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl AuditSink for HttpAuditSink {
    fn publish(&self, event: &RetirementEvent) -> Result<(), AuditError> {
        match self.agent.post(&self.endpoint).send_json(event) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(status, _)) => Err(AuditError::Rejected(status)),
            Err(ureq::Error::Transport(transport)) => {
                Err(AuditError::Transport(transport.to_string()))
            }
        }
    }
}

/// Keeps events in memory. Used by tests and local demos.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<RetirementEvent>>,
}

impl RecordingAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<RetirementEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl AuditSink for RecordingAuditSink {
    fn publish(&self, event: &RetirementEvent) -> Result<(), AuditError> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event.clone());
        Ok(())
    }
}

/// Fire-and-forget wrapper: `publish` only enqueues, and a worker thread delivers to
/// the inner sink. A full queue drops the event.
pub struct QueuedAuditSink {
    sender: Mutex<Option<SyncSender<RetirementEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    delivery_failures: Arc<AtomicU64>,
}

impl QueuedAuditSink {
    /// # Errors
    /// Returns an error when the worker thread cannot be spawned.
    pub fn spawn(inner: Arc<dyn AuditSink>, capacity: usize) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
        let delivery_failures = Arc::new(AtomicU64::new(0));
        let failures = Arc::clone(&delivery_failures);
        let worker = thread::Builder::new()
            .name("audit-publisher".to_string())
            .spawn(move || deliver(&receiver, inner.as_ref(), &failures))?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            delivery_failures,
        })
    }

    #[must_use]
    pub fn delivery_failures(&self) -> u64 {
        self.delivery_failures.load(Ordering::Relaxed)
    }

    /// Stop accepting events, deliver everything already queued, and join the worker.
    pub fn shutdown(&self) {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("audit publisher thread panicked");
            }
        }
    }
}

fn deliver(receiver: &Receiver<RetirementEvent>, inner: &dyn AuditSink, failures: &AtomicU64) {
    while let Ok(event) = receiver.recv() {
        if let Err(err) = inner.publish(&event) {
            failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                agreement_id = %event.agreement_id,
                error = %err,
                "audit delivery failed"
            );
        }
    }
}

impl AuditSink for QueuedAuditSink {
    fn publish(&self, event: &RetirementEvent) -> Result<(), AuditError> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return Err(AuditError::Closed);
        };
        match sender.try_send(event.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(dropped)) => {
                tracing::warn!(agreement_id = %dropped.agreement_id, "audit queue full; event dropped");
                Err(AuditError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(AuditError::Closed),
        }
    }
}

impl Drop for QueuedAuditSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}
