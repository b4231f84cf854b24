//! Audit trail: one immutable entry per operation, written off-thread.
//!
//! Entries go through an mpsc channel to a dedicated writer thread that owns
//! the [`AuditSink`]. Callers never wait on storage and a failed write never
//! fails the operation that produced the entry; it is logged and counted.
//!
//! [`AuditTrail::intercept`] wraps a handler so that exactly one entry is
//! emitted whatever the outcome, including a panic inside the handler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::adapters::StorageError;
use crate::domain::{
    AuditCategory, AuditEntry, AuthAuditEntry, CallerContext, OperationContext, RequestInfo,
};
use crate::ports::{AuditRecorder, AuditSink, AuditedResponse};
use crate::{OrganGuardError, Result};

const PANIC_ERROR_CODE: &str = "HANDLER_PANIC";

enum WriterCommand {
    Audit(Box<AuditEntry>),
    Auth(Box<AuthAuditEntry>),
    Flush(Sender<()>),
    Shutdown,
}

#[derive(Debug, Default)]
struct WriterStats {
    written: AtomicU64,
    failed: AtomicU64,
}

/// Handle to the audit writer thread.
pub struct AuditTrail {
    tx: Sender<WriterCommand>,
    stats: Arc<WriterStats>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail")
            .field("written", &self.written_count())
            .field("failed", &self.failed_writes())
            .finish_non_exhaustive()
    }
}

impl AuditTrail {
    /// Start the writer thread over `sink`.
    pub fn spawn<A>(sink: Arc<A>) -> Self
    where
        A: AuditSink + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let stats = Arc::new(WriterStats::default());
        let writer_stats = Arc::clone(&stats);

        let handle = thread::Builder::new()
            .name("organguard-audit".to_string())
            .spawn(move || Self::run_writer(sink.as_ref(), &rx, &writer_stats))
            .map_err(|e| tracing::error!(error = %e, "Failed to start audit writer thread"))
            .ok();

        Self { tx, stats, handle }
    }

    fn run_writer<A: AuditSink>(sink: &A, rx: &Receiver<WriterCommand>, stats: &WriterStats) {
        while let Ok(command) = rx.recv() {
            let outcome = match command {
                WriterCommand::Audit(entry) => sink.append_audit(&entry),
                WriterCommand::Auth(entry) => sink.append_auth_audit(&entry),
                WriterCommand::Flush(ack) => {
                    let _ = ack.send(());
                    continue;
                }
                WriterCommand::Shutdown => break,
            };

            match outcome {
                Ok(()) => {
                    stats.written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    let e: StorageError = e.into();
                    let err = OrganGuardError::AuditWriteFailed(e.to_string());
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(error = %err, "Audit entry dropped");
                }
            }
        }
        tracing::debug!("Audit writer stopped");
    }

    fn send(&self, command: WriterCommand) {
        if self.tx.send(command).is_err() {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            let err = OrganGuardError::AuditWriteFailed("audit writer is not running".to_string());
            tracing::error!(error = %err, "Audit entry dropped");
        }
    }

    /// Queue a data-access entry.
    pub fn record(&self, entry: AuditEntry) {
        self.send(WriterCommand::Audit(Box::new(entry)));
    }

    /// Queue an authentication entry.
    pub fn record_auth(&self, entry: AuthAuditEntry) {
        self.send(WriterCommand::Auth(Box::new(entry)));
    }

    /// Block until everything queued before this call has been handled.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.tx.send(WriterCommand::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Entries persisted so far.
    #[must_use]
    pub fn written_count(&self) -> u64 {
        self.stats.written.load(Ordering::Relaxed)
    }

    /// Entries that could not be persisted.
    #[must_use]
    pub fn failed_writes(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    /// Run `handler` for `request` and record exactly one entry for it.
    ///
    /// The handler gets a scoped [`OperationContext`]; a mutation diff
    /// captured through it ends up in the same entry. The handler's result is
    /// returned unchanged.
    pub fn intercept<R, F>(&self, caller: &CallerContext, request: &RequestInfo, handler: F) -> Result<R>
    where
        R: AuditedResponse,
        F: FnOnce(&OperationContext) -> Result<R>,
    {
        let ctx = OperationContext::scoped(caller.clone(), request.request_id.clone());
        let mut pending = PendingEntry {
            trail: self,
            entry: Some(AuditEntry::begin(caller, request)),
            started: Instant::now(),
        };

        let result = handler(&ctx);

        if let Some(entry) = pending.entry.take() {
            let mut entry = match &result {
                Ok(response) => entry.succeeded(response.result_count(), response.entity_id()),
                Err(e) => {
                    let failed = entry.failed(e.code(), e.to_string());
                    if matches!(e, OrganGuardError::Forbidden { .. }) {
                        failed.with_category(AuditCategory::Authorization)
                    } else {
                        failed
                    }
                }
            };
            if let Some(diff) = ctx.take_mutation() {
                entry = entry.with_mutation(&diff);
            }
            self.record(entry.with_duration(pending.started.elapsed()));
        }

        result
    }
}

/// Records a failure entry if the handler unwinds before the outcome is known.
struct PendingEntry<'a> {
    trail: &'a AuditTrail,
    entry: Option<AuditEntry>,
    started: Instant,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            let entry = entry
                .failed(PANIC_ERROR_CODE, "handler panicked")
                .with_duration(self.started.elapsed());
            self.trail.record(entry);
        }
    }
}

impl AuditRecorder for AuditTrail {
    fn record(&self, entry: AuditEntry) {
        AuditTrail::record(self, entry);
    }

    fn record_auth(&self, entry: AuthAuditEntry) {
        AuditTrail::record_auth(self, entry);
    }
}

impl Drop for AuditTrail {
    fn drop(&mut self) {
        let _ = self.tx.send(WriterCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Audit writer thread panicked");
            }
        }
    }
}
