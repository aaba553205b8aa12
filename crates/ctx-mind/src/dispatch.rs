use crate::degradation::{CallOutcome, DegradationMonitor};
use chrono::{DateTime, Utc};
use ctx_core::memory_contracts::{Dependency, StageKind};
use ctx_core::ports::{
    decode_stage_output, ArchiveDocument, ArchivePort, DependencyFailure, RankedDocument,
    ReasoningPort, ReasoningRequest,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortTimeouts {
    pub reasoning_ms: u64,
    pub archive_ms: u64,
}

impl Default for PortTimeouts {
    fn default() -> Self {
        Self {
            reasoning_ms: 30_000,
            archive_ms: 10_000,
        }
    }
}

/// Result of a guarded dependency call.
#[derive(Debug, Clone, PartialEq)]
pub enum Guarded<T> {
    Done(T),
    /// The circuit refused the call; nothing was attempted.
    Skipped,
    Failed(DependencyFailure),
}

impl<T> Guarded<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            Self::Done(value) => Some(value),
            _ => None,
        }
    }
}

/// Runs `call` on a detached thread and waits at most `timeout`. A call that
/// overruns is abandoned; its thread finishes on its own and the late result
/// is dropped.
pub fn call_with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, DependencyFailure>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DependencyFailure> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    thread::Builder::new()
        .name("ctx-port-call".to_string())
        .spawn(move || {
            let _ = tx.send(call());
        })
        .map_err(|err| DependencyFailure::service(format!("failed to spawn call: {err}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(DependencyFailure::timeout(format!(
            "no response within {}ms",
            timeout.as_millis()
        ))),
        Err(RecvTimeoutError::Disconnected) => {
            Err(DependencyFailure::service("call worker exited without a result"))
        }
    }
}

/// The only path from the core to the external ports: every call is gated by
/// the degradation monitor, bounded by a timeout, and reported back.
#[derive(Clone)]
pub struct PortGateway {
    reasoning: Arc<dyn ReasoningPort>,
    archive: Arc<dyn ArchivePort>,
    monitor: DegradationMonitor,
    timeouts: PortTimeouts,
}

impl PortGateway {
    pub fn new(
        reasoning: Arc<dyn ReasoningPort>,
        archive: Arc<dyn ArchivePort>,
        monitor: DegradationMonitor,
        timeouts: PortTimeouts,
    ) -> Self {
        Self {
            reasoning,
            archive,
            monitor,
            timeouts,
        }
    }

    pub fn monitor(&self) -> &DegradationMonitor {
        &self.monitor
    }

    /// Runs one reasoning stage and decodes its payload. A payload that does
    /// not decode counts as a failure of the reasoning dependency.
    pub fn infer_stage<T: DeserializeOwned>(
        &self,
        stage: StageKind,
        text: &str,
        context: Value,
        now: DateTime<Utc>,
    ) -> Guarded<T> {
        if !self.monitor.guard(Dependency::Reasoning, now) {
            debug!(event = "stage_skipped_circuit_open", stage = %stage);
            return Guarded::Skipped;
        }

        let port = Arc::clone(&self.reasoning);
        let request = ReasoningRequest::new(stage, text).with_context(context);
        let result = call_with_timeout(
            Duration::from_millis(self.timeouts.reasoning_ms.max(1)),
            move || port.infer(&request),
        )
        .and_then(|payload| decode_stage_output::<T>(stage, payload));

        self.settle(Dependency::Reasoning, result, now)
    }

    pub fn archive_upsert(
        &self,
        collection: &str,
        documents: Vec<ArchiveDocument>,
        now: DateTime<Utc>,
    ) -> Guarded<()> {
        if !self.monitor.guard(Dependency::Archive, now) {
            return Guarded::Skipped;
        }
        let port = Arc::clone(&self.archive);
        let collection = collection.to_string();
        let result = call_with_timeout(
            Duration::from_millis(self.timeouts.archive_ms.max(1)),
            move || port.upsert(&collection, &documents),
        );
        self.settle(Dependency::Archive, result, now)
    }

    pub fn archive_query(
        &self,
        collection: &str,
        text: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Guarded<Vec<RankedDocument>> {
        if !self.monitor.guard(Dependency::Archive, now) {
            return Guarded::Skipped;
        }
        let port = Arc::clone(&self.archive);
        let collection = collection.to_string();
        let text = text.to_string();
        let result = call_with_timeout(
            Duration::from_millis(self.timeouts.archive_ms.max(1)),
            move || port.query(&collection, &text, limit),
        );
        self.settle(Dependency::Archive, result, now)
    }

    fn settle<T>(
        &self,
        dependency: Dependency,
        result: Result<T, DependencyFailure>,
        now: DateTime<Utc>,
    ) -> Guarded<T> {
        match result {
            Ok(value) => {
                self.monitor.report(dependency, CallOutcome::Success, now);
                Guarded::Done(value)
            }
            Err(failure) => {
                warn!(
                    event = "dependency_call_failed",
                    dependency = %dependency,
                    kind = %failure.kind,
                    error = %failure.message
                );
                self.monitor
                    .report(dependency, CallOutcome::Failure(failure.to_string()), now);
                Guarded::Failed(failure)
            }
        }
    }
}
