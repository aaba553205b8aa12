use crate::alerts::AlertPolicy;
use crate::dispatch::{Guarded, PortGateway, PortTimeouts};
use crate::tiered_store::{
    CommitReport, CompressionReport, HotBudget, OutboxReport, TieredMemoryStore,
};
use crate::MemoryError;
use chrono::{DateTime, Duration, Utc};
use ctx_core::memory_contracts::{
    AlertClass, AlertFinding, AnomalyOutput, ArchiveKind, ArchivePayload, ArchiveRecord,
    DecisionsOutput, EntitiesOutput, ExtractedFacts, FailuresOutput, NudgeOutput, PatternOutput,
    ProcessingState, Session, Significance, StageKind, SummaryOutput, TriagePlan,
    ANOMALY_POISON_SESSION,
};
use ctx_core::ports::DependencyFailure;
use ctx_storage::QueueEntry;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Mutex, TryLockError};
use tracing::{debug, error, info, warn};

const COMMIT_ATTEMPTS: usize = 3;
const PATTERN_SUMMARY_WINDOW: usize = 20;
const ANOMALY_MISSING_COLD: &str = "missing_cold_session";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_period_ms: u64,
    pub max_transient_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Periodic stage cadences over the completion ordinal; 0 disables.
    pub pattern_every: u64,
    pub nudge_every: u64,
    pub anomaly_every: u64,
    pub learning_mode: bool,
    pub timeouts: PortTimeouts,
    pub budget: HotBudget,
    pub alerts: AlertPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 60_000,
            max_transient_retries: 5,
            backoff_base_ms: 60_000,
            backoff_cap_ms: 30 * 60_000,
            pattern_every: 5,
            nudge_every: 3,
            anomaly_every: 4,
            learning_mode: false,
            timeouts: PortTimeouts::default(),
            budget: HotBudget::default(),
            alerts: AlertPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    /// `min(base * 2^(level-1), cap)` for backoff levels starting at 1.
    pub fn backoff_for(&self, level: u32) -> Duration {
        let exponent = level.saturating_sub(1).min(40);
        let delay = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_cap_ms.max(self.backoff_base_ms));
        Duration::milliseconds(delay.min(i64::MAX as u64) as i64)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Nothing eligible in the queue.
    #[default]
    Idle,
    /// Another session is in flight.
    Busy,
    Completed,
    /// Completed without reasoning spend.
    Skipped,
    /// A circuit was open on the mandatory path; re-queued without a failure.
    Deferred { stage: StageKind },
    Retried { stage: StageKind, failures: u32 },
    /// A local step failed mid-session; re-queued with the failure counted.
    Interrupted { failures: u32 },
    Terminal,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub outcome: TickOutcome,
    pub session_id: Option<String>,
    pub ordinal: Option<u64>,
    pub revision: Option<u64>,
    pub periodic_ran: Vec<StageKind>,
    pub periodic_skipped: Vec<StageKind>,
    pub compression: Option<CompressionReport>,
    pub outbox: OutboxReport,
    pub alerts_purged: usize,
}

enum StageStop {
    Skipped(StageKind),
    Failed(StageKind, DependencyFailure),
}

/// Drives queued sessions through the stage sequence, one session per tick.
pub struct PipelineScheduler {
    store: TieredMemoryStore,
    gateway: PortGateway,
    config: SchedulerConfig,
    in_flight: Mutex<()>,
}

impl PipelineScheduler {
    /// Sessions left in progress by an interrupted process go back to the
    /// queue.
    pub fn new(
        store: TieredMemoryStore,
        gateway: PortGateway,
        config: SchedulerConfig,
        now: DateTime<Utc>,
    ) -> Result<Self, MemoryError> {
        let recovered = store.with_db(|db| db.recover_in_progress(now))?;
        if recovered > 0 {
            warn!(event = "in_progress_sessions_recovered", recovered);
        }
        Ok(Self {
            store,
            gateway,
            config,
            in_flight: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &TieredMemoryStore {
        &self.store
    }

    pub fn gateway(&self) -> &PortGateway {
        &self.gateway
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Writes the session to the cold tier and appends it to the queue.
    /// A session id the queue already knows is rejected.
    pub fn enqueue(&self, session: &Session, now: DateTime<Utc>) -> Result<(), MemoryError> {
        session.validate()?;
        self.store.ingest(session)?;
        let inserted = self
            .store
            .with_db(|db| db.enqueue_session(&session.id, session.created_at, now))?;
        if !inserted {
            return Err(MemoryError::DuplicateEnqueue(session.id.clone()));
        }
        info!(event = "session_enqueued", session_id = %session.id);
        Ok(())
    }

    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, MemoryError> {
        let _in_flight = match self.in_flight.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Ok(TickReport {
                    outcome: TickOutcome::Busy,
                    ..TickReport::default()
                })
            }
        };

        let mut report = TickReport {
            outbox: self.store.flush_outbox(&self.gateway, now)?,
            alerts_purged: self
                .store
                .with_db(|db| self.config.alerts.collect_garbage(db, now))?,
            ..TickReport::default()
        };

        // Holding `in_flight` means any in-progress row was left behind by a
        // tick whose cleanup also failed.
        let counts = self.store.with_db(|db| db.queue_counts())?;
        if counts.in_progress > 0 {
            self.release_stale(now)?;
        }

        let Some(entry) = self.store.with_db(|db| db.next_eligible(now))? else {
            return Ok(report);
        };
        if !self
            .store
            .with_db(|db| db.mark_in_progress(&entry.session_id, now))?
        {
            return Ok(report);
        }
        report.session_id = Some(entry.session_id.clone());
        debug!(event = "session_started", session_id = %entry.session_id, seq = entry.seq);

        report.outcome = match self.process(&entry, now, &mut report) {
            Ok(outcome) => outcome,
            Err(err) => self.release_after_error(&entry, &err, now)?,
        };
        Ok(report)
    }

    /// Settles a session whose processing stopped on a local error. A row
    /// still in progress counts one failure against the retry limit.
    fn release_after_error(
        &self,
        entry: &QueueEntry,
        err: &MemoryError,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, MemoryError> {
        let session_id = entry.session_id.as_str();
        let state = self
            .store
            .with_db(|db| db.queue_entry(session_id))?
            .map(|current| current.state);
        match state {
            Some(ProcessingState::InProgress) => {
                error!(event = "session_processing_failed", session_id, error = %err);
                let message = format!("interrupted: {err}");
                Ok(match self.count_failure(entry, &message, now)? {
                    Some(failures) => TickOutcome::Interrupted { failures },
                    None => TickOutcome::Terminal,
                })
            }
            Some(ProcessingState::Completed) => {
                warn!(event = "session_follow_up_failed", session_id, error = %err);
                Ok(TickOutcome::Completed)
            }
            Some(ProcessingState::FailedTerminal) => {
                warn!(event = "session_follow_up_failed", session_id, error = %err);
                Ok(TickOutcome::Terminal)
            }
            Some(ProcessingState::Queued) | None => {
                warn!(event = "session_released_before_error", session_id, error = %err);
                Ok(TickOutcome::Idle)
            }
        }
    }

    fn release_stale(&self, now: DateTime<Utc>) -> Result<(), MemoryError> {
        let stale = self
            .store
            .with_db(|db| db.queue_entries())?
            .into_iter()
            .filter(|entry| entry.state == ProcessingState::InProgress);
        for entry in stale {
            warn!(event = "stale_session_released", session_id = %entry.session_id);
            self.count_failure(&entry, "interrupted: left in progress", now)?;
        }
        Ok(())
    }

    fn process(
        &self,
        entry: &QueueEntry,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<TickOutcome, MemoryError> {
        let session = match self.store.cold().read(&entry.session_id) {
            Ok(Some(session)) => session,
            Ok(None) => {
                return self.fail_missing_cold(entry, "cold record not found", now);
            }
            Err(err) => {
                return self.fail_missing_cold(entry, &err.to_string(), now);
            }
        };

        if session.significance == Significance::Low && !self.config.learning_mode {
            self.store
                .with_db(|db| db.mark_skipped(&session.id, "low significance", now))?;
            info!(event = "session_skipped_low_significance", session_id = %session.id);
            return Ok(TickOutcome::Skipped);
        }

        let (facts, plan) = match self.extract(&session, now) {
            Ok(extracted) => extracted,
            Err(stop) => return self.requeue(entry, stop, now),
        };

        let commit = match self.commit_with_retry(&facts, &plan, now) {
            Ok(commit) => commit,
            Err(err) => {
                error!(
                    event = "session_commit_failed",
                    session_id = %session.id,
                    error = %err
                );
                let message = format!("commit: {err}");
                return Ok(match self.count_failure(entry, &message, now)? {
                    Some(failures) => TickOutcome::Interrupted { failures },
                    None => TickOutcome::Terminal,
                });
            }
        };
        report.revision = Some(commit.revision);

        let ordinal = self.store.with_db(|db| db.mark_completed(&session.id, now))?;
        report.ordinal = Some(ordinal);
        info!(
            event = "session_completed",
            session_id = %session.id,
            ordinal,
            revision = commit.revision,
            changed = commit.changed,
            archive_pending = commit.outbox.pending
        );

        self.run_periodic(&session, ordinal, now, report)?;
        report.compression = self.compress_if_needed(now);
        Ok(TickOutcome::Completed)
    }

    /// Stages 1-5. The first stage that is refused or fails stops the run;
    /// nothing has been written at that point.
    fn extract(
        &self,
        session: &Session,
        now: DateTime<Utc>,
    ) -> Result<(ExtractedFacts, TriagePlan), StageStop> {
        let text = session.raw_text.as_str();
        let base_context = json!({
            "session_id": session.id,
            "significance": session.significance.as_str(),
            "tags": session.tags,
        });

        let summary: SummaryOutput =
            self.run_stage(StageKind::Summary, text, base_context.clone(), now)?;
        let context = json!({
            "session_id": session.id,
            "summary": summary.summary,
            "topics": summary.topics,
        });
        let entities: EntitiesOutput =
            self.run_stage(StageKind::Entities, text, context.clone(), now)?;
        let decisions: DecisionsOutput =
            self.run_stage(StageKind::Decisions, text, context.clone(), now)?;
        let failures: FailuresOutput = self.run_stage(StageKind::Failures, text, context, now)?;

        let facts = ExtractedFacts {
            session_id: session.id.clone(),
            observed_at: Some(session.created_at),
            summary: summary.summary.trim().to_string(),
            entities: entities.entities,
            decisions: decisions.decisions,
            failures: failures.failures,
        };
        let triage_context = serde_json::to_value(&facts).unwrap_or(Value::Null);
        let plan: TriagePlan = self.run_stage(StageKind::Triage, text, triage_context, now)?;
        let plan = if self.config.learning_mode {
            plan.with_learning_mode()
        } else {
            plan
        };
        Ok((facts, plan))
    }

    fn run_stage<T: DeserializeOwned>(
        &self,
        stage: StageKind,
        text: &str,
        context: Value,
        now: DateTime<Utc>,
    ) -> Result<T, StageStop> {
        match self.gateway.infer_stage(stage, text, context, now) {
            Guarded::Done(output) => Ok(output),
            Guarded::Skipped => Err(StageStop::Skipped(stage)),
            Guarded::Failed(failure) => Err(StageStop::Failed(stage, failure)),
        }
    }

    /// Stage 6. The hot commit only loses to a concurrent edit; it re-reads
    /// the revision and reapplies a bounded number of times.
    fn commit_with_retry(
        &self,
        facts: &ExtractedFacts,
        plan: &TriagePlan,
        now: DateTime<Utc>,
    ) -> Result<CommitReport, MemoryError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let expected = self.store.current_revision()?;
            match self.store.commit(facts, plan, expected, &self.gateway, now) {
                Err(MemoryError::DataConflict { expected, found }) if attempt < COMMIT_ATTEMPTS => {
                    warn!(
                        event = "commit_conflict_retry",
                        session_id = %facts.session_id,
                        expected,
                        found,
                        attempt
                    );
                }
                result => return result,
            }
        }
    }

    fn requeue(
        &self,
        entry: &QueueEntry,
        stop: StageStop,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, MemoryError> {
        let session_id = entry.session_id.as_str();
        match stop {
            StageStop::Skipped(stage) => {
                let level = entry.backoff_level + 1;
                let retry_at = now + self.config.backoff_for(level);
                let reason = format!("{stage} skipped: circuit open");
                self.store
                    .with_db(|db| db.schedule_deferral(session_id, &reason, retry_at, now))?;
                info!(
                    event = "session_deferred",
                    session_id,
                    stage = %stage,
                    backoff_level = level,
                    retry_at = %retry_at
                );
                Ok(TickOutcome::Deferred { stage })
            }
            StageStop::Failed(stage, failure) => {
                let message = format!("{stage}: {failure}");
                match self.count_failure(entry, &message, now)? {
                    Some(failures) => {
                        info!(
                            event = "session_requeued",
                            session_id,
                            stage = %stage,
                            failures
                        );
                        Ok(TickOutcome::Retried { stage, failures })
                    }
                    None => Ok(TickOutcome::Terminal),
                }
            }
        }
    }

    /// Counts one transient failure. Past `max_transient_retries` the session
    /// is terminal and a poison anomaly is recorded (`None`); otherwise it
    /// goes to the back of the queue with backoff and the new count is
    /// returned.
    fn count_failure(
        &self,
        entry: &QueueEntry,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>, MemoryError> {
        let session_id = entry.session_id.as_str();
        let failures = entry.transient_failures + 1;
        if failures > self.config.max_transient_retries {
            self.store
                .with_db(|db| db.mark_failed_terminal(session_id, message, now))?;
            let finding = AlertFinding {
                kind: ANOMALY_POISON_SESSION.to_string(),
                subject: format!("session {session_id} exceeded retry limit"),
                confidence_bps: 10_000,
            };
            self.store.with_db(|db| {
                self.config
                    .alerts
                    .record_exact(db, AlertClass::Anomaly, &finding, Some(session_id), now)
            })?;
            warn!(event = "session_poisoned", session_id, failures, error = message);
            return Ok(None);
        }

        let level = entry.backoff_level + 1;
        let retry_at = now + self.config.backoff_for(level);
        self.store
            .with_db(|db| db.schedule_retry(session_id, message, retry_at, now))?;
        debug!(
            event = "session_retry_scheduled",
            session_id,
            failures,
            retry_at = %retry_at
        );
        Ok(Some(failures))
    }

    fn fail_missing_cold(
        &self,
        entry: &QueueEntry,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, MemoryError> {
        let session_id = entry.session_id.as_str();
        self.store
            .with_db(|db| db.mark_failed_terminal(session_id, reason, now))?;
        let finding = AlertFinding {
            kind: ANOMALY_MISSING_COLD.to_string(),
            subject: format!("session {session_id} has no readable cold record"),
            confidence_bps: 10_000,
        };
        self.store.with_db(|db| {
            self.config
                .alerts
                .record_exact(db, AlertClass::Anomaly, &finding, Some(session_id), now)
        })?;
        error!(event = "session_cold_record_unreadable", session_id, reason);
        Ok(TickOutcome::Terminal)
    }

    /// Stages 7-9. Refusals and failures are not retried; the next
    /// qualifying ordinal runs them again.
    fn run_periodic(
        &self,
        session: &Session,
        ordinal: u64,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), MemoryError> {
        if is_due(self.config.pattern_every, ordinal) {
            let summaries = self.recent_summaries()?;
            let context = json!({ "ordinal": ordinal, "sessions": summaries.len() });
            match self.gateway.infer_stage::<PatternOutput>(
                StageKind::Pattern,
                &summaries.join("\n"),
                context,
                now,
            ) {
                Guarded::Done(output) => {
                    let records = output
                        .patterns
                        .into_iter()
                        .filter(|pattern| !pattern.description.trim().is_empty())
                        .map(|pattern| {
                            ArchiveRecord::new(&session.id, ArchivePayload::Pattern(pattern), false, now)
                        })
                        .collect::<Vec<_>>();
                    if !records.is_empty() {
                        self.store.with_db(|db| db.insert_archive_records(&records))?;
                        report.outbox = self.store.flush_outbox(&self.gateway, now)?;
                    }
                    report.periodic_ran.push(StageKind::Pattern);
                }
                _ => report.periodic_skipped.push(StageKind::Pattern),
            }
        }

        if is_due(self.config.nudge_every, ordinal) {
            let context = self.hot_context(ordinal);
            match self.gateway.infer_stage::<NudgeOutput>(
                StageKind::Nudge,
                &session.raw_text,
                context,
                now,
            ) {
                Guarded::Done(output) => {
                    self.record_alerts(AlertClass::Nudge, &output.nudges, &session.id, now)?;
                    report.periodic_ran.push(StageKind::Nudge);
                }
                _ => report.periodic_skipped.push(StageKind::Nudge),
            }
        }

        if is_due(self.config.anomaly_every, ordinal) {
            let context = self.hot_context(ordinal);
            match self.gateway.infer_stage::<AnomalyOutput>(
                StageKind::Anomaly,
                &session.raw_text,
                context,
                now,
            ) {
                Guarded::Done(output) => {
                    self.record_alerts(AlertClass::Anomaly, &output.anomalies, &session.id, now)?;
                    report.periodic_ran.push(StageKind::Anomaly);
                }
                _ => report.periodic_skipped.push(StageKind::Anomaly),
            }
        }

        if !report.periodic_skipped.is_empty() {
            debug!(
                event = "periodic_stages_skipped",
                session_id = %session.id,
                ordinal,
                skipped = ?report.periodic_skipped
            );
        }
        Ok(())
    }

    fn record_alerts(
        &self,
        class: AlertClass,
        findings: &[AlertFinding],
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), MemoryError> {
        for finding in findings {
            self.store.with_db(|db| {
                self.config
                    .alerts
                    .record(db, class, finding, Some(session_id), now)
            })?;
        }
        Ok(())
    }

    fn recent_summaries(&self) -> Result<Vec<String>, MemoryError> {
        let records = self
            .store
            .with_db(|db| db.ledger_records(PATTERN_SUMMARY_WINDOW * 8))?;
        let mut summaries = records
            .into_iter()
            .filter(|record| record.kind() == ArchiveKind::Summary)
            .take(PATTERN_SUMMARY_WINDOW)
            .map(|record| record.payload.document_text())
            .collect::<Vec<_>>();
        summaries.reverse();
        Ok(summaries)
    }

    fn hot_context(&self, ordinal: u64) -> Value {
        let markdown = self
            .store
            .read_hot()
            .map(|snapshot| snapshot.document.render_markdown())
            .unwrap_or_default();
        json!({ "ordinal": ordinal, "master_context": markdown })
    }

    /// Stage 10. Failures are logged and leave the document as it was.
    fn compress_if_needed(&self, now: DateTime<Utc>) -> Option<CompressionReport> {
        let snapshot = self.store.read_hot()?;
        let budget = self.config.budget.budget_for(&snapshot.document);
        if snapshot.document.token_estimate() <= budget {
            return None;
        }
        match self.store.compress(&self.gateway, budget, now) {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(event = "compression_failed", budget, error = %err);
                None
            }
        }
    }
}

fn is_due(every: u64, ordinal: u64) -> bool {
    every > 0 && ordinal > 0 && ordinal % every == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::degradation::{CircuitConfig, DegradationMonitor};
    use chrono::TimeZone;
    use ctx_core::ports::{
        ArchiveDocument, ArchivePort, RankedDocument, ReasoningPort, ReasoningRequest,
    };
    use std::sync::Arc;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    /// Answers every stage with a minimal valid payload.
    struct QuietReasoner;

    impl ReasoningPort for QuietReasoner {
        fn infer(&self, request: &ReasoningRequest) -> Result<Value, DependencyFailure> {
            Ok(match request.stage {
                StageKind::Summary => json!({"summary": format!("about {}", request.text)}),
                StageKind::Entities => json!({"entities": [{"name": "Atlas", "kind": "project"}]}),
                StageKind::Decisions => json!({"decisions": []}),
                StageKind::Failures => json!({"failures": []}),
                StageKind::Triage => json!({"items": []}),
                StageKind::Pattern => json!({"patterns": []}),
                StageKind::Nudge => json!({"nudges": [{"kind": "follow_up", "subject": "review atlas rollout"}]}),
                StageKind::Anomaly => json!({"anomalies": []}),
                StageKind::Compress => json!({"digest": "condensed"}),
            })
        }
    }

    struct DownReasoner;

    impl ReasoningPort for DownReasoner {
        fn infer(&self, _request: &ReasoningRequest) -> Result<Value, DependencyFailure> {
            Err(DependencyFailure::service("503"))
        }
    }

    struct NullArchive;

    impl ArchivePort for NullArchive {
        fn upsert(&self, _: &str, _: &[ArchiveDocument]) -> Result<(), DependencyFailure> {
            Ok(())
        }

        fn query(&self, _: &str, _: &str, _: usize) -> Result<Vec<RankedDocument>, DependencyFailure> {
            Ok(Vec::new())
        }
    }

    fn scheduler(
        dir: &std::path::Path,
        reasoning: Arc<dyn ReasoningPort>,
        config: SchedulerConfig,
    ) -> PipelineScheduler {
        let store = TieredMemoryStore::open(dir).expect("open store");
        let gateway = PortGateway::new(
            reasoning,
            Arc::new(NullArchive),
            DegradationMonitor::new(CircuitConfig::default()),
            config.timeouts,
        );
        PipelineScheduler::new(store, gateway, config, ts()).expect("scheduler")
    }

    fn state_of(scheduler: &PipelineScheduler, session_id: &str) -> ProcessingState {
        scheduler
            .store()
            .with_db(|db| db.queue_entry(session_id))
            .expect("queue entry")
            .expect("row present")
            .state
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = SchedulerConfig::default();
        assert_eq!(config.backoff_for(1), Duration::minutes(1));
        assert_eq!(config.backoff_for(2), Duration::minutes(2));
        assert_eq!(config.backoff_for(5), Duration::minutes(16));
        assert_eq!(config.backoff_for(6), Duration::minutes(30));
        assert_eq!(config.backoff_for(60), Duration::minutes(30));
    }

    #[test]
    fn cadence_uses_completion_ordinal() {
        assert!(!is_due(5, 0));
        assert!(is_due(5, 5));
        assert!(!is_due(5, 6));
        assert!(!is_due(0, 10));
        assert!(is_due(3, 9));
    }

    #[test]
    fn duplicate_enqueue_is_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let scheduler = scheduler(dir.path(), Arc::new(QuietReasoner), SchedulerConfig::default());
        let session = Session::new("s1", "planning call", ts());
        scheduler.enqueue(&session, ts()).expect("enqueue");
        let err = scheduler.enqueue(&session, ts()).expect_err("duplicate");
        assert!(matches!(err, MemoryError::DuplicateEnqueue(id) if id == "s1"));
    }

    #[test]
    fn completed_session_reaches_hot_and_runs_due_periodic_stages() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = SchedulerConfig {
            nudge_every: 1,
            ..SchedulerConfig::default()
        };
        let scheduler = scheduler(dir.path(), Arc::new(QuietReasoner), config);
        scheduler
            .enqueue(&Session::new("s1", "atlas planning", ts()), ts())
            .expect("enqueue");

        let report = scheduler.tick(ts()).expect("tick");
        assert_eq!(report.outcome, TickOutcome::Completed);
        assert_eq!(report.ordinal, Some(1));
        assert_eq!(report.revision, Some(1));
        assert_eq!(report.periodic_ran, vec![StageKind::Nudge]);
        assert_eq!(state_of(&scheduler, "s1"), ProcessingState::Completed);

        let nudges = scheduler
            .store()
            .with_db(|db| db.active_alerts(AlertClass::Nudge, ts()))
            .expect("nudges");
        assert_eq!(nudges.len(), 1);

        let idle = scheduler.tick(ts()).expect("idle tick");
        assert_eq!(idle.outcome, TickOutcome::Idle);
    }

    #[test]
    fn low_significance_sessions_skip_reasoning() {
        let dir = tempfile::tempdir().expect("temp dir");
        let scheduler = scheduler(dir.path(), Arc::new(DownReasoner), SchedulerConfig::default());
        let mut session = Session::new("s1", "small talk", ts());
        session.significance = Significance::Low;
        scheduler.enqueue(&session, ts()).expect("enqueue");

        let report = scheduler.tick(ts()).expect("tick");
        assert_eq!(report.outcome, TickOutcome::Skipped);
        assert_eq!(state_of(&scheduler, "s1"), ProcessingState::Completed);
        assert_eq!(
            scheduler
                .store()
                .with_db(|db| db.completed_ordinal())
                .expect("ordinal"),
            0
        );
    }

    #[test]
    fn open_circuit_defers_without_counting_a_failure() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = SchedulerConfig {
            backoff_base_ms: 1_000,
            ..SchedulerConfig::default()
        };
        let scheduler = scheduler(dir.path(), Arc::new(DownReasoner), config);
        scheduler
            .enqueue(&Session::new("s1", "atlas planning", ts()), ts())
            .expect("enqueue");

        for step in 0..3 {
            let report = scheduler
                .tick(ts() + Duration::hours(step))
                .expect("failing tick");
            assert!(matches!(report.outcome, TickOutcome::Retried { .. }));
        }

        // Third failure opened the reasoning circuit; the cooldown has not elapsed.
        let report = scheduler
            .tick(ts() + Duration::hours(2) + Duration::seconds(10))
            .expect("tick");
        assert_eq!(
            report.outcome,
            TickOutcome::Deferred {
                stage: StageKind::Summary
            }
        );

        let entry = scheduler
            .store()
            .with_db(|db| db.queue_entry("s1"))
            .expect("entry")
            .expect("row");
        assert_eq!(entry.state, ProcessingState::Queued);
        assert_eq!(entry.transient_failures, 3);
        assert_eq!(entry.backoff_level, 4);
    }

    #[test]
    fn missing_cold_record_is_terminal() {
        let dir = tempfile::tempdir().expect("temp dir");
        let scheduler = scheduler(dir.path(), Arc::new(QuietReasoner), SchedulerConfig::default());
        scheduler
            .store()
            .with_db(|db| db.enqueue_session("ghost", ts(), ts()))
            .expect("raw enqueue");

        let report = scheduler.tick(ts()).expect("tick");
        assert_eq!(report.outcome, TickOutcome::Terminal);
        assert_eq!(state_of(&scheduler, "ghost"), ProcessingState::FailedTerminal);
        let anomalies = scheduler
            .store()
            .with_db(|db| db.active_alerts(AlertClass::Anomaly, ts()))
            .expect("anomalies");
        assert_eq!(anomalies.len(), 1);
    }

    #[test]
    fn failing_commits_become_terminal_at_the_retry_limit() {
        let dir = tempfile::tempdir().expect("temp dir");
        let scheduler = scheduler(dir.path(), Arc::new(QuietReasoner), SchedulerConfig::default());
        scheduler
            .enqueue(&Session::new("s1", "atlas planning", ts()), ts())
            .expect("enqueue");
        let conn = rusqlite::Connection::open(dir.path().join("memory.db")).expect("raw conn");
        conn.execute_batch(
            "CREATE TRIGGER reject_revisions BEFORE INSERT ON master_revisions
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .expect("trigger");

        let mut outcomes = Vec::new();
        for step in 0..6 {
            let report = scheduler
                .tick(ts() + Duration::hours(step))
                .expect("tick reports instead of failing");
            outcomes.push(report.outcome);
        }
        assert_eq!(outcomes[0], TickOutcome::Interrupted { failures: 1 });
        assert_eq!(outcomes[4], TickOutcome::Interrupted { failures: 5 });
        assert_eq!(outcomes[5], TickOutcome::Terminal);
        assert_eq!(state_of(&scheduler, "s1"), ProcessingState::FailedTerminal);

        let anomalies = scheduler
            .store()
            .with_db(|db| db.active_alerts(AlertClass::Anomaly, ts() + Duration::hours(6)))
            .expect("anomalies");
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, ANOMALY_POISON_SESSION);
    }

    #[test]
    fn stale_in_progress_rows_are_released_on_the_next_tick() {
        let dir = tempfile::tempdir().expect("temp dir");
        let scheduler = scheduler(dir.path(), Arc::new(QuietReasoner), SchedulerConfig::default());
        scheduler
            .enqueue(&Session::new("s1", "atlas planning", ts()), ts())
            .expect("enqueue");
        scheduler
            .store()
            .with_db(|db| db.mark_in_progress("s1", ts()))
            .expect("mark in progress");

        let first = scheduler.tick(ts()).expect("tick");
        assert_ne!(first.outcome, TickOutcome::Busy);
        let entry = scheduler
            .store()
            .with_db(|db| db.queue_entry("s1"))
            .expect("entry")
            .expect("row");
        assert_eq!(entry.state, ProcessingState::Queued);
        assert_eq!(entry.transient_failures, 1);

        let later = scheduler.tick(ts() + Duration::hours(1)).expect("tick");
        assert_eq!(later.outcome, TickOutcome::Completed);
        assert_eq!(state_of(&scheduler, "s1"), ProcessingState::Completed);
    }
}
