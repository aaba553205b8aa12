use crate::degradation::DegradationMonitor;
use crate::tiered_store::{HotBudget, TieredMemoryStore};
use crate::MemoryError;
use chrono::{DateTime, Utc};
use ctx_core::master_context::MasterContext;
use ctx_core::memory_contracts::{
    AlertClass, ArchivePayload, DegradationLevel, ExtractedFacts, HotSource, Session, TriagePlan,
};
use ctx_storage::{LedgerCounts, QueueCounts};
use std::collections::BTreeMap;
use tracing::{info, warn};

const DEFAULT_REPROCESS_LIMIT: usize = 50;

/// Cold sessions to replay, by creation time. Both bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for SessionRange {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            limit: DEFAULT_REPROCESS_LIMIT,
        }
    }
}

impl SessionRange {
    fn contains(&self, created_at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| created_at >= from)
            && self.to.map_or(true, |to| created_at <= to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaffoldReport {
    pub document: MasterContext,
    pub created: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReprocessReport {
    pub scanned: usize,
    pub enqueued: usize,
    pub requeued: usize,
    pub skipped_pending: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    pub sessions: usize,
    pub records_applied: usize,
    pub records_skipped: usize,
    pub revision: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub level: DegradationLevel,
    pub hot_source: Option<HotSource>,
    pub revision: Option<u64>,
    pub hot_tokens: Option<u32>,
    pub hot_budget: Option<u32>,
    pub cold_sessions: usize,
    pub queue: QueueCounts,
    pub ledger: LedgerCounts,
    pub active_nudges: usize,
    pub active_anomalies: usize,
}

/// Human-triggered recovery operations. Each one reports partial progress
/// instead of stopping at the first bad record.
pub struct BootstrapCoordinator {
    store: TieredMemoryStore,
    monitor: DegradationMonitor,
    budget: HotBudget,
}

impl BootstrapCoordinator {
    pub fn new(store: TieredMemoryStore, monitor: DegradationMonitor, budget: HotBudget) -> Self {
        Self {
            store,
            monitor,
            budget,
        }
    }

    /// Returns the readable hot document, or persists an empty one.
    pub fn scaffold(&self, now: DateTime<Utc>) -> Result<ScaffoldReport, MemoryError> {
        if let Some(snapshot) = self.store.read_hot() {
            return Ok(ScaffoldReport {
                document: snapshot.document,
                created: false,
            });
        }

        let revision = self
            .store
            .replace_document(MasterContext::empty(), "scaffold", now)?;
        info!(event = "hot_scaffolded", revision);
        let document = self
            .store
            .read_hot()
            .map(|snapshot| snapshot.document)
            .ok_or(MemoryError::NoContextAvailable)?;
        Ok(ScaffoldReport {
            document,
            created: true,
        })
    }

    /// Puts cold sessions back on the queue. Sessions still pending are left
    /// where they are; replaying a committed session changes nothing because
    /// commits and ledger inserts are keyed by session and fact identity.
    pub fn reprocess(
        &self,
        range: &SessionRange,
        now: DateTime<Utc>,
    ) -> Result<ReprocessReport, MemoryError> {
        let mut report = ReprocessReport::default();
        let mut sessions: Vec<Session> = Vec::new();
        for session_id in self.store.cold().session_ids()? {
            match self.store.cold().read(&session_id) {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(err) => {
                    warn!(event = "reprocess_unreadable_session", session_id = %session_id, error = %err);
                    report.errors.push(format!("{session_id}: {err}"));
                }
            }
        }
        sessions.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });

        for session in sessions
            .into_iter()
            .filter(|session| range.contains(session.created_at))
            .take(range.limit.max(1))
        {
            report.scanned += 1;
            match self.requeue_one(&session, now) {
                Ok(Requeue::Enqueued) => report.enqueued += 1,
                Ok(Requeue::Requeued) => report.requeued += 1,
                Ok(Requeue::Pending) => report.skipped_pending += 1,
                Err(err) => {
                    warn!(event = "reprocess_session_failed", session_id = %session.id, error = %err);
                    report.errors.push(format!("{}: {err}", session.id));
                }
            }
        }

        info!(
            event = "reprocess_finished",
            scanned = report.scanned,
            enqueued = report.enqueued,
            requeued = report.requeued,
            skipped_pending = report.skipped_pending,
            errors = report.errors.len()
        );
        Ok(report)
    }

    fn requeue_one(&self, session: &Session, now: DateTime<Utc>) -> Result<Requeue, MemoryError> {
        self.store.with_db(|db| match db.queue_entry(&session.id)? {
            None => {
                db.enqueue_session(&session.id, session.created_at, now)?;
                Ok(Requeue::Enqueued)
            }
            Some(entry) if entry.state.is_pending() => Ok(Requeue::Pending),
            Some(_) => {
                if db.requeue_session(&session.id, now)? {
                    Ok(Requeue::Requeued)
                } else {
                    Ok(Requeue::Pending)
                }
            }
        })
    }

    /// Synthesizes a fresh hot document from the hot-eligible ledger records,
    /// folded in commit order with the commit merge rule. The result is
    /// persisted above every existing revision.
    pub fn rebuild_master(&self, now: DateTime<Utc>) -> Result<RebuildReport, MemoryError> {
        let mut report = RebuildReport::default();
        let mut order: Vec<String> = Vec::new();
        let mut grouped: BTreeMap<String, (ExtractedFacts, DateTime<Utc>)> = BTreeMap::new();

        for record in self.store.with_db(|db| db.hot_ledger_records())? {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    warn!(event = "rebuild_record_skipped", record_id = %err.record_id, error = %err.message);
                    report.records_skipped += 1;
                    report
                        .errors
                        .push(format!("{}: {}", err.record_id, err.message));
                    continue;
                }
            };
            if !grouped.contains_key(&record.session_id) {
                order.push(record.session_id.clone());
            }
            let (facts, latest) = grouped
                .entry(record.session_id.clone())
                .or_insert_with(|| (ExtractedFacts::new(record.session_id.clone()), record.created_at));
            *latest = (*latest).max(record.created_at);
            match record.payload {
                ArchivePayload::Entity(entity) => facts.entities.push(entity),
                ArchivePayload::Decision { text } => facts.decisions.push(text),
                ArchivePayload::Failure { text } => facts.failures.push(text),
                _ => {
                    report.records_skipped += 1;
                    continue;
                }
            }
            report.records_applied += 1;
        }

        let mut document = MasterContext::empty();
        let plan = TriagePlan::default();
        for session_id in &order {
            if let Some((facts, created_at)) = grouped.get_mut(session_id) {
                facts.observed_at = match self.store.cold().read(session_id) {
                    Ok(Some(session)) => Some(session.created_at),
                    _ => Some(*created_at),
                };
                document.apply_facts(facts, &plan, *created_at);
            }
        }
        let nudges = self
            .store
            .with_db(|db| db.active_alerts(AlertClass::Nudge, now))?;
        document.replace_nudges(&nudges, now);

        report.sessions = order.len();
        report.revision = self.store.replace_document(document, "rebuild", now)?;
        info!(
            event = "hot_rebuilt",
            revision = report.revision,
            sessions = report.sessions,
            records_applied = report.records_applied,
            records_skipped = report.records_skipped
        );
        Ok(report)
    }

    pub fn status(&self, now: DateTime<Utc>) -> Result<StatusReport, MemoryError> {
        let snapshot = self.store.read_hot();
        let hot_source = snapshot.as_ref().map(|snapshot| snapshot.source);
        let (queue, ledger, active_nudges, active_anomalies) = self.store.with_db(|db| {
            Ok((
                db.queue_counts()?,
                db.ledger_counts()?,
                db.active_alerts(AlertClass::Nudge, now)?.len(),
                db.active_alerts(AlertClass::Anomaly, now)?.len(),
            ))
        })?;
        Ok(StatusReport {
            level: self.monitor.level(hot_source),
            hot_source,
            revision: snapshot.as_ref().map(|snapshot| snapshot.document.revision),
            hot_tokens: snapshot
                .as_ref()
                .map(|snapshot| snapshot.document.token_estimate()),
            hot_budget: snapshot
                .as_ref()
                .map(|snapshot| self.budget.budget_for(&snapshot.document)),
            cold_sessions: self.store.cold().session_ids()?.len(),
            queue,
            ledger,
            active_nudges,
            active_anomalies,
        })
    }
}

enum Requeue {
    Enqueued,
    Requeued,
    Pending,
}
