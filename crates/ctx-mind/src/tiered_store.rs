use crate::dispatch::{Guarded, PortGateway};
use crate::MemoryError;
use chrono::{DateTime, Utc};
use ctx_core::master_context::{ContextEntry, ContextSection, MasterContext, DIGEST_KEY};
use ctx_core::memory_contracts::{
    archive_records_for, normalize_identity, AlertClass, ArchiveKind, ArchivePayload,
    ArchiveRecord, CompressOutput, ExtractedFacts, HotSource, Session, StageKind, TriagePlan,
};
use ctx_core::ports::ArchiveDocument;
use ctx_storage::{ColdSessionLog, LastGoodCache, MemoryDb, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{error, info, warn};

const OUTBOX_BATCH: usize = 200;
const DEFAULT_REVISION_RETENTION: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotBudget {
    pub base_tokens: u32,
    pub per_project_tokens: u32,
    pub max_tokens: u32,
}

impl Default for HotBudget {
    fn default() -> Self {
        Self {
            base_tokens: 5_000,
            per_project_tokens: 500,
            max_tokens: 8_000,
        }
    }
}

impl HotBudget {
    /// Grows with the number of tracked projects, up to the ceiling.
    pub fn budget_for(&self, document: &MasterContext) -> u32 {
        let projects = document.project_count().min(u32::MAX as usize) as u32;
        self.base_tokens
            .saturating_add(self.per_project_tokens.saturating_mul(projects))
            .min(self.max_tokens.max(self.base_tokens))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotSnapshot {
    pub document: MasterContext,
    pub source: HotSource,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OutboxReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    pub pending: u64,
    pub circuit_open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    pub revision: u64,
    pub changed: bool,
    pub records_written: usize,
    pub outbox: OutboxReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum CompressionOutcome {
    NotNeeded,
    NothingToPrune,
    Compressed,
    /// A dependency circuit was open; the document is unchanged.
    Skipped,
    Failed(String),
    /// The document moved on while the digest was being produced.
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionReport {
    pub outcome: CompressionOutcome,
    pub tokens_before: u32,
    pub tokens_after: u32,
    pub pruned_entries: usize,
    pub revision: Option<u64>,
}

impl CompressionReport {
    fn unchanged(outcome: CompressionOutcome, tokens: u32, revision: Option<u64>) -> Self {
        Self {
            outcome,
            tokens_before: tokens,
            tokens_after: tokens,
            pruned_entries: 0,
            revision,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualEdit {
    Upsert {
        section: ContextSection,
        label: String,
        text: String,
    },
    Remove {
        section: ContextSection,
        key: String,
    },
}

struct StoreState {
    db: MemoryDb,
    live: Option<MasterContext>,
}

/// Owner of the three tiers. Every mutation of the hot document goes through
/// one mutex; reasoning and archive calls are made with the mutex released.
#[derive(Clone)]
pub struct TieredMemoryStore {
    state: Arc<Mutex<StoreState>>,
    cold: ColdSessionLog,
    last_good: LastGoodCache,
    revision_retention: usize,
}

impl TieredMemoryStore {
    pub fn new(db: MemoryDb, cold: ColdSessionLog, last_good: LastGoodCache) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState { db, live: None })),
            cold,
            last_good,
            revision_retention: DEFAULT_REVISION_RETENTION,
        }
    }

    /// Standard layout under one data directory.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir).map_err(StorageError::from)?;
        let db = MemoryDb::open(data_dir.join("memory.db"))?;
        let cold = ColdSessionLog::open(data_dir.join("sessions"))?;
        let last_good = LastGoodCache::new(data_dir.join("master_context.last_good.json"));
        Ok(Self::new(db, cold, last_good))
    }

    pub fn with_revision_retention(mut self, keep: usize) -> Self {
        self.revision_retention = keep.max(1);
        self
    }

    pub fn cold(&self) -> &ColdSessionLog {
        &self.cold
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_db<T>(
        &self,
        f: impl FnOnce(&MemoryDb) -> Result<T, StorageError>,
    ) -> Result<T, MemoryError> {
        let state = self.lock();
        Ok(f(&state.db)?)
    }

    /// Writes a session to the cold tier. Returns false if it was already there.
    pub fn ingest(&self, session: &Session) -> Result<bool, MemoryError> {
        session.validate()?;
        Ok(self.cold.append(session)?)
    }

    /// Current hot document: live copy, else latest durable revision, else
    /// the last-good snapshot. `None` only when every tier is unreadable.
    pub fn read_hot(&self) -> Option<HotSnapshot> {
        let mut state = self.lock();
        self.resolve_hot(&mut state)
    }

    pub fn hot_source(&self) -> Option<HotSource> {
        self.read_hot().map(|snapshot| snapshot.source)
    }

    fn resolve_hot(&self, state: &mut StoreState) -> Option<HotSnapshot> {
        if let Some(live) = &state.live {
            return Some(HotSnapshot {
                document: live.clone(),
                source: HotSource::Live,
            });
        }

        match state.db.latest_revision() {
            Ok(Some(document)) => {
                state.live = Some(document.clone());
                return Some(HotSnapshot {
                    document,
                    source: HotSource::Durable,
                });
            }
            Ok(None) => {}
            Err(err) => warn!(event = "hot_durable_read_failed", error = %err),
        }

        match self.last_good.load() {
            Ok(Some(document)) => {
                warn!(
                    event = "hot_served_from_last_good",
                    revision = document.revision
                );
                Some(HotSnapshot {
                    document,
                    source: HotSource::LastGood,
                })
            }
            Ok(None) => None,
            Err(err) => {
                warn!(event = "hot_last_good_read_failed", error = %err);
                None
            }
        }
    }

    /// Base for the next mutation. When no tier is readable the next revision
    /// still lands above anything already persisted.
    fn base_document(&self, state: &mut StoreState) -> Result<MasterContext, MemoryError> {
        if let Some(snapshot) = self.resolve_hot(state) {
            return Ok(snapshot.document);
        }
        let mut empty = MasterContext::empty();
        empty.revision = state.db.latest_revision_number()?.unwrap_or(0);
        Ok(empty)
    }

    pub fn current_revision(&self) -> Result<u64, MemoryError> {
        let mut state = self.lock();
        Ok(self.base_document(&mut state)?.revision)
    }

    fn persist(
        &self,
        state: &mut StoreState,
        document: MasterContext,
        cause: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, MemoryError> {
        let durable = state.db.latest_revision_number()?.unwrap_or(0);
        let live = state.live.as_ref().map(|live| live.revision);
        let monotonic = document.revision > durable
            && live.map_or(true, |live| document.revision > live);
        if !monotonic {
            error!(
                event = "revision_invariant_violated",
                revision = document.revision,
                durable_revision = durable,
                live_revision = ?live,
                cause = cause
            );
            return Err(MemoryError::RevisionInvariant(format!(
                "revision {} is not above durable {durable} / live {live:?}",
                document.revision
            )));
        }
        if !state.db.insert_revision(&document, cause, now)? {
            return Err(MemoryError::RevisionInvariant(format!(
                "revision {} already persisted",
                document.revision
            )));
        }
        state.db.prune_revisions(self.revision_retention)?;

        let revision = document.revision;
        if let Err(err) = self.last_good.store(&document) {
            warn!(event = "last_good_write_failed", revision, error = %err);
        }
        state.live = Some(document);
        info!(event = "hot_revision_persisted", revision, cause = cause);
        Ok(revision)
    }

    /// Folds a session's triaged facts into the hot document and queues its
    /// archive records. The archive delivery is attempted afterwards and never
    /// decides the outcome of the hot commit.
    pub fn commit(
        &self,
        facts: &ExtractedFacts,
        plan: &TriagePlan,
        expected_revision: u64,
        gateway: &PortGateway,
        now: DateTime<Utc>,
    ) -> Result<CommitReport, MemoryError> {
        if !self.cold.contains(&facts.session_id) {
            return Err(MemoryError::MissingColdSession(facts.session_id.clone()));
        }

        let (revision, changed, records_written) = {
            let mut state = self.lock();
            let base = self.base_document(&mut state)?;
            if base.revision != expected_revision {
                warn!(
                    event = "hot_revision_conflict",
                    session_id = %facts.session_id,
                    expected = expected_revision,
                    found = base.revision
                );
                return Err(MemoryError::DataConflict {
                    expected: expected_revision,
                    found: base.revision,
                });
            }

            let mut next = base.clone();
            let mut changed = next.apply_facts(facts, plan, now);
            let nudges = state.db.active_alerts(AlertClass::Nudge, now)?;
            changed |= next.replace_nudges(&nudges, now);

            let revision = if changed {
                next.revision = base.revision + 1;
                next.updated_at = Some(now);
                self.persist(&mut state, next, "commit", now)?
            } else {
                base.revision
            };

            let records = archive_records_for(facts, plan, now);
            let records_written = state.db.insert_archive_records(&records)?;
            (revision, changed, records_written)
        };

        let outbox = self.flush_outbox(gateway, now)?;
        info!(
            event = "hot_commit",
            session_id = %facts.session_id,
            revision,
            changed,
            records_written,
            archive_pending = outbox.pending
        );
        Ok(CommitReport {
            revision,
            changed,
            records_written,
            outbox,
        })
    }

    /// Delivers undelivered ledger records to the archive, one collection at a
    /// time. Stops at the first refused or failed batch.
    pub fn flush_outbox(
        &self,
        gateway: &PortGateway,
        now: DateTime<Utc>,
    ) -> Result<OutboxReport, MemoryError> {
        let pending = self.with_db(|db| db.undelivered_records(OUTBOX_BATCH))?;
        let mut report = OutboxReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        let mut by_collection: BTreeMap<&'static str, Vec<ArchiveRecord>> = BTreeMap::new();
        for record in pending {
            by_collection
                .entry(record.kind().collection())
                .or_default()
                .push(record);
        }

        for (collection, records) in by_collection {
            let ids = records
                .iter()
                .map(|record| record.record_id.clone())
                .collect::<Vec<_>>();
            let documents = records.iter().map(archive_document).collect::<Vec<_>>();
            report.attempted += ids.len();

            match gateway.archive_upsert(collection, documents, now) {
                Guarded::Done(()) => {
                    report.delivered += self.with_db(|db| db.mark_delivered(&ids))?;
                }
                Guarded::Skipped => {
                    report.circuit_open = true;
                    break;
                }
                Guarded::Failed(failure) => {
                    let message = failure.to_string();
                    self.with_db(|db| db.record_delivery_failure(&ids, &message))?;
                    report.failed += ids.len();
                    break;
                }
            }
        }

        report.pending = self.with_db(|db| db.ledger_counts())?.undelivered;
        Ok(report)
    }

    /// Shrinks the hot document toward `budget_tokens`. Candidates are pruned
    /// from a copy, summarized into one digest per section, and archived
    /// before the removal is committed. Any refusal or failure leaves the
    /// document as it was.
    pub fn compress(
        &self,
        gateway: &PortGateway,
        budget_tokens: u32,
        now: DateTime<Utc>,
    ) -> Result<CompressionReport, MemoryError> {
        let Some(snapshot) = self.read_hot() else {
            return Ok(CompressionReport::unchanged(
                CompressionOutcome::NotNeeded,
                0,
                None,
            ));
        };
        let document = snapshot.document;
        let tokens_before = document.token_estimate();
        let revision = Some(document.revision);
        if tokens_before <= budget_tokens {
            return Ok(CompressionReport::unchanged(
                CompressionOutcome::NotNeeded,
                tokens_before,
                revision,
            ));
        }

        // Pruned entries are archived under their source sessions, so an entry
        // with no cold-tier source stays in the hot document.
        let mut trial = document.clone();
        let mut pruned: BTreeMap<ContextSection, Vec<ContextEntry>> = BTreeMap::new();
        for (section, entry) in document.prune_candidates() {
            if trial.token_estimate() <= budget_tokens {
                break;
            }
            if !entry.sources.iter().any(|source| self.cold.contains(source)) {
                continue;
            }
            trial.remove_entry(section, &entry.key);
            pruned.entry(section).or_default().push(entry);
        }
        if pruned.is_empty() {
            return Ok(CompressionReport::unchanged(
                CompressionOutcome::NothingToPrune,
                tokens_before,
                revision,
            ));
        }

        let mut digests = Vec::new();
        for (section, entries) in &pruned {
            let prior_digest = document.entry(*section, DIGEST_KEY).map(|entry| entry.text.as_str());
            let text = digest_input(prior_digest, entries);
            let context = serde_json::json!({
                "section": section.as_str(),
                "budget_tokens": budget_tokens,
                "entries": entries.len(),
            });
            match gateway.infer_stage::<CompressOutput>(StageKind::Compress, &text, context, now) {
                Guarded::Done(output) if !output.digest.trim().is_empty() => {
                    digests.push((*section, output.digest.trim().to_string()));
                }
                Guarded::Done(_) => {
                    return Ok(self.compression_abandoned(
                        CompressionOutcome::Failed("empty digest".to_string()),
                        tokens_before,
                        revision,
                    ));
                }
                Guarded::Skipped => {
                    return Ok(self.compression_abandoned(
                        CompressionOutcome::Skipped,
                        tokens_before,
                        revision,
                    ));
                }
                Guarded::Failed(failure) => {
                    return Ok(self.compression_abandoned(
                        CompressionOutcome::Failed(failure.to_string()),
                        tokens_before,
                        revision,
                    ));
                }
            }
        }

        let pruned_records = pruned
            .iter()
            .flat_map(|(section, entries)| {
                entries
                    .iter()
                    .flat_map(move |entry| self.pruned_records(*section, entry, now))
            })
            .collect::<Vec<_>>();
        let documents = pruned_records.iter().map(archive_document).collect::<Vec<_>>();
        match gateway.archive_upsert(ArchiveKind::Pruned.collection(), documents, now) {
            Guarded::Done(()) => {}
            Guarded::Skipped => {
                return Ok(self.compression_abandoned(
                    CompressionOutcome::Skipped,
                    tokens_before,
                    revision,
                ));
            }
            Guarded::Failed(failure) => {
                return Ok(self.compression_abandoned(
                    CompressionOutcome::Failed(failure.to_string()),
                    tokens_before,
                    revision,
                ));
            }
        }

        let mut state = self.lock();
        let base = self.base_document(&mut state)?;
        if base.revision != document.revision {
            warn!(
                event = "compression_conflict",
                planned_revision = document.revision,
                found = base.revision
            );
            return Ok(CompressionReport::unchanged(
                CompressionOutcome::Conflict,
                tokens_before,
                Some(base.revision),
            ));
        }

        let mut next = base;
        let mut pruned_entries = 0;
        for (section, entries) in &pruned {
            for entry in entries {
                if next.remove_entry(*section, &entry.key).is_some() {
                    pruned_entries += 1;
                }
            }
        }
        for (section, digest) in &digests {
            next.merge_entry(*section, DIGEST_KEY, digest, None, now);
        }
        next.revision += 1;
        next.updated_at = Some(now);
        let tokens_after = next.token_estimate();
        let revision = self.persist(&mut state, next, "compress", now)?;

        // Already in the archive; the ledger copy keeps them searchable offline.
        state.db.insert_archive_records(&pruned_records)?;
        let ids = pruned_records
            .iter()
            .map(|record| record.record_id.clone())
            .collect::<Vec<_>>();
        state.db.mark_delivered(&ids)?;

        info!(
            event = "hot_compressed",
            revision,
            tokens_before,
            tokens_after,
            pruned_entries
        );
        Ok(CompressionReport {
            outcome: CompressionOutcome::Compressed,
            tokens_before,
            tokens_after,
            pruned_entries,
            revision: Some(revision),
        })
    }

    /// One record per source session that the cold tier still holds.
    fn pruned_records(
        &self,
        section: ContextSection,
        entry: &ContextEntry,
        now: DateTime<Utc>,
    ) -> Vec<ArchiveRecord> {
        entry
            .sources
            .iter()
            .filter(|source| self.cold.contains(source))
            .map(|source| {
                let payload = ArchivePayload::Pruned {
                    section: section.as_str().to_string(),
                    label: entry.label.clone(),
                    text: entry.text.clone(),
                };
                ArchiveRecord::new(source, payload, false, now)
            })
            .collect()
    }

    fn compression_abandoned(
        &self,
        outcome: CompressionOutcome,
        tokens: u32,
        revision: Option<u64>,
    ) -> CompressionReport {
        warn!(event = "compression_abandoned", outcome = ?outcome, tokens);
        CompressionReport::unchanged(outcome, tokens, revision)
    }

    /// Applies a human edit under the same optimistic revision check as a
    /// pipeline commit. Returns the resulting revision.
    pub fn apply_manual_edit(
        &self,
        edit: &ManualEdit,
        expected_revision: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, MemoryError> {
        let mut state = self.lock();
        let base = self.base_document(&mut state)?;
        if base.revision != expected_revision {
            return Err(MemoryError::DataConflict {
                expected: expected_revision,
                found: base.revision,
            });
        }

        let mut next = base.clone();
        let changed = match edit {
            ManualEdit::Upsert {
                section,
                label,
                text,
            } => next.merge_entry(*section, label, text.trim(), Some("manual"), now),
            ManualEdit::Remove { section, key } => next
                .remove_entry(*section, key)
                .or_else(|| next.remove_entry(*section, &normalize_identity(key)))
                .is_some(),
        };
        if !changed {
            return Ok(base.revision);
        }
        next.revision = base.revision + 1;
        next.updated_at = Some(now);
        self.persist(&mut state, next, "manual_edit", now)
    }

    /// Persists `document` as the new hot state, numbered above every revision
    /// seen so far. Used by scaffolding and rebuilds.
    pub fn replace_document(
        &self,
        mut document: MasterContext,
        cause: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, MemoryError> {
        let mut state = self.lock();
        let durable = state.db.latest_revision_number()?.unwrap_or(0);
        let live = state.live.as_ref().map_or(0, |live| live.revision);
        document.revision = durable.max(live) + 1;
        document.updated_at = Some(now);
        self.persist(&mut state, document, cause, now)
    }
}

fn archive_document(record: &ArchiveRecord) -> ArchiveDocument {
    ArchiveDocument {
        id: record.record_id.clone(),
        text: record.payload.document_text(),
        metadata: serde_json::json!({
            "session_id": record.session_id,
            "kind": record.kind().as_str(),
            "hot": record.hot,
            "created_at": record.created_at.to_rfc3339(),
        }),
    }
}

fn digest_input(prior_digest: Option<&str>, entries: &[ContextEntry]) -> String {
    let mut text = String::new();
    if let Some(prior) = prior_digest {
        text.push_str(&format!("Existing digest: {prior}\n"));
    }
    for entry in entries {
        text.push_str(&format!("- {}: {}\n", entry.label, entry.text));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::degradation::{CircuitConfig, DegradationMonitor};
    use crate::dispatch::PortTimeouts;
    use chrono::{Duration, TimeZone};
    use ctx_core::memory_contracts::{Dependency, Entity, EntityKind};
    use ctx_core::ports::{
        ArchivePort, DependencyFailure, RankedDocument, ReasoningPort, ReasoningRequest,
    };
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    struct DigestReasoner;

    impl ReasoningPort for DigestReasoner {
        fn infer(&self, request: &ReasoningRequest) -> Result<Value, DependencyFailure> {
            let lines = request.text.lines().count();
            Ok(serde_json::json!({"digest": format!("{lines} older items condensed")}))
        }
    }

    #[derive(Default)]
    struct SwitchArchive {
        down: AtomicBool,
    }

    impl ArchivePort for SwitchArchive {
        fn upsert(&self, _: &str, _: &[ArchiveDocument]) -> Result<(), DependencyFailure> {
            if self.down.load(Ordering::SeqCst) {
                return Err(DependencyFailure::service("archive unavailable"));
            }
            Ok(())
        }

        fn query(&self, _: &str, _: &str, _: usize) -> Result<Vec<RankedDocument>, DependencyFailure> {
            Ok(Vec::new())
        }
    }

    fn gateway(archive: Arc<SwitchArchive>) -> PortGateway {
        PortGateway::new(
            Arc::new(DigestReasoner),
            archive,
            DegradationMonitor::new(CircuitConfig::default()),
            PortTimeouts::default(),
        )
    }

    fn store(dir: &Path) -> TieredMemoryStore {
        TieredMemoryStore::open(dir).expect("open store")
    }

    fn facts(session_id: &str) -> ExtractedFacts {
        ExtractedFacts {
            session_id: session_id.to_string(),
            observed_at: None,
            summary: "planning".to_string(),
            entities: vec![Entity {
                name: "Atlas".to_string(),
                kind: EntityKind::Project,
                detail: "search rewrite".to_string(),
            }],
            decisions: vec!["Ship behind a flag".to_string()],
            failures: vec!["Indexer crashed on empty docs".to_string()],
        }
    }

    fn ingest(store: &TieredMemoryStore, session_id: &str) {
        store
            .ingest(&Session::new(session_id, "raw session text", ts()))
            .expect("ingest");
    }

    #[test]
    fn commit_then_read_returns_facts_at_next_revision() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = store(dir.path());
        let gateway = gateway(Arc::new(SwitchArchive::default()));
        ingest(&store, "s1");

        let report = store
            .commit(&facts("s1"), &TriagePlan::default(), 0, &gateway, ts())
            .expect("commit");
        assert_eq!(report.revision, 1);
        assert_eq!(report.records_written, 4);
        assert_eq!(report.outbox.delivered, 4);

        let hot = store.read_hot().expect("hot readable");
        assert_eq!(hot.source, HotSource::Live);
        assert_eq!(hot.document.revision, 1);
        assert!(hot.document.entry(ContextSection::Projects, "atlas").is_some());
        assert!(hot
            .document
            .entry(ContextSection::Decisions, "ship behind a flag")
            .is_some());
        assert!(hot
            .document
            .entry(ContextSection::OpenIssues, "indexer crashed on empty docs")
            .is_some());

        let again = store
            .commit(&facts("s1"), &TriagePlan::default(), 1, &gateway, ts())
            .expect("replay commit");
        assert!(!again.changed);
        assert_eq!(again.revision, 1);
        assert_eq!(again.records_written, 0);
    }

    #[test]
    fn stale_revision_is_a_conflict() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = store(dir.path());
        let gateway = gateway(Arc::new(SwitchArchive::default()));
        ingest(&store, "s1");

        store
            .apply_manual_edit(
                &ManualEdit::Upsert {
                    section: ContextSection::People,
                    label: "Robin".to_string(),
                    text: "on call this week".to_string(),
                },
                0,
                ts(),
            )
            .expect("manual edit");

        let err = store
            .commit(&facts("s1"), &TriagePlan::default(), 0, &gateway, ts())
            .expect_err("stale commit");
        assert!(matches!(
            err,
            MemoryError::DataConflict {
                expected: 0,
                found: 1
            }
        ));
    }

    #[test]
    fn commit_requires_cold_record() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = store(dir.path());
        let gateway = gateway(Arc::new(SwitchArchive::default()));
        let err = store
            .commit(&facts("ghost"), &TriagePlan::default(), 0, &gateway, ts())
            .expect_err("missing cold session");
        assert!(matches!(err, MemoryError::MissingColdSession(id) if id == "ghost"));
    }

    #[test]
    fn archive_outage_does_not_block_hot_commit() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = store(dir.path());
        let archive = Arc::new(SwitchArchive::default());
        archive.down.store(true, Ordering::SeqCst);
        let gateway = gateway(Arc::clone(&archive));
        ingest(&store, "s1");

        let report = store
            .commit(&facts("s1"), &TriagePlan::default(), 0, &gateway, ts())
            .expect("commit");
        assert_eq!(report.revision, 1);
        assert_eq!(report.outbox.delivered, 0);
        assert!(report.outbox.pending > 0);

        archive.down.store(false, Ordering::SeqCst);
        let flushed = store
            .flush_outbox(&gateway, ts() + Duration::minutes(1))
            .expect("flush");
        assert_eq!(flushed.pending, 0);
        assert!(flushed.delivered > 0);
    }

    #[test]
    fn read_falls_back_through_durable_and_last_good() {
        let dir = tempfile::tempdir().expect("temp dir");
        {
            let store = store(dir.path());
            let gateway = gateway(Arc::new(SwitchArchive::default()));
            ingest(&store, "s1");
            store
                .commit(&facts("s1"), &TriagePlan::default(), 0, &gateway, ts())
                .expect("commit");
        }

        let reopened = store(dir.path());
        let hot = reopened.read_hot().expect("durable copy");
        assert_eq!(hot.source, HotSource::Durable);
        assert_eq!(hot.document.revision, 1);

        let conn = rusqlite::Connection::open(dir.path().join("memory.db")).expect("raw conn");
        conn.execute("UPDATE master_revisions SET document_json = 'not json'", [])
            .expect("corrupt durable copy");
        drop(conn);

        let degraded = store(dir.path());
        let hot = degraded.read_hot().expect("last good copy");
        assert_eq!(hot.source, HotSource::LastGood);
        assert_eq!(hot.document.revision, 1);

        std::fs::remove_file(dir.path().join("master_context.last_good.json"))
            .expect("remove last good");
        let offline = store(dir.path());
        assert!(offline.read_hot().is_none());
        assert_eq!(offline.current_revision().expect("revision"), 1);
    }

    fn bulky_store(dir: &Path, gateway: &PortGateway) -> TieredMemoryStore {
        let store = store(dir);
        for idx in 0..12 {
            let session_id = format!("s{idx}");
            ingest(&store, &session_id);
            let facts = ExtractedFacts {
                session_id: session_id.clone(),
                observed_at: None,
                summary: String::new(),
                entities: Vec::new(),
                decisions: vec![format!("decision {idx} {}", "d".repeat(120))],
                failures: vec![format!("issue {idx} {}", "x".repeat(120))],
            };
            let revision = store.current_revision().expect("revision");
            store
                .commit(
                    &facts,
                    &TriagePlan::default(),
                    revision,
                    gateway,
                    ts() + Duration::minutes(idx),
                )
                .expect("commit");
        }
        store
    }

    #[test]
    fn compression_prunes_oldest_issues_into_a_digest() {
        let dir = tempfile::tempdir().expect("temp dir");
        let gateway = gateway(Arc::new(SwitchArchive::default()));
        let store = bulky_store(dir.path(), &gateway);
        let before = store.read_hot().expect("hot").document;
        let budget = before.token_estimate() * 3 / 4;

        let report = store
            .compress(&gateway, budget, ts() + Duration::hours(1))
            .expect("compress");
        assert_eq!(report.outcome, CompressionOutcome::Compressed);
        assert!(report.tokens_after < report.tokens_before);
        assert_eq!(report.revision, Some(before.revision + 1));

        let after = store.read_hot().expect("hot").document;
        assert!(after.entry(ContextSection::OpenIssues, DIGEST_KEY).is_some());
        assert!(after
            .entries(ContextSection::OpenIssues)
            .all(|entry| !entry.text.starts_with("issue 0 ")));
        assert!(after
            .entries(ContextSection::OpenIssues)
            .any(|entry| entry.text.starts_with("issue 11 ")));

        let ledger = store.with_db(|db| db.ledger_records(500)).expect("ledger");
        let archived = ledger
            .iter()
            .filter(|record| record.kind() == ArchiveKind::Pruned)
            .count();
        assert_eq!(archived, report.pruned_entries);
        let orphans = ledger
            .iter()
            .filter(|record| !store.cold().contains(&record.session_id))
            .map(|record| record.session_id.clone())
            .collect::<Vec<_>>();
        assert!(orphans.is_empty(), "ledger rows without a cold session: {orphans:?}");
    }

    #[test]
    fn entries_without_a_cold_source_are_not_pruned() {
        let dir = tempfile::tempdir().expect("temp dir");
        let gateway = gateway(Arc::new(SwitchArchive::default()));
        let store = bulky_store(dir.path(), &gateway);
        let revision = store.current_revision().expect("revision");
        store
            .apply_manual_edit(
                &ManualEdit::Upsert {
                    section: ContextSection::OpenIssues,
                    label: "Printer jam".to_string(),
                    text: format!("printer jam {}", "p".repeat(120)),
                },
                revision,
                ts() - Duration::days(1),
            )
            .expect("manual edit");
        let before = store.read_hot().expect("hot").document;
        let budget = before.token_estimate() / 4;

        let report = store
            .compress(&gateway, budget, ts() + Duration::hours(1))
            .expect("compress");
        assert_eq!(report.outcome, CompressionOutcome::Compressed);
        let after = store.read_hot().expect("hot").document;
        assert!(after.entry(ContextSection::OpenIssues, "printer jam").is_some());
    }

    #[test]
    fn compression_with_open_circuit_leaves_document_untouched() {
        let dir = tempfile::tempdir().expect("temp dir");
        let gateway = gateway(Arc::new(SwitchArchive::default()));
        let store = bulky_store(dir.path(), &gateway);
        for _ in 0..3 {
            gateway.monitor().report(
                Dependency::Reasoning,
                crate::degradation::CallOutcome::Failure("down".to_string()),
                ts(),
            );
        }
        let before = store.read_hot().expect("hot").document;
        let budget = before.token_estimate() / 2;

        let report = store
            .compress(&gateway, budget, ts() + Duration::seconds(1))
            .expect("compress");
        assert_eq!(report.outcome, CompressionOutcome::Skipped);
        assert_eq!(report.tokens_after, report.tokens_before);

        let after = store.read_hot().expect("hot").document;
        assert_eq!(after, before);
        assert_eq!(after.token_estimate(), before.token_estimate());
    }

    #[test]
    fn budget_scales_with_projects_up_to_ceiling() {
        let budget = HotBudget::default();
        let mut doc = MasterContext::empty();
        assert_eq!(budget.budget_for(&doc), 5_000);
        for idx in 0..3 {
            doc.merge_entry(ContextSection::Projects, &format!("p{idx}"), "x", None, ts());
        }
        assert_eq!(budget.budget_for(&doc), 6_500);
        for idx in 3..20 {
            doc.merge_entry(ContextSection::Projects, &format!("p{idx}"), "x", None, ts());
        }
        assert_eq!(budget.budget_for(&doc), 8_000);
    }
}
