use crate::dispatch::Guarded;
use crate::scheduler::PipelineScheduler;
use crate::tiered_store::ManualEdit;
use crate::MemoryError;
use chrono::{DateTime, Utc};
use ctx_core::master_context::ContextSection;
use ctx_core::memory_contracts::{
    new_session_id, AlertClass, DegradationLevel, HotSource, Session, Significance,
    ARCHIVE_COLLECTIONS,
};
use ctx_core::ports::ArchiveDocument;
use ctx_storage::term_overlap_score;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

const RELATED_LIMIT: usize = 5;
const LEDGER_SCAN_LIMIT: usize = 2_000;
const CORRECTION_MIN_SCORE: f64 = 0.5;
const CORRECTABLE_COLLECTIONS: [&str; 4] = ["sessions", "entities", "decisions", "failures"];
const EDIT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub collection: String,
    pub id: String,
    pub text: String,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchSource {
    Archive,
    /// The archive was unavailable; results come from the local ledger.
    Ledger,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub source: SearchSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedContext {
    pub markdown: String,
    pub revision: u64,
    pub source: HotSource,
    pub level: DegradationLevel,
    pub related: Vec<SearchHit>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionDraft {
    pub text: String,
    pub significance: Significance,
    pub tags: Vec<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionScope {
    Hot,
    Archive,
    Both,
}

impl CorrectionScope {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hot" => Some(Self::Hot),
            "archive" => Some(Self::Archive),
            "both" => Some(Self::Both),
            _ => None,
        }
    }

    fn hot(self) -> bool {
        matches!(self, Self::Hot | Self::Both)
    }

    fn archive(self) -> bool {
        matches!(self, Self::Archive | Self::Both)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CorrectionReport {
    pub hot_entries: usize,
    pub revision: Option<u64>,
    pub archive_records: usize,
    /// Local ledger rows rewritten; they feed rebuilds and offline search.
    pub ledger_records: usize,
    pub archive_unavailable: bool,
}

/// Assistant-facing operations, mapped onto the store and the queue.
pub struct ToolSurface<'a> {
    scheduler: &'a PipelineScheduler,
}

impl<'a> ToolSurface<'a> {
    pub fn new(scheduler: &'a PipelineScheduler) -> Self {
        Self { scheduler }
    }

    /// Hot document plus, when a topic is given, related archive hits.
    pub fn load_context(
        &self,
        topic: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LoadedContext, MemoryError> {
        let snapshot = self
            .scheduler
            .store()
            .read_hot()
            .ok_or(MemoryError::NoContextAvailable)?;
        let level = self
            .scheduler
            .gateway()
            .monitor()
            .level(Some(snapshot.source));

        let related = match topic.map(str::trim).filter(|topic| !topic.is_empty()) {
            Some(topic) => {
                self.search_archive(topic, &CORRECTABLE_COLLECTIONS, RELATED_LIMIT, now)?
                    .hits
            }
            None => Vec::new(),
        };

        Ok(LoadedContext {
            markdown: snapshot.document.render_markdown(),
            revision: snapshot.document.revision,
            source: snapshot.source,
            level,
            related,
        })
    }

    /// Stores a finished session and queues it for processing. Returns the
    /// new session id.
    pub fn save_session(
        &self,
        draft: SessionDraft,
        now: DateTime<Utc>,
    ) -> Result<String, MemoryError> {
        let session = Session {
            id: new_session_id(),
            raw_text: draft.text,
            created_at: now,
            significance: draft.significance,
            tags: draft.tags,
            source: draft.source,
        };
        self.scheduler.enqueue(&session, now)?;
        Ok(session.id)
    }

    /// Mid-session save. Each checkpoint is its own cold record, linked to
    /// the running session through its tags.
    pub fn checkpoint(
        &self,
        session_id: &str,
        note: &str,
        significance: Significance,
        now: DateTime<Utc>,
    ) -> Result<String, MemoryError> {
        let checkpoint_id = format!("{}-checkpoint-{}", session_id.trim(), now.timestamp_millis());
        let session = Session {
            id: checkpoint_id.clone(),
            raw_text: note.to_string(),
            created_at: now,
            significance,
            tags: vec!["checkpoint".to_string(), format!("session:{}", session_id.trim())],
            source: Some("checkpoint".to_string()),
        };
        self.scheduler.enqueue(&session, now)?;
        info!(event = "checkpoint_saved", session_id = %session_id, checkpoint_id = %checkpoint_id);
        Ok(checkpoint_id)
    }

    /// Searches the archive; when the archive circuit refuses or the call
    /// fails, scores the local ledger instead.
    pub fn search_archive(
        &self,
        query: &str,
        collections: &[&str],
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<SearchResults, MemoryError> {
        let collections = if collections.is_empty() {
            ARCHIVE_COLLECTIONS.to_vec()
        } else {
            collections.to_vec()
        };
        let limit = limit.max(1);

        let mut hits = Vec::new();
        for collection in &collections {
            match self
                .scheduler
                .gateway()
                .archive_query(collection, query, limit, now)
            {
                Guarded::Done(documents) => {
                    hits.extend(documents.into_iter().map(|document| SearchHit {
                        collection: collection.to_string(),
                        id: document.id,
                        text: document.text,
                        score: document.score,
                    }));
                }
                Guarded::Skipped | Guarded::Failed(_) => {
                    warn!(event = "archive_search_fallback", collection = %collection);
                    return self.search_ledger(query, &collections, limit);
                }
            }
        }
        rank(&mut hits, limit);
        Ok(SearchResults {
            hits,
            source: SearchSource::Archive,
        })
    }

    fn search_ledger(
        &self,
        query: &str,
        collections: &[&str],
        limit: usize,
    ) -> Result<SearchResults, MemoryError> {
        let wanted = collections.iter().copied().collect::<BTreeSet<_>>();
        let records = self
            .scheduler
            .store()
            .with_db(|db| db.ledger_records(LEDGER_SCAN_LIMIT))?;
        let mut hits = records
            .into_iter()
            .filter(|record| wanted.contains(record.kind().collection()))
            .filter_map(|record| {
                let collection = record.kind().collection();
                let text = record.payload.document_text();
                let score = term_overlap_score(query, &text);
                (score > 0.0).then(|| SearchHit {
                    collection: collection.to_string(),
                    id: record.record_id,
                    text,
                    score,
                })
            })
            .collect::<Vec<_>>();
        rank(&mut hits, limit);
        Ok(SearchResults {
            hits,
            source: SearchSource::Ledger,
        })
    }

    /// Dismisses active alerts whose subject contains `needle`. The hot
    /// nudges section catches up on the next commit.
    pub fn dismiss(
        &self,
        class: AlertClass,
        needle: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, MemoryError> {
        let dismissed = self
            .scheduler
            .store()
            .with_db(|db| db.dismiss_alerts(class, needle, now))?;
        info!(event = "alerts_dismissed", class = class.as_str(), dismissed);
        Ok(dismissed)
    }

    /// Replaces `item` with `correction` in matching hot entries and close
    /// archive matches. Fails only when nothing matched anywhere.
    pub fn correct_fact(
        &self,
        item: &str,
        correction: &str,
        scope: CorrectionScope,
        now: DateTime<Utc>,
    ) -> Result<CorrectionReport, MemoryError> {
        let item = item.trim();
        let correction = correction.trim();
        if item.is_empty() || correction.is_empty() {
            return Err(MemoryError::NoMatchingEntry(item.to_string()));
        }

        let mut report = CorrectionReport::default();
        if scope.hot() {
            let (entries, revision) = self.correct_hot(item, correction, now)?;
            report.hot_entries = entries;
            report.revision = revision;
        }
        if scope.archive() {
            match self.correct_archive(item, correction, now) {
                Some(count) => report.archive_records = count,
                None => report.archive_unavailable = true,
            }
        }
        report.ledger_records = self.correct_ledger(item, correction, scope)?;

        if report.hot_entries == 0
            && report.archive_records == 0
            && report.ledger_records == 0
            && !report.archive_unavailable
        {
            return Err(MemoryError::NoMatchingEntry(item.to_string()));
        }
        info!(
            event = "fact_corrected",
            hot_entries = report.hot_entries,
            archive_records = report.archive_records,
            ledger_records = report.ledger_records,
            archive_unavailable = report.archive_unavailable
        );
        Ok(report)
    }

    fn correct_hot(
        &self,
        item: &str,
        correction: &str,
        now: DateTime<Utc>,
    ) -> Result<(usize, Option<u64>), MemoryError> {
        let store = self.scheduler.store();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(snapshot) = store.read_hot() else {
                return Ok((0, None));
            };
            let document = snapshot.document;
            let edits = ContextSection::ALL
                .into_iter()
                .filter(|section| *section != ContextSection::Nudges)
                .flat_map(|section| {
                    document
                        .entries(section)
                        .filter_map(|entry| {
                            replace_ignoring_case(&entry.text, item, correction).map(|text| {
                                ManualEdit::Upsert {
                                    section,
                                    label: entry.label.clone(),
                                    text,
                                }
                            })
                        })
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>();
            if edits.is_empty() {
                return Ok((0, None));
            }

            let mut revision = document.revision;
            let mut applied = 0;
            let mut conflicted = false;
            for edit in &edits {
                match store.apply_manual_edit(edit, revision, now) {
                    Ok(next) => {
                        if next != revision {
                            applied += 1;
                        }
                        revision = next;
                    }
                    Err(MemoryError::DataConflict { .. }) if attempt < EDIT_ATTEMPTS => {
                        conflicted = true;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
            if !conflicted {
                return Ok((applied, Some(revision)));
            }
        }
    }

    /// Hot scope touches only hot-eligible rows, the ones a rebuild reads.
    /// Rewritten rows go back through the outbox.
    fn correct_ledger(
        &self,
        item: &str,
        correction: &str,
        scope: CorrectionScope,
    ) -> Result<usize, MemoryError> {
        let rewritten = self.scheduler.store().with_db(|db| {
            db.rewrite_ledger_payloads(|payload, hot| {
                if !scope.archive() && !hot {
                    return None;
                }
                payload.rewrite_text(|text| replace_ignoring_case(text, item, correction))
            })
        })?;
        if rewritten > 0 {
            info!(event = "ledger_corrected", rewritten);
        }
        Ok(rewritten)
    }

    /// `None` when the archive could not be reached.
    fn correct_archive(&self, item: &str, correction: &str, now: DateTime<Utc>) -> Option<usize> {
        let gateway = self.scheduler.gateway();
        let mut corrected = 0;
        for collection in CORRECTABLE_COLLECTIONS {
            let hits = gateway
                .archive_query(collection, item, RELATED_LIMIT, now)
                .ok()?;
            let documents = hits
                .into_iter()
                .filter(|hit| hit.score >= CORRECTION_MIN_SCORE)
                .map(|hit| {
                    let text = replace_ignoring_case(&hit.text, item, correction)
                        .unwrap_or_else(|| format!("{}\n[CORRECTION: {correction}]", hit.text));
                    let mut metadata = match hit.metadata {
                        serde_json::Value::Object(map) => map,
                        _ => serde_json::Map::new(),
                    };
                    metadata.insert("corrected".to_string(), true.into());
                    metadata.insert("corrected_at".to_string(), now.to_rfc3339().into());
                    ArchiveDocument {
                        id: hit.id,
                        text,
                        metadata: serde_json::Value::Object(metadata),
                    }
                })
                .collect::<Vec<_>>();
            if documents.is_empty() {
                continue;
            }
            let count = documents.len();
            gateway.archive_upsert(collection, documents, now).ok()?;
            corrected += count;
        }
        Some(corrected)
    }
}

fn rank(hits: &mut Vec<SearchHit>, limit: usize) {
    hits.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.id.cmp(&right.id))
    });
    hits.truncate(limit);
}

/// Case-insensitive (ASCII) replacement of every occurrence; `None` when the
/// needle does not occur.
fn replace_ignoring_case(haystack: &str, needle: &str, replacement: &str) -> Option<String> {
    let lower_haystack = haystack.to_ascii_lowercase();
    let lower_needle = needle.to_ascii_lowercase();
    if lower_needle.is_empty() || !lower_haystack.contains(&lower_needle) {
        return None;
    }
    let mut out = String::with_capacity(haystack.len());
    let mut cursor = 0;
    while let Some(offset) = lower_haystack[cursor..].find(&lower_needle) {
        let start = cursor + offset;
        out.push_str(&haystack[cursor..start]);
        out.push_str(replacement);
        cursor = start + lower_needle.len();
    }
    out.push_str(&haystack[cursor..]);
    Some(out)
}
