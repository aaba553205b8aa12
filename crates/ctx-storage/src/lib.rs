use chrono::{DateTime, SecondsFormat, Utc};
use ctx_core::master_context::MasterContext;
use ctx_core::memory_contracts::{
    canonical_payload_hash, normalize_identity, Alert, AlertClass, ArchivePayload, ArchiveRecord,
    ProcessingState,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

pub mod cold_log;
pub mod last_good;
pub mod local_archive;

pub use cold_log::ColdSessionLog;
pub use last_good::{DataDirLock, LastGoodCache};
pub use local_archive::LocalArchiveIndex;

pub const MEMORY_SCHEMA_VERSION: i64 = 1;

const META_COMPLETED_ORDINAL: &str = "completed_ordinal";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("file lock busy: {0}")]
    LockBusy(String),
    #[error("invalid stored value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Durable per-session processing record. The raw session itself lives in
/// the cold log and is never touched by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub session_id: String,
    pub seq: i64,
    pub state: ProcessingState,
    pub transient_failures: u32,
    pub backoff_level: u32,
    pub next_eligible_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub session_created_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueCounts {
    pub queued: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed_terminal: u64,
}

impl QueueCounts {
    pub fn pending(&self) -> u64 {
        self.queued + self.in_progress
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LedgerCounts {
    pub total: u64,
    pub undelivered: u64,
    pub hot: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerDecodeError {
    pub record_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionMeta {
    pub revision: u64,
    pub content_hash: String,
    pub cause: String,
    pub committed_at: DateTime<Utc>,
}

pub struct MemoryDb {
    conn: Connection,
}

impl MemoryDb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > MEMORY_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: MEMORY_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_memory_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    /// Inserts a fresh queue row at the back of the queue. Returns false when
    /// the session already has a row in any state.
    pub fn enqueue_session(
        &self,
        session_id: &str,
        session_created_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let now_text = format_timestamp(now);
        let changes = self.conn.execute(
            "
            INSERT OR IGNORE INTO session_queue (
                session_id,
                seq,
                state,
                transient_failures,
                backoff_level,
                next_eligible_at,
                last_error,
                session_created_at,
                enqueued_at,
                updated_at
            ) VALUES (
                ?1,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM session_queue),
                'queued', 0, 0, ?2, NULL, ?3, ?2, ?2
            )
            ",
            params![session_id, now_text, format_timestamp(session_created_at)],
        )?;
        Ok(changes > 0)
    }

    /// Puts a finished session back at the back of the queue with clean
    /// counters. Pending sessions are left alone.
    pub fn requeue_session(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let now_text = format_timestamp(now);
        let changes = self.conn.execute(
            "
            UPDATE session_queue
            SET seq = (SELECT COALESCE(MAX(seq), 0) + 1 FROM session_queue),
                state = 'queued',
                transient_failures = 0,
                backoff_level = 0,
                next_eligible_at = ?2,
                last_error = NULL,
                enqueued_at = ?2,
                updated_at = ?2
            WHERE session_id = ?1
              AND state IN ('completed', 'failed_terminal')
            ",
            params![session_id, now_text],
        )?;
        Ok(changes > 0)
    }

    /// Sessions left in progress by an interrupted process are retried.
    pub fn recover_in_progress(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE session_queue
            SET state = 'queued', updated_at = ?1
            WHERE state = 'in_progress'
            ",
            [format_timestamp(now)],
        )?;
        Ok(changes)
    }

    pub fn queue_entry(&self, session_id: &str) -> Result<Option<QueueEntry>, StorageError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {QUEUE_COLUMNS} FROM session_queue WHERE session_id = ?1"),
                [session_id],
                queue_entry_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Oldest queued session whose backoff has elapsed.
    pub fn next_eligible(&self, now: DateTime<Utc>) -> Result<Option<QueueEntry>, StorageError> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "
                    SELECT {QUEUE_COLUMNS}
                    FROM session_queue
                    WHERE state = 'queued' AND next_eligible_at <= ?1
                    ORDER BY seq ASC
                    LIMIT 1
                    "
                ),
                [format_timestamp(now)],
                queue_entry_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn queue_entries(&self) -> Result<Vec<QueueEntry>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "SELECT {QUEUE_COLUMNS} FROM session_queue ORDER BY seq ASC"
        ))?;
        let rows = statement.query_map([], queue_entry_from_row)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn mark_in_progress(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE session_queue
            SET state = 'in_progress', updated_at = ?2
            WHERE session_id = ?1 AND state = 'queued'
            ",
            params![session_id, format_timestamp(now)],
        )?;
        Ok(changes > 0)
    }

    /// Marks the mandatory path done and returns the new completion ordinal.
    pub fn mark_completed(&self, session_id: &str, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let now_text = format_timestamp(now);
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "
            UPDATE session_queue
            SET state = 'completed', last_error = NULL, updated_at = ?2
            WHERE session_id = ?1
            ",
            params![session_id, now_text],
        )?;
        let current: Option<String> = tx
            .query_row(
                "SELECT value FROM pipeline_meta WHERE key = ?1",
                [META_COMPLETED_ORDINAL],
                |row| row.get(0),
            )
            .optional()?;
        let ordinal = parse_ordinal(current)? + 1;
        tx.execute(
            "
            INSERT INTO pipeline_meta (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            ",
            params![META_COMPLETED_ORDINAL, ordinal.to_string(), now_text],
        )?;
        tx.commit()?;
        Ok(ordinal)
    }

    pub fn completed_ordinal(&self) -> Result<u64, StorageError> {
        let current: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM pipeline_meta WHERE key = ?1",
                [META_COMPLETED_ORDINAL],
                |row| row.get(0),
            )
            .optional()?;
        parse_ordinal(current)
    }

    /// Counts one transient failure and moves the session to the back of the
    /// queue, eligible again at `retry_at`.
    pub fn schedule_retry(
        &self,
        session_id: &str,
        error: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            UPDATE session_queue
            SET seq = (SELECT COALESCE(MAX(seq), 0) + 1 FROM session_queue),
                state = 'queued',
                transient_failures = transient_failures + 1,
                backoff_level = backoff_level + 1,
                next_eligible_at = ?3,
                last_error = ?2,
                updated_at = ?4
            WHERE session_id = ?1
            ",
            params![
                session_id,
                error,
                format_timestamp(retry_at),
                format_timestamp(now)
            ],
        )?;
        Ok(())
    }

    /// Moves the session to the back of the queue without counting a
    /// failure; used when a dependency circuit refused the call.
    pub fn schedule_deferral(
        &self,
        session_id: &str,
        reason: &str,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            UPDATE session_queue
            SET seq = (SELECT COALESCE(MAX(seq), 0) + 1 FROM session_queue),
                state = 'queued',
                backoff_level = backoff_level + 1,
                next_eligible_at = ?3,
                last_error = ?2,
                updated_at = ?4
            WHERE session_id = ?1
            ",
            params![
                session_id,
                reason,
                format_timestamp(retry_at),
                format_timestamp(now)
            ],
        )?;
        Ok(())
    }

    /// Completes a session that was deliberately not processed. The
    /// completion ordinal is not advanced.
    pub fn mark_skipped(
        &self,
        session_id: &str,
        note: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            UPDATE session_queue
            SET state = 'completed', last_error = ?2, updated_at = ?3
            WHERE session_id = ?1
            ",
            params![session_id, note, format_timestamp(now)],
        )?;
        Ok(())
    }

    pub fn mark_failed_terminal(
        &self,
        session_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            UPDATE session_queue
            SET state = 'failed_terminal',
                transient_failures = transient_failures + 1,
                last_error = ?2,
                updated_at = ?3
            WHERE session_id = ?1
            ",
            params![session_id, error, format_timestamp(now)],
        )?;
        Ok(())
    }

    pub fn queue_counts(&self) -> Result<QueueCounts, StorageError> {
        let mut statement = self
            .conn
            .prepare("SELECT state, COUNT(*) FROM session_queue GROUP BY state")?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let (state, count) = row?;
            let count = count.max(0) as u64;
            match ProcessingState::parse(&state) {
                Some(ProcessingState::Queued) => counts.queued = count,
                Some(ProcessingState::InProgress) => counts.in_progress = count,
                Some(ProcessingState::Completed) => counts.completed = count,
                Some(ProcessingState::FailedTerminal) => counts.failed_terminal = count,
                None => {
                    return Err(StorageError::InvalidValue {
                        field: "session_queue.state",
                        value: state,
                    })
                }
            }
        }
        Ok(counts)
    }

    /// Persists a hot document revision. Returns false when that revision
    /// number is already taken.
    pub fn insert_revision(
        &self,
        document: &MasterContext,
        cause: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let document_json = serde_json::to_string(document)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let content_hash = canonical_payload_hash(&document.sections)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let changes = self.conn.execute(
            "
            INSERT OR IGNORE INTO master_revisions (
                revision,
                document_json,
                content_hash,
                cause,
                committed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                document.revision as i64,
                document_json,
                content_hash,
                cause,
                format_timestamp(now)
            ],
        )?;
        Ok(changes > 0)
    }

    /// Highest persisted revision number, readable even when the stored
    /// document itself no longer decodes.
    pub fn latest_revision_number(&self) -> Result<Option<u64>, StorageError> {
        let revision: Option<i64> =
            self.conn
                .query_row("SELECT MAX(revision) FROM master_revisions", [], |row| {
                    row.get(0)
                })?;
        Ok(revision.map(|revision| revision.max(0) as u64))
    }

    pub fn latest_revision(&self) -> Result<Option<MasterContext>, StorageError> {
        let document_json: Option<String> = self
            .conn
            .query_row(
                "SELECT document_json FROM master_revisions ORDER BY revision DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        document_json
            .map(|json| {
                serde_json::from_str(&json)
                    .map_err(|err| StorageError::Serialization(err.to_string()))
            })
            .transpose()
    }

    pub fn revision_history(&self, limit: usize) -> Result<Vec<RevisionMeta>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT revision, content_hash, cause, committed_at
            FROM master_revisions
            ORDER BY revision DESC
            LIMIT ?1
            ",
        )?;
        let rows = statement.query_map([limit as i64], |row| {
            Ok(RevisionMeta {
                revision: row.get::<_, i64>(0)? as u64,
                content_hash: row.get(1)?,
                cause: row.get(2)?,
                committed_at: timestamp_column(row, 3)?,
            })
        })?;

        let mut history = Vec::new();
        for row in rows {
            history.push(row?);
        }
        Ok(history)
    }

    /// Drops all but the newest `keep` revisions.
    pub fn prune_revisions(&self, keep: usize) -> Result<usize, StorageError> {
        let changes = self.conn.execute(
            "
            DELETE FROM master_revisions
            WHERE revision NOT IN (
                SELECT revision FROM master_revisions ORDER BY revision DESC LIMIT ?1
            )
            ",
            [keep.max(1) as i64],
        )?;
        Ok(changes)
    }

    /// Appends records to the archive outbox. Already-known record ids are
    /// skipped. Returns how many rows were new.
    pub fn insert_archive_records(&self, records: &[ArchiveRecord]) -> Result<usize, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;
        {
            let mut statement = tx.prepare(
                "
                INSERT OR IGNORE INTO archive_ledger (
                    record_id,
                    session_id,
                    kind,
                    collection,
                    payload_json,
                    hot,
                    delivered,
                    delivery_attempts,
                    last_error,
                    created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, NULL, ?7)
                ",
            )?;
            for record in records {
                let payload_json = serde_json::to_string(&record.payload)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?;
                inserted += statement.execute(params![
                    record.record_id,
                    record.session_id,
                    record.kind().as_str(),
                    record.kind().collection(),
                    payload_json,
                    record.hot as i64,
                    format_timestamp(record.created_at)
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn undelivered_records(&self, limit: usize) -> Result<Vec<ArchiveRecord>, StorageError> {
        self.ledger_query(
            "WHERE delivered = 0 ORDER BY rowid ASC LIMIT ?1",
            params![limit as i64],
        )
    }

    /// Hot-eligible records in commit order; the input for rebuilding the
    /// hot document. Rows that no longer decode are returned as errors so a
    /// rebuild can skip them and carry on.
    pub fn hot_ledger_records(
        &self,
    ) -> Result<Vec<Result<ArchiveRecord, LedgerDecodeError>>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT record_id, session_id, payload_json, created_at
            FROM archive_ledger
            WHERE hot = 1
            ORDER BY created_at ASC, rowid ASC
            ",
        )?;
        let rows = statement.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (record_id, session_id, payload_json, created_at) = row?;
            let decoded = serde_json::from_str::<ArchivePayload>(&payload_json)
                .map_err(|err| err.to_string())
                .and_then(|payload| {
                    parse_timestamp(created_at)
                        .map(|created_at| (payload, created_at))
                        .map_err(|err| err.to_string())
                });
            records.push(match decoded {
                Ok((payload, created_at)) => Ok(ArchiveRecord {
                    record_id,
                    session_id,
                    payload,
                    hot: true,
                    created_at,
                }),
                Err(message) => Err(LedgerDecodeError { record_id, message }),
            });
        }
        Ok(records)
    }

    pub fn ledger_records(&self, limit: usize) -> Result<Vec<ArchiveRecord>, StorageError> {
        self.ledger_query("ORDER BY rowid DESC LIMIT ?1", params![limit as i64])
    }

    fn ledger_query<P: rusqlite::Params>(
        &self,
        clause: &str,
        params: P,
    ) -> Result<Vec<ArchiveRecord>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "
            SELECT record_id, session_id, payload_json, hot, created_at
            FROM archive_ledger
            {clause}
            "
        ))?;
        let rows = statement.query_map(params, |row| {
            let payload_json: String = row.get(2)?;
            let payload: ArchivePayload = serde_json::from_str(&payload_json).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    2,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?;
            Ok(ArchiveRecord {
                record_id: row.get(0)?,
                session_id: row.get(1)?,
                payload,
                hot: row.get::<_, i64>(3)? != 0,
                created_at: timestamp_column(row, 4)?,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Rewrites ledger payloads in place. `rewrite` sees each decodable
    /// payload with its hot flag and returns the replacement for rows it
    /// changes; those rows are queued for delivery again. Returns how many
    /// rows changed.
    pub fn rewrite_ledger_payloads(
        &self,
        mut rewrite: impl FnMut(&ArchivePayload, bool) -> Option<ArchivePayload>,
    ) -> Result<usize, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let rows = {
            let mut statement = tx.prepare(
                "SELECT record_id, payload_json, hot FROM archive_ledger ORDER BY rowid ASC",
            )?;
            let mapped = statement.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)? != 0,
                ))
            })?;
            let mut rows = Vec::new();
            for row in mapped {
                rows.push(row?);
            }
            rows
        };

        let mut rewritten = 0;
        {
            let mut update = tx.prepare(
                "
                UPDATE archive_ledger
                SET payload_json = ?2,
                    delivered = 0,
                    last_error = NULL
                WHERE record_id = ?1
                ",
            )?;
            for (record_id, payload_json, hot) in rows {
                let Ok(payload) = serde_json::from_str::<ArchivePayload>(&payload_json) else {
                    continue;
                };
                let Some(replacement) = rewrite(&payload, hot) else {
                    continue;
                };
                let replacement_json = serde_json::to_string(&replacement)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?;
                rewritten += update.execute(params![record_id, replacement_json])?;
            }
        }
        tx.commit()?;
        Ok(rewritten)
    }

    pub fn mark_delivered(&self, record_ids: &[String]) -> Result<usize, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let mut updated = 0;
        {
            let mut statement = tx.prepare(
                "
                UPDATE archive_ledger
                SET delivered = 1,
                    delivery_attempts = delivery_attempts + 1,
                    last_error = NULL
                WHERE record_id = ?1
                ",
            )?;
            for record_id in record_ids {
                updated += statement.execute([record_id])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    pub fn record_delivery_failure(
        &self,
        record_ids: &[String],
        error: &str,
    ) -> Result<(), StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut statement = tx.prepare(
                "
                UPDATE archive_ledger
                SET delivery_attempts = delivery_attempts + 1,
                    last_error = ?2
                WHERE record_id = ?1
                ",
            )?;
            for record_id in record_ids {
                statement.execute(params![record_id, error])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn ledger_counts(&self) -> Result<LedgerCounts, StorageError> {
        let counts = self.conn.query_row(
            "
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN delivered = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN hot = 1 THEN 1 ELSE 0 END), 0)
            FROM archive_ledger
            ",
            [],
            |row| {
                Ok(LedgerCounts {
                    total: row.get::<_, i64>(0)?.max(0) as u64,
                    undelivered: row.get::<_, i64>(1)?.max(0) as u64,
                    hot: row.get::<_, i64>(2)?.max(0) as u64,
                })
            },
        )?;
        Ok(counts)
    }

    /// Inserts or refreshes an alert. Dismissed alerts stay dismissed.
    pub fn upsert_alert(&self, alert: &Alert) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO alerts (
                alert_id,
                class,
                kind,
                subject,
                confidence_bps,
                session_id,
                created_at,
                expires_at,
                dismissed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(alert_id) DO UPDATE SET
                subject = excluded.subject,
                confidence_bps = MAX(alerts.confidence_bps, excluded.confidence_bps),
                expires_at = MAX(alerts.expires_at, excluded.expires_at)
            WHERE alerts.dismissed_at IS NULL
            ",
            params![
                alert.alert_id,
                alert.class.as_str(),
                alert.kind,
                alert.subject,
                alert.confidence_bps as i64,
                alert.session_id,
                format_timestamp(alert.created_at),
                format_timestamp(alert.expires_at),
                alert.dismissed_at.map(format_timestamp)
            ],
        )?;
        Ok(())
    }

    pub fn active_alerts(
        &self,
        class: AlertClass,
        now: DateTime<Utc>,
    ) -> Result<Vec<Alert>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT alert_id, class, kind, subject, confidence_bps, session_id,
                   created_at, expires_at, dismissed_at
            FROM alerts
            WHERE class = ?1 AND dismissed_at IS NULL AND expires_at > ?2
            ORDER BY created_at ASC, alert_id ASC
            ",
        )?;
        let rows = statement.query_map(
            params![class.as_str(), format_timestamp(now)],
            alert_from_row,
        )?;

        let mut alerts = Vec::new();
        for row in rows {
            alerts.push(row?);
        }
        Ok(alerts)
    }

    /// Dismisses active alerts of a class whose subject contains `needle`
    /// (case-insensitive).
    pub fn dismiss_alerts(
        &self,
        class: AlertClass,
        needle: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let wanted = normalize_identity(needle);
        if wanted.is_empty() {
            return Ok(0);
        }
        let matching = self
            .active_alerts(class, now)?
            .into_iter()
            .filter(|alert| normalize_identity(&alert.subject).contains(&wanted))
            .map(|alert| alert.alert_id)
            .collect::<BTreeSet<_>>();

        let mut dismissed = 0;
        for alert_id in matching {
            dismissed += self.conn.execute(
                "UPDATE alerts SET dismissed_at = ?2 WHERE alert_id = ?1",
                params![alert_id, format_timestamp(now)],
            )?;
        }
        Ok(dismissed)
    }

    /// Removes expired alerts and dismissed alerts past their expiry.
    pub fn purge_expired_alerts(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let changes = self
            .conn
            .execute("DELETE FROM alerts WHERE expires_at <= ?1", [format_timestamp(now)])?;
        Ok(changes)
    }

    pub fn delete_alert(&self, alert_id: &str) -> Result<bool, StorageError> {
        let changes = self
            .conn
            .execute("DELETE FROM alerts WHERE alert_id = ?1", [alert_id])?;
        Ok(changes > 0)
    }

    pub(crate) fn upsert_local_document(
        &self,
        collection: &str,
        doc_id: &str,
        text: &str,
        metadata_json: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO local_archive (collection, doc_id, text, metadata_json, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(collection, doc_id) DO UPDATE SET
                text = excluded.text,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at
            ",
            params![collection, doc_id, text, metadata_json, format_timestamp(now)],
        )?;
        Ok(())
    }

    pub(crate) fn local_documents(
        &self,
        collection: &str,
    ) -> Result<Vec<(String, String, String)>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT doc_id, text, metadata_json
            FROM local_archive
            WHERE collection = ?1
            ORDER BY doc_id ASC
            ",
        )?;
        let rows = statement.query_map([collection], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;

        let mut documents = Vec::new();
        for row in rows {
            documents.push(row?);
        }
        Ok(documents)
    }
}

const QUEUE_COLUMNS: &str = "
    session_id, seq, state, transient_failures, backoff_level, next_eligible_at,
    last_error, session_created_at, enqueued_at, updated_at
";

fn queue_entry_from_row(row: &Row<'_>) -> rusqlite::Result<QueueEntry> {
    let state: String = row.get(2)?;
    let state = ProcessingState::parse(&state).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(StorageError::InvalidValue {
                field: "session_queue.state",
                value: state.clone(),
            }),
        )
    })?;

    Ok(QueueEntry {
        session_id: row.get(0)?,
        seq: row.get(1)?,
        state,
        transient_failures: row.get::<_, i64>(3)?.max(0) as u32,
        backoff_level: row.get::<_, i64>(4)?.max(0) as u32,
        next_eligible_at: timestamp_column(row, 5)?,
        last_error: row.get(6)?,
        session_created_at: timestamp_column(row, 7)?,
        enqueued_at: timestamp_column(row, 8)?,
        updated_at: timestamp_column(row, 9)?,
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let class: String = row.get(1)?;
    let class = AlertClass::parse(&class).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            Box::new(StorageError::InvalidValue {
                field: "alerts.class",
                value: class.clone(),
            }),
        )
    })?;
    let dismissed_at = row
        .get::<_, Option<String>>(8)?
        .map(|value| {
            parse_timestamp(value).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    8,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })
        })
        .transpose()?;

    Ok(Alert {
        alert_id: row.get(0)?,
        class,
        kind: row.get(2)?,
        subject: row.get(3)?,
        confidence_bps: row.get::<_, i64>(4)?.clamp(0, u16::MAX as i64) as u16,
        session_id: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
        expires_at: timestamp_column(row, 7)?,
        dismissed_at,
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(row.get::<_, String>(idx)?).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
    })
}

fn parse_ordinal(value: Option<String>) -> Result<u64, StorageError> {
    match value {
        None => Ok(0),
        Some(value) => value.parse::<u64>().map_err(|_| StorageError::InvalidValue {
            field: "pipeline_meta.completed_ordinal",
            value,
        }),
    }
}

/// Fixed-width UTC timestamps so text comparison in SQL matches time order.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

/// Share of query terms present in the candidate text.
pub fn term_overlap_score(query: &str, text: &str) -> f64 {
    let query_terms = normalize_identity(query)
        .split(' ')
        .filter(|term| !term.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>();
    if query_terms.is_empty() {
        return 0.0;
    }
    let text_terms = normalize_identity(text)
        .split(' ')
        .map(str::to_string)
        .collect::<BTreeSet<_>>();
    let matched = query_terms
        .iter()
        .filter(|term| text_terms.contains(*term))
        .count();
    matched as f64 / query_terms.len() as f64
}
