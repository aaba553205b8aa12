use crate::{term_overlap_score, MemoryDb, StorageError};
use chrono::Utc;
use ctx_core::ports::{ArchiveDocument, ArchivePort, DependencyFailure, RankedDocument};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

/// SQLite-backed archive with term-overlap ranking. Stands in for a vector
/// store when none is configured.
pub struct LocalArchiveIndex {
    db: Mutex<MemoryDb>,
}

impl LocalArchiveIndex {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            db: Mutex::new(MemoryDb::open(path)?),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Ok(Self {
            db: Mutex::new(MemoryDb::open_in_memory()?),
        })
    }

    fn with_db<T>(
        &self,
        f: impl FnOnce(&MemoryDb) -> Result<T, StorageError>,
    ) -> Result<T, DependencyFailure> {
        let db = self
            .db
            .lock()
            .map_err(|_| DependencyFailure::service("local archive lock poisoned"))?;
        f(&db).map_err(|err| DependencyFailure::service(err.to_string()))
    }
}

impl ArchivePort for LocalArchiveIndex {
    fn upsert(
        &self,
        collection: &str,
        documents: &[ArchiveDocument],
    ) -> Result<(), DependencyFailure> {
        let now = Utc::now();
        self.with_db(|db| {
            for document in documents {
                let metadata_json = serde_json::to_string(&document.metadata)
                    .map_err(|err| StorageError::Serialization(err.to_string()))?;
                db.upsert_local_document(
                    collection,
                    &document.id,
                    &document.text,
                    &metadata_json,
                    now,
                )?;
            }
            Ok(())
        })
    }

    fn query(
        &self,
        collection: &str,
        text: &str,
        limit: usize,
    ) -> Result<Vec<RankedDocument>, DependencyFailure> {
        let documents = self.with_db(|db| db.local_documents(collection))?;
        let mut ranked = documents
            .into_iter()
            .filter_map(|(id, body, metadata_json)| {
                let score = term_overlap_score(text, &body);
                if score <= 0.0 {
                    return None;
                }
                let metadata = serde_json::from_str(&metadata_json).unwrap_or(Value::Null);
                Some(RankedDocument {
                    id,
                    text: body,
                    score,
                    metadata,
                })
            })
            .collect::<Vec<_>>();
        ranked.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.id.cmp(&right.id))
        });
        ranked.truncate(limit);
        Ok(ranked)
    }
}
