use crate::StorageError;
use ctx_core::memory_contracts::Session;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Append-only cold tier: one JSON file per session, created exclusively and
/// never rewritten.
#[derive(Debug, Clone)]
pub struct ColdSessionLog {
    root: PathBuf,
}

impl ColdSessionLog {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.json"))
    }

    /// Writes the session once. Returns false if a record with this id is
    /// already present; the existing record is left untouched.
    pub fn append(&self, session: &Session) -> Result<bool, StorageError> {
        session
            .validate()
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let body = serde_json::to_vec_pretty(session)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path_for(&session.id))
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        file.write_all(&body)?;
        file.sync_all()?;
        Ok(true)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.path_for(session_id).is_file()
    }

    pub fn read(&self, session_id: &str) -> Result<Option<Session>, StorageError> {
        let body = match fs::read(self.path_for(session_id)) {
            Ok(body) => body,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|err| StorageError::Serialization(err.to_string()))
    }

    /// Ids of every stored record, sorted, without reading the records.
    pub fn session_ids(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn append_is_write_once() {
        let dir = tempfile::tempdir().expect("temp dir");
        let log = ColdSessionLog::open(dir.path().join("cold")).expect("open log");

        let original = Session::new("s1", "first text", ts());
        assert!(log.append(&original).expect("append"));

        let rewrite = Session::new("s1", "rewritten text", ts());
        assert!(!log.append(&rewrite).expect("second append"));

        let stored = log.read("s1").expect("read").expect("present");
        assert_eq!(stored.raw_text, "first text");
        assert!(log.read("missing").expect("read missing").is_none());
    }

    #[test]
    fn session_ids_are_sorted_and_readable() {
        let dir = tempfile::tempdir().expect("temp dir");
        let log = ColdSessionLog::open(dir.path()).expect("open log");
        log.append(&Session::new("late", "b", ts() + Duration::hours(1)))
            .expect("append late");
        log.append(&Session::new("early", "a", ts()))
            .expect("append early");

        let ids = log.session_ids().expect("ids");
        assert_eq!(ids, vec!["early".to_string(), "late".to_string()]);
        let late = log.read("late").expect("read").expect("present");
        assert_eq!(late.created_at, ts() + Duration::hours(1));
        assert!(log.contains("early"));
    }

    #[test]
    fn append_rejects_invalid_sessions() {
        let dir = tempfile::tempdir().expect("temp dir");
        let log = ColdSessionLog::open(dir.path()).expect("open log");
        assert!(log.append(&Session::new("../x", "text", ts())).is_err());
    }

    #[test]
    fn session_ids_survive_unreadable_records() {
        let dir = tempfile::tempdir().expect("temp dir");
        let log = ColdSessionLog::open(dir.path()).expect("open log");
        log.append(&Session::new("good", "text", ts()))
            .expect("append good");
        fs::write(dir.path().join("broken.json"), b"{not json").expect("write broken");
        fs::write(dir.path().join("notes.txt"), b"ignored").expect("write other");

        assert_eq!(
            log.session_ids().expect("ids"),
            vec!["broken".to_string(), "good".to_string()]
        );
        assert!(log.read("broken").is_err());
    }
}
