use chrono::{DateTime, Duration, Utc};
use ctx_core::memory_contracts::{
    alert_id, validate_confidence_bps, word_overlap, Alert, AlertClass, AlertFinding,
};
use ctx_storage::{MemoryDb, StorageError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertPolicy {
    pub nudge_retention_days: i64,
    pub nudge_max_active: usize,
    pub anomaly_retention_days: i64,
    pub anomaly_max_active: usize,
    /// Word-overlap ratio above which a new alert counts as a duplicate.
    pub dedupe_overlap: f64,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            nudge_retention_days: 7,
            nudge_max_active: 20,
            anomaly_retention_days: 14,
            anomaly_max_active: 30,
            dedupe_overlap: 0.8,
        }
    }
}

impl AlertPolicy {
    fn retention(&self, class: AlertClass) -> Duration {
        let days = match class {
            AlertClass::Nudge => self.nudge_retention_days,
            AlertClass::Anomaly => self.anomaly_retention_days,
        };
        Duration::days(days.max(1))
    }

    fn max_active(&self, class: AlertClass) -> usize {
        match class {
            AlertClass::Nudge => self.nudge_max_active,
            AlertClass::Anomaly => self.anomaly_max_active,
        }
        .max(1)
    }

    /// Records a finding unless an active alert of the same class already
    /// covers it. Returns the stored alert, or `None` when deduplicated.
    pub fn record(
        &self,
        db: &MemoryDb,
        class: AlertClass,
        finding: &AlertFinding,
        session_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Alert>, StorageError> {
        let subject = finding.subject.trim();
        if subject.is_empty() {
            return Ok(None);
        }
        if let Err(err) = validate_confidence_bps("confidence_bps", finding.confidence_bps) {
            warn!(event = "alert_rejected", class = class.as_str(), error = %err);
            return Ok(None);
        }

        let id = alert_id(class, &finding.kind, subject);
        let active = db.active_alerts(class, now)?;
        if active.iter().any(|existing| {
            existing.alert_id != id && word_overlap(&existing.subject, subject) > self.dedupe_overlap
        }) {
            debug!(
                event = "alert_deduplicated",
                class = class.as_str(),
                subject = subject
            );
            return Ok(None);
        }

        self.store(db, class, id, finding, session_id, now).map(Some)
    }

    /// Records a finding deduplicated only by its own identity. Used for
    /// system-generated alerts whose subjects differ by an id alone.
    pub fn record_exact(
        &self,
        db: &MemoryDb,
        class: AlertClass,
        finding: &AlertFinding,
        session_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Alert, StorageError> {
        let id = alert_id(class, &finding.kind, finding.subject.trim());
        self.store(db, class, id, finding, session_id, now)
    }

    fn store(
        &self,
        db: &MemoryDb,
        class: AlertClass,
        id: String,
        finding: &AlertFinding,
        session_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Alert, StorageError> {
        let subject = finding.subject.trim();
        let alert = Alert {
            alert_id: id,
            class,
            kind: finding.kind.clone(),
            subject: subject.to_string(),
            confidence_bps: finding.confidence_bps,
            session_id: session_id.map(str::to_string),
            created_at: now,
            expires_at: now + self.retention(class),
            dismissed_at: None,
        };
        db.upsert_alert(&alert)?;
        self.enforce_cap(db, class, now)?;
        Ok(alert)
    }

    /// Keeps the strongest alerts when a class exceeds its active cap;
    /// ties go to the newer alert.
    fn enforce_cap(
        &self,
        db: &MemoryDb,
        class: AlertClass,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let mut active = db.active_alerts(class, now)?;
        let cap = self.max_active(class);
        if active.len() <= cap {
            return Ok(0);
        }
        active.sort_by(|left, right| {
            right
                .confidence_bps
                .cmp(&left.confidence_bps)
                .then_with(|| right.created_at.cmp(&left.created_at))
                .then_with(|| left.alert_id.cmp(&right.alert_id))
        });
        let mut dropped = 0;
        for alert in active.iter().skip(cap) {
            if db.delete_alert(&alert.alert_id)? {
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    pub fn collect_garbage(&self, db: &MemoryDb, now: DateTime<Utc>) -> Result<usize, StorageError> {
        db.purge_expired_alerts(now)
    }
}
