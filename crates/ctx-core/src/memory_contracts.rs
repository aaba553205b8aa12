use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use thiserror::Error;

pub const MEMORY_CONTRACT_VERSION: u32 = 1;
pub const MAX_CONFIDENCE_BPS: u16 = 10_000;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("confidence bps out of range for {field}: {value}")]
    InvalidConfidenceBps { field: &'static str, value: u16 },
    #[error("invalid session record: {reason}")]
    InvalidSession { reason: String },
    #[error("unknown {field} value: {value}")]
    UnknownValue { field: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum Significance {
    Low,
    #[default]
    Medium,
    High,
}

impl Significance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Queued,
    InProgress,
    Completed,
    FailedTerminal,
}

impl ProcessingState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::FailedTerminal => "failed_terminal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed_terminal" => Some(Self::FailedTerminal),
            _ => None,
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(self, Self::Queued | Self::InProgress)
    }
}

/// Raw session as written to the cold tier. Never mutated after ingestion;
/// processing state lives in the durable queue, not in the record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub raw_text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub significance: Significance,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, raw_text: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            raw_text: raw_text.into(),
            created_at,
            significance: Significance::default(),
            tags: Vec::new(),
            source: None,
        }
    }

    pub fn validate(&self) -> Result<(), ContractError> {
        let id = self.id.trim();
        if id.is_empty() {
            return Err(ContractError::InvalidSession {
                reason: "session id cannot be empty".to_string(),
            });
        }
        if id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(ContractError::InvalidSession {
                reason: format!("session id is not path safe: {id}"),
            });
        }
        if self.raw_text.trim().is_empty() {
            return Err(ContractError::InvalidSession {
                reason: format!("session {id} has no text"),
            });
        }
        Ok(())
    }
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Person,
    Project,
    Service,
    #[default]
    #[serde(other)]
    Other,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Project => "project",
            Self::Service => "service",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entity {
    pub name: String,
    #[serde(default)]
    pub kind: EntityKind,
    #[serde(default)]
    pub detail: String,
}

/// Output of stages 1-4 for one session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractedFacts {
    pub session_id: String,
    /// When the source session happened; orders conflicting hot texts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
    pub summary: String,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub failures: Vec<String>,
}

impl ExtractedFacts {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.summary.trim().is_empty()
            && self.entities.is_empty()
            && self.decisions.is_empty()
            && self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Summary,
    Entities,
    Decisions,
    Failures,
    Triage,
    Pattern,
    Nudge,
    Anomaly,
    Compress,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Entities => "entities",
            Self::Decisions => "decisions",
            Self::Failures => "failures",
            Self::Triage => "triage",
            Self::Pattern => "pattern",
            Self::Nudge => "nudge",
            Self::Anomaly => "anomaly",
            Self::Compress => "compress",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SummaryOutput {
    pub summary: String,
    #[serde(default)]
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntitiesOutput {
    #[serde(default)]
    pub entities: Vec<Entity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DecisionsOutput {
    #[serde(default)]
    pub decisions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailuresOutput {
    #[serde(default)]
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FactKind {
    Entity,
    Decision,
    Failure,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriageAction {
    Keep,
    Archive,
    Merge,
    Discard,
}

impl TriageAction {
    /// Whether a fact with this action is folded into the hot document.
    pub fn reaches_hot(self) -> bool {
        matches!(self, Self::Keep | Self::Merge)
    }

    pub fn reaches_warm(self) -> bool {
        !matches!(self, Self::Discard)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriageItem {
    pub kind: FactKind,
    pub key: String,
    pub action: TriageAction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriagePlan {
    #[serde(default)]
    pub items: Vec<TriageItem>,
}

impl TriagePlan {
    /// Facts the classifier did not mention are kept.
    pub fn action_for(&self, kind: FactKind, key: &str) -> TriageAction {
        let wanted = normalize_identity(key);
        self.items
            .iter()
            .find(|item| item.kind == kind && normalize_identity(&item.key) == wanted)
            .map(|item| item.action)
            .unwrap_or(TriageAction::Keep)
    }

    /// Learning mode never drops a fact; discards are archived instead.
    pub fn with_learning_mode(mut self) -> Self {
        for item in &mut self.items {
            if item.action == TriageAction::Discard {
                item.action = TriageAction::Archive;
            }
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatternFinding {
    pub kind: String,
    pub description: String,
    #[serde(default)]
    pub frequency: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatternOutput {
    #[serde(default)]
    pub patterns: Vec<PatternFinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertFinding {
    pub kind: String,
    pub subject: String,
    #[serde(default = "default_finding_confidence")]
    pub confidence_bps: u16,
}

fn default_finding_confidence() -> u16 {
    5_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NudgeOutput {
    #[serde(default)]
    pub nudges: Vec<AlertFinding>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnomalyOutput {
    #[serde(default)]
    pub anomalies: Vec<AlertFinding>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompressOutput {
    pub digest: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    Summary,
    Entity,
    Decision,
    Failure,
    Pattern,
    Pruned,
}

impl ArchiveKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Entity => "entity",
            Self::Decision => "decision",
            Self::Failure => "failure",
            Self::Pattern => "pattern",
            Self::Pruned => "pruned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "summary" => Some(Self::Summary),
            "entity" => Some(Self::Entity),
            "decision" => Some(Self::Decision),
            "failure" => Some(Self::Failure),
            "pattern" => Some(Self::Pattern),
            "pruned" => Some(Self::Pruned),
            _ => None,
        }
    }

    pub fn collection(self) -> &'static str {
        match self {
            Self::Summary => "sessions",
            Self::Entity => "entities",
            Self::Decision => "decisions",
            Self::Failure => "failures",
            Self::Pattern => "patterns",
            Self::Pruned => "hot_pruned",
        }
    }
}

pub const ARCHIVE_COLLECTIONS: [&str; 6] = [
    "sessions",
    "entities",
    "decisions",
    "failures",
    "patterns",
    "hot_pruned",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArchivePayload {
    Summary { text: String },
    Entity(Entity),
    Decision { text: String },
    Failure { text: String },
    Pattern(PatternFinding),
    Pruned { section: String, label: String, text: String },
}

impl ArchivePayload {
    pub fn kind(&self) -> ArchiveKind {
        match self {
            Self::Summary { .. } => ArchiveKind::Summary,
            Self::Entity(_) => ArchiveKind::Entity,
            Self::Decision { .. } => ArchiveKind::Decision,
            Self::Failure { .. } => ArchiveKind::Failure,
            Self::Pattern(_) => ArchiveKind::Pattern,
            Self::Pruned { .. } => ArchiveKind::Pruned,
        }
    }

    /// Fact identity within its kind; drives record ids and hot merges.
    pub fn identity(&self) -> String {
        match self {
            Self::Summary { .. } => "summary".to_string(),
            Self::Entity(entity) => normalize_identity(&entity.name),
            Self::Decision { text } | Self::Failure { text } => normalize_identity(text),
            Self::Pattern(pattern) => normalize_identity(&format!(
                "{} {}",
                pattern.kind, pattern.description
            )),
            Self::Pruned { section, label, .. } => {
                normalize_identity(&format!("{section} {label}"))
            }
        }
    }

    /// Runs `rewrite` over the payload's free text; `None` when it changed
    /// nothing. Identity fields stay as they are, so record ids are stable.
    /// An entity without detail is rewritten through its name into the detail.
    pub fn rewrite_text(&self, rewrite: impl Fn(&str) -> Option<String>) -> Option<Self> {
        match self {
            Self::Summary { text } => rewrite(text).map(|text| Self::Summary { text }),
            Self::Decision { text } => rewrite(text).map(|text| Self::Decision { text }),
            Self::Failure { text } => rewrite(text).map(|text| Self::Failure { text }),
            Self::Entity(entity) => {
                let current = if entity.detail.trim().is_empty() {
                    &entity.name
                } else {
                    &entity.detail
                };
                rewrite(current).map(|detail| {
                    Self::Entity(Entity {
                        detail,
                        ..entity.clone()
                    })
                })
            }
            Self::Pattern(pattern) => rewrite(&pattern.description).map(|description| {
                Self::Pattern(PatternFinding {
                    description,
                    ..pattern.clone()
                })
            }),
            Self::Pruned {
                section,
                label,
                text,
            } => rewrite(text).map(|text| Self::Pruned {
                section: section.clone(),
                label: label.clone(),
                text,
            }),
        }
    }

    pub fn document_text(&self) -> String {
        match self {
            Self::Summary { text } | Self::Decision { text } | Self::Failure { text } => {
                text.clone()
            }
            Self::Entity(entity) if entity.detail.trim().is_empty() => entity.name.clone(),
            Self::Entity(entity) => format!("{}: {}", entity.name, entity.detail),
            Self::Pattern(pattern) => format!("[{}] {}", pattern.kind, pattern.description),
            Self::Pruned { label, text, .. } => format!("{label}: {text}"),
        }
    }
}

/// Immutable unit of the warm tier, keyed by session id + kind + fact identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveRecord {
    pub record_id: String,
    pub session_id: String,
    pub payload: ArchivePayload,
    /// Whether triage folded this fact into the hot document.
    pub hot: bool,
    pub created_at: DateTime<Utc>,
}

impl ArchiveRecord {
    pub fn new(
        session_id: &str,
        payload: ArchivePayload,
        hot: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        let record_id = archive_record_id(session_id, payload.kind(), &payload.identity());
        Self {
            record_id,
            session_id: session_id.to_string(),
            payload,
            hot,
            created_at,
        }
    }

    pub fn kind(&self) -> ArchiveKind {
        self.payload.kind()
    }
}

pub fn archive_record_id(session_id: &str, kind: ArchiveKind, identity: &str) -> String {
    let digest = sha256_hex(format!("{session_id}|{}|{identity}", kind.as_str()).as_bytes());
    format!("{}:{session_id}:{}", kind.as_str(), &digest[..16])
}

/// Builds the warm-tier records for a session after triage. Discarded facts
/// produce nothing; archive-only facts are flagged `hot = false`.
pub fn archive_records_for(
    facts: &ExtractedFacts,
    plan: &TriagePlan,
    created_at: DateTime<Utc>,
) -> Vec<ArchiveRecord> {
    let mut records = Vec::new();
    let mut seen = BTreeSet::new();
    let session_id = facts.session_id.as_str();

    if !facts.summary.trim().is_empty() {
        let payload = ArchivePayload::Summary {
            text: facts.summary.trim().to_string(),
        };
        records.push(ArchiveRecord::new(session_id, payload, false, created_at));
    }

    for entity in &facts.entities {
        let action = plan.action_for(FactKind::Entity, &entity.name);
        if !action.reaches_warm() {
            continue;
        }
        let payload = ArchivePayload::Entity(entity.clone());
        push_unique(&mut records, &mut seen, session_id, payload, action, created_at);
    }
    for decision in &facts.decisions {
        let action = plan.action_for(FactKind::Decision, decision);
        if !action.reaches_warm() {
            continue;
        }
        let payload = ArchivePayload::Decision {
            text: decision.trim().to_string(),
        };
        push_unique(&mut records, &mut seen, session_id, payload, action, created_at);
    }
    for failure in &facts.failures {
        let action = plan.action_for(FactKind::Failure, failure);
        if !action.reaches_warm() {
            continue;
        }
        let payload = ArchivePayload::Failure {
            text: failure.trim().to_string(),
        };
        push_unique(&mut records, &mut seen, session_id, payload, action, created_at);
    }

    records
}

fn push_unique(
    records: &mut Vec<ArchiveRecord>,
    seen: &mut BTreeSet<String>,
    session_id: &str,
    payload: ArchivePayload,
    action: TriageAction,
    created_at: DateTime<Utc>,
) {
    let record = ArchiveRecord::new(session_id, payload, action.reaches_hot(), created_at);
    if seen.insert(record.record_id.clone()) {
        records.push(record);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertClass {
    Nudge,
    Anomaly,
}

impl AlertClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nudge => "nudge",
            Self::Anomaly => "anomaly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "nudge" => Some(Self::Nudge),
            "anomaly" => Some(Self::Anomaly),
            _ => None,
        }
    }
}

pub const ANOMALY_POISON_SESSION: &str = "poison_session";

/// Advisory nudge or anomaly. Never needed for hot-document correctness.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alert {
    pub alert_id: String,
    pub class: AlertClass,
    pub kind: String,
    pub subject: String,
    pub confidence_bps: u16,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub dismissed_at: Option<DateTime<Utc>>,
}

pub fn alert_id(class: AlertClass, kind: &str, subject: &str) -> String {
    let digest = sha256_hex(
        format!("{}|{}|{}", class.as_str(), kind, normalize_identity(subject)).as_bytes(),
    );
    format!("{}:{}", class.as_str(), &digest[..16])
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    Reasoning,
    Archive,
}

impl Dependency {
    pub const ALL: [Dependency; 2] = [Dependency::Reasoning, Dependency::Archive];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reasoning => "reasoning",
            Self::Archive => "archive",
        }
    }
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Open and half-open both count as a degraded dependency.
    pub fn is_tripped(self) -> bool {
        !matches!(self, Self::Closed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyHealth {
    pub dependency: Dependency,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub circuit_state: CircuitState,
    pub opened_at: Option<DateTime<Utc>>,
    pub cooldown_ms: u64,
    pub trial_in_flight: bool,
    pub last_error: Option<String>,
}

impl DependencyHealth {
    pub fn new(dependency: Dependency, cooldown_ms: u64) -> Self {
        Self {
            dependency,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            circuit_state: CircuitState::Closed,
            opened_at: None,
            cooldown_ms,
            trial_in_flight: false,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HotSource {
    Live,
    Durable,
    LastGood,
}

impl HotSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Durable => "durable",
            Self::LastGood => "last_good",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    Full,
    Partial,
    Minimal,
    Offline,
}

impl DegradationLevel {
    /// Pure derivation over the two health records and hot-tier readability.
    /// Serving the hot document from its last-good cache counts as one more
    /// degraded input, alongside each tripped circuit.
    pub fn derive(
        reasoning: &DependencyHealth,
        archive: &DependencyHealth,
        hot_source: Option<HotSource>,
    ) -> Self {
        let Some(hot_source) = hot_source else {
            return Self::Offline;
        };
        let tripped = [reasoning, archive]
            .iter()
            .filter(|health| health.circuit_state.is_tripped())
            .count();
        let degraded = tripped + usize::from(hot_source == HotSource::LastGood);
        match degraded {
            0 => Self::Full,
            1 => Self::Partial,
            _ => Self::Minimal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial => "partial",
            Self::Minimal => "minimal",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn validate_confidence_bps(field: &'static str, value: u16) -> Result<(), ContractError> {
    if value > MAX_CONFIDENCE_BPS {
        return Err(ContractError::InvalidConfidenceBps { field, value });
    }
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let json =
        serde_json::to_value(value).map_err(|err| ContractError::Serialization(err.to_string()))?;
    let canonical = canonicalize_value(json);
    serde_json::to_string(&canonical).map_err(|err| ContractError::Serialization(err.to_string()))
}

pub fn canonical_payload_hash<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let rendered = canonical_json(value)?;
    Ok(sha256_hex(rendered.as_bytes()))
}

fn canonicalize_value(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(String, Value)> = object.into_iter().collect();
            entries.sort_by(|left, right| left.0.cmp(&right.0));

            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize_value(value));
            }
            Value::Object(sorted)
        }
        Value::Array(values) => Value::Array(values.into_iter().map(canonicalize_value).collect()),
        scalar => scalar,
    }
}

/// Character-ratio token heuristic. Stable and monotonic in text length.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    (chars / 4).max(1)
}

pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn normalize_identity(text: &str) -> String {
    normalize_text(
        &text
            .chars()
            .map(|ch| {
                if ch.is_alphanumeric() {
                    ch.to_ascii_lowercase()
                } else {
                    ' '
                }
            })
            .collect::<String>(),
    )
}

pub fn truncate_chars(text: String, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }

    if text.chars().count() <= max_chars {
        return text;
    }

    let mut out = text
        .chars()
        .take(max_chars.saturating_sub(3))
        .collect::<String>();
    out.push_str("...");
    out
}

/// Share of distinct words the two texts have in common, relative to the
/// larger word set.
pub fn word_overlap(left: &str, right: &str) -> f64 {
    let left_words = left
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect::<BTreeSet<_>>();
    let right_words = right
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect::<BTreeSet<_>>();
    if left_words.is_empty() || right_words.is_empty() {
        return 0.0;
    }
    let shared = left_words.intersection(&right_words).count();
    shared as f64 / left_words.len().max(right_words.len()) as f64
}
