use crate::memory_contracts::StageKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ServiceError,
    MalformedOutput,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ServiceError => "service_error",
            Self::MalformedOutput => "malformed_output",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by an external dependency. Every kind counts against the
/// dependency's circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DependencyFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl DependencyFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn service(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ServiceError, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(FailureKind::MalformedOutput, message)
    }
}

impl std::fmt::Display for DependencyFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for DependencyFailure {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReasoningRequest {
    pub stage: StageKind,
    pub text: String,
    /// Stage-specific structured context (prior stage outputs, recent summaries).
    #[serde(default)]
    pub context: Value,
}

impl ReasoningRequest {
    pub fn new(stage: StageKind, text: impl Into<String>) -> Self {
        Self {
            stage,
            text: text.into(),
            context: Value::Null,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

/// Reasoning service: turns text plus a stage prompt into a structured JSON
/// payload. Implementations must be callable from a worker thread.
pub trait ReasoningPort: Send + Sync {
    fn infer(&self, request: &ReasoningRequest) -> Result<Value, DependencyFailure>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveDocument {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedDocument {
    pub id: String,
    pub text: String,
    pub score: f64,
    #[serde(default)]
    pub metadata: Value,
}

/// Similarity-search archive for the warm tier. `upsert` must be idempotent
/// per document id.
pub trait ArchivePort: Send + Sync {
    fn upsert(&self, collection: &str, documents: &[ArchiveDocument])
        -> Result<(), DependencyFailure>;

    fn query(
        &self,
        collection: &str,
        text: &str,
        limit: usize,
    ) -> Result<Vec<RankedDocument>, DependencyFailure>;
}

/// Decodes a reasoning payload into a stage's typed output. A payload that
/// does not match the stage schema is a malformed-output failure.
pub fn decode_stage_output<T: DeserializeOwned>(
    stage: StageKind,
    payload: Value,
) -> Result<T, DependencyFailure> {
    serde_json::from_value(payload).map_err(|err| {
        DependencyFailure::malformed(format!("{stage} output did not match schema: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_contracts::{DecisionsOutput, TriageAction, TriagePlan};

    #[test]
    fn decode_accepts_matching_payload() {
        let output: DecisionsOutput = decode_stage_output(
            StageKind::Decisions,
            serde_json::json!({"decisions": ["adopt rust"]}),
        )
        .expect("decode decisions");
        assert_eq!(output.decisions, vec!["adopt rust".to_string()]);
    }

    #[test]
    fn decode_reports_malformed_output() {
        let err = decode_stage_output::<DecisionsOutput>(
            StageKind::Decisions,
            serde_json::json!({"decisions": "not a list"}),
        )
        .expect_err("schema mismatch");
        assert_eq!(err.kind, FailureKind::MalformedOutput);
        assert!(err.to_string().starts_with("malformed_output: decisions"));
    }

    #[test]
    fn triage_plan_decodes_from_wire_shape() {
        let plan: TriagePlan = decode_stage_output(
            StageKind::Triage,
            serde_json::json!({"items": [{"kind": "failure", "key": "disk", "action": "discard"}]}),
        )
        .expect("decode triage");
        assert_eq!(plan.items[0].action, TriageAction::Discard);
    }
}
