use ctx_core::memory_contracts::{
    normalize_identity, normalize_text, truncate_chars, AlertFinding, AnomalyOutput,
    CompressOutput, DecisionsOutput, EntitiesOutput, Entity, EntityKind, FailuresOutput,
    NudgeOutput, PatternFinding, PatternOutput, StageKind, SummaryOutput, TriagePlan,
};
use ctx_core::ports::{DependencyFailure, ReasoningPort, ReasoningRequest};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

const SUMMARY_MAX_CHARS: usize = 280;
const FACT_MAX_CHARS: usize = 200;
const SUBJECT_MAX_CHARS: usize = 160;
const DIGEST_MAX_CHARS: usize = 600;
const PATTERN_MIN_SESSIONS: usize = 3;
const FAILURE_BURST: usize = 3;

/// Text heuristics standing in for an external reasoning service, so the
/// pipeline runs end to end on a single machine.
pub struct DeterministicReasoner {
    person: Regex,
    project: Regex,
    decision: Regex,
    failure: Regex,
    follow_up: Regex,
}

impl DeterministicReasoner {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            person: Regex::new(
                r"(?:@([A-Za-z][\w-]+))|(?:\b(?:with|from|asked|told|ask|cc)\s+([A-Z][a-z]+(?:\s[A-Z][a-z]+)?))",
            )?,
            project: Regex::new(r"(?i)\b(?:project|repo|service|module)\s+([A-Za-z0-9][\w.-]*)")?,
            decision: Regex::new(
                r"(?i)\b(decided|agreed|going with|we will|chose|settled on|decision)\b",
            )?,
            failure: Regex::new(
                r"(?i)\b(failed|fails|failure|error|errors|timed out|timeout|crash|crashed|bug|broken)\b",
            )?,
            follow_up: Regex::new(r"(?i)\b(todo|follow up|follow-up|remind|next step|need to)\b")?,
        })
    }

    fn summary(&self, text: &str) -> SummaryOutput {
        let summary = sentences(text).into_iter().take(2).collect::<Vec<_>>().join(". ");
        SummaryOutput {
            summary: truncate_chars(summary, SUMMARY_MAX_CHARS),
            topics: self
                .projects(text)
                .into_iter()
                .map(|entity| entity.name)
                .collect(),
        }
    }

    fn projects(&self, text: &str) -> Vec<Entity> {
        let mut seen = BTreeSet::new();
        self.project
            .captures_iter(text)
            .filter_map(|captures| captures.get(1))
            .map(|name| name.as_str().trim_end_matches(['.', '-']).to_string())
            .filter(|name| !name.is_empty() && seen.insert(normalize_identity(name)))
            .map(|name| Entity {
                name,
                kind: EntityKind::Project,
                detail: String::new(),
            })
            .collect()
    }

    fn entities(&self, text: &str) -> EntitiesOutput {
        let mut seen = BTreeSet::new();
        let mut entities = self
            .person
            .captures_iter(text)
            .filter_map(|captures| captures.get(1).or_else(|| captures.get(2)))
            .map(|name| name.as_str().to_string())
            .filter(|name| seen.insert(normalize_identity(name)))
            .map(|name| Entity {
                name,
                kind: EntityKind::Person,
                detail: String::new(),
            })
            .collect::<Vec<_>>();
        entities.extend(self.projects(text));
        EntitiesOutput { entities }
    }

    fn matching_sentences(&self, pattern: &Regex, text: &str, max_chars: usize) -> Vec<String> {
        let mut seen = BTreeSet::new();
        sentences(text)
            .into_iter()
            .filter(|sentence| pattern.is_match(sentence))
            .map(|sentence| truncate_chars(sentence, max_chars))
            .filter(|sentence| seen.insert(normalize_identity(sentence)))
            .collect()
    }

    /// Words that recur across at least three input lines (one line per
    /// recent session summary).
    fn patterns(&self, text: &str) -> PatternOutput {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for line in text.lines() {
            let words = normalize_identity(line)
                .split(' ')
                .filter(|word| word.chars().count() >= 5)
                .map(str::to_string)
                .collect::<BTreeSet<_>>();
            for word in words {
                *counts.entry(word).or_default() += 1;
            }
        }
        let mut recurring = counts
            .into_iter()
            .filter(|(_, count)| *count >= PATTERN_MIN_SESSIONS)
            .collect::<Vec<_>>();
        recurring.sort_by(|left, right| right.1.cmp(&left.1).then_with(|| left.0.cmp(&right.0)));
        PatternOutput {
            patterns: recurring
                .into_iter()
                .take(3)
                .map(|(word, count)| PatternFinding {
                    kind: "recurring_topic".to_string(),
                    description: format!("{word} came up in {count} recent sessions"),
                    frequency: count as u32,
                })
                .collect(),
        }
    }

    fn nudges(&self, text: &str) -> NudgeOutput {
        NudgeOutput {
            nudges: self
                .matching_sentences(&self.follow_up, text, SUBJECT_MAX_CHARS)
                .into_iter()
                .map(|subject| AlertFinding {
                    kind: "follow_up".to_string(),
                    subject,
                    confidence_bps: 6_000,
                })
                .collect(),
        }
    }

    fn anomalies(&self, text: &str) -> AnomalyOutput {
        let failures = self.matching_sentences(&self.failure, text, FACT_MAX_CHARS);
        let mut anomalies = Vec::new();
        if failures.len() >= FAILURE_BURST {
            anomalies.push(AlertFinding {
                kind: "failure_burst".to_string(),
                subject: format!("{} failures reported in one session", failures.len()),
                confidence_bps: 5_000,
            });
        }
        AnomalyOutput { anomalies }
    }

    /// Keeps the prior digest and appends the labels of the condensed lines.
    fn compress(&self, text: &str) -> CompressOutput {
        let mut parts = Vec::new();
        for line in text.lines() {
            if let Some(prior) = line.strip_prefix("Existing digest: ") {
                parts.push(prior.trim().to_string());
            } else if let Some(item) = line.strip_prefix("- ") {
                let label = item.split(": ").next().unwrap_or(item);
                parts.push(normalize_text(label));
            }
        }
        CompressOutput {
            digest: truncate_chars(parts.join("; "), DIGEST_MAX_CHARS),
        }
    }
}

impl ReasoningPort for DeterministicReasoner {
    fn infer(&self, request: &ReasoningRequest) -> Result<Value, DependencyFailure> {
        let text = request.text.as_str();
        match request.stage {
            StageKind::Summary => to_payload(&self.summary(text)),
            StageKind::Entities => to_payload(&self.entities(text)),
            StageKind::Decisions => to_payload(&DecisionsOutput {
                decisions: self.matching_sentences(&self.decision, text, FACT_MAX_CHARS),
            }),
            StageKind::Failures => to_payload(&FailuresOutput {
                failures: self.matching_sentences(&self.failure, text, FACT_MAX_CHARS),
            }),
            StageKind::Triage => to_payload(&TriagePlan::default()),
            StageKind::Pattern => to_payload(&self.patterns(text)),
            StageKind::Nudge => to_payload(&self.nudges(text)),
            StageKind::Anomaly => to_payload(&self.anomalies(text)),
            StageKind::Compress => to_payload(&self.compress(text)),
        }
    }
}

fn to_payload<T: Serialize>(output: &T) -> Result<Value, DependencyFailure> {
    serde_json::to_value(output).map_err(|err| DependencyFailure::malformed(err.to_string()))
}

fn sentences(text: &str) -> Vec<String> {
    text.split(['.', '!', '?', '\n'])
        .map(normalize_text)
        .filter(|sentence| !sentence.is_empty())
        .collect()
}
