use crate::memory_contracts::{
    estimate_tokens, normalize_identity, normalize_text, Alert, EntityKind, ExtractedFacts,
    FactKind, TriagePlan,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const MAX_ENTRY_HISTORY: usize = 5;
pub const DIGEST_KEY: &str = "digest";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ContextSection {
    People,
    Projects,
    Decisions,
    OpenIssues,
    Nudges,
}

impl ContextSection {
    pub const ALL: [ContextSection; 5] = [
        ContextSection::People,
        ContextSection::Projects,
        ContextSection::Decisions,
        ContextSection::OpenIssues,
        ContextSection::Nudges,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::People => "people",
            Self::Projects => "projects",
            Self::Decisions => "decisions",
            Self::OpenIssues => "open_issues",
            Self::Nudges => "nudges",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "people" => Some(Self::People),
            "projects" => Some(Self::Projects),
            "decisions" => Some(Self::Decisions),
            "open_issues" => Some(Self::OpenIssues),
            "nudges" => Some(Self::Nudges),
            _ => None,
        }
    }

    fn heading(self) -> &'static str {
        match self {
            Self::People => "People",
            Self::Projects => "Projects",
            Self::Decisions => "Decisions",
            Self::OpenIssues => "Open issues",
            Self::Nudges => "Nudges",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextEntry {
    pub key: String,
    pub label: String,
    pub text: String,
    #[serde(default)]
    pub sources: BTreeSet<String>,
    pub updated_at: DateTime<Utc>,
    /// Superseded texts, oldest first.
    #[serde(default)]
    pub history: Vec<String>,
    /// When the writer of `text` observed it, and which source that was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_by: Option<String>,
}

impl ContextEntry {
    /// Returns whether the text changed; the old text joins the bounded
    /// history.
    fn replace_text(&mut self, text: &str) -> bool {
        if self.text == text {
            return false;
        }
        let superseded = std::mem::replace(&mut self.text, text.to_string());
        self.history.push(superseded);
        if self.history.len() > MAX_ENTRY_HISTORY {
            let overflow = self.history.len() - MAX_ENTRY_HISTORY;
            self.history.drain(..overflow);
        }
        true
    }
}

/// The hot tier: a single sectioned document with a monotonically increasing
/// revision. Revision bookkeeping belongs to the store; the methods here only
/// edit content and report whether anything changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MasterContext {
    pub revision: u64,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sections: BTreeMap<ContextSection, BTreeMap<String, ContextEntry>>,
}

impl Default for MasterContext {
    fn default() -> Self {
        Self::empty()
    }
}

impl MasterContext {
    pub fn empty() -> Self {
        Self {
            revision: 0,
            updated_at: None,
            sections: BTreeMap::new(),
        }
    }

    pub fn entries(&self, section: ContextSection) -> impl Iterator<Item = &ContextEntry> {
        self.sections.get(&section).into_iter().flat_map(|map| map.values())
    }

    pub fn entry(&self, section: ContextSection, key: &str) -> Option<&ContextEntry> {
        self.sections.get(&section).and_then(|map| map.get(key))
    }

    pub fn entry_count(&self) -> usize {
        self.sections.values().map(BTreeMap::len).sum()
    }

    pub fn project_count(&self) -> usize {
        self.sections
            .get(&ContextSection::Projects)
            .map(|map| map.keys().filter(|key| key.as_str() != DIGEST_KEY).count())
            .unwrap_or(0)
    }

    /// Content equality, ignoring revision and timestamps.
    pub fn same_content(&self, other: &MasterContext) -> bool {
        fn strip(
            doc: &MasterContext,
        ) -> Vec<(
            ContextSection,
            Vec<(&String, &String, &BTreeSet<String>, &Vec<String>)>,
        )> {
            doc.sections
                .iter()
                .filter(|(_, entries)| !entries.is_empty())
                .map(|(section, entries)| {
                    let entries = entries
                        .values()
                        .map(|entry| (&entry.key, &entry.text, &entry.sources, &entry.history))
                        .collect::<Vec<_>>();
                    (*section, entries)
                })
                .collect::<Vec<_>>()
        }
        strip(self) == strip(other)
    }

    /// Folds hot-eligible facts into the document. Returns whether content changed.
    pub fn apply_facts(
        &mut self,
        facts: &ExtractedFacts,
        plan: &TriagePlan,
        now: DateTime<Utc>,
    ) -> bool {
        let mut changed = false;
        let source = facts.session_id.as_str();
        let observed_at = facts.observed_at;

        for entity in &facts.entities {
            if !plan.action_for(FactKind::Entity, &entity.name).reaches_hot() {
                continue;
            }
            let section = match entity.kind {
                EntityKind::Person => ContextSection::People,
                _ => ContextSection::Projects,
            };
            let text = if entity.detail.trim().is_empty() {
                entity.name.trim().to_string()
            } else {
                normalize_text(&entity.detail)
            };
            changed |=
                self.merge_observed(section, &entity.name, &text, Some(source), observed_at, now);
        }

        for decision in &facts.decisions {
            if !plan.action_for(FactKind::Decision, decision).reaches_hot() {
                continue;
            }
            changed |= self.merge_observed(
                ContextSection::Decisions,
                decision,
                &normalize_text(decision),
                Some(source),
                observed_at,
                now,
            );
        }

        for failure in &facts.failures {
            if !plan.action_for(FactKind::Failure, failure).reaches_hot() {
                continue;
            }
            changed |= self.merge_observed(
                ContextSection::OpenIssues,
                failure,
                &normalize_text(failure),
                Some(source),
                observed_at,
                now,
            );
        }

        changed
    }

    /// Unordered write (manual edits, digests): a new text always replaces
    /// the current one and is stamped no earlier than `now`, so replaying
    /// older sessions does not undo it.
    pub fn merge_entry(
        &mut self,
        section: ContextSection,
        label: &str,
        text: &str,
        source: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        self.merge_observed(section, label, text, source, None, now)
    }

    /// The most recently observed text wins; the superseded text is kept in
    /// the entry history. Text observed earlier than the current one, or at
    /// the same instant by another source, only adds its source, so replaying
    /// sessions converges on the same entry.
    pub fn merge_observed(
        &mut self,
        section: ContextSection,
        label: &str,
        text: &str,
        source: Option<&str>,
        observed_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        let key = normalize_identity(label);
        if key.is_empty() || text.trim().is_empty() {
            return false;
        }
        let entries = self.sections.entry(section).or_default();

        let Some(existing) = entries.get_mut(&key) else {
            let mut sources = BTreeSet::new();
            if let Some(source) = source {
                sources.insert(source.to_string());
            }
            entries.insert(
                key.clone(),
                ContextEntry {
                    key,
                    label: label.trim().to_string(),
                    text: text.to_string(),
                    sources,
                    updated_at: now,
                    history: Vec::new(),
                    observed_at: Some(observed_at.unwrap_or(now)),
                    observed_by: source.map(str::to_string),
                },
            );
            return true;
        };

        let mut changed = false;
        if let Some(source) = source {
            changed |= existing.sources.insert(source.to_string());
        }
        let same_writer = existing.observed_by.as_deref() == source;
        match observed_at {
            Some(observed_at) => {
                let stale = existing.observed_at.is_some_and(|current| {
                    observed_at < current || (observed_at == current && !same_writer)
                });
                if !stale {
                    changed |= existing.replace_text(text);
                    if existing.observed_at != Some(observed_at) || !same_writer {
                        existing.observed_at = Some(observed_at);
                        existing.observed_by = source.map(str::to_string);
                        changed = true;
                    }
                }
            }
            None => {
                if existing.replace_text(text) {
                    existing.observed_at = existing.observed_at.max(Some(now));
                    existing.observed_by = source.map(str::to_string);
                    changed = true;
                }
            }
        }
        if changed {
            existing.updated_at = now;
        }
        changed
    }

    pub fn remove_entry(&mut self, section: ContextSection, key: &str) -> Option<ContextEntry> {
        let entries = self.sections.get_mut(&section)?;
        let removed = entries.remove(key);
        if entries.is_empty() {
            self.sections.remove(&section);
        }
        removed
    }

    /// Rebuilds the nudges section from the currently active alerts.
    pub fn replace_nudges(&mut self, active: &[Alert], now: DateTime<Utc>) -> bool {
        let mut next = BTreeMap::new();
        for alert in active {
            let previous = self.entry(ContextSection::Nudges, &alert.alert_id);
            let updated_at = previous
                .filter(|entry| entry.text == alert.subject)
                .map(|entry| entry.updated_at)
                .unwrap_or(now);
            let mut sources = BTreeSet::new();
            if let Some(session_id) = &alert.session_id {
                sources.insert(session_id.clone());
            }
            next.insert(
                alert.alert_id.clone(),
                ContextEntry {
                    key: alert.alert_id.clone(),
                    label: alert.kind.clone(),
                    text: alert.subject.clone(),
                    sources,
                    updated_at,
                    history: Vec::new(),
                    observed_at: None,
                    observed_by: None,
                },
            );
        }

        let current = self.sections.get(&ContextSection::Nudges);
        let unchanged = match current {
            Some(current) => {
                current.len() == next.len()
                    && current.iter().all(|(key, entry)| {
                        next.get(key).is_some_and(|candidate| {
                            candidate.text == entry.text && candidate.sources == entry.sources
                        })
                    })
            }
            None => next.is_empty(),
        };
        if unchanged {
            return false;
        }

        if next.is_empty() {
            self.sections.remove(&ContextSection::Nudges);
        } else {
            self.sections.insert(ContextSection::Nudges, next);
        }
        true
    }

    /// Compression order: open issues oldest first, then decisions oldest
    /// first. Existing digests are never pruned.
    pub fn prune_candidates(&self) -> Vec<(ContextSection, ContextEntry)> {
        let mut candidates = Vec::new();
        for section in [ContextSection::OpenIssues, ContextSection::Decisions] {
            let mut entries = self
                .entries(section)
                .filter(|entry| entry.key != DIGEST_KEY)
                .cloned()
                .collect::<Vec<_>>();
            entries.sort_by(|left, right| {
                left.updated_at
                    .cmp(&right.updated_at)
                    .then_with(|| left.key.cmp(&right.key))
            });
            candidates.extend(entries.into_iter().map(|entry| (section, entry)));
        }
        candidates
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::from("# Master context\n");
        for section in ContextSection::ALL {
            let Some(entries) = self.sections.get(&section) else {
                continue;
            };
            if entries.is_empty() {
                continue;
            }
            out.push_str(&format!("\n## {}\n", section.heading()));
            for entry in entries.values() {
                if entry.label.is_empty() || entry.label == entry.text {
                    out.push_str(&format!("- {}\n", entry.text));
                } else {
                    out.push_str(&format!("- **{}**: {}\n", entry.label, entry.text));
                }
            }
        }
        out
    }

    pub fn token_estimate(&self) -> u32 {
        estimate_tokens(&self.render_markdown())
    }
}
