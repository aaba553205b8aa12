use chrono::{DateTime, Duration, TimeZone, Utc};
use ctx_core::master_context::ContextSection;
use ctx_core::memory_contracts::{
    AlertClass, DegradationLevel, Dependency, Entity, EntityKind, HotSource, ProcessingState,
    Session, StageKind, ANOMALY_POISON_SESSION,
};
use ctx_core::ports::{
    ArchiveDocument, ArchivePort, DependencyFailure, RankedDocument, ReasoningPort,
    ReasoningRequest,
};
use ctx_mind::{
    BootstrapCoordinator, CallOutcome, CircuitConfig, CompressionOutcome, DegradationMonitor,
    HotBudget, MemoryError, PipelineScheduler, PortGateway, SchedulerConfig, SessionRange,
    TickOutcome, TieredMemoryStore, ToolSurface,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

fn ts(offset_minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
        .single()
        .expect("valid timestamp")
        + Duration::minutes(offset_minutes)
}

#[derive(Clone, Default)]
struct SessionScript {
    entities: Vec<Entity>,
    decisions: Vec<String>,
    failures: Vec<String>,
    fail_times: u32,
}

/// Canned per-session results. Periodic stages carry no session id and get
/// empty outputs.
#[derive(Default)]
struct ScriptedReasoner {
    scripts: BTreeMap<String, SessionScript>,
    failures_left: Mutex<BTreeMap<String, u32>>,
    summary_calls: Mutex<Vec<String>>,
}

impl ScriptedReasoner {
    fn new(scripts: BTreeMap<String, SessionScript>) -> Self {
        let failures_left = scripts
            .iter()
            .map(|(id, script)| (id.clone(), script.fail_times))
            .collect();
        Self {
            scripts,
            failures_left: Mutex::new(failures_left),
            summary_calls: Mutex::new(Vec::new()),
        }
    }

    fn summary_calls(&self) -> Vec<String> {
        self.summary_calls.lock().expect("calls lock").clone()
    }
}

impl ReasoningPort for ScriptedReasoner {
    fn infer(&self, request: &ReasoningRequest) -> Result<Value, DependencyFailure> {
        let session_id = request
            .context
            .get("session_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let script = self.scripts.get(&session_id).cloned().unwrap_or_default();

        match request.stage {
            StageKind::Summary => {
                self.summary_calls
                    .lock()
                    .expect("calls lock")
                    .push(session_id.clone());
                let mut failures_left = self.failures_left.lock().expect("failures lock");
                if let Some(left) = failures_left.get_mut(&session_id) {
                    if *left > 0 {
                        *left -= 1;
                        return Err(DependencyFailure::service("scripted outage"));
                    }
                }
                Ok(json!({"summary": format!("summary of {session_id}")}))
            }
            StageKind::Entities => Ok(json!({"entities": script.entities})),
            StageKind::Decisions => Ok(json!({"decisions": script.decisions})),
            StageKind::Failures => Ok(json!({"failures": script.failures})),
            StageKind::Triage => Ok(json!({"items": []})),
            StageKind::Pattern => Ok(json!({"patterns": []})),
            StageKind::Nudge => Ok(json!({"nudges": []})),
            StageKind::Anomaly => Ok(json!({"anomalies": []})),
            StageKind::Compress => Ok(json!({"digest": "older items condensed"})),
        }
    }
}

#[derive(Default)]
struct MemoryArchive {
    documents: Mutex<BTreeMap<(String, String), String>>,
}

impl ArchivePort for MemoryArchive {
    fn upsert(&self, collection: &str, documents: &[ArchiveDocument]) -> Result<(), DependencyFailure> {
        let mut stored = self.documents.lock().expect("archive lock");
        for document in documents {
            stored.insert(
                (collection.to_string(), document.id.clone()),
                document.text.clone(),
            );
        }
        Ok(())
    }

    fn query(&self, _: &str, _: &str, _: usize) -> Result<Vec<RankedDocument>, DependencyFailure> {
        Ok(Vec::new())
    }
}

struct Harness {
    scheduler: PipelineScheduler,
    reasoner: Arc<ScriptedReasoner>,
    archive: Arc<MemoryArchive>,
}

impl Harness {
    fn new(dir: &Path, scripts: BTreeMap<String, SessionScript>) -> Self {
        let reasoner = Arc::new(ScriptedReasoner::new(scripts));
        let archive = Arc::new(MemoryArchive::default());
        let config = SchedulerConfig::default();
        let gateway = PortGateway::new(
            reasoner.clone(),
            archive.clone(),
            DegradationMonitor::new(CircuitConfig::default()),
            config.timeouts,
        );
        let store = TieredMemoryStore::open(dir).expect("open store");
        let scheduler = PipelineScheduler::new(store, gateway, config, ts(0)).expect("scheduler");
        Self {
            scheduler,
            reasoner,
            archive,
        }
    }

    fn coordinator(&self) -> BootstrapCoordinator {
        BootstrapCoordinator::new(
            self.scheduler.store().clone(),
            self.scheduler.gateway().monitor().clone(),
            HotBudget::default(),
        )
    }

    fn enqueue(&self, session_id: &str, at: i64) {
        self.scheduler
            .enqueue(&Session::new(session_id, format!("notes for {session_id}"), ts(at)), ts(at))
            .expect("enqueue");
    }

    /// Ticks an hour apart until the queue is idle; returns completed ids.
    fn drain(&self, start: i64) -> (Vec<String>, i64) {
        let mut completed = Vec::new();
        let mut minute = start;
        for _ in 0..50 {
            let report = self.scheduler.tick(ts(minute)).expect("tick");
            minute += 60;
            match report.outcome {
                TickOutcome::Idle => break,
                TickOutcome::Completed => {
                    completed.extend(report.session_id);
                }
                _ => {}
            }
        }
        (completed, minute)
    }

    fn ledger_ids(&self) -> BTreeSet<String> {
        self.scheduler
            .store()
            .with_db(|db| db.ledger_records(10_000))
            .expect("ledger")
            .into_iter()
            .map(|record| record.record_id)
            .collect()
    }
}

fn project(name: &str) -> Entity {
    Entity {
        name: name.to_string(),
        kind: EntityKind::Project,
        detail: String::new(),
    }
}

fn person(name: &str, detail: &str) -> Entity {
    Entity {
        name: name.to_string(),
        kind: EntityKind::Person,
        detail: detail.to_string(),
    }
}

fn five_sessions() -> BTreeMap<String, SessionScript> {
    (1..=5)
        .map(|idx| {
            (
                format!("s{idx}"),
                SessionScript {
                    entities: vec![
                        project(&format!("Project {idx}")),
                        project("Shared"),
                        person("Robin", &format!("role {idx}")),
                    ],
                    decisions: vec![format!("decision from session {idx}")],
                    failures: if idx % 2 == 0 {
                        vec![format!("issue seen in session {idx}")]
                    } else {
                        Vec::new()
                    },
                    fail_times: 0,
                },
            )
        })
        .collect()
}

#[test]
fn commit_round_trip_merges_facts_and_bumps_revision_once() {
    let dir = tempfile::tempdir().expect("temp dir");
    let scripts = BTreeMap::from([(
        "s1".to_string(),
        SessionScript {
            entities: vec![project("Atlas"), project("atlas"), project("Beacon")],
            decisions: vec!["Ship behind a flag".to_string()],
            failures: vec!["Indexer crashed".to_string()],
            fail_times: 0,
        },
    )]);
    let harness = Harness::new(dir.path(), scripts);
    let scaffold = harness.coordinator().scaffold(ts(0)).expect("scaffold");
    assert_eq!(scaffold.document.revision, 1);

    harness.enqueue("s1", 0);
    let report = harness.scheduler.tick(ts(1)).expect("tick");
    assert_eq!(report.outcome, TickOutcome::Completed);
    assert_eq!(report.revision, Some(2));

    let hot = harness.scheduler.store().read_hot().expect("hot");
    assert_eq!(hot.document.revision, 2);
    assert_eq!(hot.document.entries(ContextSection::Projects).count(), 2);
    assert!(hot.document.entry(ContextSection::Projects, "atlas").is_some());
    assert!(hot.document.entry(ContextSection::Projects, "beacon").is_some());
    assert!(hot
        .document
        .entry(ContextSection::Decisions, "ship behind a flag")
        .is_some());
    assert!(hot
        .document
        .entry(ContextSection::OpenIssues, "indexer crashed")
        .is_some());

    let archived = harness.archive.documents.lock().expect("archive lock").len();
    assert_eq!(archived, 5);
}

#[test]
fn reprocessing_a_range_twice_matches_reprocessing_once() {
    let dir = tempfile::tempdir().expect("temp dir");
    let harness = Harness::new(dir.path(), five_sessions());
    for idx in 1..=5 {
        harness.enqueue(&format!("s{idx}"), idx);
    }
    let (completed, minute) = harness.drain(10);
    assert_eq!(completed.len(), 5);
    let original = harness.scheduler.store().read_hot().expect("hot").document;
    let original_ledger = harness.ledger_ids();

    let coordinator = harness.coordinator();
    let first = coordinator
        .reprocess(&SessionRange::default(), ts(minute))
        .expect("first reprocess");
    assert_eq!(first.requeued, 5);
    assert!(first.errors.is_empty());
    let (_, minute) = harness.drain(minute);
    let once = harness.scheduler.store().read_hot().expect("hot").document;
    let once_ledger = harness.ledger_ids();

    coordinator
        .reprocess(&SessionRange::default(), ts(minute))
        .expect("second reprocess");
    harness.drain(minute);
    let twice = harness.scheduler.store().read_hot().expect("hot").document;
    let twice_ledger = harness.ledger_ids();

    assert!(once.same_content(&original));
    assert!(twice.same_content(&once));
    assert_eq!(twice.revision, once.revision);
    assert_eq!(once.revision, original.revision);
    assert_eq!(once_ledger, original_ledger);
    assert_eq!(twice_ledger, once_ledger);
    assert_eq!(
        twice
            .entry(ContextSection::Projects, "shared")
            .expect("shared project")
            .sources
            .len(),
        5
    );

    // Every session disagrees about Robin; the latest session's text holds
    // through both replays.
    let robin = twice
        .entry(ContextSection::People, "robin")
        .expect("robin entry");
    assert_eq!(robin.text, "role 5");
    assert_eq!(robin.history, vec!["role 1", "role 2", "role 3", "role 4"]);
    assert_eq!(robin.sources.len(), 5);
}

#[test]
fn older_session_processed_late_does_not_override_newer_fact() {
    let dir = tempfile::tempdir().expect("temp dir");
    let scripts = BTreeMap::from([
        (
            "old".to_string(),
            SessionScript {
                entities: vec![person("Robin", "developer")],
                ..SessionScript::default()
            },
        ),
        (
            "new".to_string(),
            SessionScript {
                entities: vec![person("Robin", "manager")],
                ..SessionScript::default()
            },
        ),
    ]);
    let harness = Harness::new(dir.path(), scripts);
    harness
        .scheduler
        .enqueue(&Session::new("new", "notes for new", ts(10)), ts(10))
        .expect("enqueue new");
    harness
        .scheduler
        .enqueue(&Session::new("old", "notes for old", ts(0)), ts(11))
        .expect("enqueue old");

    let (completed, minute) = harness.drain(20);
    assert_eq!(completed, vec!["new".to_string(), "old".to_string()]);
    let hot = harness.scheduler.store().read_hot().expect("hot").document;
    let robin = hot
        .entry(ContextSection::People, "robin")
        .expect("robin entry");
    assert_eq!(robin.text, "manager");
    assert!(robin.history.is_empty());
    assert_eq!(robin.sources.len(), 2);

    harness
        .coordinator()
        .rebuild_master(ts(minute))
        .expect("rebuild");
    let rebuilt = harness.scheduler.store().read_hot().expect("hot").document;
    assert_eq!(
        rebuilt
            .entry(ContextSection::People, "robin")
            .map(|entry| entry.text.as_str()),
        Some("manager")
    );
}

#[test]
fn storage_error_mid_tick_requeues_the_session_and_the_queue_keeps_moving() {
    let dir = tempfile::tempdir().expect("temp dir");
    let harness = Harness::new(dir.path(), five_sessions());
    harness.enqueue("s1", 0);
    harness.enqueue("s2", 1);

    let conn = rusqlite::Connection::open(dir.path().join("memory.db")).expect("raw conn");
    conn.execute_batch(
        "CREATE TRIGGER fail_completion BEFORE UPDATE OF state ON session_queue
         WHEN NEW.state = 'completed'
         BEGIN SELECT RAISE(ABORT, 'transient io'); END;",
    )
    .expect("install trigger");

    let report = harness
        .scheduler
        .tick(ts(2))
        .expect("storage errors are settled inside the tick");
    assert_eq!(report.session_id.as_deref(), Some("s1"));
    assert_eq!(report.outcome, TickOutcome::Interrupted { failures: 1 });
    let entry = harness
        .scheduler
        .store()
        .with_db(|db| db.queue_entry("s1"))
        .expect("entry")
        .expect("row");
    assert_eq!(entry.state, ProcessingState::Queued);
    assert_eq!(entry.transient_failures, 1);

    conn.execute_batch("DROP TRIGGER fail_completion")
        .expect("drop trigger");
    drop(conn);

    let report = harness
        .scheduler
        .tick(ts(2) + Duration::seconds(30))
        .expect("tick");
    assert_eq!(report.outcome, TickOutcome::Completed);
    assert_eq!(report.session_id.as_deref(), Some("s2"));

    let (completed, _) = harness.drain(10);
    assert_eq!(completed, vec!["s1".to_string()]);
    let counts = harness
        .scheduler
        .store()
        .with_db(|db| db.queue_counts())
        .expect("counts");
    assert_eq!(counts.completed, 2);
    assert_eq!(counts.in_progress, 0);
}

#[test]
fn poison_session_is_terminal_after_six_failures_with_one_anomaly() {
    let dir = tempfile::tempdir().expect("temp dir");
    let scripts = BTreeMap::from([(
        "bad".to_string(),
        SessionScript {
            fail_times: 100,
            ..SessionScript::default()
        },
    )]);
    let harness = Harness::new(dir.path(), scripts);
    harness.enqueue("bad", 0);

    let mut outcomes = Vec::new();
    for step in 0..6 {
        outcomes.push(harness.scheduler.tick(ts(step * 60)).expect("tick").outcome);
    }
    assert!(outcomes[..5]
        .iter()
        .all(|outcome| matches!(outcome, TickOutcome::Retried { .. })));
    assert_eq!(outcomes[5], TickOutcome::Terminal);
    assert_eq!(harness.reasoner.summary_calls().len(), 6);

    let entry = harness
        .scheduler
        .store()
        .with_db(|db| db.queue_entry("bad"))
        .expect("entry")
        .expect("row");
    assert_eq!(entry.state, ProcessingState::FailedTerminal);
    assert_eq!(entry.transient_failures, 6);

    let anomalies = harness
        .scheduler
        .store()
        .with_db(|db| db.active_alerts(AlertClass::Anomaly, ts(400)))
        .expect("anomalies");
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].kind, ANOMALY_POISON_SESSION);
    assert_eq!(anomalies[0].session_id.as_deref(), Some("bad"));

    for step in 6..9 {
        let report = harness.scheduler.tick(ts(step * 60)).expect("tick");
        assert_eq!(report.outcome, TickOutcome::Idle);
    }
    assert_eq!(harness.reasoner.summary_calls().len(), 6);
}

#[test]
fn retried_session_goes_to_the_back_of_the_queue() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut scripts = BTreeMap::new();
    for id in ["a", "b", "c"] {
        scripts.insert(
            id.to_string(),
            SessionScript {
                decisions: vec![format!("decision {id}")],
                fail_times: u32::from(id == "a"),
                ..SessionScript::default()
            },
        );
    }
    let harness = Harness::new(dir.path(), scripts);
    harness.enqueue("a", 0);
    harness.enqueue("b", 1);
    harness.enqueue("c", 2);

    let (completed, _) = harness.drain(5);
    assert_eq!(completed, vec!["b".to_string(), "c".to_string(), "a".to_string()]);
    assert_eq!(
        harness.reasoner.summary_calls(),
        vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
            "a".to_string()
        ]
    );
}

#[test]
fn compression_with_reasoning_circuit_open_keeps_the_document() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut scripts = BTreeMap::new();
    for idx in 0..8 {
        scripts.insert(
            format!("s{idx}"),
            SessionScript {
                decisions: vec![format!("decision {idx} {}", "detail ".repeat(20))],
                failures: vec![format!("issue {idx} {}", "context ".repeat(20))],
                ..SessionScript::default()
            },
        );
    }
    let harness = Harness::new(dir.path(), scripts);
    for idx in 0..8 {
        harness.enqueue(&format!("s{idx}"), idx);
    }
    let (completed, minute) = harness.drain(10);
    assert_eq!(completed.len(), 8);

    let store = harness.scheduler.store();
    let gateway = harness.scheduler.gateway();
    let before = store.read_hot().expect("hot").document;
    let budget = before.token_estimate() * 2 / 3;

    for _ in 0..3 {
        gateway.monitor().report(
            Dependency::Reasoning,
            CallOutcome::Failure("reasoning down".to_string()),
            ts(minute),
        );
    }
    let report = store
        .compress(gateway, budget, ts(minute))
        .expect("compress");
    assert_eq!(report.outcome, CompressionOutcome::Skipped);
    let after = store.read_hot().expect("hot").document;
    assert_eq!(after, before);
    assert_eq!(after.token_estimate(), before.token_estimate());

    // Once the cooldown has elapsed the trial call goes through and compression runs.
    let report = store
        .compress(gateway, budget, ts(minute + 5))
        .expect("compress after cooldown");
    assert_eq!(report.outcome, CompressionOutcome::Compressed);
    assert!(report.tokens_after < report.tokens_before);
    assert_eq!(report.revision, Some(before.revision + 1));
}

#[test]
fn degradation_level_follows_circuits_and_hot_readability() {
    let dir = tempfile::tempdir().expect("temp dir");
    let scripts = BTreeMap::from([(
        "s1".to_string(),
        SessionScript {
            entities: vec![project("Atlas")],
            ..SessionScript::default()
        },
    )]);
    let harness = Harness::new(dir.path(), scripts);
    harness.enqueue("s1", 0);
    harness.drain(1);

    let coordinator = harness.coordinator();
    let monitor = harness.scheduler.gateway().monitor();
    assert_eq!(coordinator.status(ts(200)).expect("status").level, DegradationLevel::Full);

    for _ in 0..3 {
        monitor.report(Dependency::Archive, CallOutcome::Failure("down".to_string()), ts(200));
    }
    assert_eq!(
        coordinator.status(ts(200)).expect("status").level,
        DegradationLevel::Partial
    );

    for _ in 0..3 {
        monitor.report(Dependency::Reasoning, CallOutcome::Failure("down".to_string()), ts(200));
    }
    assert_eq!(
        coordinator.status(ts(200)).expect("status").level,
        DegradationLevel::Minimal
    );

    // Reopen the same data directory with the durable copy corrupted.
    let conn = rusqlite::Connection::open(dir.path().join("memory.db")).expect("raw conn");
    conn.execute("UPDATE master_revisions SET document_json = '{'", [])
        .expect("corrupt revisions");
    drop(conn);
    let reopened = TieredMemoryStore::open(dir.path()).expect("reopen");
    let degraded = BootstrapCoordinator::new(reopened.clone(), monitor.clone(), HotBudget::default());
    let status = degraded.status(ts(201)).expect("status");
    assert_eq!(status.hot_source, Some(HotSource::LastGood));
    assert_eq!(status.level, DegradationLevel::Minimal);
    assert!(reopened
        .read_hot()
        .expect("last good")
        .document
        .entry(ContextSection::Projects, "atlas")
        .is_some());

    std::fs::remove_file(dir.path().join("master_context.last_good.json")).expect("remove cache");
    let offline_store = TieredMemoryStore::open(dir.path()).expect("reopen");
    let offline = BootstrapCoordinator::new(offline_store.clone(), monitor.clone(), HotBudget::default());
    assert_eq!(
        offline.status(ts(202)).expect("status").level,
        DegradationLevel::Offline
    );

    let gateway = PortGateway::new(
        harness.reasoner.clone(),
        harness.archive.clone(),
        monitor.clone(),
        Default::default(),
    );
    let scheduler = PipelineScheduler::new(offline_store, gateway, SchedulerConfig::default(), ts(202))
        .expect("scheduler");
    let err = ToolSurface::new(&scheduler)
        .load_context(None, ts(202))
        .expect_err("no tier readable");
    assert!(matches!(err, MemoryError::NoContextAvailable));

    // Rebuilding from the ledger restores a readable hot tier above the corrupt revision.
    let rebuilt = offline
        .rebuild_master(ts(203))
        .expect("rebuild");
    assert_eq!(rebuilt.revision, 2);
    assert_eq!(
        offline.status(ts(203)).expect("status").hot_source,
        Some(HotSource::Live)
    );
}

#[test]
fn archive_outage_queues_records_until_the_next_tick() {
    let dir = tempfile::tempdir().expect("temp dir");
    let scripts = five_sessions();
    let harness = Harness::new(dir.path(), scripts);
    let monitor = harness.scheduler.gateway().monitor();
    for _ in 0..3 {
        monitor.report(Dependency::Archive, CallOutcome::Failure("down".to_string()), ts(0));
    }
    harness.enqueue("s1", 0);

    let report = harness.scheduler.tick(ts(0)).expect("tick");
    assert_eq!(report.outcome, TickOutcome::Completed);
    assert!(report.revision.is_some());
    assert!(harness.archive.documents.lock().expect("archive lock").is_empty());
    let pending = harness
        .scheduler
        .store()
        .with_db(|db| db.ledger_counts())
        .expect("counts")
        .undelivered;
    assert!(pending > 0);

    let report = harness.scheduler.tick(ts(5)).expect("tick");
    assert_eq!(report.outcome, TickOutcome::Idle);
    assert_eq!(report.outbox.pending, 0);
    assert_eq!(
        harness.archive.documents.lock().expect("archive lock").len() as u64,
        pending
    );
}
