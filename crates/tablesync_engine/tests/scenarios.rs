//! End-to-end sync runs against in-memory endpoints.

use std::sync::Arc;
use std::time::Duration;
use tablesync_engine::{
    CheckpointStore, CrossReferenceResolver, EndpointError, EndpointOp,
    EngineConfig, ErrorKind, FileCheckpointStore, MemoryAuditSink, MemoryEndpoint,
    MemoryLinkedTables, MockClock, PhaseStatus, RateLimitConfig, RetryConfig, RunStatus,
    SyncOrchestrator, SyncPhase,
};
use tablesync_protocol::{
    Checkpoint, ConflictPolicy, FieldMapEntry, FieldMapping, FieldType, FieldValue, Row, RowId,
    Schema, SchemaField, Side, SyncConfiguration, SyncDirection,
};
use tablesync_testkit::prelude::*;

type Orchestrator = SyncOrchestrator<MemoryEndpoint, MemoryEndpoint>;

struct Harness {
    left: Arc<MemoryEndpoint>,
    right: Arc<MemoryEndpoint>,
    clock: Arc<MockClock>,
    sync: Orchestrator,
}

fn engine() -> EngineConfig {
    EngineConfig::new()
        .with_left_rate_limit(RateLimitConfig::unlimited())
        .with_right_rate_limit(RateLimitConfig::unlimited())
        .with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(10))
                .with_jitter(false),
        )
}

/// Left rows are stored as given; right rows are canonical and converted to
/// columns with `mapping`.
fn harness_with(
    engine: EngineConfig,
    mapping: &FieldMapping,
    left: Vec<Row>,
    right: Vec<Row>,
) -> Harness {
    let left = Arc::new(MemoryEndpoint::new("records").with_rows(left));
    let right = Arc::new(MemoryEndpoint::new("sheet").with_rows(sheet_rows(mapping, &right)));
    let clock = Arc::new(MockClock::default());
    let sync = SyncOrchestrator::new(Arc::clone(&left), Arc::clone(&right), engine)
        .with_clock(clock.clone());
    Harness {
        left,
        right,
        clock,
        sync,
    }
}

fn harness(mapping: &FieldMapping, left: Vec<Row>, right: Vec<Row>) -> Harness {
    harness_with(engine(), mapping, left, right)
}

fn config(mapping: FieldMapping, direction: SyncDirection) -> SyncConfiguration {
    SyncConfiguration::new("people", mapping).with_direction(direction)
}

fn canonical_right(h: &Harness, mapping: &FieldMapping, id: &str) -> Option<Row> {
    h.right
        .row(&RowId::from(id))
        .map(|row| mapping.project_right(&row))
}

#[test]
fn clean_add_to_empty_sheet() {
    let mapping = plain_mapping();
    let h = harness(&mapping, numbered_people(3), Vec::new());
    let cfg = config(mapping.clone(), SyncDirection::LeftToRight);

    let outcome = h.sync.run_sync(&cfg, &Checkpoint::empty("people"));
    let report = &outcome.report;

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.detection.left_added, 3);
    assert_eq!(report.left_to_right.added, 3);
    assert_eq!(report.total_writes(), 3);
    assert_eq!(h.right.len(), 3);
    let r1 = h.right.row(&RowId::from("r01")).unwrap();
    assert_eq!(r1.field("A"), Some(&FieldValue::Text("Person 1".into())));
    assert_eq!(r1.field("B"), Some(&FieldValue::Text("person1@example.com".into())));

    assert_eq!(outcome.checkpoint.len(), 3);
    let entry = outcome.checkpoint.get(&RowId::from("r02")).unwrap();
    assert_eq!(entry.left_hash, numbered_people(3)[1].content_hash());
    assert_eq!(entry.left_hash, entry.right_hash);
    assert!(outcome.checkpoint.taken_at.is_some());
}

#[test]
fn second_run_is_idempotent() {
    let mapping = plain_mapping();
    let h = harness(&mapping, numbered_people(5), Vec::new());
    let cfg = config(mapping, SyncDirection::Bidirectional);

    let first = h.sync.run_sync(&cfg, &Checkpoint::empty("people"));
    assert_eq!(first.report.total_writes(), 5);

    let second = h.sync.run_sync(&cfg, &first.checkpoint);
    assert_eq!(second.report.status, RunStatus::Success);
    assert_eq!(second.report.total_writes(), 0);
    assert_eq!(second.report.detection.unchanged, 5);
    assert_eq!(second.checkpoint.entries, first.checkpoint.entries);
    assert_eq!(h.right.call_count(EndpointOp::Create), 1);
}

#[test]
fn updates_keep_unmapped_fields_and_clear_emptied_ones() {
    let mapping = plain_mapping();
    let base = person_with_status("r1", "Ada", "Todo");
    let stored = with_value(&base, "fldNotes", FieldValue::Text("met at the summit".into()));
    let mut right = with_value(&base, "fldName", FieldValue::Text("Ada Lovelace".into()));
    right.fields.remove("fldStatus");
    let h = harness(&mapping, vec![stored], vec![right.clone()]);
    let cfg = config(mapping.clone(), SyncDirection::Bidirectional);

    let outcome = h.sync.run_sync(&cfg, &checkpoint_of("people", &[base]));
    assert_eq!(outcome.report.status, RunStatus::Success);
    assert_eq!(outcome.report.right_to_left.updated, 1);

    let left = h.left.row(&RowId::from("r1")).unwrap();
    assert_eq!(left.field("fldName"), Some(&FieldValue::Text("Ada Lovelace".into())));
    assert_eq!(
        left.field("fldNotes"),
        Some(&FieldValue::Text("met at the summit".into()))
    );
    assert_eq!(left.field("fldStatus"), None);
    assert_eq!(mapping.project_left(&left).fields, right.fields);

    let again = h.sync.run_sync(&cfg, &outcome.checkpoint);
    assert_eq!(again.report.total_writes(), 0);
}

#[test]
fn bidirectional_conflict_right_wins() {
    let mapping = plain_mapping();
    let base = person("r1", "Ada", "ada@example.com");
    let left = with_value(&base, "fldName", FieldValue::Text("Ada L.".into()));
    let right = with_value(&base, "fldName", FieldValue::Text("Ada Lovelace".into()));
    let h = harness(&mapping, vec![left], vec![right.clone()]);
    let cfg = config(mapping.clone(), SyncDirection::Bidirectional)
        .with_policy(ConflictPolicy::RightWins);

    let outcome = h.sync.run_sync(&cfg, &checkpoint_of("people", &[base]));
    let report = &outcome.report;

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.detection.both_changed, 1);
    assert_eq!(report.conflicts.right_won, 1);
    assert_eq!(report.right_to_left.updated, 1);
    assert_eq!(report.left_to_right.total(), 0);
    assert_eq!(report.resolutions[0].winner, Side::Right);
    assert_eq!(report.resolutions[0].rationale, "policy right_wins");

    let stored = h.left.row(&RowId::from("r1")).unwrap();
    assert_eq!(stored.field("fldName"), Some(&FieldValue::Text("Ada Lovelace".into())));
    let entry = outcome.checkpoint.get(&RowId::from("r1")).unwrap();
    assert_eq!(entry.left_hash, right.content_hash());

    let again = h.sync.run_sync(&cfg, &outcome.checkpoint);
    assert_eq!(again.report.total_writes(), 0);
    assert_eq!(again.report.detection.unchanged, 1);
}

#[test]
fn newest_wins_follows_timestamps() {
    let mapping = plain_mapping();
    let base = person("r1", "Ada", "ada@example.com");
    let left = with_value(&base, "fldEmail", FieldValue::Text("old@example.com".into()))
        .with_modified_at(ts(100));
    let right = with_value(&base, "fldEmail", FieldValue::Text("new@example.com".into()))
        .with_modified_at(ts(200));
    let h = harness(&mapping, vec![left], vec![right]);
    let cfg = config(mapping, SyncDirection::Bidirectional).with_policy(ConflictPolicy::NewestWins);

    let outcome = h.sync.run_sync(&cfg, &checkpoint_of("people", &[base]));
    assert_eq!(outcome.report.conflicts.right_won, 1);
    assert!(outcome.report.resolutions[0].rationale.starts_with("newest_wins"));
    assert_eq!(
        h.left.row(&RowId::from("r1")).unwrap().field("fldEmail"),
        Some(&FieldValue::Text("new@example.com".into()))
    );
}

#[test]
fn first_sync_collision_is_a_conflict() {
    let mapping = plain_mapping();
    let h = harness(
        &mapping,
        vec![person("r1", "Ada", "ada@example.com")],
        vec![person("r1", "Ada", "ada@work.example.com")],
    );
    let cfg = config(mapping.clone(), SyncDirection::Bidirectional)
        .with_policy(ConflictPolicy::LeftWins);

    let outcome = h.sync.run_sync(&cfg, &Checkpoint::empty("people"));
    assert_eq!(outcome.report.detection.both_changed, 1);
    assert_eq!(outcome.report.conflicts.left_won, 1);
    assert_eq!(outcome.report.left_to_right.updated, 1);
    assert_eq!(
        canonical_right(&h, &mapping, "r1").unwrap().field("fldEmail"),
        Some(&FieldValue::Text("ada@example.com".into()))
    );
}

#[test]
fn deletes_propagate_and_leave_checkpoint() {
    let mapping = plain_mapping();
    let rows = numbered_people(3);
    let h = harness(&mapping, rows[..2].to_vec(), rows.clone());
    let cfg = config(mapping, SyncDirection::LeftToRight);

    let outcome = h.sync.run_sync(&cfg, &checkpoint_of("people", &rows));
    assert_eq!(outcome.report.detection.left_deleted, 1);
    assert_eq!(outcome.report.left_to_right.deleted, 1);
    assert!(h.right.row(&RowId::from("r03")).is_none());
    assert!(outcome.checkpoint.get(&RowId::from("r03")).is_none());
    assert_eq!(outcome.checkpoint.len(), 2);
}

#[test]
fn rows_deleted_on_both_sides_are_forgotten() {
    let mapping = plain_mapping();
    let rows = numbered_people(2);
    let h = harness(&mapping, rows[..1].to_vec(), rows[..1].to_vec());
    let cfg = config(mapping, SyncDirection::Bidirectional);

    let outcome = h.sync.run_sync(&cfg, &checkpoint_of("people", &rows));
    assert_eq!(outcome.report.detection.both_deleted, 1);
    assert_eq!(outcome.report.total_writes(), 0);
    assert_eq!(outcome.checkpoint.len(), 1);
}

#[test]
fn update_delete_conflict_left_deletion_wins() {
    let mapping = plain_mapping();
    let base = person("r1", "Ada", "ada@example.com");
    let right = with_value(&base, "fldName", FieldValue::Text("Countess".into()));
    let h = harness(&mapping, Vec::new(), vec![right]);
    let cfg = config(mapping, SyncDirection::Bidirectional).with_policy(ConflictPolicy::LeftWins);

    let outcome = h.sync.run_sync(&cfg, &checkpoint_of("people", &[base]));
    assert_eq!(outcome.report.conflicts.left_won, 1);
    assert!(outcome.report.resolutions[0].deleted);
    assert_eq!(outcome.report.left_to_right.deleted, 1);
    assert!(h.right.is_empty());
    assert!(outcome.checkpoint.is_empty());
}

#[test]
fn one_bad_row_does_not_sink_the_batch() {
    let mapping = plain_mapping();
    let original = numbered_people(10);
    let edited: Vec<Row> = original
        .iter()
        .map(|row| {
            let email = format!("{}@new.example.com", row.id);
            with_value(row, "fldEmail", FieldValue::Text(email))
        })
        .collect();
    let h = harness(&mapping, edited.clone(), original.clone());
    h.right
        .fail_writes_of("r04", EndpointError::validation("r04", "invalid email"));
    let cfg = config(mapping, SyncDirection::LeftToRight);
    let checkpoint = checkpoint_of("people", &original);

    let outcome = h.sync.run_sync(&cfg, &checkpoint);
    let report = &outcome.report;

    assert_eq!(report.status, RunStatus::Partial);
    assert_eq!(report.left_to_right.updated, 9);
    assert_eq!(report.error_count(), 1);
    let (phase, error) = report.errors().next().unwrap();
    assert_eq!(phase, SyncPhase::WritingLeftToRight);
    assert_eq!(error.kind, ErrorKind::Validation);
    assert_eq!(error.row_id, Some(RowId::from("r04")));
    assert_eq!(
        report.phase_status(SyncPhase::WritingLeftToRight),
        PhaseStatus::PartiallySucceeded
    );
    // One rejected batch of ten, then ten single-row replays.
    assert_eq!(h.right.call_count(EndpointOp::Update), 11);

    for (old, new) in original.iter().zip(&edited) {
        let entry = outcome.checkpoint.get(&old.id).unwrap();
        if old.id.as_str() == "r04" {
            assert_eq!(entry.left_hash, old.content_hash());
        } else {
            assert_eq!(entry.left_hash, new.content_hash());
        }
    }

    h.right.clear_row_failures();
    let retry = h.sync.run_sync(&cfg, &outcome.checkpoint);
    assert_eq!(retry.report.status, RunStatus::Success);
    assert_eq!(retry.report.left_to_right.updated, 1);
}

#[test]
fn transient_write_errors_are_retried() {
    let mapping = plain_mapping();
    let h = harness(&mapping, numbered_people(2), Vec::new());
    h.right.fail_next(
        EndpointOp::Create,
        EndpointError::Server {
            status: 503,
            message: "unavailable".into(),
        },
    );
    let cfg = config(mapping, SyncDirection::LeftToRight);

    let outcome = h.sync.run_sync(&cfg, &Checkpoint::empty("people"));
    assert_eq!(outcome.report.status, RunStatus::Success);
    assert_eq!(h.right.call_count(EndpointOp::Create), 2);
    assert_eq!(h.right.len(), 2);
    assert!(h.clock.total_slept() >= Duration::from_millis(10));
}

#[test]
fn checkpoint_kept_when_every_write_fails() {
    let mapping = plain_mapping();
    let h = harness(&mapping, numbered_people(1), Vec::new());
    h.right
        .fail_writes_of("r01", EndpointError::validation("r01", "rejected"));
    let cfg = config(mapping, SyncDirection::LeftToRight);
    let checkpoint = Checkpoint::empty("people");

    let outcome = h.sync.run_sync(&cfg, &checkpoint);
    assert_eq!(outcome.report.status, RunStatus::Partial);
    assert_eq!(
        outcome.report.phase_status(SyncPhase::WritingLeftToRight),
        PhaseStatus::Failed
    );
    let update = outcome.report.phase(SyncPhase::UpdatingCheckpoint).unwrap();
    assert_eq!(update.status, PhaseStatus::Skipped);
    assert_eq!(update.warnings.len(), 1);
    assert_eq!(outcome.checkpoint, checkpoint);
}

#[test]
fn linked_fields_translate_in_both_directions() {
    let mapping = people_mapping();
    let tables = Arc::new(MemoryLinkedTables::new());
    tables.insert(TEAMS_TABLE, "recEng", "Engineering");

    let left = person("r1", "Ada", "ada@example.com")
        .with_field("fldTeam", FieldValue::Links(vec!["recEng".into()]));
    let right = person("r2", "Grace", "grace@example.com")
        .with_field("fldTeam", FieldValue::Text("Engineering, Design".into()));
    let h = harness(&mapping, vec![left], vec![right]);
    let resolver = CrossReferenceResolver::new(
        tables.clone(),
        h.sync.left_guard(),
        Duration::from_secs(300),
        h.clock.clone(),
    );
    let sync = h.sync.with_cross_references(Arc::new(resolver));
    let cfg = config(mapping, SyncDirection::Bidirectional);

    let outcome = sync.run_sync(&cfg, &Checkpoint::empty("people"));
    assert_eq!(outcome.report.status, RunStatus::Success);
    assert_eq!(outcome.report.left_to_right.added, 1);
    assert_eq!(outcome.report.right_to_left.added, 1);

    let on_sheet = h.right.row(&RowId::from("r1")).unwrap();
    assert_eq!(
        on_sheet.field("D"),
        Some(&FieldValue::Links(vec!["Engineering".into()]))
    );

    let on_records = h.left.row(&RowId::from("r2")).unwrap();
    assert_eq!(
        on_records.field("fldTeam"),
        Some(&FieldValue::Links(vec!["recEng".into(), "Teams-1".into()]))
    );
    assert_eq!(tables.create_calls(), 1);
    assert!(tables.labels(TEAMS_TABLE).iter().any(|l| l.label == "Design"));

    let again = sync.run_sync(&cfg, &outcome.checkpoint);
    assert_eq!(again.report.total_writes(), 0);
}

#[test]
fn unknown_label_is_a_row_error() {
    let mapping = FieldMapping::new(vec![
        FieldMapEntry::new("fldName", 0),
        FieldMapEntry::new("fldTeam", 3).linked(TEAMS_TABLE, false),
    ]);
    let tables = Arc::new(MemoryLinkedTables::new());
    tables.insert(TEAMS_TABLE, "recEng", "Engineering");

    let ok = Row::new("r1")
        .with_field("fldName", FieldValue::Text("Ada".into()))
        .with_field("fldTeam", FieldValue::Text("engineering".into()));
    let bad = Row::new("r2")
        .with_field("fldName", FieldValue::Text("Grace".into()))
        .with_field("fldTeam", FieldValue::Text("Navy".into()));
    let h = harness(&mapping, Vec::new(), vec![ok, bad]);
    let resolver = CrossReferenceResolver::new(
        tables.clone(),
        h.sync.left_guard(),
        Duration::from_secs(300),
        h.clock.clone(),
    );
    let sync = h.sync.with_cross_references(Arc::new(resolver));
    let cfg = config(mapping, SyncDirection::RightToLeft);

    let outcome = sync.run_sync(&cfg, &Checkpoint::empty("people"));
    assert_eq!(outcome.report.status, RunStatus::Partial);
    assert_eq!(outcome.report.right_to_left.added, 1);
    let (_, error) = outcome.report.errors().next().unwrap();
    assert_eq!(error.kind, ErrorKind::Transform);
    assert_eq!(error.row_id, Some(RowId::from("r2")));
    assert!(h.left.row(&RowId::from("r2")).is_none());
    assert_eq!(
        h.left.row(&RowId::from("r1")).unwrap().field("fldTeam"),
        Some(&FieldValue::Links(vec!["recEng".into()]))
    );
    assert_eq!(tables.create_calls(), 0);
    assert!(outcome.checkpoint.get(&RowId::from("r2")).is_none());
}

#[test]
fn cross_reference_cache_expires_after_ttl() {
    let mapping = people_mapping();
    let tables = Arc::new(MemoryLinkedTables::new());
    tables.insert(TEAMS_TABLE, "recEng", "Engineering");
    let left = person("r1", "Ada", "ada@example.com")
        .with_field("fldTeam", FieldValue::Links(vec!["recEng".into()]));
    let h = harness(&mapping, vec![left], Vec::new());
    let resolver = CrossReferenceResolver::new(
        tables.clone(),
        h.sync.left_guard(),
        Duration::from_secs(60),
        h.clock.clone(),
    );
    let sync = h.sync.with_cross_references(Arc::new(resolver));
    let cfg = config(mapping, SyncDirection::LeftToRight);

    let first = sync.run_sync(&cfg, &Checkpoint::empty("people"));
    let second = sync.run_sync(&cfg, &first.checkpoint);
    assert_eq!(tables.fetch_count(TEAMS_TABLE), 1);
    assert_eq!(second.report.total_writes(), 0);

    tables.rename(TEAMS_TABLE, &RowId::from("recEng"), "Platform");
    h.clock.advance(Duration::from_secs(61));
    let third = sync.run_sync(&cfg, &second.checkpoint);
    assert_eq!(tables.fetch_count(TEAMS_TABLE), 2);
    assert_eq!(third.report.left_to_right.updated, 1);
    assert_eq!(
        h.right.row(&RowId::from("r1")).unwrap().field("D"),
        Some(&FieldValue::Links(vec!["Platform".into()]))
    );
}

#[test]
fn dropdown_mismatch_is_a_warning() {
    let mapping = plain_mapping();
    let left = Arc::new(
        MemoryEndpoint::new("records")
            .with_rows(vec![person_with_status("r1", "Ada", "Blocked")])
            .with_schema(Schema::new(vec![SchemaField::new(
                "fldStatus",
                "Status",
                FieldType::SingleSelect,
            )
            .with_choices(["Todo", "Done"])])),
    );
    let right = Arc::new(MemoryEndpoint::new("sheet"));
    let sync = SyncOrchestrator::new(left, Arc::clone(&right), engine())
        .with_clock(Arc::new(MockClock::default()));

    let outcome = sync.run_sync(
        &config(mapping, SyncDirection::LeftToRight),
        &Checkpoint::empty("people"),
    );
    assert_eq!(outcome.report.status, RunStatus::Success);
    assert_eq!(outcome.report.choice_fields.len(), 1);
    assert_eq!(outcome.report.choice_fields[0].column_label(), "C");

    let write = outcome.report.phase(SyncPhase::WritingLeftToRight).unwrap();
    assert!(write.warnings.iter().any(|w| w.contains("Blocked")));
    assert_eq!(right.len(), 1);
}

#[test]
fn rate_limit_spaces_requests() {
    let mapping = plain_mapping();
    let engine = engine().with_right_rate_limit(RateLimitConfig::new(5));
    let h = harness_with(engine, &mapping, numbered_people(25), Vec::new());
    let cfg = config(mapping, SyncDirection::LeftToRight);

    let outcome = h.sync.run_sync(&cfg, &Checkpoint::empty("people"));
    assert_eq!(outcome.report.left_to_right.added, 25);

    // One list call and three create batches of at most ten rows.
    let stats = h.sync.right_guard().limiter().stats();
    assert_eq!(stats.executed, 4);
    assert!(stats.waited >= Duration::from_millis(600));
    assert_eq!(h.right.call_count(EndpointOp::Create), 3);
}

#[test]
fn cancelled_run_writes_nothing_until_reset() {
    let mapping = plain_mapping();
    let h = harness(&mapping, numbered_people(2), Vec::new());
    let cfg = config(mapping, SyncDirection::LeftToRight);
    let token = h.sync.cancellation_token();

    token.cancel();
    let cancelled = h.sync.run_sync(&cfg, &Checkpoint::empty("people"));
    assert!(cancelled.report.cancelled);
    assert!(h.right.is_empty());

    token.reset();
    let resumed = h.sync.run_sync(&cfg, &cancelled.checkpoint);
    assert!(!resumed.report.cancelled);
    assert_eq!(h.right.len(), 2);
}

#[test]
fn audit_sink_sees_every_run() {
    let mapping = plain_mapping();
    let h = harness(&mapping, numbered_people(1), Vec::new());
    let sink = Arc::new(MemoryAuditSink::new());
    let sync = h.sync.with_audit_sink(sink.clone());
    let cfg = config(mapping, SyncDirection::LeftToRight);

    let outcome = sync.run_sync(&cfg, &Checkpoint::empty("people"));
    sync.run_sync(&cfg, &outcome.checkpoint);

    let reports = sink.reports();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].run_id, outcome.report.run_id);
    assert_ne!(reports[0].run_id, reports[1].run_id);
    assert_eq!(sync.stats().runs_completed, 2);
    assert_eq!(sync.stats().rows_written, 1);
}

#[test]
fn file_store_round_trip_between_runs() {
    let state = TempStateDir::new();
    let store = FileCheckpointStore::open(state.path()).unwrap();
    let mapping = plain_mapping();
    let h = harness(&mapping, numbered_people(3), Vec::new());
    let cfg = config(mapping, SyncDirection::LeftToRight);

    {
        let _lock = store.lock(&cfg.id).unwrap();
        let checkpoint = store.load(&cfg.id).unwrap();
        let outcome = h.sync.run_sync(&cfg, &checkpoint);
        store.save(&outcome.checkpoint).unwrap();
    }

    let _lock = store.lock(&cfg.id).unwrap();
    let loaded = store.load(&cfg.id).unwrap();
    assert_eq!(loaded.len(), 3);
    let outcome = h.sync.run_sync(&cfg, &loaded);
    assert_eq!(outcome.report.total_writes(), 0);
}
