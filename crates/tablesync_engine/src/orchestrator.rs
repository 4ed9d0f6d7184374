//! Sync orchestrator state machine.
//!
//! One call to [`SyncOrchestrator::run_sync`] walks the phases
//! `Fetching → DetectingConflicts → ResolvingConflicts → WritingLeftToRight →
//! WritingRightToLeft → UpdatingCheckpoint → Done`, recording a
//! [`PhaseReport`] for each. Phase errors are collected, never raised: the
//! caller always gets a [`RunReport`] and a checkpoint back.

use crate::audit::AuditSink;
use crate::cancel::CancellationToken;
use crate::choices::{ChoiceFieldInspector, ChoiceInspection};
use crate::clock::{Clock, SystemClock};
use crate::config::{EngineConfig, RateLimitConfig};
use crate::crossref::{normalize_label, CrossReferenceResolver};
use crate::detector::{ConflictDetector, Detection};
use crate::endpoint::{fetch_all_rows, EndpointClient, RowSelector};
use crate::error::{EndpointResult, ErrorKind, SyncError};
use crate::report::{
    PhaseError, PhaseReport, PhaseStatus, ResolutionLogEntry, RunReport, RunStatus, SyncPhase,
    WriteCounts,
};
use crate::resolver::ConflictResolver;
use crate::retry::ApiGuard;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tablesync_protocol::{
    Checkpoint, CheckpointEntry, ConflictRecord, FieldMapping, FieldValue, Resolution, Row, RowId,
    Side, Snapshot, SyncConfiguration, CHECKPOINT_VERSION,
};
use tracing::{debug, info, warn};

/// What a run hands back: its report and the checkpoint to persist.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    /// The run report.
    pub report: RunReport,
    /// The new checkpoint; the input checkpoint when nothing may change.
    pub checkpoint: Checkpoint,
}

/// Counters across the runs of one orchestrator.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorStats {
    /// Runs finished, whatever their status.
    pub runs_completed: u64,
    /// Runs whose status was `Failed`.
    pub runs_failed: u64,
    /// Rows written in either direction.
    pub rows_written: u64,
    /// Conflicts detected.
    pub conflicts_encountered: u64,
    /// End of the last run.
    pub last_run_at: Option<DateTime<Utc>>,
    /// First error of the last run, if any.
    pub last_error: Option<String>,
}

/// Runs sync configurations between a record endpoint (left) and a
/// spreadsheet endpoint (right).
///
/// The orchestrator is reusable: it holds the per-service guards, so
/// successive or concurrent runs against the same services share their rate
/// limits. It does not serialize runs of the same configuration; see
/// [`crate::FileCheckpointStore::lock`].
pub struct SyncOrchestrator<L: EndpointClient, R: EndpointClient> {
    engine: EngineConfig,
    left: Arc<L>,
    right: Arc<R>,
    left_guard: Arc<ApiGuard>,
    right_guard: Arc<ApiGuard>,
    clock: Arc<dyn Clock>,
    cross_refs: Option<Arc<CrossReferenceResolver>>,
    audit: Option<Arc<dyn AuditSink>>,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    inspector: ChoiceFieldInspector,
    cancel: CancellationToken,
    phase: RwLock<Option<SyncPhase>>,
    stats: RwLock<OrchestratorStats>,
}

impl<L: EndpointClient, R: EndpointClient> SyncOrchestrator<L, R> {
    /// Creates an orchestrator on the system clock.
    pub fn new(left: Arc<L>, right: Arc<R>, engine: EngineConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let (left_guard, right_guard) = build_guards(&*left, &*right, &engine, &clock);
        Self {
            engine,
            left,
            right,
            left_guard,
            right_guard,
            clock,
            cross_refs: None,
            audit: None,
            detector: ConflictDetector::new(),
            resolver: ConflictResolver::new(),
            inspector: ChoiceFieldInspector::new(),
            cancel: CancellationToken::new(),
            phase: RwLock::new(None),
            stats: RwLock::new(OrchestratorStats::default()),
        }
    }

    /// Replaces the clock. Rebuilds the guards, so call this before
    /// [`Self::with_guards`].
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        let (left_guard, right_guard) = build_guards(&*self.left, &*self.right, &self.engine, &clock);
        self.left_guard = left_guard;
        self.right_guard = right_guard;
        self.clock = clock;
        self
    }

    /// Uses existing guards, e.g. to share rate limits with other
    /// orchestrators talking to the same services.
    pub fn with_guards(mut self, left: Arc<ApiGuard>, right: Arc<ApiGuard>) -> Self {
        self.left_guard = left;
        self.right_guard = right;
        self
    }

    /// Enables linked-record translation.
    pub fn with_cross_references(mut self, resolver: Arc<CrossReferenceResolver>) -> Self {
        self.cross_refs = Some(resolver);
        self
    }

    /// Sends every finished report to `sink`.
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Guard of the record endpoint.
    pub fn left_guard(&self) -> Arc<ApiGuard> {
        Arc::clone(&self.left_guard)
    }

    /// Guard of the spreadsheet endpoint.
    pub fn right_guard(&self) -> Arc<ApiGuard> {
        Arc::clone(&self.right_guard)
    }

    /// Token that cancels runs at the next phase boundary.
    ///
    /// A cancelled token stays cancelled until reset.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Engine settings.
    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine
    }

    /// Phase currently executing; `Done` after a run, `None` before the first.
    pub fn phase(&self) -> Option<SyncPhase> {
        *self.phase.read()
    }

    /// Counters across runs.
    pub fn stats(&self) -> OrchestratorStats {
        self.stats.read().clone()
    }

    /// Runs one configuration.
    ///
    /// `checkpoint` is never modified; the outcome carries the checkpoint the
    /// caller should persist.
    pub fn run_sync(&self, config: &SyncConfiguration, checkpoint: &Checkpoint) -> SyncOutcome {
        let started = self.clock.now();
        let mut report = RunReport::start(config.id.clone(), self.clock.wall());
        info!(
            config_id = %config.id,
            run_id = %report.run_id,
            direction = ?config.direction,
            "sync run started"
        );

        let checkpoint = if config.active {
            self.execute(config, checkpoint, &mut report)
        } else {
            info!(config_id = %config.id, "configuration inactive, nothing to do");
            report.phases = SyncPhase::REPORTED
                .iter()
                .map(|phase| PhaseReport::skipped(*phase))
                .collect();
            checkpoint.clone()
        };

        self.finish(&mut report, started);
        SyncOutcome { report, checkpoint }
    }

    fn execute(
        &self,
        config: &SyncConfiguration,
        checkpoint: &Checkpoint,
        report: &mut RunReport,
    ) -> Checkpoint {
        let mut rec = self.begin(SyncPhase::Fetching);
        let fetched = self.fetch(config, &mut rec);
        report.phases.push(rec.finish(self.clock.now()));
        let Some(fetched) = fetched else {
            skip_after(report, SyncPhase::Fetching, "fetch failed");
            return checkpoint.clone();
        };
        if let Some(choices) = &fetched.choices {
            report.choice_fields = choices.fields.clone();
        }
        if self.stop_requested(report, SyncPhase::Fetching) {
            return checkpoint.clone();
        }

        let mut rec = self.begin(SyncPhase::DetectingConflicts);
        let base = match checkpoint.validate_for(&config.id) {
            Ok(()) => checkpoint.clone(),
            Err(err) => {
                rec.warn(format!("[state] checkpoint ignored, every row treated as new: {err}"));
                Checkpoint::empty(config.id.clone())
            }
        };
        let mut detection = self.detector.detect(&base, &fetched.left, &fetched.right);
        report.detection = detection.counts();
        report.phases.push(rec.finish(self.clock.now()));
        if self.stop_requested(report, SyncPhase::DetectingConflicts) {
            return checkpoint.clone();
        }

        if config.direction.is_bidirectional() {
            let mut rec = self.begin(SyncPhase::ResolvingConflicts);
            self.resolve_conflicts(config, &mut detection.both_changed, report, &mut rec);
            report.phases.push(rec.finish(self.clock.now()));
        } else {
            source_wins(config, &mut detection.both_changed, report);
            report
                .phases
                .push(PhaseReport::skipped(SyncPhase::ResolvingConflicts));
        }
        if self.stop_requested(report, SyncPhase::ResolvingConflicts) {
            return checkpoint.clone();
        }

        let mut attempted = 0usize;

        let mut to_right = Vec::new();
        if config.direction.writes_left_to_right() {
            let mut rec = self.begin(SyncPhase::WritingLeftToRight);
            let mut plan = WritePlan::for_leg(&fetched.left, &fetched.right, &detection, Side::Left);
            plan.clear_unset(&config.mapping);
            attempted += plan.len();
            self.prepare_for_right(config, &mut plan, fetched.choices.as_ref(), &mut rec);
            to_right = self.write_leg(
                &*self.right,
                &self.right_guard,
                &self.engine.right_rate_limit,
                plan,
                &mut rec,
            );
            report.left_to_right = write_counts(&to_right);
            report.phases.push(rec.finish(self.clock.now()));
        } else {
            report
                .phases
                .push(PhaseReport::skipped(SyncPhase::WritingLeftToRight));
        }
        if self.stop_requested(report, SyncPhase::WritingLeftToRight) {
            return checkpoint.clone();
        }

        let mut to_left = Vec::new();
        if config.direction.writes_right_to_left() {
            let mut rec = self.begin(SyncPhase::WritingRightToLeft);
            let mut plan = WritePlan::for_leg(&fetched.right, &fetched.left, &detection, Side::Right);
            plan.clear_unset(&config.mapping);
            attempted += plan.len();
            self.prepare_for_left(config, &mut plan, &mut rec);
            to_left = self.write_leg(
                &*self.left,
                &self.left_guard,
                &self.engine.left_rate_limit,
                plan,
                &mut rec,
            );
            report.right_to_left = write_counts(&to_left);
            report.phases.push(rec.finish(self.clock.now()));
        } else {
            report
                .phases
                .push(PhaseReport::skipped(SyncPhase::WritingRightToLeft));
        }
        if self.stop_requested(report, SyncPhase::WritingRightToLeft) {
            return checkpoint.clone();
        }

        if attempted > 0 && to_right.is_empty() && to_left.is_empty() {
            warn!(config_id = %config.id, attempted, "no write committed, keeping checkpoint");
            report.phases.push(PhaseReport::skipped_because(
                SyncPhase::UpdatingCheckpoint,
                format!("none of {attempted} planned write(s) committed; checkpoint unchanged"),
            ));
            return checkpoint.clone();
        }

        let rec = self.begin(SyncPhase::UpdatingCheckpoint);
        let next = self.next_checkpoint(config, &base, &fetched, &detection, &to_right, &to_left);
        debug!(entries = next.len(), "derived checkpoint");
        report.phases.push(rec.finish(self.clock.now()));
        next
    }

    fn begin(&self, phase: SyncPhase) -> PhaseRecorder {
        *self.phase.write() = Some(phase);
        info!(phase = %phase, "phase started");
        PhaseRecorder::new(phase, self.clock.now())
    }

    fn stop_requested(&self, report: &mut RunReport, after: SyncPhase) -> bool {
        if !self.cancel.is_cancelled() {
            return false;
        }
        info!(config_id = %report.config_id, after = %after, "run cancelled");
        report.cancelled = true;
        skip_after(report, after, "run cancelled");
        true
    }

    fn finish(&self, report: &mut RunReport, started: Duration) {
        report.finished_at = self.clock.wall();
        report.duration = self.clock.now().saturating_sub(started);
        report.settle();
        *self.phase.write() = Some(SyncPhase::Done);

        {
            let mut stats = self.stats.write();
            stats.runs_completed += 1;
            if report.status == RunStatus::Failed {
                stats.runs_failed += 1;
            }
            stats.rows_written += report.total_writes() as u64;
            stats.conflicts_encountered += report.detection.both_changed as u64;
            stats.last_run_at = Some(report.finished_at);
            stats.last_error = report.errors().next().map(|(_, e)| e.to_string());
        }

        info!(
            config_id = %report.config_id,
            run_id = %report.run_id,
            status = %report.status,
            written = report.total_writes(),
            errors = report.error_count(),
            duration_ms = report.duration.as_millis() as u64,
            "sync run finished"
        );

        if let Some(sink) = &self.audit {
            if let Err(err) = sink.record(report) {
                warn!(run_id = %report.run_id, error = %err, "audit sink rejected report");
            }
        }
    }

    fn fetch(&self, config: &SyncConfiguration, rec: &mut PhaseRecorder) -> Option<Fetched> {
        if let Err(err) = config.validate() {
            rec.fail(PhaseError::from_error(SyncPhase::Fetching, &SyncError::from(err)));
            return None;
        }

        let mapping = &config.mapping;
        let left_selector = RowSelector::new(self.engine.page_size)
            .with_fields(mapping.entries().iter().map(|e| e.field_id.clone()).collect());
        let right_selector = RowSelector::new(self.engine.page_size)
            .with_fields(mapping.entries().iter().map(|e| e.column_label()).collect());

        let left_rows = match fetch_all_rows(&*self.left, &self.left_guard, &left_selector) {
            Ok(rows) => rows,
            Err(err) => {
                rec.fail(PhaseError::from_error(SyncPhase::Fetching, &err));
                return None;
            }
        };
        let right_rows = match fetch_all_rows(&*self.right, &self.right_guard, &right_selector) {
            Ok(rows) => rows,
            Err(err) => {
                rec.fail(PhaseError::from_error(SyncPhase::Fetching, &err));
                return None;
            }
        };
        info!(left = left_rows.len(), right = right_rows.len(), "fetched rows");

        let schema = self.left_guard.call("get_schema", ErrorKind::Fetch, || {
            self.left.get_schema().map_err(SyncError::from)
        });
        let choices = match schema {
            Ok(schema) => {
                let inspection = self.inspector.detect(&schema.fields, mapping);
                rec.warnings.extend(inspection.warnings.iter().cloned());
                Some(inspection)
            }
            Err(err) => {
                rec.warn(format!(
                    "record schema unavailable, dropdown validation disabled: {err}"
                ));
                None
            }
        };

        let mut left_canonical: Vec<Row> = left_rows.iter().map(|r| mapping.project_left(r)).collect();
        self.ids_to_labels(config, &mut left_canonical, rec);
        let right_canonical: Vec<Row> = right_rows.iter().map(|r| mapping.project_right(r)).collect();

        Some(Fetched {
            left: snapshot(Side::Left, left_canonical, rec),
            right: snapshot(Side::Right, right_canonical, rec),
            choices,
        })
    }

    /// Replaces linked ids in canonical record rows with their labels.
    fn ids_to_labels(&self, config: &SyncConfiguration, rows: &mut [Row], rec: &mut PhaseRecorder) {
        for (entry, link) in config.mapping.linked_entries() {
            let ids: BTreeSet<String> = rows
                .iter()
                .filter_map(|row| match row.field(&entry.field_id) {
                    Some(FieldValue::Links(items)) => Some(items.iter().cloned()),
                    _ => None,
                })
                .flatten()
                .collect();
            if ids.is_empty() {
                continue;
            }
            let Some(resolver) = &self.cross_refs else {
                rec.warn(format!(
                    "no cross-reference resolver; linked field {} compared by id",
                    entry.field_id
                ));
                continue;
            };

            let ids: Vec<RowId> = ids.into_iter().map(RowId::from).collect();
            let resolution = resolver.resolve_ids_to_labels(&link.table, &ids);
            rec.warnings.extend(resolution.warnings.iter().cloned());
            if !resolution.missing.is_empty() {
                rec.warn(format!(
                    "[transform] {} linked id(s) of {} not found in table {}; kept as ids",
                    resolution.missing.len(),
                    entry.field_id,
                    link.table
                ));
            }

            let labels: HashMap<&str, &str> = resolution
                .resolved
                .iter()
                .map(|link| (link.id.as_str(), link.label.as_str()))
                .collect();
            for row in rows.iter_mut() {
                if let Some(FieldValue::Links(items)) = row.fields.get_mut(&entry.field_id) {
                    for item in items.iter_mut() {
                        if let Some(label) = labels.get(item.as_str()) {
                            *item = (*label).to_string();
                        }
                    }
                }
            }
        }
    }

    fn resolve_conflicts(
        &self,
        config: &SyncConfiguration,
        conflicts: &mut [ConflictRecord],
        report: &mut RunReport,
        rec: &mut PhaseRecorder,
    ) {
        for conflict in conflicts.iter_mut() {
            match self.resolver.resolve_in_place(conflict, config.policy) {
                Ok(()) => log_resolution(conflict, report),
                Err(err) => {
                    report.conflicts.unresolved += 1;
                    rec.error(
                        PhaseError::from_error(SyncPhase::ResolvingConflicts, &err)
                            .with_row(conflict.row_id.clone()),
                    );
                }
            }
        }
    }

    /// Converts outgoing canonical rows to spreadsheet columns, checking
    /// dropdown values on the way.
    fn prepare_for_right(
        &self,
        config: &SyncConfiguration,
        plan: &mut WritePlan,
        choices: Option<&ChoiceInspection>,
        rec: &mut PhaseRecorder,
    ) {
        for row in plan.creates.iter_mut().chain(plan.updates.iter_mut()) {
            if let Some(choices) = choices {
                for field in &choices.fields {
                    let Some(value) = row.field(&field.field_id) else {
                        continue;
                    };
                    if value.normalized().is_none() {
                        continue;
                    }
                    if let Err(invalid) = field.validate(value) {
                        rec.warn(format!(
                            "[validation] row {}: {} not among the choices of {} (column {})",
                            row.id,
                            invalid.join(", "),
                            field.field_name,
                            field.column_label()
                        ));
                    }
                }
            }
            *row = config.mapping.to_columns(row);
        }
    }

    /// Replaces linked labels in outgoing rows with record ids. Rows with a
    /// label that cannot be resolved are dropped from the plan.
    fn prepare_for_left(&self, config: &SyncConfiguration, plan: &mut WritePlan, rec: &mut PhaseRecorder) {
        for (entry, link) in config.mapping.linked_entries() {
            let labels: BTreeSet<String> = plan
                .upserts()
                .filter_map(|row| match row.field(&entry.field_id) {
                    Some(FieldValue::Links(items)) => Some(items.iter().cloned()),
                    _ => None,
                })
                .flatten()
                .collect();
            if labels.is_empty() {
                continue;
            }
            let Some(resolver) = &self.cross_refs else {
                rec.warn(format!(
                    "no cross-reference resolver; linked field {} written as labels",
                    entry.field_id
                ));
                continue;
            };

            let labels: Vec<String> = labels.into_iter().collect();
            let resolution = resolver.resolve_labels_to_ids(&link.table, &labels, link.create_missing);
            rec.warnings.extend(resolution.warnings.iter().cloned());
            let ids: HashMap<String, &RowId> = resolution
                .resolved
                .iter()
                .map(|link| (normalize_label(&link.label), &link.id))
                .collect();

            let mut failed = HashSet::new();
            for row in plan.creates.iter_mut().chain(plan.updates.iter_mut()) {
                let Some(FieldValue::Links(items)) = row.fields.get_mut(&entry.field_id) else {
                    continue;
                };
                let unresolved: Vec<&str> = items
                    .iter()
                    .filter(|item| !ids.contains_key(&normalize_label(item)))
                    .map(String::as_str)
                    .collect();
                if !unresolved.is_empty() {
                    rec.error(
                        PhaseError::new(
                            ErrorKind::Transform,
                            format!(
                                "linked value(s) {} not found in table {}",
                                unresolved.join(", "),
                                link.table
                            ),
                        )
                        .with_row(row.id.clone()),
                    );
                    failed.insert(row.id.clone());
                    continue;
                }
                for item in items.iter_mut() {
                    if let Some(id) = ids.get(&normalize_label(item)) {
                        *item = id.to_string();
                    }
                }
            }
            plan.creates.retain(|row| !failed.contains(&row.id));
            plan.updates.retain(|row| !failed.contains(&row.id));
        }
    }

    fn write_leg<C: EndpointClient + ?Sized>(
        &self,
        client: &C,
        guard: &ApiGuard,
        rate: &RateLimitConfig,
        plan: WritePlan,
        rec: &mut PhaseRecorder,
    ) -> Vec<Committed> {
        let phase = rec.phase;
        let deletes: Vec<Row> = plan.deletes.into_iter().map(Row::new).collect();

        let mut outcome = ChunkOutcome::default();
        outcome.merge(dispatch(client, guard, rate, WriteOp::Create, &plan.creates, phase));
        outcome.merge(dispatch(client, guard, rate, WriteOp::Update, &plan.updates, phase));
        outcome.merge(dispatch(client, guard, rate, WriteOp::Delete, &deletes, phase));

        info!(
            phase = %phase,
            destination = client.name(),
            committed = outcome.committed.len(),
            failed = outcome.errors.len(),
            "writes dispatched"
        );
        let nothing_committed = outcome.committed.is_empty();
        for error in outcome.errors {
            rec.error(error);
        }
        if nothing_committed && !rec.errors.is_empty() {
            rec.failed = true;
        }
        outcome.committed
    }

    fn next_checkpoint(
        &self,
        config: &SyncConfiguration,
        base: &Checkpoint,
        fetched: &Fetched,
        detection: &Detection,
        to_right: &[Committed],
        to_left: &[Committed],
    ) -> Checkpoint {
        let mut next = base.clone();
        next.version = CHECKPOINT_VERSION;
        next.config_id = config.id.clone();
        next.taken_at = Some(self.clock.wall());

        for id in &detection.unchanged {
            if let (Some(left), Some(right)) = (fetched.left.get(id), fetched.right.get(id)) {
                next.insert(
                    id.clone(),
                    CheckpointEntry {
                        left_hash: left.hash,
                        right_hash: right.hash,
                        left_modified: left.row.modified_at,
                        right_modified: right.row.modified_at,
                    },
                );
            }
        }
        for id in &detection.both_deleted {
            next.remove(id);
        }

        for commit in to_right {
            match (commit.op, fetched.left.get(&commit.id)) {
                (WriteOp::Delete, _) => {
                    next.remove(&commit.id);
                }
                (_, Some(source)) => next.insert(
                    commit.id.clone(),
                    CheckpointEntry::in_sync(source.hash, source.row.modified_at, commit.modified_at),
                ),
                (_, None) => {}
            }
        }
        for commit in to_left {
            match (commit.op, fetched.right.get(&commit.id)) {
                (WriteOp::Delete, _) => {
                    next.remove(&commit.id);
                }
                (_, Some(source)) => next.insert(
                    commit.id.clone(),
                    CheckpointEntry::in_sync(source.hash, commit.modified_at, source.row.modified_at),
                ),
                (_, None) => {}
            }
        }

        next
    }
}

fn build_guards(
    left: &dyn EndpointClient,
    right: &dyn EndpointClient,
    engine: &EngineConfig,
    clock: &Arc<dyn Clock>,
) -> (Arc<ApiGuard>, Arc<ApiGuard>) {
    (
        Arc::new(ApiGuard::new(
            left.name(),
            &engine.left_rate_limit,
            engine.retry.clone(),
            Arc::clone(clock),
        )),
        Arc::new(ApiGuard::new(
            right.name(),
            &engine.right_rate_limit,
            engine.retry.clone(),
            Arc::clone(clock),
        )),
    )
}

struct Fetched {
    left: Snapshot,
    right: Snapshot,
    choices: Option<ChoiceInspection>,
}

fn snapshot(side: Side, rows: Vec<Row>, rec: &mut PhaseRecorder) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for row in rows {
        if let Err(duplicate) = snapshot.insert(row) {
            rec.error(
                PhaseError::new(
                    ErrorKind::Transform,
                    format!("duplicate row id on the {side} endpoint; first occurrence kept"),
                )
                .with_row(duplicate.id),
            );
        }
    }
    snapshot
}

/// In one-way mode the source side wins every conflict, whatever the policy.
fn source_wins(config: &SyncConfiguration, conflicts: &mut [ConflictRecord], report: &mut RunReport) {
    let (winner, rationale) = if config.direction.writes_left_to_right() {
        (Side::Left, "one-way sync: left is authoritative")
    } else {
        (Side::Right, "one-way sync: right is authoritative")
    };
    for conflict in conflicts.iter_mut() {
        let row = conflict.candidate(winner).cloned();
        conflict.resolve(Resolution {
            winner,
            row,
            rationale: rationale.to_string(),
        });
        log_resolution(conflict, report);
    }
}

fn log_resolution(conflict: &ConflictRecord, report: &mut RunReport) {
    let Some(resolution) = &conflict.resolution else {
        return;
    };
    match resolution.winner {
        Side::Left => report.conflicts.left_won += 1,
        Side::Right => report.conflicts.right_won += 1,
    }
    debug!(
        row_id = %conflict.row_id,
        winner = %resolution.winner,
        rationale = %resolution.rationale,
        "conflict resolved"
    );
    report.resolutions.push(ResolutionLogEntry {
        row_id: conflict.row_id.clone(),
        kind: conflict.kind,
        winner: resolution.winner,
        deleted: resolution.row.is_none(),
        rationale: resolution.rationale.clone(),
    });
}

fn skip_after(report: &mut RunReport, after: SyncPhase, reason: &str) {
    let remaining = SyncPhase::REPORTED
        .iter()
        .skip_while(|phase| **phase != after)
        .skip(1);
    for phase in remaining {
        report.phases.push(PhaseReport::skipped_because(*phase, reason));
    }
}

fn write_counts(committed: &[Committed]) -> WriteCounts {
    let mut counts = WriteCounts::default();
    for commit in committed {
        match commit.op {
            WriteOp::Create => counts.added += 1,
            WriteOp::Update => counts.updated += 1,
            WriteOp::Delete => counts.deleted += 1,
        }
    }
    counts
}

struct PhaseRecorder {
    phase: SyncPhase,
    started: Duration,
    errors: Vec<PhaseError>,
    warnings: Vec<String>,
    failed: bool,
}

impl PhaseRecorder {
    fn new(phase: SyncPhase, started: Duration) -> Self {
        Self {
            phase,
            started,
            errors: Vec::new(),
            warnings: Vec::new(),
            failed: false,
        }
    }

    fn warn(&mut self, message: String) {
        warn!(phase = %self.phase, "{message}");
        self.warnings.push(message);
    }

    fn error(&mut self, error: PhaseError) {
        warn!(
            phase = %self.phase,
            kind = %error.kind,
            row_id = ?error.row_id,
            message = %error.message,
            "phase error"
        );
        self.errors.push(error);
    }

    fn fail(&mut self, error: PhaseError) {
        self.failed = true;
        self.error(error);
    }

    fn finish(self, now: Duration) -> PhaseReport {
        let status = if self.failed {
            PhaseStatus::Failed
        } else if self.errors.is_empty() {
            PhaseStatus::Succeeded
        } else {
            PhaseStatus::PartiallySucceeded
        };
        PhaseReport {
            phase: self.phase,
            status,
            duration: now.saturating_sub(self.started),
            errors: self.errors,
            warnings: self.warnings,
        }
    }
}

/// Canonical rows to write to one destination.
#[derive(Debug, Default)]
struct WritePlan {
    creates: Vec<Row>,
    updates: Vec<Row>,
    deletes: Vec<RowId>,
}

impl WritePlan {
    /// Collects the writes that carry `source_side`'s changes to the other
    /// side: its single-side buckets plus the conflicts it won.
    fn for_leg(source: &Snapshot, dest: &Snapshot, detection: &Detection, source_side: Side) -> Self {
        let (added, updated, deleted) = match source_side {
            Side::Left => (&detection.left_added, &detection.left_updated, &detection.left_deleted),
            Side::Right => (
                &detection.right_added,
                &detection.right_updated,
                &detection.right_deleted,
            ),
        };

        let mut plan = Self::default();
        for id in added.iter().chain(updated.iter()) {
            if let Some(current) = source.get(id) {
                plan.upsert(&current.row, dest);
            }
        }
        for id in deleted {
            plan.delete(id, dest);
        }
        for conflict in &detection.both_changed {
            let Some(resolution) = &conflict.resolution else {
                continue;
            };
            if resolution.winner != source_side {
                continue;
            }
            match &resolution.row {
                Some(row) => plan.upsert(row, dest),
                None => plan.delete(&conflict.row_id, dest),
            }
        }
        plan
    }

    fn upsert(&mut self, row: &Row, dest: &Snapshot) {
        let mut row = row.clone();
        row.modified_at = None;
        if dest.contains(&row.id) {
            self.updates.push(row);
        } else {
            self.creates.push(row);
        }
    }

    fn delete(&mut self, id: &RowId, dest: &Snapshot) {
        if dest.contains(id) {
            self.deletes.push(id.clone());
        }
    }

    /// Gives every update an empty value for each mapped field it lacks, so
    /// the destination clears the field. Unmapped fields are never sent.
    fn clear_unset(&mut self, mapping: &FieldMapping) {
        for row in &mut self.updates {
            for entry in mapping.entries() {
                row.fields
                    .entry(entry.field_id.clone())
                    .or_insert_with(|| FieldValue::Text(String::new()));
            }
        }
    }

    fn upserts(&self) -> impl Iterator<Item = &Row> {
        self.creates.iter().chain(self.updates.iter())
    }

    fn len(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOp {
    Create,
    Update,
    Delete,
}

impl WriteOp {
    fn operation(&self) -> &'static str {
        match self {
            WriteOp::Create => "create_rows",
            WriteOp::Update => "update_rows",
            WriteOp::Delete => "delete_rows",
        }
    }
}

/// A row the destination accepted.
#[derive(Debug, Clone)]
struct Committed {
    id: RowId,
    op: WriteOp,
    modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ChunkOutcome {
    committed: Vec<Committed>,
    errors: Vec<PhaseError>,
}

impl ChunkOutcome {
    fn failed(chunk: &[Row], kind: ErrorKind, message: &str) -> Self {
        Self {
            committed: Vec::new(),
            errors: chunk
                .iter()
                .map(|row| PhaseError::new(kind, message).with_row(row.id.clone()))
                .collect(),
        }
    }

    fn merge(&mut self, other: ChunkOutcome) {
        self.committed.extend(other.committed);
        self.errors.extend(other.errors);
    }
}

/// Sends rows in chunks of the destination's batch size, at most
/// `max_in_flight` chunks at a time.
fn dispatch<C: EndpointClient + ?Sized>(
    client: &C,
    guard: &ApiGuard,
    rate: &RateLimitConfig,
    op: WriteOp,
    rows: &[Row],
    phase: SyncPhase,
) -> ChunkOutcome {
    let mut outcome = ChunkOutcome::default();
    if rows.is_empty() {
        return outcome;
    }

    let chunks: Vec<&[Row]> = rows.chunks(client.max_batch_size().max(1)).collect();
    for wave in chunks.chunks(rate.max_in_flight().max(1)) {
        debug!(
            operation = op.operation(),
            chunks = wave.len(),
            rows = wave.iter().map(|c| c.len()).sum::<usize>(),
            "dispatching write chunks"
        );
        let results: Vec<ChunkOutcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = wave
                .iter()
                .map(|chunk| {
                    let handle = scope.spawn(move || send_chunk(client, guard, op, chunk, phase));
                    (*chunk, handle)
                })
                .collect();
            handles
                .into_iter()
                .map(|(chunk, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        ChunkOutcome::failed(chunk, phase.error_kind(), "write worker panicked")
                    })
                })
                .collect()
        });
        for result in results {
            outcome.merge(result);
        }
    }
    outcome
}

/// Sends one chunk through the guard. A chunk rejected for a reason that
/// retrying cannot fix is replayed one row at a time.
fn send_chunk<C: EndpointClient + ?Sized>(
    client: &C,
    guard: &ApiGuard,
    op: WriteOp,
    chunk: &[Row],
    phase: SyncPhase,
) -> ChunkOutcome {
    let result = guard.call(op.operation(), phase.error_kind(), || {
        write_chunk(client, op, chunk).map_err(SyncError::from)
    });
    match result {
        Ok(committed) => ChunkOutcome {
            committed,
            errors: Vec::new(),
        },
        Err(err) if chunk.len() > 1 && !err.root_cause().is_retryable() => {
            debug!(
                operation = op.operation(),
                rows = chunk.len(),
                error = %err,
                "chunk rejected, replaying rows individually"
            );
            let mut outcome = ChunkOutcome::default();
            for row in chunk {
                outcome.merge(send_chunk(client, guard, op, std::slice::from_ref(row), phase));
            }
            outcome
        }
        Err(err) => ChunkOutcome::failed(chunk, err.kind_or(phase.error_kind()), &err.to_string()),
    }
}

fn write_chunk<C: EndpointClient + ?Sized>(
    client: &C,
    op: WriteOp,
    chunk: &[Row],
) -> EndpointResult<Vec<Committed>> {
    let stored = match op {
        WriteOp::Create => client.create_rows(chunk)?,
        WriteOp::Update => client.update_rows(chunk)?,
        WriteOp::Delete => {
            let ids: Vec<RowId> = chunk.iter().map(|row| row.id.clone()).collect();
            client.delete_rows(&ids)?;
            Vec::new()
        }
    };
    Ok(chunk
        .iter()
        .map(|row| Committed {
            id: row.id.clone(),
            op,
            modified_at: stored
                .iter()
                .find(|s| s.id == row.id)
                .and_then(|s| s.modified_at),
        })
        .collect())
}
