//! Property-based test generators using proptest.
//!
//! The scenario strategy builds a checkpoint and both endpoint snapshots
//! from per-row states, so every combination the change detector
//! distinguishes comes up.

use crate::fixtures::ts;
use proptest::prelude::*;
use tablesync_protocol::{
    Checkpoint, CheckpointEntry, ConflictKind, ConflictRecord, FieldValue, Row, RowId,
};

/// Field ids used by generated rows.
pub const GENERATED_FIELDS: [&str; 3] = ["fldName", "fldQty", "fldDone"];

/// Strategy for generating non-empty field values.
pub fn field_value_strategy() -> impl Strategy<Value = FieldValue> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(FieldValue::Text),
        (-1000i32..1000).prop_map(|n| FieldValue::Number(f64::from(n))),
        any::<bool>().prop_map(FieldValue::Boolean),
        prop::sample::select(vec!["Todo", "Doing", "Done"])
            .prop_map(|s| FieldValue::Choice(s.to_string())),
    ]
}

/// Strategy for generating the fields of a canonical row.
pub fn fields_strategy() -> impl Strategy<Value = Vec<(String, FieldValue)>> {
    prop::collection::vec(field_value_strategy(), GENERATED_FIELDS.len()).prop_map(|values| {
        GENERATED_FIELDS
            .iter()
            .map(|f| f.to_string())
            .zip(values)
            .collect()
    })
}

/// Strategy for generating a canonical row with the given id.
pub fn row_strategy(id: String) -> impl Strategy<Value = Row> {
    (fields_strategy(), prop::option::of(0i64..10_000)).prop_map(move |(fields, modified)| {
        let mut row = Row::new(id.as_str());
        for (name, value) in fields {
            row = row.with_field(name, value);
        }
        row.modified_at = modified.map(ts);
        row
    })
}

/// State of a row on one endpoint relative to the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideState {
    /// The endpoint does not hold the row.
    Absent,
    /// The endpoint holds the checkpointed content (absent if there was none).
    Kept,
    /// The endpoint holds fresh content.
    Changed,
}

fn side_state_strategy() -> impl Strategy<Value = SideState> {
    prop_oneof![
        Just(SideState::Absent),
        Just(SideState::Kept),
        Just(SideState::Changed),
    ]
}

/// A generated checkpoint with the two snapshots of one run.
#[derive(Debug, Clone)]
pub struct SyncScenario {
    /// Checkpoint of the previous run.
    pub checkpoint: Checkpoint,
    /// Canonical rows on the record endpoint.
    pub left: Vec<Row>,
    /// Canonical rows on the spreadsheet endpoint.
    pub right: Vec<Row>,
    /// Every id mentioned by the checkpoint or either side.
    pub ids: Vec<RowId>,
}

/// Strategy for generating sync scenarios of up to `max_rows` rows.
pub fn sync_scenario_strategy(config_id: &'static str, max_rows: usize) -> impl Strategy<Value = SyncScenario> {
    prop::collection::vec(
        (
            any::<bool>(),
            fields_strategy(),
            side_state_strategy(),
            fields_strategy(),
            side_state_strategy(),
            fields_strategy(),
        ),
        0..=max_rows,
    )
    .prop_map(move |rows| {
        let mut scenario = SyncScenario {
            checkpoint: Checkpoint::empty(config_id),
            left: Vec::new(),
            right: Vec::new(),
            ids: Vec::new(),
        };
        for (i, (has_base, base, left_state, left, right_state, right)) in rows.into_iter().enumerate() {
            let id = format!("r{i:03}");
            let base = has_base.then(|| build(&id, base));
            let left = side_row(&id, base.as_ref(), left_state, left);
            let right = side_row(&id, base.as_ref(), right_state, right);

            if base.is_none() && left.is_none() && right.is_none() {
                continue;
            }
            if let Some(base) = &base {
                scenario.checkpoint.insert(
                    base.id.clone(),
                    CheckpointEntry::in_sync(base.content_hash(), None, None),
                );
            }
            scenario.left.extend(left);
            scenario.right.extend(right);
            scenario.ids.push(RowId::from(id));
        }
        scenario
    })
}

fn build(id: &str, fields: Vec<(String, FieldValue)>) -> Row {
    fields
        .into_iter()
        .fold(Row::new(id), |row, (name, value)| row.with_field(name, value))
}

fn side_row(
    id: &str,
    base: Option<&Row>,
    state: SideState,
    fresh: Vec<(String, FieldValue)>,
) -> Option<Row> {
    match state {
        SideState::Absent => None,
        SideState::Kept => base.cloned(),
        SideState::Changed => Some(build(id, fresh)),
    }
}

/// Strategy for generating both-updated conflicts with optional timestamps.
pub fn conflict_strategy() -> impl Strategy<Value = ConflictRecord> {
    (row_strategy("r1".into()), row_strategy("r1".into())).prop_map(|(left, right)| {
        ConflictRecord::new(RowId::from("r1"), ConflictKind::BothUpdated, Some(left), Some(right))
    })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
