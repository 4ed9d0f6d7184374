//! Endpoint client contracts.
//!
//! The engine talks to the two external stores only through these traits.
//! Credentials, signing and HTTP details live in the implementations.

use crate::error::{EndpointError, EndpointResult, ErrorKind, SyncError, SyncResult};
use crate::retry::ApiGuard;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tablesync_protocol::{Row, RowId, Schema};
use tracing::debug;

/// Which rows to list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSelector {
    /// Restrict returned fields; `None` returns all.
    pub fields: Option<Vec<String>>,
    /// Rows per page.
    pub page_size: u32,
}

impl RowSelector {
    /// Selects all fields.
    pub fn new(page_size: u32) -> Self {
        Self {
            fields: None,
            page_size: page_size.max(1),
        }
    }

    /// Restricts the returned fields.
    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowPage {
    /// Rows on this page.
    pub rows: Vec<Row>,
    /// Token for the next page; `None` on the last page.
    pub next_page: Option<String>,
}

/// A table on an external service.
///
/// Rows passed to and returned from a client are in the endpoint's own key
/// space: field ids for the record API, column letters for the spreadsheet.
pub trait EndpointClient: Send + Sync {
    /// Short service name used in logs and limiter names.
    fn name(&self) -> &str;

    /// Lists one page of rows.
    fn list_rows(&self, selector: &RowSelector, page: Option<&str>) -> EndpointResult<RowPage>;

    /// Creates rows; returns them as stored.
    fn create_rows(&self, batch: &[Row]) -> EndpointResult<Vec<Row>>;

    /// Updates rows; returns them as stored.
    fn update_rows(&self, batch: &[Row]) -> EndpointResult<Vec<Row>>;

    /// Deletes rows; returns the ids that were deleted.
    fn delete_rows(&self, ids: &[RowId]) -> EndpointResult<Vec<RowId>>;

    /// Returns the table schema.
    fn get_schema(&self) -> EndpointResult<Schema>;

    /// Largest batch accepted by the write calls.
    fn max_batch_size(&self) -> usize;
}

/// A row of a foreign table, reduced to its id and display label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedLabel {
    /// Row id in the foreign table.
    pub id: RowId,
    /// Display label (primary field).
    pub label: String,
}

impl LinkedLabel {
    /// Creates a label pair.
    pub fn new(id: impl Into<RowId>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// Access to the foreign tables that linked-record fields point into.
pub trait LinkedTableSource: Send + Sync {
    /// Fetches every row of a foreign table as id/label pairs.
    fn fetch_labels(&self, table: &str) -> EndpointResult<Vec<LinkedLabel>>;

    /// Creates rows with the given labels; returns the new pairs.
    fn create_labels(&self, table: &str, labels: &[String]) -> EndpointResult<Vec<LinkedLabel>>;

    /// Largest batch accepted by `create_labels`.
    fn max_batch_size(&self) -> usize {
        10
    }
}

/// Iterator over the pages of a listing.
///
/// Each page request goes through the endpoint's guard, so pagination obeys
/// the rate limit and retries a failed page without restarting the listing.
pub struct Pages<'a, C: EndpointClient + ?Sized> {
    client: &'a C,
    guard: &'a ApiGuard,
    selector: RowSelector,
    state: PageState,
    seen_tokens: HashSet<String>,
}

enum PageState {
    First,
    Next(String),
    Done,
}

impl<'a, C: EndpointClient + ?Sized> Pages<'a, C> {
    /// Starts a listing.
    pub fn new(client: &'a C, guard: &'a ApiGuard, selector: RowSelector) -> Self {
        Self {
            client,
            guard,
            selector,
            state: PageState::First,
            seen_tokens: HashSet::new(),
        }
    }
}

impl<C: EndpointClient + ?Sized> Iterator for Pages<'_, C> {
    type Item = SyncResult<Vec<Row>>;

    fn next(&mut self) -> Option<Self::Item> {
        let token = match std::mem::replace(&mut self.state, PageState::Done) {
            PageState::Done => return None,
            PageState::First => None,
            PageState::Next(token) => Some(token),
        };

        let result = self.guard.call("list_rows", ErrorKind::Fetch, || {
            self.client
                .list_rows(&self.selector, token.as_deref())
                .map_err(SyncError::from)
        });

        match result {
            Ok(page) => {
                if let Some(next) = page.next_page {
                    if !self.seen_tokens.insert(next.clone()) {
                        return Some(Err(SyncError::OperationFailed {
                            operation: "list_rows".into(),
                            attempts: 1,
                            kind: ErrorKind::Fetch,
                            source: Box::new(SyncError::State(format!(
                                "{} repeated page token {next}",
                                self.client.name()
                            ))),
                        }));
                    }
                    self.state = PageState::Next(next);
                }
                Some(Ok(page.rows))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

/// Lists every row of an endpoint.
pub fn fetch_all_rows<C: EndpointClient + ?Sized>(
    client: &C,
    guard: &ApiGuard,
    selector: &RowSelector,
) -> SyncResult<Vec<Row>> {
    let mut rows = Vec::new();
    let mut pages = 0usize;
    for page in Pages::new(client, guard, selector.clone()) {
        rows.extend(page?);
        pages += 1;
    }
    debug!(endpoint = client.name(), rows = rows.len(), pages, "listed rows");
    Ok(rows)
}

/// Client operation, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointOp {
    /// `list_rows`.
    List,
    /// `create_rows`.
    Create,
    /// `update_rows`.
    Update,
    /// `delete_rows`.
    Delete,
    /// `get_schema`.
    Schema,
}

/// An in-memory endpoint.
///
/// Backs the CLI's file endpoints and the engine tests. Failures can be
/// scripted per operation, or attached to a row so that any write batch
/// containing it is rejected.
#[derive(Debug)]
pub struct MemoryEndpoint {
    name: String,
    rows: RwLock<BTreeMap<RowId, Row>>,
    schema: RwLock<Schema>,
    max_batch: usize,
    write_time: RwLock<Option<DateTime<Utc>>>,
    scripted: Mutex<VecDeque<(EndpointOp, EndpointError)>>,
    row_failures: RwLock<HashMap<RowId, EndpointError>>,
    calls: Mutex<HashMap<EndpointOp, usize>>,
}

impl MemoryEndpoint {
    /// Creates an empty endpoint.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(BTreeMap::new()),
            schema: RwLock::new(Schema::default()),
            max_batch: 10,
            write_time: RwLock::new(None),
            scripted: Mutex::new(VecDeque::new()),
            row_failures: RwLock::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Seeds rows.
    pub fn with_rows(self, rows: impl IntoIterator<Item = Row>) -> Self {
        {
            let mut stored = self.rows.write();
            for row in rows {
                stored.insert(row.id.clone(), row);
            }
        }
        self
    }

    /// Sets the schema.
    pub fn with_schema(self, schema: Schema) -> Self {
        *self.schema.write() = schema;
        self
    }

    /// Sets the maximum write batch size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch = size.max(1);
        self
    }

    /// Stamps written rows with a fixed modification time.
    pub fn set_write_time(&self, time: DateTime<Utc>) {
        *self.write_time.write() = Some(time);
    }

    /// Inserts or replaces a row directly, bypassing failure injection.
    pub fn put_row(&self, row: Row) {
        self.rows.write().insert(row.id.clone(), row);
    }

    /// Removes a row directly.
    pub fn remove_row(&self, id: &RowId) -> Option<Row> {
        self.rows.write().remove(id)
    }

    /// Returns a row.
    pub fn row(&self, id: &RowId) -> Option<Row> {
        self.rows.read().get(id).cloned()
    }

    /// Returns all rows in id order.
    pub fn rows(&self) -> Vec<Row> {
        self.rows.read().values().cloned().collect()
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Returns true if no rows are stored.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Returns the schema.
    pub fn schema(&self) -> Schema {
        self.schema.read().clone()
    }

    /// Makes the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: EndpointOp, error: EndpointError) {
        self.scripted.lock().push_back((op, error));
    }

    /// Makes every write batch containing `id` fail with `error`.
    pub fn fail_writes_of(&self, id: impl Into<RowId>, error: EndpointError) {
        self.row_failures.write().insert(id.into(), error);
    }

    /// Clears row-attached failures.
    pub fn clear_row_failures(&self) {
        self.row_failures.write().clear();
    }

    /// Number of calls made to `op`, failed ones included.
    pub fn call_count(&self, op: EndpointOp) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    fn begin(&self, op: EndpointOp) -> EndpointResult<()> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        let mut scripted = self.scripted.lock();
        if let Some(pos) = scripted.iter().position(|(o, _)| *o == op) {
            if let Some((_, err)) = scripted.remove(pos) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn check_batch<'a>(&self, ids: impl IntoIterator<Item = &'a RowId>) -> EndpointResult<()> {
        let failures = self.row_failures.read();
        for id in ids {
            if let Some(err) = failures.get(id) {
                return Err(err.clone());
            }
        }
        Ok(())
    }

    fn check_size(&self, len: usize) -> EndpointResult<()> {
        if len > self.max_batch {
            return Err(EndpointError::Client {
                status: 413,
                message: format!("batch of {len} exceeds limit of {}", self.max_batch),
            });
        }
        Ok(())
    }

    /// Applies `row` to the stored row with its id. Fields not in `row` are
    /// kept and fields given an empty value are cleared.
    fn patch(&self, rows: &mut BTreeMap<RowId, Row>, row: &Row) -> Row {
        let stored = rows
            .entry(row.id.clone())
            .or_insert_with(|| Row::new(row.id.clone()));
        for (name, value) in &row.fields {
            if value.normalized().is_some() {
                stored.fields.insert(name.clone(), value.clone());
            } else {
                stored.fields.remove(name);
            }
        }
        stored.modified_at = Some(self.write_time.read().unwrap_or_else(Utc::now));
        stored.clone()
    }
}

impl EndpointClient for MemoryEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_rows(&self, selector: &RowSelector, page: Option<&str>) -> EndpointResult<RowPage> {
        self.begin(EndpointOp::List)?;
        let offset = match page {
            None => 0,
            Some(token) => token.parse::<usize>().map_err(|_| EndpointError::Client {
                status: 400,
                message: format!("bad page token {token}"),
            })?,
        };
        let rows = self.rows.read();
        let page_size = selector.page_size.max(1) as usize;
        let page_rows: Vec<Row> = rows
            .values()
            .skip(offset)
            .take(page_size)
            .map(|row| match &selector.fields {
                None => row.clone(),
                Some(fields) => {
                    let mut projected = row.clone();
                    projected.fields.retain(|k, _| fields.contains(k));
                    projected
                }
            })
            .collect();
        let next = offset + page_rows.len();
        Ok(RowPage {
            rows: page_rows,
            next_page: (next < rows.len()).then(|| next.to_string()),
        })
    }

    fn create_rows(&self, batch: &[Row]) -> EndpointResult<Vec<Row>> {
        self.begin(EndpointOp::Create)?;
        self.check_size(batch.len())?;
        self.check_batch(batch.iter().map(|r| &r.id))?;
        let mut rows = self.rows.write();
        Ok(batch.iter().map(|row| self.patch(&mut rows, row)).collect())
    }

    fn update_rows(&self, batch: &[Row]) -> EndpointResult<Vec<Row>> {
        self.begin(EndpointOp::Update)?;
        self.check_size(batch.len())?;
        self.check_batch(batch.iter().map(|r| &r.id))?;
        let mut rows = self.rows.write();
        if let Some(missing) = batch.iter().find(|r| !rows.contains_key(&r.id)) {
            return Err(EndpointError::Client {
                status: 404,
                message: format!("row {} not found", missing.id),
            });
        }
        Ok(batch.iter().map(|row| self.patch(&mut rows, row)).collect())
    }

    fn delete_rows(&self, ids: &[RowId]) -> EndpointResult<Vec<RowId>> {
        self.begin(EndpointOp::Delete)?;
        self.check_size(ids.len())?;
        self.check_batch(ids)?;
        let mut rows = self.rows.write();
        Ok(ids
            .iter()
            .filter(|id| rows.remove(*id).is_some())
            .cloned()
            .collect())
    }

    fn get_schema(&self) -> EndpointResult<Schema> {
        self.begin(EndpointOp::Schema)?;
        Ok(self.schema.read().clone())
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch
    }
}

/// In-memory foreign tables for linked-record fields.
#[derive(Debug, Default)]
pub struct MemoryLinkedTables {
    tables: RwLock<HashMap<String, Vec<LinkedLabel>>>,
    next_id: Mutex<u64>,
    fetches: Mutex<HashMap<String, usize>>,
    create_calls: Mutex<usize>,
    failing: RwLock<HashSet<String>>,
    max_batch: Option<usize>,
}

impl MemoryLinkedTables {
    /// Creates an empty set of tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum create batch size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch = Some(size.max(1));
        self
    }

    /// Adds or replaces a row of a foreign table.
    pub fn insert(&self, table: &str, id: impl Into<RowId>, label: impl Into<String>) {
        let entry = LinkedLabel::new(id, label);
        let mut tables = self.tables.write();
        let rows = tables.entry(table.to_string()).or_default();
        rows.retain(|r| r.id != entry.id);
        rows.push(entry);
    }

    /// Renames a row, simulating an edit in the foreign table.
    pub fn rename(&self, table: &str, id: &RowId, label: impl Into<String>) {
        let label = label.into();
        if let Some(rows) = self.tables.write().get_mut(table) {
            for row in rows.iter_mut().filter(|r| &r.id == id) {
                row.label = label.clone();
            }
        }
    }

    /// Returns the rows of a table.
    pub fn labels(&self, table: &str) -> Vec<LinkedLabel> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }

    /// Makes every call against `table` fail with a network error.
    pub fn set_failing(&self, table: &str, failing: bool) {
        let mut set = self.failing.write();
        if failing {
            set.insert(table.to_string());
        } else {
            set.remove(table);
        }
    }

    /// Number of `fetch_labels` calls for a table.
    pub fn fetch_count(&self, table: &str) -> usize {
        self.fetches.lock().get(table).copied().unwrap_or(0)
    }

    /// Number of `create_labels` calls.
    pub fn create_calls(&self) -> usize {
        *self.create_calls.lock()
    }

    fn check(&self, table: &str) -> EndpointResult<()> {
        if self.failing.read().contains(table) {
            return Err(EndpointError::Network(format!("{table} unreachable")));
        }
        Ok(())
    }
}

impl LinkedTableSource for MemoryLinkedTables {
    fn fetch_labels(&self, table: &str) -> EndpointResult<Vec<LinkedLabel>> {
        *self.fetches.lock().entry(table.to_string()).or_insert(0) += 1;
        self.check(table)?;
        Ok(self.labels(table))
    }

    fn create_labels(&self, table: &str, labels: &[String]) -> EndpointResult<Vec<LinkedLabel>> {
        *self.create_calls.lock() += 1;
        self.check(table)?;
        if labels.len() > self.max_batch_size() {
            return Err(EndpointError::Client {
                status: 413,
                message: format!("batch of {} exceeds limit", labels.len()),
            });
        }
        let mut created = Vec::with_capacity(labels.len());
        for label in labels {
            let id = {
                let mut next = self.next_id.lock();
                *next += 1;
                format!("{table}-{next}")
            };
            self.insert(table, id.as_str(), label.clone());
            created.push(LinkedLabel::new(id, label.clone()));
        }
        Ok(created)
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch.unwrap_or(10)
    }
}
