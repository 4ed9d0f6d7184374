//! Cross-reference resolution for linked-record fields.
//!
//! Linked fields hold row ids of a foreign table on the record side and the
//! rows' display labels on the spreadsheet side. [`CrossReferenceResolver`]
//! translates in both directions through a per-table cache with TTL eviction.

use crate::clock::Clock;
use crate::endpoint::{LinkedLabel, LinkedTableSource};
use crate::error::{ErrorKind, SyncError};
use crate::retry::ApiGuard;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tablesync_protocol::RowId;
use tracing::{debug, warn};

/// Normalizes a label for matching: trimmed and lowercased.
pub fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

/// An id/label pair produced by a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedLink {
    /// Row id in the foreign table.
    pub id: RowId,
    /// Display label.
    pub label: String,
}

impl From<LinkedLabel> for ResolvedLink {
    fn from(linked: LinkedLabel) -> Self {
        Self {
            id: linked.id,
            label: linked.label,
        }
    }
}

/// Result of [`CrossReferenceResolver::resolve_ids_to_labels`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdResolution {
    /// Ids that were found, in request order.
    pub resolved: Vec<ResolvedLink>,
    /// Ids with no row in the foreign table, or not fetchable.
    pub missing: Vec<RowId>,
    /// Degraded-path messages.
    pub warnings: Vec<String>,
}

impl IdResolution {
    /// Label for an id, if it was resolved.
    pub fn label_for(&self, id: &RowId) -> Option<&str> {
        self.resolved
            .iter()
            .find(|link| &link.id == id)
            .map(|link| link.label.as_str())
    }
}

/// Result of [`CrossReferenceResolver::resolve_labels_to_ids`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelResolution {
    /// Labels that were found or created, in request order.
    pub resolved: Vec<ResolvedLink>,
    /// Labels that could not be matched or created.
    pub missing: Vec<String>,
    /// Rows created in the foreign table during this call.
    pub created: Vec<ResolvedLink>,
    /// Degraded-path messages.
    pub warnings: Vec<String>,
}

impl LabelResolution {
    /// Id for a label, matched the way the cache matches.
    pub fn id_for(&self, label: &str) -> Option<&RowId> {
        let wanted = normalize_label(label);
        self.resolved
            .iter()
            .find(|link| normalize_label(&link.label) == wanted)
            .map(|link| &link.id)
    }
}

#[derive(Debug)]
struct TableCache {
    id_to_label: HashMap<RowId, String>,
    label_to_id: HashMap<String, RowId>,
    filled_at: Duration,
}

impl TableCache {
    fn new(filled_at: Duration) -> Self {
        Self {
            id_to_label: HashMap::new(),
            label_to_id: HashMap::new(),
            filled_at,
        }
    }

    /// Replaces the cached table with a full listing.
    fn replace(&mut self, links: impl IntoIterator<Item = LinkedLabel>) {
        self.id_to_label.clear();
        self.label_to_id.clear();
        self.merge(links);
    }

    /// Adds rows. A label already held by another live row keeps its id.
    fn merge(&mut self, links: impl IntoIterator<Item = LinkedLabel>) {
        for link in links {
            let key = normalize_label(&link.label);
            if let Some(old) = self.id_to_label.insert(link.id.clone(), link.label) {
                let old_key = normalize_label(&old);
                if old_key != key && self.label_to_id.get(&old_key) == Some(&link.id) {
                    self.label_to_id.remove(&old_key);
                }
            }
            let taken = self.label_to_id.get(&key).is_some_and(|owner| {
                self.id_to_label
                    .get(owner)
                    .is_some_and(|label| normalize_label(label) == key)
            });
            if !taken {
                self.label_to_id.insert(key, link.id);
            }
        }
    }

    fn by_label(&self, label: &str) -> Option<ResolvedLink> {
        let id = self.label_to_id.get(&normalize_label(label))?;
        let label = self.id_to_label.get(id)?;
        Some(ResolvedLink {
            id: id.clone(),
            label: label.clone(),
        })
    }
}

/// Resolves linked-record ids to labels and back.
///
/// Shared across runs behind an `Arc`; the cache is keyed by foreign table.
/// A fetch replaces the table's entries wholesale, while rows created through
/// the resolver are merged into them.
pub struct CrossReferenceResolver {
    source: Arc<dyn LinkedTableSource>,
    guard: Arc<ApiGuard>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    tables: RwLock<HashMap<String, TableCache>>,
}

impl fmt::Debug for CrossReferenceResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossReferenceResolver")
            .field("ttl", &self.ttl)
            .field("cached_tables", &self.tables.read().len())
            .finish()
    }
}

impl CrossReferenceResolver {
    /// Creates a resolver.
    ///
    /// `guard` should be the guard of the service hosting the foreign tables
    /// so lookups share its rate limit.
    pub fn new(
        source: Arc<dyn LinkedTableSource>,
        guard: Arc<ApiGuard>,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            guard,
            clock,
            ttl,
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Cache lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns true if a live cache entry exists for `table`.
    pub fn is_cached(&self, table: &str) -> bool {
        let now = self.clock.now();
        self.tables
            .read()
            .get(table)
            .is_some_and(|cache| !self.expired(cache, now))
    }

    /// Drops the cache of one table.
    pub fn invalidate(&self, table: &str) {
        if self.tables.write().remove(table).is_some() {
            debug!(table, "invalidated cross-reference cache");
        }
    }

    /// Drops every cached table.
    pub fn invalidate_all(&self) {
        self.tables.write().clear();
    }

    /// Translates foreign row ids to their labels.
    pub fn resolve_ids_to_labels(&self, table: &str, ids: &[RowId]) -> IdResolution {
        let mut result = IdResolution::default();
        self.evict_if_expired(table);

        let uncached: Vec<&RowId> = {
            let tables = self.tables.read();
            let cache = tables.get(table);
            ids.iter()
                .filter(|id| cache.map_or(true, |c| !c.id_to_label.contains_key(*id)))
                .collect()
        };

        if !uncached.is_empty() {
            debug!(table, uncached = uncached.len(), "fetching linked table for ids");
            if let Err(err) = self.fetch_table(table) {
                result
                    .warnings
                    .push(format!("could not fetch linked table {table}: {err}"));
            }
        } else {
            debug!(table, ids = ids.len(), "cross-reference cache hit");
        }

        let tables = self.tables.read();
        let cache = tables.get(table);
        for id in ids {
            match cache.and_then(|c| c.id_to_label.get(id)) {
                Some(label) => result.resolved.push(ResolvedLink {
                    id: id.clone(),
                    label: label.clone(),
                }),
                None => result.missing.push(id.clone()),
            }
        }
        result
    }

    /// Translates labels to foreign row ids, optionally creating rows for
    /// labels with no match.
    pub fn resolve_labels_to_ids(
        &self,
        table: &str,
        labels: &[String],
        create_missing: bool,
    ) -> LabelResolution {
        let mut result = LabelResolution::default();
        let labels: Vec<&String> = labels.iter().filter(|l| !l.trim().is_empty()).collect();
        self.evict_if_expired(table);

        let uncached = {
            let tables = self.tables.read();
            let cache = tables.get(table);
            labels
                .iter()
                .any(|label| cache.and_then(|c| c.by_label(label)).is_none())
        };

        let mut fetched = true;
        if uncached {
            debug!(table, labels = labels.len(), "fetching linked table for labels");
            if let Err(err) = self.fetch_table(table) {
                fetched = false;
                result
                    .warnings
                    .push(format!("could not fetch linked table {table}: {err}"));
            }
        }

        if create_missing && fetched {
            let mut seen = HashSet::new();
            let unmatched: Vec<String> = {
                let tables = self.tables.read();
                let cache = tables.get(table);
                labels
                    .iter()
                    .filter(|label| cache.and_then(|c| c.by_label(label)).is_none())
                    .filter(|label| seen.insert(normalize_label(label)))
                    .map(|label| label.trim().to_string())
                    .collect()
            };
            if !unmatched.is_empty() {
                self.create_labels(table, &unmatched, &mut result);
            }
        }

        let tables = self.tables.read();
        let cache = tables.get(table);
        for label in labels {
            match cache.and_then(|c| c.by_label(label)) {
                Some(link) => result.resolved.push(link),
                None => result.missing.push(label.clone()),
            }
        }
        result
    }

    fn create_labels(&self, table: &str, labels: &[String], result: &mut LabelResolution) {
        let batch_size = self.source.max_batch_size().max(1);
        for chunk in labels.chunks(batch_size) {
            let created = self.guard.call("create_labels", ErrorKind::Write, || {
                self.source
                    .create_labels(table, chunk)
                    .map_err(SyncError::from)
            });
            match created {
                Ok(created) => {
                    debug!(table, created = created.len(), "created linked rows");
                    result
                        .created
                        .extend(created.iter().cloned().map(ResolvedLink::from));
                    self.merge(table, created);
                }
                Err(err) => {
                    warn!(table, error = %err, "failed to create linked rows");
                    result.warnings.push(format!(
                        "could not create {} row(s) in linked table {table}: {err}",
                        chunk.len()
                    ));
                }
            }
        }
    }

    fn fetch_table(&self, table: &str) -> Result<(), SyncError> {
        let links = self
            .guard
            .call("fetch_labels", ErrorKind::Fetch, || {
                self.source.fetch_labels(table).map_err(SyncError::from)
            })
            .inspect_err(|err| warn!(table, error = %err, "linked table fetch failed"))?;
        debug!(table, rows = links.len(), "fetched linked table");
        let now = self.clock.now();
        let mut tables = self.tables.write();
        let cache = tables
            .entry(table.to_string())
            .or_insert_with(|| TableCache::new(now));
        cache.filled_at = now;
        cache.replace(links);
        Ok(())
    }

    fn merge(&self, table: &str, links: Vec<LinkedLabel>) {
        let now = self.clock.now();
        let mut tables = self.tables.write();
        tables
            .entry(table.to_string())
            .or_insert_with(|| TableCache::new(now))
            .merge(links);
    }

    fn evict_if_expired(&self, table: &str) {
        let now = self.clock.now();
        let mut tables = self.tables.write();
        if tables.get(table).is_some_and(|c| self.expired(c, now)) {
            debug!(table, "cross-reference cache expired");
            tables.remove(table);
        }
    }

    fn expired(&self, cache: &TableCache, now: Duration) -> bool {
        now.saturating_sub(cache.filled_at) >= self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::config::{RateLimitConfig, RetryConfig};
    use crate::endpoint::MemoryLinkedTables;

    fn setup(ttl: Duration) -> (Arc<MemoryLinkedTables>, Arc<MockClock>, CrossReferenceResolver) {
        let tables = Arc::new(MemoryLinkedTables::new().with_max_batch_size(2));
        tables.insert("people", "p1", "Ada Lovelace");
        tables.insert("people", "p2", "Grace Hopper");
        let clock = Arc::new(MockClock::default());
        let guard = Arc::new(ApiGuard::new(
            "records",
            &RateLimitConfig::unlimited(),
            RetryConfig::no_retry(),
            clock.clone(),
        ));
        let resolver = CrossReferenceResolver::new(tables.clone(), guard, ttl, clock.clone());
        (tables, clock, resolver)
    }

    #[test]
    fn ids_resolve_and_hit_cache() {
        let (tables, _, resolver) = setup(Duration::from_secs(300));
        let ids = vec![RowId::from("p2"), RowId::from("p9"), RowId::from("p1")];

        let first = resolver.resolve_ids_to_labels("people", &ids);
        assert_eq!(first.resolved.len(), 2);
        assert_eq!(first.resolved[0].label, "Grace Hopper");
        assert_eq!(first.missing, vec![RowId::from("p9")]);
        assert_eq!(first.label_for(&RowId::from("p1")), Some("Ada Lovelace"));

        let second = resolver.resolve_ids_to_labels("people", &ids[..1]);
        assert_eq!(second.resolved.len(), 1);
        assert_eq!(tables.fetch_count("people"), 1);
    }

    #[test]
    fn labels_match_case_insensitively() {
        let (_, _, resolver) = setup(Duration::from_secs(300));
        let result =
            resolver.resolve_labels_to_ids("people", &["  ada LOVELACE ".to_string()], false);
        assert_eq!(result.resolved[0].id, RowId::from("p1"));
        assert_eq!(result.id_for("Ada Lovelace"), Some(&RowId::from("p1")));
        assert!(result.missing.is_empty());
    }

    #[test]
    fn missing_labels_are_created_in_batches() {
        let (tables, _, resolver) = setup(Duration::from_secs(300));
        let labels: Vec<String> = ["Ada Lovelace", "Linus", "Barbara", "Edsger", "linus"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let result = resolver.resolve_labels_to_ids("people", &labels, true);
        assert_eq!(result.created.len(), 3);
        assert_eq!(tables.create_calls(), 2);
        assert_eq!(result.resolved.len(), 5);
        assert!(result.missing.is_empty());
        assert_eq!(result.id_for("LINUS"), result.id_for("Linus"));

        let again = resolver.resolve_labels_to_ids("people", &labels[1..2], true);
        assert!(again.created.is_empty());
        assert_eq!(tables.fetch_count("people"), 1);
    }

    #[test]
    fn unmatched_labels_without_create_are_missing() {
        let (tables, _, resolver) = setup(Duration::from_secs(300));
        let result = resolver.resolve_labels_to_ids("people", &["Nobody".to_string()], false);
        assert_eq!(result.missing, vec!["Nobody".to_string()]);
        assert_eq!(tables.create_calls(), 0);
    }

    #[test]
    fn ttl_expiry_refetches() {
        let (tables, clock, resolver) = setup(Duration::from_secs(300));
        let ids = vec![RowId::from("p1")];

        resolver.resolve_ids_to_labels("people", &ids);
        tables.rename("people", &RowId::from("p1"), "Ada King");

        clock.advance(Duration::from_secs(299));
        let cached = resolver.resolve_ids_to_labels("people", &ids);
        assert_eq!(cached.resolved[0].label, "Ada Lovelace");
        assert_eq!(tables.fetch_count("people"), 1);

        clock.advance(Duration::from_secs(1));
        assert!(!resolver.is_cached("people"));
        let fresh = resolver.resolve_ids_to_labels("people", &ids);
        assert_eq!(fresh.resolved[0].label, "Ada King");
        assert_eq!(tables.fetch_count("people"), 2);
    }

    #[test]
    fn refetch_drops_renamed_labels() {
        let (tables, _, resolver) = setup(Duration::from_secs(300));
        tables.insert("teams", "t1", "Platform");
        let first = resolver.resolve_labels_to_ids("teams", &["Platform".to_string()], false);
        assert_eq!(first.id_for("Platform"), Some(&RowId::from("t1")));

        tables.rename("teams", &RowId::from("t1"), "Infra");
        tables.insert("teams", "t2", "Platform");
        let renamed = resolver.resolve_labels_to_ids("teams", &["Infra".to_string()], false);
        assert_eq!(renamed.id_for("Infra"), Some(&RowId::from("t1")));
        assert_eq!(tables.fetch_count("teams"), 2);

        let reused = resolver.resolve_labels_to_ids("teams", &["Platform".to_string()], false);
        assert_eq!(
            reused.resolved,
            vec![ResolvedLink {
                id: RowId::from("t2"),
                label: "Platform".to_string(),
            }]
        );
        assert_eq!(tables.fetch_count("teams"), 2);
    }

    #[test]
    fn cache_merge_moves_renamed_label() {
        let mut cache = TableCache::new(Duration::ZERO);
        cache.merge([LinkedLabel::new("t1", "Platform")]);
        cache.merge([LinkedLabel::new("t1", "Infra")]);
        cache.merge([LinkedLabel::new("t2", "Platform")]);

        assert_eq!(cache.by_label("platform").map(|l| l.id), Some(RowId::from("t2")));
        assert_eq!(cache.by_label("Infra").map(|l| l.id), Some(RowId::from("t1")));
    }

    #[test]
    fn invalidate_forces_refetch() {
        let (tables, _, resolver) = setup(Duration::from_secs(300));
        let ids = vec![RowId::from("p1")];
        resolver.resolve_ids_to_labels("people", &ids);
        assert!(resolver.is_cached("people"));

        resolver.invalidate("people");
        resolver.resolve_ids_to_labels("people", &ids);
        resolver.invalidate_all();
        resolver.resolve_ids_to_labels("people", &ids);
        assert_eq!(tables.fetch_count("people"), 3);
    }

    #[test]
    fn fetch_failure_reports_missing_with_warning() {
        let (tables, _, resolver) = setup(Duration::from_secs(300));
        tables.set_failing("people", true);

        let ids = resolver.resolve_ids_to_labels("people", &[RowId::from("p1")]);
        assert_eq!(ids.missing, vec![RowId::from("p1")]);
        assert_eq!(ids.warnings.len(), 1);

        let labels = resolver.resolve_labels_to_ids("people", &["Linus".to_string()], true);
        assert_eq!(labels.missing, vec!["Linus".to_string()]);
        assert!(labels.created.is_empty());
        assert_eq!(tables.create_calls(), 0);
    }

    #[test]
    fn concurrent_lookups_share_the_cache() {
        let (tables, _, resolver) = setup(Duration::from_secs(300));
        let resolver = Arc::new(resolver);
        std::thread::scope(|scope| {
            for id in ["p1", "p2", "p1", "p2"] {
                let resolver = Arc::clone(&resolver);
                scope.spawn(move || {
                    let result = resolver.resolve_ids_to_labels("people", &[RowId::from(id)]);
                    assert_eq!(result.resolved.len(), 1);
                });
            }
        });
        assert!(tables.fetch_count("people") >= 1);
        assert!(resolver.is_cached("people"));
    }
}
