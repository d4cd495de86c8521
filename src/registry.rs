// 🗂️ Registry Store - injected repository for the resolution pipeline
//
// The driver never talks to a database handle directly. Everything it needs
// (select, lookup, upsert, link, counts) is a method on `RegistryStore`, so the
// same loop runs against SQLite in production and `MemoryStore` in tests.

use crate::config::ProgramConfig;
use crate::entities::{CanonicalOrganization, Link, NewOrganization, SourceRecord, UnlinkableReason};
use crate::matching::MatchKey;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Key conflict on {key} but no winner found on re-lookup")]
    ConflictUnresolved { key: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Worth retrying on the next page or run
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::SystemIoFailure
                    | rusqlite::ErrorCode::CannotOpen
            ),
            StoreError::Sqlite(_) => false,
            StoreError::ConflictUnresolved { .. } => true,
            StoreError::Unavailable(_) => true,
        }
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// How a key ended up with an organization id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub organization_id: String,

    /// false = an existing organization won (conflict or lookup hit)
    pub created: bool,
}

/// Upsert outcome per key; one failed key never sinks the batch
#[derive(Debug, Default)]
pub struct UpsertBatch {
    pub resolved: HashMap<MatchKey, Resolution>,
    pub failed: Vec<(MatchKey, StoreError)>,
}

impl UpsertBatch {
    pub fn created(&self) -> usize {
        self.resolved.values().filter(|r| r.created).count()
    }

    pub fn matched(&self) -> usize {
        self.resolved.values().filter(|r| !r.created).count()
    }

    /// Every key fails with the same message
    pub fn all_failed(templates: &[NewOrganization], message: &str) -> Self {
        UpsertBatch {
            resolved: HashMap::new(),
            failed: templates
                .iter()
                .map(|t| (t.key.clone(), StoreError::Unavailable(message.to_string())))
                .collect(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LinkSummary {
    /// null → id transitions written
    pub linked: usize,

    /// Already carried a reference; left untouched
    pub already_linked: usize,

    /// Record id not found in the table
    pub missing: usize,
}

// ============================================================================
// REPOSITORY TRAIT
// ============================================================================

pub trait RegistryStore {
    /// Up to `limit` records with a null reference that are not marked
    /// unlinkable, ordered by id
    fn select_unlinked(
        &self,
        program: &ProgramConfig,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, StoreError>;

    /// Existing organization ids for the keys that are registered
    fn lookup(&self, keys: &[MatchKey]) -> Result<HashMap<MatchKey, String>, StoreError>;

    /// Find-or-create one organization per template key
    fn upsert(&mut self, templates: &[NewOrganization]) -> UpsertBatch;

    /// Write references (null → id only) and record origin tags
    fn link(&mut self, program: &ProgramConfig, links: &[Link]) -> Result<LinkSummary, StoreError>;

    /// Exclude records from future selection
    fn mark_unlinkable(
        &mut self,
        program: &ProgramConfig,
        records: &[(i64, UnlinkableReason)],
    ) -> Result<usize, StoreError>;

    /// Pending records (null reference, not unlinkable)
    fn count_unlinked(&self, program: &ProgramConfig) -> Result<u64, StoreError>;

    fn count_unlinkable(&self, program: &ProgramConfig) -> Result<u64, StoreError>;

    fn count_organizations(&self) -> Result<u64, StoreError>;

    fn organization(&self, id: &str) -> Result<Option<CanonicalOrganization>, StoreError>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// In-memory registry + source tables
///
/// Clones share state, so two clones behave like two driver processes
/// pointed at the same database.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    sources: HashMap<String, BTreeMap<i64, SourceRecord>>,
    organizations: HashMap<MatchKey, CanonicalOrganization>,
    keys_by_id: HashMap<String, MatchKey>,
    unlinkable: HashMap<String, BTreeMap<i64, UnlinkableReason>>,

    /// Normalized names whose upserts fail as if the store timed out
    failing_names: HashSet<String>,

    /// Lookups fail with a non-retryable SQL error carrying this message
    broken_lookup: Option<String>,

    offline: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn check_online(state: &MemoryState) -> Result<(), StoreError> {
        if state.offline {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        } else {
            Ok(())
        }
    }

    /// Load a source row (what the import jobs would do)
    pub fn insert_source(&self, program: &str, record: SourceRecord) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state
            .sources
            .entry(program.to_string())
            .or_default()
            .insert(record.id, record);
        Ok(())
    }

    pub fn source(&self, program: &str, id: i64) -> Result<Option<SourceRecord>, StoreError> {
        let state = self.state()?;
        Ok(state.sources.get(program).and_then(|t| t.get(&id)).cloned())
    }

    pub fn sources(&self, program: &str) -> Result<Vec<SourceRecord>, StoreError> {
        let state = self.state()?;
        Ok(state
            .sources
            .get(program)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    pub fn organizations(&self) -> Result<Vec<CanonicalOrganization>, StoreError> {
        let state = self.state()?;
        Ok(state.organizations.values().cloned().collect())
    }

    /// Make every upsert of this normalized name fail transiently
    pub fn fail_upserts_for(&self, normalized_name: &str) -> Result<(), StoreError> {
        self.state()?.failing_names.insert(normalized_name.to_string());
        Ok(())
    }

    pub fn clear_failures(&self) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.failing_names.clear();
        state.broken_lookup = None;
        state.offline = false;
        Ok(())
    }

    /// Make every lookup fail the way a malformed statement would
    pub fn break_lookups(&self, message: &str) -> Result<(), StoreError> {
        self.state()?.broken_lookup = Some(message.to_string());
        Ok(())
    }

    /// Every call fails while offline
    pub fn set_offline(&self, offline: bool) -> Result<(), StoreError> {
        self.state()?.offline = offline;
        Ok(())
    }
}

impl RegistryStore for MemoryStore {
    fn select_unlinked(
        &self,
        program: &ProgramConfig,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, StoreError> {
        let state = self.state()?;
        Self::check_online(&state)?;

        let skipped = state.unlinkable.get(&program.name);
        Ok(state
            .sources
            .get(&program.name)
            .map(|table| {
                table
                    .values()
                    .filter(|r| r.organization_id.is_none())
                    .filter(|r| !skipped.is_some_and(|s| s.contains_key(&r.id)))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn lookup(&self, keys: &[MatchKey]) -> Result<HashMap<MatchKey, String>, StoreError> {
        let state = self.state()?;
        Self::check_online(&state)?;
        if let Some(message) = &state.broken_lookup {
            return Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(message.clone()),
            )));
        }

        Ok(keys
            .iter()
            .filter_map(|key| {
                state
                    .organizations
                    .get(key)
                    .map(|org| (key.clone(), org.id.clone()))
            })
            .collect())
    }

    fn upsert(&mut self, templates: &[NewOrganization]) -> UpsertBatch {
        let mut state = match self.state() {
            Ok(state) => state,
            Err(err) => return UpsertBatch::all_failed(templates, &err.to_string()),
        };
        if state.offline {
            return UpsertBatch::all_failed(templates, "memory store offline");
        }

        let mut batch = UpsertBatch::default();
        for template in templates {
            if state.failing_names.contains(&template.key.normalized_name) {
                batch.failed.push((
                    template.key.clone(),
                    StoreError::Unavailable(format!("simulated timeout for {}", template.key)),
                ));
                continue;
            }

            // Insert-if-absent under one lock: the in-memory uniqueness constraint
            let resolution = match state.organizations.get(&template.key) {
                Some(existing) => Resolution {
                    organization_id: existing.id.clone(),
                    created: false,
                },
                None => {
                    let org = CanonicalOrganization::create(template);
                    let id = org.id.clone();
                    state.keys_by_id.insert(id.clone(), template.key.clone());
                    state.organizations.insert(template.key.clone(), org);
                    Resolution {
                        organization_id: id,
                        created: true,
                    }
                }
            };
            batch.resolved.insert(template.key.clone(), resolution);
        }
        batch
    }

    fn link(&mut self, program: &ProgramConfig, links: &[Link]) -> Result<LinkSummary, StoreError> {
        let mut state = self.state()?;
        Self::check_online(&state)?;

        let mut summary = LinkSummary::default();
        let mut touched = HashSet::new();
        {
            let table = state.sources.entry(program.name.clone()).or_default();
            for link in links {
                match table.get_mut(&link.record_id) {
                    Some(record) if record.organization_id.is_none() => {
                        record.organization_id = Some(link.organization_id.clone());
                        summary.linked += 1;
                        touched.insert(link.organization_id.clone());
                    }
                    Some(_) => summary.already_linked += 1,
                    None => summary.missing += 1,
                }
            }
        }

        for org_id in touched {
            let Some(key) = state.keys_by_id.get(&org_id).cloned() else {
                continue;
            };
            if let Some(org) = state.organizations.get_mut(&key) {
                org.origins.insert(program.name.clone());
                org.kinds.insert(program.kind.as_str().to_string());
            }
        }

        Ok(summary)
    }

    fn mark_unlinkable(
        &mut self,
        program: &ProgramConfig,
        records: &[(i64, UnlinkableReason)],
    ) -> Result<usize, StoreError> {
        let mut state = self.state()?;
        Self::check_online(&state)?;

        let marked = state.unlinkable.entry(program.name.clone()).or_default();
        let before = marked.len();
        for (id, reason) in records {
            marked.entry(*id).or_insert(*reason);
        }
        Ok(marked.len() - before)
    }

    fn count_unlinked(&self, program: &ProgramConfig) -> Result<u64, StoreError> {
        Ok(self.select_unlinked(program, usize::MAX)?.len() as u64)
    }

    fn count_unlinkable(&self, program: &ProgramConfig) -> Result<u64, StoreError> {
        let state = self.state()?;
        Self::check_online(&state)?;
        Ok(state
            .unlinkable
            .get(&program.name)
            .map(|m| m.len() as u64)
            .unwrap_or(0))
    }

    fn count_organizations(&self) -> Result<u64, StoreError> {
        let state = self.state()?;
        Self::check_online(&state)?;
        Ok(state.organizations.len() as u64)
    }

    fn organization(&self, id: &str) -> Result<Option<CanonicalOrganization>, StoreError> {
        let state = self.state()?;
        Self::check_online(&state)?;
        Ok(state
            .keys_by_id
            .get(id)
            .and_then(|key| state.organizations.get(key))
            .cloned())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProgramKind;
    use std::thread;

    fn loans() -> ProgramConfig {
        ProgramConfig::new("ppp_loans", ProgramKind::Loan, "ppp_loans", "borrower_name")
    }

    fn template(name: &str, state: Option<&str>) -> NewOrganization {
        let record = SourceRecord::new(1, name, state);
        let key = MatchKey::from_record(&record).unwrap();
        NewOrganization::from_record(key, &record, &loans())
    }

    #[test]
    fn test_upsert_twice_returns_same_id() {
        let mut store = MemoryStore::new();

        let first = store.upsert(&[template("Acme Inc", Some("CA"))]);
        let second = store.upsert(&[template("ACME, INC.", Some("ca"))]);

        assert_eq!(first.created(), 1);
        assert_eq!(second.created(), 0);
        assert_eq!(second.matched(), 1);

        let key = MatchKey::from_raw("acme inc", Some("CA")).unwrap();
        assert_eq!(
            first.resolved[&key].organization_id,
            second.resolved[&key].organization_id
        );
        assert_eq!(store.count_organizations().unwrap(), 1);
    }

    #[test]
    fn test_lookup_tolerates_duplicates_and_misses() {
        let mut store = MemoryStore::new();
        store.upsert(&[template("Acme", Some("TX"))]);

        let hit = MatchKey::from_raw("acme", Some("TX")).unwrap();
        let miss = MatchKey::from_raw("acme", None).unwrap();
        let found = store.lookup(&[hit.clone(), hit.clone(), miss.clone()]).unwrap();

        assert_eq!(found.len(), 1);
        assert!(found.contains_key(&hit));
        assert!(!found.contains_key(&miss));
    }

    #[test]
    fn test_concurrent_upserts_create_one_organization() {
        let store = MemoryStore::new();
        let key = MatchKey::from_raw("acme inc", Some("CA")).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let mut store = store.clone();
                let key = key.clone();
                thread::spawn(move || {
                    // Each "driver" misses on lookup, then races to create
                    let _ = store.lookup(&[key]).unwrap();
                    store
                        .upsert(&[template("Acme Inc", Some("CA"))])
                        .resolved
                        .values()
                        .next()
                        .unwrap()
                        .organization_id
                        .clone()
                })
            })
            .collect();

        let ids: HashSet<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(ids.len(), 1);
        assert_eq!(store.count_organizations().unwrap(), 1);
    }

    #[test]
    fn test_link_never_overwrites() {
        let mut store = MemoryStore::new();
        let program = loans();
        store
            .insert_source("ppp_loans", SourceRecord::new(1, "Acme", Some("CA")))
            .unwrap();

        let first = store
            .link(&program, &[Link { record_id: 1, organization_id: "org-a".to_string() }])
            .unwrap();
        let second = store
            .link(&program, &[
                Link { record_id: 1, organization_id: "org-b".to_string() },
                Link { record_id: 99, organization_id: "org-b".to_string() },
            ])
            .unwrap();

        assert_eq!(first.linked, 1);
        assert_eq!(second.linked, 0);
        assert_eq!(second.already_linked, 1);
        assert_eq!(second.missing, 1);

        let record = store.source("ppp_loans", 1).unwrap().unwrap();
        assert_eq!(record.organization_id.as_deref(), Some("org-a"));
    }

    #[test]
    fn test_link_records_origin_tags() {
        let mut store = MemoryStore::new();
        let program = loans();
        store
            .insert_source("ppp_loans", SourceRecord::new(1, "Acme", Some("CA")))
            .unwrap();

        let batch = store.upsert(&[template("Acme", Some("CA"))]);
        let org_id = batch.resolved.values().next().unwrap().organization_id.clone();
        store
            .link(&program, &[Link { record_id: 1, organization_id: org_id.clone() }])
            .unwrap();

        let org = store.organization(&org_id).unwrap().unwrap();
        assert!(org.origins.contains("ppp_loans"));
        assert!(org.is_loan_recipient());
    }

    #[test]
    fn test_unlinkable_excluded_from_selection() {
        let mut store = MemoryStore::new();
        let program = loans();
        store.insert_source("ppp_loans", SourceRecord::new(1, "", None)).unwrap();
        store.insert_source("ppp_loans", SourceRecord::new(2, "Acme", None)).unwrap();

        let marked = store
            .mark_unlinkable(&program, &[(1, UnlinkableReason::EmptyName)])
            .unwrap();
        let again = store
            .mark_unlinkable(&program, &[(1, UnlinkableReason::EmptyName)])
            .unwrap();

        assert_eq!(marked, 1);
        assert_eq!(again, 0);
        assert_eq!(store.count_unlinked(&program).unwrap(), 1);
        assert_eq!(store.count_unlinkable(&program).unwrap(), 1);
        assert_eq!(store.select_unlinked(&program, 10).unwrap()[0].id, 2);
    }

    #[test]
    fn test_failures_are_transient() {
        let mut store = MemoryStore::new();
        store.fail_upserts_for("acme").unwrap();

        let batch = store.upsert(&[template("Acme", None), template("Bolt", None)]);
        assert_eq!(batch.failed.len(), 1);
        assert!(batch.failed[0].1.is_transient());
        assert_eq!(batch.created(), 1);

        store.set_offline(true).unwrap();
        assert!(store.count_organizations().unwrap_err().is_transient());
    }

    #[test]
    fn test_broken_lookup_is_permanent() {
        let store = MemoryStore::new();
        store.break_lookups("too many SQL variables").unwrap();

        let key = MatchKey::from_raw("acme", None).unwrap();
        let err = store.lookup(&[key.clone()]).unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("too many SQL variables"));

        store.clear_failures().unwrap();
        assert!(store.lookup(&[key]).unwrap().is_empty());
    }
}
