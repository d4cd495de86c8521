// 🔁 Convergence Driver - drain the unlinked backlog page by page
//
// Each iteration:
//   select page (null reference, not unlinkable)
//     → group by MatchKey
//     → Lookup existing ids
//     → Upsert the misses
//     → Link every record whose key resolved
//     → mark key-less records unlinkable
//
// Selection is "whatever is still pending", never an offset, so killing the
// process between pages loses nothing: the next run just picks up the rest.

use crate::config::{LinkerConfig, ProgramConfig};
use crate::entities::{Link, NewOrganization, SourceRecord, UnlinkableReason};
use crate::matching::MatchKey;
use crate::registry::{RegistryStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

// ============================================================================
// SETTINGS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSettings {
    pub page_size: usize,
    pub lookup_chunk: usize,
    pub link_chunk: usize,
    pub max_pages: Option<usize>,
}

impl Default for DriverSettings {
    fn default() -> Self {
        DriverSettings::from(&LinkerConfig::default())
    }
}

impl From<&LinkerConfig> for DriverSettings {
    fn from(config: &LinkerConfig) -> Self {
        DriverSettings {
            page_size: config.page_size.max(1),
            lookup_chunk: config.lookup_chunk.max(1),
            link_chunk: config.link_chunk.max(1),
            max_pages: config.max_pages,
        }
    }
}

// ============================================================================
// OUTCOMES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgramStatus {
    /// Selection came back empty
    Done,

    /// A non-empty page made no forward progress; the rest waits for next run
    Stalled,

    /// Stop flag raised or page cap reached, at a page boundary
    Stopped,

    /// Selection itself failed
    Interrupted,
}

impl ProgramStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramStatus::Done => "done",
            ProgramStatus::Stalled => "stalled",
            ProgramStatus::Stopped => "stopped",
            ProgramStatus::Interrupted => "interrupted",
        }
    }
}

/// What one page iteration did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageOutcome {
    pub selected: usize,
    pub linked: usize,

    /// Linked by someone else between select and update
    pub already_linked: usize,

    pub created: usize,

    /// Keys that resolved to an organization that already existed
    pub matched: usize,

    pub unlinkable: usize,

    /// Keys left unresolved by a transient store failure
    pub failed_keys: usize,

    /// Records left pending by a transient store failure
    pub failed_records: usize,

    /// First store error that retrying will not fix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permanent_error: Option<String>,
}

impl PageOutcome {
    fn note_failure(&mut self, error: &StoreError) {
        if !error.is_transient() && self.permanent_error.is_none() {
            self.permanent_error = Some(error.to_string());
        }
    }

    /// Anything that removes records from the pending set
    pub fn made_progress(&self) -> bool {
        self.linked + self.already_linked + self.unlinkable > 0
    }
}

/// Totals for draining one program
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramOutcome {
    pub program: String,
    pub status: ProgramStatus,
    pub pages: usize,
    pub linked: usize,
    pub already_linked: usize,
    pub created: usize,
    pub matched: usize,
    pub unlinkable: usize,
    pub failed_keys: usize,
    pub failed_records: usize,
    pub error: Option<String>,
}

impl ProgramOutcome {
    fn new(program: &str) -> Self {
        ProgramOutcome {
            program: program.to_string(),
            status: ProgramStatus::Done,
            pages: 0,
            linked: 0,
            already_linked: 0,
            created: 0,
            matched: 0,
            unlinkable: 0,
            failed_keys: 0,
            failed_records: 0,
            error: None,
        }
    }

    fn interrupted(program: &str, error: String) -> Self {
        ProgramOutcome {
            status: ProgramStatus::Interrupted,
            error: Some(error),
            ..ProgramOutcome::new(program)
        }
    }

    fn absorb(&mut self, page: &PageOutcome) {
        self.pages += 1;
        self.linked += page.linked;
        self.already_linked += page.already_linked;
        self.created += page.created;
        self.matched += page.matched;
        self.unlinkable += page.unlinkable;
        self.failed_keys += page.failed_keys;
        self.failed_records += page.failed_records;
    }
}

// ============================================================================
// DRIVER
// ============================================================================

pub struct ConvergenceDriver {
    settings: DriverSettings,
    stop: Arc<AtomicBool>,
}

impl ConvergenceDriver {
    pub fn new(settings: DriverSettings) -> Self {
        ConvergenceDriver {
            settings,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a stop flag with a signal handler or another thread
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Drain programs one after another on a single store
    pub fn run<S: RegistryStore>(
        &self,
        store: &mut S,
        programs: &[ProgramConfig],
    ) -> Vec<ProgramOutcome> {
        programs
            .iter()
            .map(|program| self.drain(store, program))
            .collect()
    }

    /// Drain each program on its own thread with its own store
    ///
    /// Pages of one program stay sequential; only distinct programs overlap.
    /// Keys shared across programs are arbitrated by the store's uniqueness
    /// constraint.
    pub fn run_parallel<S, F>(&self, open: F, programs: &[ProgramConfig]) -> Vec<ProgramOutcome>
    where
        S: RegistryStore,
        F: Fn() -> anyhow::Result<S> + Sync,
    {
        thread::scope(|scope| {
            let handles: Vec<_> = programs
                .iter()
                .map(|program| {
                    let open = &open;
                    scope.spawn(move || match open() {
                        Ok(mut store) => self.drain(&mut store, program),
                        Err(e) => ProgramOutcome::interrupted(&program.name, format!("{:#}", e)),
                    })
                })
                .collect();

            handles
                .into_iter()
                .zip(programs)
                .map(|(handle, program)| {
                    handle.join().unwrap_or_else(|_| {
                        ProgramOutcome::interrupted(&program.name, "worker panicked".to_string())
                    })
                })
                .collect()
        })
    }

    /// Run pages for one program until Done, Stalled, Stopped or Interrupted
    pub fn drain<S: RegistryStore>(&self, store: &mut S, program: &ProgramConfig) -> ProgramOutcome {
        let mut outcome = ProgramOutcome::new(&program.name);
        info!(program = %program.name, page_size = self.settings.page_size, "draining program");

        let status = loop {
            if self.stop.load(Ordering::SeqCst) {
                info!(program = %program.name, "stop requested");
                break ProgramStatus::Stopped;
            }
            if self.settings.max_pages.is_some_and(|max| outcome.pages >= max) {
                info!(program = %program.name, pages = outcome.pages, "page cap reached");
                break ProgramStatus::Stopped;
            }

            let page = match store.select_unlinked(program, self.settings.page_size) {
                Ok(page) => page,
                Err(e) => {
                    warn!(program = %program.name, error = %e, "selection failed");
                    outcome.error = Some(e.to_string());
                    break ProgramStatus::Interrupted;
                }
            };
            if page.is_empty() {
                break ProgramStatus::Done;
            }

            let result = self.process_page(store, program, page);
            outcome.absorb(&result);
            debug!(
                program = %program.name,
                page = outcome.pages,
                selected = result.selected,
                linked = result.linked,
                created = result.created,
                matched = result.matched,
                unlinkable = result.unlinkable,
                failed_keys = result.failed_keys,
                "page committed"
            );

            // The same statement would fail on every later page
            if let Some(error) = &result.permanent_error {
                warn!(program = %program.name, error = %error, "non-retryable store error");
                outcome.error = Some(error.clone());
                break ProgramStatus::Interrupted;
            }

            if !result.made_progress() {
                warn!(
                    program = %program.name,
                    pending = result.selected,
                    "no forward progress, leaving remaining records for the next run"
                );
                break ProgramStatus::Stalled;
            }
        };
        outcome.status = status;

        info!(
            program = %program.name,
            status = outcome.status.as_str(),
            pages = outcome.pages,
            linked = outcome.linked,
            created = outcome.created,
            matched = outcome.matched,
            unlinkable = outcome.unlinkable,
            "program finished"
        );
        outcome
    }

    /// One select→resolve→link iteration over an already-selected page
    pub fn process_page<S: RegistryStore>(
        &self,
        store: &mut S,
        program: &ProgramConfig,
        page: Vec<SourceRecord>,
    ) -> PageOutcome {
        let mut outcome = PageOutcome {
            selected: page.len(),
            ..PageOutcome::default()
        };

        // 1. Group by key; page arrives ordered by id so records[0] is first-seen
        let mut groups: BTreeMap<MatchKey, Vec<SourceRecord>> = BTreeMap::new();
        let mut unlinkable = Vec::new();
        for record in page {
            match MatchKey::from_record(&record) {
                Some(key) => groups.entry(key).or_default().push(record),
                None => unlinkable.push((record.id, UnlinkableReason::EmptyName)),
            }
        }

        // 2. Lookup
        let keys: Vec<MatchKey> = groups.keys().cloned().collect();
        let mut resolved: HashMap<MatchKey, String> = HashMap::with_capacity(keys.len());
        let mut failed: HashSet<MatchKey> = HashSet::new();
        for chunk in keys.chunks(self.settings.lookup_chunk) {
            match store.lookup(chunk) {
                Ok(found) => {
                    outcome.matched += found.len();
                    resolved.extend(found);
                }
                Err(e) => {
                    warn!(program = %program.name, keys = chunk.len(), error = %e, "lookup failed");
                    outcome.note_failure(&e);
                    failed.extend(chunk.iter().cloned());
                }
            }
        }

        // 3. Upsert whatever Lookup did not find
        let templates: Vec<NewOrganization> = groups
            .iter()
            .filter(|(key, _)| !resolved.contains_key(*key) && !failed.contains(*key))
            .map(|(key, records)| NewOrganization::from_record(key.clone(), &records[0], program))
            .collect();
        if !templates.is_empty() {
            let batch = store.upsert(&templates);
            outcome.created += batch.created();
            outcome.matched += batch.matched();
            for (key, e) in batch.failed {
                warn!(program = %program.name, key = %key, error = %e, "upsert failed");
                outcome.note_failure(&e);
                failed.insert(key);
            }
            resolved.extend(
                batch
                    .resolved
                    .into_iter()
                    .map(|(key, resolution)| (key, resolution.organization_id)),
            );
        }
        outcome.failed_keys = failed.len();
        outcome.failed_records = failed
            .iter()
            .filter_map(|key| groups.get(key).map(Vec::len))
            .sum();

        // 4. Link
        let links: Vec<Link> = groups
            .iter()
            .filter_map(|(key, records)| resolved.get(key).map(|id| (id, records)))
            .flat_map(|(id, records)| {
                records.iter().map(move |record| Link {
                    record_id: record.id,
                    organization_id: id.clone(),
                })
            })
            .collect();
        for chunk in links.chunks(self.settings.link_chunk) {
            match store.link(program, chunk) {
                Ok(summary) => {
                    outcome.linked += summary.linked;
                    // Vanished rows are not pending anymore either
                    outcome.already_linked += summary.already_linked + summary.missing;
                }
                Err(e) => {
                    warn!(program = %program.name, records = chunk.len(), error = %e, "link failed");
                    outcome.note_failure(&e);
                    outcome.failed_records += chunk.len();
                }
            }
        }

        // 5. Park records that can never produce a key
        if !unlinkable.is_empty() {
            match store.mark_unlinkable(program, &unlinkable) {
                Ok(marked) => {
                    outcome.unlinkable += marked;
                    debug!(program = %program.name, marked, "records marked unlinkable");
                }
                Err(e) => {
                    warn!(program = %program.name, records = unlinkable.len(), error = %e, "could not mark unlinkable");
                    outcome.note_failure(&e);
                    outcome.failed_records += unlinkable.len();
                }
            }
        }

        outcome
    }
}

// ============================================================================
// TESTS
// ============================================================================
