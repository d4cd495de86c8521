// 📊 Progress Reporter - before/after counts for every linking run
//
// Pure read-and-format: snapshots only count rows, and the run report is
// assembled from the driver's outcomes plus two snapshots.

use crate::config::ProgramConfig;
use crate::convergence::{ProgramOutcome, ProgramStatus};
use crate::registry::{RegistryStore, StoreError};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

// ============================================================================
// SNAPSHOT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramCounts {
    pub program: String,

    /// Pending: null reference and not marked unlinkable
    pub unlinked: u64,

    pub unlinkable: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub organizations: u64,
    pub programs: Vec<ProgramCounts>,
}

impl Snapshot {
    pub fn program(&self, name: &str) -> Option<&ProgramCounts> {
        self.programs.iter().find(|p| p.program == name)
    }

    pub fn total_unlinked(&self) -> u64 {
        self.programs.iter().map(|p| p.unlinked).sum()
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "📦 Registry status ({})", self.taken_at.format("%Y-%m-%d %H:%M:%S UTC"));
        let _ = writeln!(out, "{}", RULE);
        let _ = writeln!(out, "{:<20} {:>12} {:>12}", "program", "unlinked", "unlinkable");
        for p in &self.programs {
            let _ = writeln!(out, "{:<20} {:>12} {:>12}", p.program, p.unlinked, p.unlinkable);
        }
        let _ = writeln!(out, "{}", RULE);
        let _ = write!(out, "Canonical organizations: {}", self.organizations);
        out
    }
}

// ============================================================================
// RUN REPORT
// ============================================================================

/// One row per program: `{program, before_unlinked, after_unlinked, linked,
/// created, matched}` plus status and unlinkable counts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramReport {
    pub program: String,
    pub status: ProgramStatus,
    pub before_unlinked: u64,
    pub after_unlinked: u64,
    pub linked: usize,
    pub created: usize,
    pub matched: usize,
    pub unlinkable: usize,
    pub failed_records: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub linked: usize,
    pub created: usize,
    pub matched: usize,
    pub unlinkable: usize,
    pub failed_records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub organizations_before: u64,
    pub organizations_after: u64,
    pub programs: Vec<ProgramReport>,
    pub totals: RunTotals,
}

impl RunReport {
    /// Every program drained and nothing left pending because of failures
    pub fn is_clean(&self) -> bool {
        self.programs
            .iter()
            .all(|p| p.status == ProgramStatus::Done && p.failed_records == 0)
    }

    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "🔗 Entity linking run ({} → {})",
            self.started_at.format("%H:%M:%S"),
            self.finished_at.format("%H:%M:%S")
        );
        let _ = writeln!(out, "{}", RULE);
        let _ = writeln!(
            out,
            "{:<16} {:<12} {:>10} {:>10} {:>9} {:>9} {:>9} {:>11}",
            "program", "status", "before", "after", "linked", "created", "matched", "unlinkable"
        );
        for p in &self.programs {
            let _ = writeln!(
                out,
                "{:<16} {:<12} {:>10} {:>10} {:>9} {:>9} {:>9} {:>11}",
                p.program,
                p.status.as_str(),
                p.before_unlinked,
                p.after_unlinked,
                p.linked,
                p.created,
                p.matched,
                p.unlinkable
            );
            if let Some(error) = &p.error {
                let _ = writeln!(out, "  ⚠️  {}", error);
            }
        }
        let _ = writeln!(out, "{}", RULE);
        let _ = writeln!(
            out,
            "Organizations: {} → {} (+{})",
            self.organizations_before,
            self.organizations_after,
            self.organizations_after.saturating_sub(self.organizations_before)
        );
        let _ = write!(
            out,
            "Totals: linked {}, created {}, matched {}, unlinkable {}, left pending by errors {}",
            self.totals.linked,
            self.totals.created,
            self.totals.matched,
            self.totals.unlinkable,
            self.totals.failed_records
        );
        out
    }

    /// Per-program rows as CSV
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create report file {}", path.display()))?;
        for program in &self.programs {
            wtr.serialize(program)
                .context("Failed to write report row")?;
        }
        wtr.flush()?;
        Ok(())
    }
}

// ============================================================================
// REPORTER
// ============================================================================

pub struct ProgressReporter;

impl ProgressReporter {
    /// Count pending/unlinkable rows per program and total organizations
    pub fn snapshot<S: RegistryStore>(
        store: &S,
        programs: &[ProgramConfig],
    ) -> Result<Snapshot, StoreError> {
        let counts = programs
            .iter()
            .map(|program| {
                Ok(ProgramCounts {
                    program: program.name.clone(),
                    unlinked: store.count_unlinked(program)?,
                    unlinkable: store.count_unlinkable(program)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(Snapshot {
            taken_at: Utc::now(),
            organizations: store.count_organizations()?,
            programs: counts,
        })
    }

    pub fn finish(before: &Snapshot, outcomes: &[ProgramOutcome], after: &Snapshot) -> RunReport {
        let programs: Vec<ProgramReport> = outcomes
            .iter()
            .map(|outcome| ProgramReport {
                program: outcome.program.clone(),
                status: outcome.status,
                before_unlinked: before.program(&outcome.program).map_or(0, |p| p.unlinked),
                after_unlinked: after.program(&outcome.program).map_or(0, |p| p.unlinked),
                linked: outcome.linked,
                created: outcome.created,
                matched: outcome.matched,
                unlinkable: outcome.unlinkable,
                failed_records: outcome.failed_records,
                error: outcome.error.clone(),
            })
            .collect();

        let totals = programs.iter().fold(RunTotals::default(), |mut t, p| {
            t.linked += p.linked;
            t.created += p.created;
            t.matched += p.matched;
            t.unlinkable += p.unlinkable;
            t.failed_records += p.failed_records;
            t
        });

        RunReport {
            started_at: before.taken_at,
            finished_at: after.taken_at,
            organizations_before: before.organizations,
            organizations_after: after.organizations,
            programs,
            totals,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
