// Recipient Linker - Core Library
// Resolves funding-program records to one canonical organization registry

pub mod config;      // Program + column mapping, run settings
pub mod matching;    // Match Key normalizer
pub mod entities;    // SourceRecord, CanonicalOrganization
pub mod registry;    // RegistryStore trait + in-memory store
pub mod db;          // SQLite-backed RegistryStore
pub mod convergence; // Page-by-page linking driver
pub mod report;      // Before/after progress reporting

// Re-export commonly used types
pub use config::{ColumnMap, ConfigError, LinkerConfig, ProgramConfig, ProgramKind};
pub use matching::{normalize_name, normalize_region, MatchKey};
pub use entities::{CanonicalOrganization, Link, NewOrganization, SourceRecord, UnlinkableReason};
pub use registry::{LinkSummary, MemoryStore, RegistryStore, Resolution, StoreError, UpsertBatch};
pub use db::SqliteStore;
pub use convergence::{
    ConvergenceDriver, DriverSettings, PageOutcome, ProgramOutcome, ProgramStatus,
};
pub use report::{ProgramCounts, ProgramReport, ProgressReporter, RunReport, RunTotals, Snapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
