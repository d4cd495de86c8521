// ⚙️ Configuration - which tables feed the registry, and how hard to push
//
// Loaded from a JSON file; every field has a default so an empty `{}` is a
// valid config that links the three built-in programs.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// ERRORS
// ============================================================================

/// Fatal configuration errors: the run aborts before any page is processed
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{field} must be greater than zero")]
    ZeroSize { field: &'static str },

    #[error("{field} must be at most {max}")]
    TooLarge { field: &'static str, max: usize },

    #[error("Program '{0}' is configured more than once")]
    DuplicateProgram(String),

    #[error("Unknown program '{0}'")]
    UnknownProgram(String),

    #[error("'{0}' is not a valid SQL identifier")]
    InvalidIdentifier(String),

    #[error("Table '{table}' for program '{program}' does not exist")]
    MissingTable { program: String, table: String },

    #[error("Id column '{column}' of table '{table}' (program '{program}') is declared '{declared}', expected an INTEGER type")]
    NonIntegerId {
        program: String,
        table: String,
        column: String,
        declared: String,
    },

    #[error("Column '{column}' missing from table '{table}' (program '{program}')")]
    MissingColumn {
        program: String,
        table: String,
        column: String,
    },
}

// ============================================================================
// PROGRAMS
// ============================================================================

/// What kind of funding a program hands out
///
/// Drives the capability flags on canonical organizations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgramKind {
    Loan,
    Grant,
    Donation,
    License,
}

impl ProgramKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramKind::Loan => "loan",
            ProgramKind::Grant => "grant",
            ProgramKind::Donation => "donation",
            ProgramKind::License => "license",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "loan" => Some(ProgramKind::Loan),
            "grant" => Some(ProgramKind::Grant),
            "donation" => Some(ProgramKind::Donation),
            "license" => Some(ProgramKind::License),
            _ => None,
        }
    }
}

/// Which source columns feed the normalizer and the organization template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMap {
    /// Record identifier; must be declared with an INTEGER type (rowid-style).
    /// Tables keyed by text (loan numbers etc.) need an integer surrogate key.
    #[serde(default = "default_id_column")]
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub address: Option<String>,

    #[serde(default)]
    pub city: Option<String>,

    #[serde(default)]
    pub state: Option<String>,

    #[serde(default)]
    pub zip: Option<String>,

    /// Nullable reference column written by the linker
    #[serde(default = "default_organization_ref")]
    pub organization_ref: String,
}

impl ColumnMap {
    /// Every column the linker reads or writes
    pub fn all(&self) -> Vec<&str> {
        let mut columns = vec![self.id.as_str(), self.name.as_str()];
        for optional in [&self.address, &self.city, &self.state, &self.zip] {
            if let Some(column) = optional {
                columns.push(column.as_str());
            }
        }
        columns.push(self.organization_ref.as_str());
        columns
    }
}

/// One source program (PPP loans, state grants, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramConfig {
    pub name: String,
    pub kind: ProgramKind,
    pub table: String,
    pub columns: ColumnMap,
}

impl ProgramConfig {
    /// Program with the column names most import jobs use
    pub fn new(name: &str, kind: ProgramKind, table: &str, name_column: &str) -> Self {
        ProgramConfig {
            name: name.to_string(),
            kind,
            table: table.to_string(),
            columns: ColumnMap {
                id: default_id_column(),
                name: name_column.to_string(),
                address: Some("address".to_string()),
                city: Some("city".to_string()),
                state: Some("state".to_string()),
                zip: Some("zip".to_string()),
                organization_ref: default_organization_ref(),
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        check_identifier(&self.table)?;
        for column in self.columns.all() {
            check_identifier(column)?;
        }
        Ok(())
    }
}

// ============================================================================
// LINKER CONFIG
// ============================================================================

/// Each looked-up key binds two SQL variables; SQLite allows 32766 per statement
pub const MAX_LOOKUP_CHUNK: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkerConfig {
    /// SQLite database holding source tables and the registry
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Source records selected per iteration
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Keys per lookup statement
    #[serde(default = "default_lookup_chunk")]
    pub lookup_chunk: usize,

    /// Records per link statement batch
    #[serde(default = "default_link_chunk")]
    pub link_chunk: usize,

    /// How long one store call may wait on a locked database
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Stop each program after this many pages (None = drain fully)
    #[serde(default)]
    pub max_pages: Option<usize>,

    #[serde(default = "default_programs")]
    pub programs: Vec<ProgramConfig>,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        LinkerConfig {
            database: default_database(),
            page_size: default_page_size(),
            lookup_chunk: default_lookup_chunk(),
            link_chunk: default_link_chunk(),
            busy_timeout_ms: default_busy_timeout_ms(),
            max_pages: None,
            programs: default_programs(),
        }
    }
}

impl LinkerConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: LinkerConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::ZeroSize { field: "page_size" });
        }
        if self.lookup_chunk == 0 {
            return Err(ConfigError::ZeroSize { field: "lookup_chunk" });
        }
        if self.link_chunk == 0 {
            return Err(ConfigError::ZeroSize { field: "link_chunk" });
        }
        if self.lookup_chunk > MAX_LOOKUP_CHUNK {
            return Err(ConfigError::TooLarge {
                field: "lookup_chunk",
                max: MAX_LOOKUP_CHUNK,
            });
        }

        let mut seen = HashSet::new();
        for program in &self.programs {
            if !seen.insert(program.name.as_str()) {
                return Err(ConfigError::DuplicateProgram(program.name.clone()));
            }
            program.validate()?;
        }
        Ok(())
    }

    /// Programs to run; all of them when `names` is empty
    pub fn select_programs(&self, names: &[String]) -> Result<Vec<ProgramConfig>, ConfigError> {
        if names.is_empty() {
            return Ok(self.programs.clone());
        }
        names
            .iter()
            .map(|name| {
                self.programs
                    .iter()
                    .find(|p| &p.name == name)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownProgram(name.clone()))
            })
            .collect()
    }
}

/// Table and column names are spliced into SQL, so only plain identifiers pass
pub fn check_identifier(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier(name.to_string()))
    }
}

// Helper functions for serde defaults
fn default_database() -> PathBuf {
    PathBuf::from("recipients.db")
}

fn default_page_size() -> usize {
    2000
}

fn default_lookup_chunk() -> usize {
    250
}

fn default_link_chunk() -> usize {
    500
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_organization_ref() -> String {
    "organization_id".to_string()
}

fn default_programs() -> Vec<ProgramConfig> {
    vec![
        ProgramConfig::new("ppp_loans", ProgramKind::Loan, "ppp_loans", "borrower_name"),
        ProgramConfig::new("eidl_loans", ProgramKind::Loan, "eidl_loans", "borrower_name"),
        ProgramConfig::new("state_grants", ProgramKind::Grant, "state_grants", "recipient_name"),
    ]
}

// ============================================================================
// TESTS
// ============================================================================
