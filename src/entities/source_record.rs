// 📄 Source Record - one row from a program table (PPP loan, grant, ...)
//
// Built once at the table boundary so the rest of the pipeline never sees an
// untyped row. The linker only ever moves `organization_id` from None to Some.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Primary key in the program table
    pub id: i64,

    /// Raw recipient name as imported (may be missing)
    pub name: Option<String>,

    pub address: Option<String>,
    pub city: Option<String>,

    /// Raw region/state code, not yet validated
    pub state: Option<String>,

    pub zip: Option<String>,

    /// Canonical organization this record resolved to
    pub organization_id: Option<String>,
}

impl SourceRecord {
    /// Unlinked record with just a name and region
    pub fn new(id: i64, name: &str, state: Option<&str>) -> Self {
        SourceRecord {
            id,
            name: Some(name.to_string()),
            address: None,
            city: None,
            state: state.map(|s| s.to_string()),
            zip: None,
            organization_id: None,
        }
    }

    /// Builder-style address setter
    pub fn with_address(mut self, address: &str, city: &str, zip: &str) -> Self {
        self.address = Some(address.to_string());
        self.city = Some(city.to_string());
        self.zip = Some(zip.to_string());
        self
    }

    pub fn is_linked(&self) -> bool {
        self.organization_id.is_some()
    }
}

/// Why a record can never be linked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnlinkableReason {
    /// Name normalizes to nothing (missing, blank, or punctuation only)
    EmptyName,
}

impl UnlinkableReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnlinkableReason::EmptyName => "empty_name",
        }
    }
}

/// A resolved (record → organization) pair for the linker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub record_id: i64,
    pub organization_id: String,
}
