// 🏢 Canonical Organization - one real-world recipient across all programs
//
// "Name is a VALUE, the UUID is IDENTITY": the id is minted once per match key
// and never changes. legal_name and address are first-write-wins and are not
// reconciled afterwards.

use crate::config::{ProgramConfig, ProgramKind};
use crate::entities::SourceRecord;
use crate::matching::MatchKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ============================================================================
// CANONICAL ORGANIZATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalOrganization {
    /// Stable identity (UUID) - NEVER changes
    pub id: String,

    /// First raw name observed for the key
    pub legal_name: String,

    pub normalized_name: String,

    /// None = unknown-region bucket
    pub state: Option<String>,

    pub address: Option<String>,
    pub city: Option<String>,
    pub zip: Option<String>,

    /// Program that created the organization
    pub first_program: String,

    pub created_at: DateTime<Utc>,

    /// Programs that contributed at least one linked record
    pub origins: BTreeSet<String>,

    /// Kinds of the contributing programs
    pub kinds: BTreeSet<String>,
}

impl CanonicalOrganization {
    /// Materialize a template as a brand-new organization
    pub fn create(template: &NewOrganization) -> Self {
        CanonicalOrganization {
            id: uuid::Uuid::new_v4().to_string(),
            legal_name: template.legal_name.clone(),
            normalized_name: template.key.normalized_name.clone(),
            state: template.key.region.clone(),
            address: template.address.clone(),
            city: template.city.clone(),
            zip: template.zip.clone(),
            first_program: template.program.clone(),
            created_at: Utc::now(),
            origins: BTreeSet::new(),
            kinds: BTreeSet::new(),
        }
    }

    pub fn match_key(&self) -> MatchKey {
        MatchKey {
            normalized_name: self.normalized_name.clone(),
            region: self.state.clone(),
        }
    }

    pub fn has_kind(&self, kind: ProgramKind) -> bool {
        self.kinds.contains(kind.as_str())
    }

    pub fn is_loan_recipient(&self) -> bool {
        self.has_kind(ProgramKind::Loan)
    }

    pub fn is_grant_recipient(&self) -> bool {
        self.has_kind(ProgramKind::Grant)
    }

    pub fn is_donor(&self) -> bool {
        self.has_kind(ProgramKind::Donation)
    }

    pub fn is_licensee(&self) -> bool {
        self.has_kind(ProgramKind::License)
    }
}

// ============================================================================
// NEW ORGANIZATION (upsert template)
// ============================================================================

/// Template for an organization that Lookup did not find
///
/// Taken from the first record observed for the key in a page.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrganization {
    pub key: MatchKey,
    pub legal_name: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub zip: Option<String>,
    pub program: String,
    pub kind: ProgramKind,
}

impl NewOrganization {
    pub fn from_record(key: MatchKey, record: &SourceRecord, program: &ProgramConfig) -> Self {
        let legal_name = record
            .name
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();

        NewOrganization {
            key,
            legal_name,
            address: record.address.clone(),
            city: record.city.clone(),
            zip: record.zip.clone(),
            program: program.name.clone(),
            kind: program.kind,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
