// Entity Models
//
// Typed values built once at the table boundary:
// - SourceRecord: a row from one funding program's table
// - CanonicalOrganization: the deduplicated recipient (stable UUID identity)

pub mod organization;
pub mod source_record;

pub use organization::{CanonicalOrganization, NewOrganization};
pub use source_record::{Link, SourceRecord, UnlinkableReason};
