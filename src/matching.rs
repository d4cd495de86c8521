// 🔑 Matching - Normalizer + Match Key Builder
//
// Two raw records refer to the same canonical organization when their
// match keys are equal. No fuzzy matching happens here:
//
//   "ACME, Inc." + "ca"  → ("acme inc", Some("CA"))
//   "acme inc"   + "CA"  → ("acme inc", Some("CA"))   same key
//   "ACME Inc."  + "NY"  → ("acme inc", Some("NY"))   different key
//   "ACME Inc."  + None  → ("acme inc", None)         its own bucket

use crate::entities::SourceRecord;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// NORMALIZER
// ============================================================================

/// Normalize a raw recipient name into a match token
///
/// - ASCII lowercase
/// - Any whitespace becomes a plain space
/// - Everything outside `[a-z0-9 ]` is removed
/// - Whitespace runs collapse to one space, ends trimmed
///
/// Idempotent: `normalize_name(&normalize_name(x)) == normalize_name(x)`.
pub fn normalize_name(raw: &str) -> String {
    let kept: String = raw
        .chars()
        .filter_map(|c| {
            if c.is_whitespace() {
                Some(' ')
            } else {
                let lower = c.to_ascii_lowercase();
                if lower.is_ascii_lowercase() || lower.is_ascii_digit() {
                    Some(lower)
                } else {
                    None
                }
            }
        })
        .collect();

    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize a raw region into a two-letter state code
///
/// Returns `None` unless the trimmed value is exactly two ASCII letters.
pub fn normalize_region(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if trimmed.len() == 2 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(trimmed.to_ascii_uppercase())
    } else {
        None
    }
}

// ============================================================================
// MATCH KEY
// ============================================================================

/// Composite key deciding which canonical organization a record belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatchKey {
    pub normalized_name: String,

    /// `None` is the unknown-region bucket, never a wildcard
    pub region: Option<String>,
}

impl MatchKey {
    /// Build a key from an already-normalized name
    ///
    /// Returns `None` for an empty name: it cannot identify anything.
    pub fn build(normalized_name: String, region: Option<String>) -> Option<Self> {
        if normalized_name.is_empty() {
            return None;
        }
        Some(MatchKey {
            normalized_name,
            region,
        })
    }

    /// Build a key straight from raw text
    pub fn from_raw(name: &str, region: Option<&str>) -> Option<Self> {
        Self::build(normalize_name(name), normalize_region(region))
    }

    pub fn from_record(record: &SourceRecord) -> Option<Self> {
        Self::from_raw(
            record.name.as_deref().unwrap_or(""),
            record.state.as_deref(),
        )
    }

    /// Region as stored in the registry's unique index ('' = unknown)
    pub fn region_column(&self) -> &str {
        self.region.as_deref().unwrap_or("")
    }

    /// Inverse of `region_column`
    pub fn region_from_column(column: &str) -> Option<String> {
        if column.is_empty() {
            None
        } else {
            Some(column.to_string())
        }
    }
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}",
            self.normalized_name,
            self.region.as_deref().unwrap_or("??")
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name_examples() {
        assert_eq!(normalize_name("ACME, Inc."), "acme inc");
        assert_eq!(normalize_name("acme inc"), "acme inc");
        assert_eq!(normalize_name("  Joe's   Pizza\t& Subs  "), "joes pizza subs");
        assert_eq!(normalize_name("A-1 Plumbing LLC"), "a1 plumbing llc");
        assert_eq!(normalize_name("Café Olé"), "caf ol");
        assert_eq!(normalize_name("Line\nBreak"), "line break");
    }

    #[test]
    fn test_normalize_name_empty_inputs() {
        assert_eq!(normalize_name(""), "");
        assert_eq!(normalize_name("   \t  "), "");
        assert_eq!(normalize_name("..,;--"), "");
        assert_eq!(normalize_name("☃☃☃"), "");
    }

    #[test]
    fn test_normalize_name_idempotent() {
        let samples = [
            "ACME, Inc.",
            "  multiple   spaces  ",
            "Tabs\tand\nnewlines",
            "Ünïcödé Ñame GmbH",
            "123 Main St. #4",
            "\u{212A}elvin sign",
            "",
            "O'Neil & Sons, L.L.C.",
        ];

        for raw in samples {
            let once = normalize_name(raw);
            assert_eq!(normalize_name(&once), once, "not idempotent for {:?}", raw);
        }
    }

    #[test]
    fn test_normalize_region() {
        assert_eq!(normalize_region(Some("ca")), Some("CA".to_string()));
        assert_eq!(normalize_region(Some(" NY ")), Some("NY".to_string()));
        assert_eq!(normalize_region(Some("Calif")), None);
        assert_eq!(normalize_region(Some("C1")), None);
        assert_eq!(normalize_region(Some("")), None);
        assert_eq!(normalize_region(None), None);
    }

    #[test]
    fn test_match_key_merge_rules() {
        let a = MatchKey::from_raw("ACME Inc.", Some("CA")).unwrap();
        let b = MatchKey::from_raw("acme inc", Some("ca")).unwrap();
        let c = MatchKey::from_raw("ACME Inc.", Some("NY")).unwrap();
        let d = MatchKey::from_raw("ACME Inc.", None).unwrap();
        let e = MatchKey::from_raw("ACME Inc.", Some("California")).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);

        // Regionless keys are a separate bucket
        assert_ne!(a, d);
        assert_eq!(d, e);
    }

    #[test]
    fn test_match_key_rejects_empty_name() {
        assert!(MatchKey::from_raw("", Some("CA")).is_none());
        assert!(MatchKey::from_raw("!!!", Some("CA")).is_none());
        assert!(MatchKey::build(String::new(), None).is_none());
    }

    #[test]
    fn test_region_column_round_trip() {
        let key = MatchKey::from_raw("acme", None).unwrap();
        assert_eq!(key.region_column(), "");
        assert_eq!(MatchKey::region_from_column(""), None);
        assert_eq!(MatchKey::region_from_column("TX"), Some("TX".to_string()));
        assert_eq!(key.to_string(), "acme|??");
    }
}
