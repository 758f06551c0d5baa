//! Identity normalization: turns raw license numbers, names and address hints
//! into keys that compare equal across feeds.
//!
//! Every function here is pure and total. A `None` license means "cannot resolve
//! by license"; callers fall back to name + address matching.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

const MAX_LICENSE_LEN: usize = 20;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NormalizedLicense(String);

impl NormalizedLicense {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for NormalizedLicense {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_license_separator(ch: char) -> bool {
    ch.is_whitespace() || matches!(ch, '-' | '.' | '/' | '_')
}

pub fn normalize_license(raw: &str) -> Option<NormalizedLicense> {
    let mut compact = String::with_capacity(raw.len());
    for ch in raw.nfkc() {
        if is_license_separator(ch) {
            continue;
        }
        if !ch.is_ascii_alphanumeric() {
            return None;
        }
        compact.push(ch.to_ascii_uppercase());
    }
    if !compact.chars().any(|ch| ch.is_ascii_digit()) {
        return None;
    }
    let stripped = compact.trim_start_matches('0');
    if stripped.is_empty() || stripped.len() > MAX_LICENSE_LEN {
        return None;
    }
    Some(NormalizedLicense(stripped.to_string()))
}

/// Convenience for optional feed values.
pub fn normalize_optional_license(raw: Option<&str>) -> Option<NormalizedLicense> {
    raw.and_then(normalize_license)
}

/// Exact-match key for names: case, punctuation and spacing differences vanish.
pub fn normalize_name(raw: &str) -> String {
    let folded: String = raw
        .nfkc()
        .map(|ch| {
            if ch.is_alphanumeric() {
                ch
            } else {
                ' '
            }
        })
        .collect::<String>()
        .to_uppercase();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Human-facing form of a raw name: trimmed with inner whitespace collapsed.
pub fn display_name(raw: &str) -> String {
    raw.nfkc()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn address_tokens(raw: &str) -> BTreeSet<String> {
    normalize_name(raw)
        .split(' ')
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Overlap coefficient |A ∩ B| / min(|A|, |B|); 0 when either side is empty.
pub fn address_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    shared as f64 / smaller as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn license(raw: &str) -> Option<String> {
        normalize_license(raw).map(NormalizedLicense::into_string)
    }

    #[test]
    fn strips_leading_zeros_from_numeric_licenses() {
        assert_eq!(license("000123456").as_deref(), Some("123456"));
        assert_eq!(license(" 987 654 ").as_deref(), Some("987654"));
    }

    #[test]
    fn uppercases_trade_codes_and_drops_hyphens() {
        assert_eq!(license("c10").as_deref(), Some("C10"));
        assert_eq!(license("0C-10").as_deref(), Some("C10"));
        assert_eq!(license("c-36.a").as_deref(), Some("C36A"));
    }

    #[test]
    fn fullwidth_input_folds_to_ascii() {
        assert_eq!(license("ｃ１０").as_deref(), Some("C10"));
    }

    #[test]
    fn garbage_returns_none() {
        for raw in ["", "   ", "N/A", "NONE", "pending", "0000", "C10 (exp)", "#12"] {
            assert_eq!(license(raw), None, "expected '{raw}' to be rejected");
        }
        assert_eq!(license(&"9".repeat(21)), None);
    }

    #[test]
    fn optional_license_passes_none_through() {
        assert_eq!(normalize_optional_license(None), None);
        assert_eq!(
            normalize_optional_license(Some("c10")).map(NormalizedLicense::into_string),
            Some("C10".to_string())
        );
    }

    #[test]
    fn names_compare_without_case_or_punctuation() {
        assert_eq!(normalize_name("  Smith,  John "), "SMITH JOHN");
        assert_eq!(normalize_name("ACME Electric, Inc."), "ACME ELECTRIC INC");
        assert_eq!(normalize_name("acme electric inc"), "ACME ELECTRIC INC");
        assert_eq!(normalize_name("???"), "");
    }

    #[test]
    fn display_name_collapses_whitespace() {
        assert_eq!(display_name("  John   Smith "), "John Smith");
    }

    #[test]
    fn address_overlap_uses_smaller_side() {
        let a = address_tokens("123 Main St");
        let b = address_tokens("123 main street, suite 4");
        assert!((address_overlap(&a, &b) - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(address_overlap(&a, &BTreeSet::new()), 0.0);
        assert_eq!(address_overlap(&a, &a), 1.0);
    }
}
