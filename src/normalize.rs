//! Subject input canonicalization and stable request hashing.
//!
//! Two raw inputs describing the same person at the same address must
//! produce the same idempotency key, across processes and across days.
//! Hashes are SHA-256 (hex) rather than the std hasher, which is not
//! guaranteed stable between builds.

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Input that cannot be turned into a usable lookup request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("address is not usable for lookup: {reason}")]
    Address { reason: &'static str },

    #[error("person name is not usable for lookup: {reason}")]
    Person { reason: &'static str },
}

/// Street suffix and directional abbreviations applied during address
/// canonicalization. Longest token first is not required; matching is
/// whole-token.
const ADDRESS_ABBREVIATIONS: &[(&str, &str)] = &[
    ("STREET", "ST"),
    ("AVENUE", "AVE"),
    ("ROAD", "RD"),
    ("DRIVE", "DR"),
    ("LANE", "LN"),
    ("BOULEVARD", "BLVD"),
    ("COURT", "CT"),
    ("PLACE", "PL"),
    ("CIRCLE", "CIR"),
    ("TERRACE", "TER"),
    ("HIGHWAY", "HWY"),
    ("PARKWAY", "PKWY"),
    ("APARTMENT", "APT"),
    ("SUITE", "STE"),
    ("NORTH", "N"),
    ("SOUTH", "S"),
    ("EAST", "E"),
    ("WEST", "W"),
];

fn clean_tokens(raw: &str) -> Vec<String> {
    raw.split_whitespace()
        .map(|token| {
            token
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '#' || *c == '/')
                .collect::<String>()
                .to_ascii_uppercase()
        })
        .filter(|token| !token.is_empty())
        .collect()
}

/// Canonicalize a street address: uppercase, punctuation stripped,
/// whitespace collapsed, common suffixes abbreviated.
///
/// An address with no digit or no letter is rejected as unusable rather
/// than sent to the provider.
pub fn normalize_address(raw: &str) -> Result<String, NormalizeError> {
    let mut tokens = clean_tokens(raw);
    if tokens.is_empty() {
        return Err(NormalizeError::Address { reason: "empty" });
    }

    for token in &mut tokens {
        if let Some((_, abbr)) = ADDRESS_ABBREVIATIONS.iter().find(|(long, _)| long == token) {
            *token = (*abbr).to_string();
        }
    }

    let normalized = tokens.join(" ");
    if !normalized.chars().any(|c| c.is_ascii_digit()) {
        return Err(NormalizeError::Address {
            reason: "no street number",
        });
    }
    if !normalized.chars().any(|c| c.is_ascii_alphabetic()) {
        return Err(NormalizeError::Address {
            reason: "no street name",
        });
    }
    Ok(normalized)
}

/// Canonicalize a person name: uppercase, punctuation stripped except
/// hyphens, whitespace collapsed. Suffixes like JR/SR are kept since they
/// distinguish people.
pub fn normalize_person(raw: &str) -> Result<String, NormalizeError> {
    let tokens: Vec<String> = raw
        .split_whitespace()
        .map(|token| {
            token
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '\'')
                .collect::<String>()
                .to_ascii_uppercase()
        })
        .filter(|token| !token.is_empty())
        .collect();

    if tokens.is_empty() {
        return Err(NormalizeError::Person { reason: "empty" });
    }
    let normalized = tokens.join(" ");
    if normalized.chars().filter(|c| c.is_ascii_alphabetic()).count() < 2 {
        return Err(NormalizeError::Person {
            reason: "too short",
        });
    }
    Ok(normalized)
}

/// Stable key for one logical lookup: `sha256(provider|address|person)`.
///
/// The provider id participates so two sources never share cache entries.
pub fn idempotency_key(provider: &str, address: &str, person: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    hasher.update(b"|");
    hasher.update(address.as_bytes());
    hasher.update(b"|");
    hasher.update(person.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash of the exact serialized request body, for cache integrity checks.
pub fn payload_hash(body: &serde_json::Value) -> String {
    let serialized = body.to_string();
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_canonical_form() {
        let a = normalize_address("123 Main Street, Apt. 4").unwrap();
        let b = normalize_address("  123  MAIN ST APT 4 ").unwrap();
        assert_eq!(a, "123 MAIN ST APT 4");
        assert_eq!(a, b);
    }

    #[test]
    fn test_address_directionals() {
        let a = normalize_address("45 North Elm Avenue").unwrap();
        assert_eq!(a, "45 N ELM AVE");
    }

    #[test]
    fn test_address_rejects_unusable() {
        assert!(matches!(
            normalize_address("   "),
            Err(NormalizeError::Address { .. })
        ));
        assert!(matches!(
            normalize_address("Main Street"),
            Err(NormalizeError::Address { .. })
        ));
        assert!(matches!(
            normalize_address("12345"),
            Err(NormalizeError::Address { .. })
        ));
    }

    #[test]
    fn test_person_canonical_form() {
        let a = normalize_person("  Mary-Jane  O'Brien Jr. ").unwrap();
        assert_eq!(a, "MARY-JANE O'BRIEN JR");
    }

    #[test]
    fn test_person_rejects_unusable() {
        assert!(normalize_person("").is_err());
        assert!(normalize_person("?!").is_err());
        assert!(normalize_person("X").is_err());
    }

    #[test]
    fn test_idempotency_key_stability() {
        let a = idempotency_key("provider-a", "123 MAIN ST", "JOHN DOE");
        let b = idempotency_key("provider-a", "123 MAIN ST", "JOHN DOE");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        // Different provider, different key.
        let c = idempotency_key("provider-b", "123 MAIN ST", "JOHN DOE");
        assert_ne!(a, c);
    }

    #[test]
    fn test_payload_hash_differs_on_body_change() {
        let a = payload_hash(&serde_json::json!({"address": "123 MAIN ST"}));
        let b = payload_hash(&serde_json::json!({"address": "124 MAIN ST"}));
        assert_ne!(a, b);
    }
}
