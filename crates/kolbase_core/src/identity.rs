//! Deterministic identity resolution for natural keys.
//!
//! Two processes resolving the same natural key converge on the same primary
//! key without a lookup round-trip, which removes the duplicate-creation
//! failure mode of minting randomized ids per write path.

use crate::error::StoreError;
use crate::models::KindSchema;

/// Hex digits of the derived key suffix.
const KEY_SUFFIX_LEN: usize = 16;

/// Normalize a raw natural key: trim whitespace, strip a single leading `@`,
/// lowercase.
///
/// # Returns
/// The normalized key.
///
/// # Errors
/// Returns [`StoreError::InvalidKey`] when the key is empty after
/// normalization.
pub fn normalize_natural_key(raw: &str) -> Result<String, StoreError> {
    let trimmed = raw.trim();
    let stripped = trimmed.strip_prefix('@').unwrap_or(trimmed);
    let normalized = stripped.to_lowercase();
    if normalized.is_empty() {
        return Err(StoreError::InvalidKey(format!(
            "'{}' is empty after normalization",
            raw
        )));
    }
    Ok(normalized)
}

fn derive_suffix(schema: &KindSchema, normalized: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(schema.kind.as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(schema.natural_key_type.as_bytes());
    hasher.update(&[0x1f]);
    hasher.update(normalized.as_bytes());
    let hash = hasher.finalize();
    hash.to_hex().as_str()[..KEY_SUFFIX_LEN].to_string()
}

/// Resolve the canonical primary key for a natural key.
///
/// Pure: normalization plus a stable hash, no storage access.
///
/// # Arguments
/// - `schema`: Kind the key belongs to.
/// - `raw`: Natural key as received, e.g. `"@Alice "`.
///
/// # Returns
/// The canonical primary key, e.g. `user:3f9a...`.
///
/// # Errors
/// Returns [`StoreError::InvalidKey`] when the key is empty after
/// normalization.
pub fn resolve_primary_key(schema: &KindSchema, raw: &str) -> Result<String, StoreError> {
    let normalized = normalize_natural_key(raw)?;
    Ok(format!(
        "{}{}",
        schema.key_prefix,
        derive_suffix(schema, &normalized)
    ))
}

/// Whether `primary_key` is the canonical derivation for `normalized`.
///
/// Entities imported from older id schemes fail this check; the reconciler
/// scores canonical keys above legacy ones.
pub fn is_canonical_key(schema: &KindSchema, primary_key: &str, normalized: &str) -> bool {
    primary_key
        .strip_prefix(schema.key_prefix.as_str())
        .map(|suffix| suffix == derive_suffix(schema, normalized))
        .unwrap_or(false)
}

/// Key suffixes produced by serializing absent values in older write paths.
///
/// Documents keyed by these are unrecoverable artifacts, swept by
/// reconciliation.
pub fn is_invalid_key_suffix(suffix: &str) -> bool {
    matches!(
        suffix,
        "undefined" | "null" | "twitter_undefined" | "twitter_null" | "user_undefined"
    )
}
