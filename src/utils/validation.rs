//! Validation for names that end up interpolated into native queries.
//!
//! Attribute and value keys become JSON paths in SQL and dotted paths in
//! document filters, so they are restricted to a conservative alphabet.
//! Table and collection names get the same treatment.

use crate::error::{Error, Result};

/// Returns true if `name` is non-empty and consists only of `[A-Za-z0-9_-]`.
pub fn is_safe_field_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Rejects a field key that cannot be interpolated safely.
pub fn validate_field_name(name: &str) -> Result<()> {
    if is_safe_field_name(name) {
        Ok(())
    } else {
        Err(Error::rejected(format!("unsafe field name '{}'", name)))
    }
}

/// Table and collection names: must start with a letter or underscore.
pub fn validate_target_name(name: &str) -> Result<()> {
    let starts_ok = name
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if starts_ok && is_safe_field_name(name) && !name.contains('-') {
        Ok(())
    } else {
        Err(Error::rejected(format!("unsafe table or collection name '{}'", name)))
    }
}

/// Dotted document path where every segment is a safe field name.
pub fn validate_document_path(path: &str) -> Result<()> {
    if path.split('.').all(is_safe_field_name) {
        Ok(())
    } else {
        Err(Error::rejected(format!("unsafe document path '{}'", path)))
    }
}
