//! Input validation for MedSync.
//!
//! This module provides validation functions for everything a domain service
//! hands to the queue. All validators return MedSyncError::Validation on failure.

use crate::error::{MedSyncError, MedSyncResult};

pub const MAX_DOCUMENT_ID_LENGTH: usize = 128;
pub const MAX_USER_ID_LENGTH: usize = 128;
pub const MAX_COLLECTION_PATH_LENGTH: usize = 512;
pub const MAX_COLLECTION_PATH_DEPTH: usize = 15;
pub const MAX_PAYLOAD_BYTES: usize = 1_048_576; // 1 MiB, the remote document limit
pub const MAX_INDEX_NAME_LENGTH: usize = 64;

/// Validate an entity identifier used as a path segment.
///
/// IDs must be non-empty, no longer than MAX_DOCUMENT_ID_LENGTH, and must not
/// contain '/' (reserved for paths) or surrounding whitespace.
fn validate_path_segment(value: &str, field_name: &str, max_len: usize) -> MedSyncResult<()> {
    if value.is_empty() {
        return Err(MedSyncError::validation(field_name, "cannot be empty"));
    }

    if value.trim() != value {
        return Err(MedSyncError::validation(
            field_name,
            "cannot have leading or trailing whitespace",
        ));
    }

    if value.len() > max_len {
        return Err(MedSyncError::validation(
            field_name,
            format!("cannot exceed {} characters (got {})", max_len, value.len()),
        ));
    }

    if value.contains('/') {
        return Err(MedSyncError::validation(
            field_name,
            "cannot contain '/' character (reserved for paths)",
        ));
    }

    if value == "." || value == ".." {
        return Err(MedSyncError::validation(field_name, "cannot be '.' or '..'"));
    }

    Ok(())
}

/// Validate a document ID.
pub fn validate_document_id(document_id: &str) -> MedSyncResult<()> {
    validate_path_segment(document_id, "document_id", MAX_DOCUMENT_ID_LENGTH)
}

/// Validate a user ID.
pub fn validate_user_id(user_id: &str) -> MedSyncResult<()> {
    validate_path_segment(user_id, "user_id", MAX_USER_ID_LENGTH)
}

/// Validate a collection path.
///
/// Collection paths are slash-separated segments with an odd segment count:
/// "patients" or "users/{uid}/medications". An even count would address a
/// document, not a collection.
pub fn validate_collection_path(path: &str) -> MedSyncResult<()> {
    if path.is_empty() {
        return Err(MedSyncError::validation("collection_path", "cannot be empty"));
    }

    if path.len() > MAX_COLLECTION_PATH_LENGTH {
        return Err(MedSyncError::validation(
            "collection_path",
            format!(
                "cannot exceed {} characters (got {})",
                MAX_COLLECTION_PATH_LENGTH,
                path.len()
            ),
        ));
    }

    let parts: Vec<&str> = path.split('/').collect();

    if parts.len() > MAX_COLLECTION_PATH_DEPTH {
        return Err(MedSyncError::validation(
            "collection_path",
            format!(
                "cannot exceed {} segments (got {})",
                MAX_COLLECTION_PATH_DEPTH,
                parts.len()
            ),
        ));
    }

    if parts.len() % 2 == 0 {
        return Err(MedSyncError::validation(
            "collection_path",
            "must have an odd number of segments",
        ));
    }

    for (i, part) in parts.iter().enumerate() {
        validate_path_segment(part, "collection_path", MAX_DOCUMENT_ID_LENGTH).map_err(|_| {
            MedSyncError::validation("collection_path", format!("segment {} is invalid", i))
        })?;
    }

    Ok(())
}

/// Validate serialized payload size.
pub fn validate_payload_size(bytes: &[u8]) -> MedSyncResult<()> {
    if bytes.len() > MAX_PAYLOAD_BYTES {
        return Err(MedSyncError::validation(
            "payload",
            format!(
                "cannot exceed {} bytes (got {})",
                MAX_PAYLOAD_BYTES,
                bytes.len()
            ),
        ));
    }
    Ok(())
}

/// Validate a secondary index name for local store lookups.
pub fn validate_index_name(name: &str) -> MedSyncResult<()> {
    if name.is_empty() || name.len() > MAX_INDEX_NAME_LENGTH {
        return Err(MedSyncError::validation(
            "index_name",
            format!("must be 1 to {} characters", MAX_INDEX_NAME_LENGTH),
        ));
    }

    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(MedSyncError::validation(
            "index_name",
            "may only contain ASCII letters, digits and '_'",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_document_ids() {
        assert!(validate_document_id("med-123").is_ok());
        assert!(validate_document_id("0193a1b2c3d47e8f9a0b1c2d3e4f5a6b").is_ok());
    }

    #[test]
    fn test_invalid_document_ids() {
        assert!(validate_document_id("").is_err());
        assert!(validate_document_id(" padded ").is_err());
        assert!(validate_document_id("a/b").is_err());
        assert!(validate_document_id("..").is_err());
        assert!(validate_document_id(&"x".repeat(MAX_DOCUMENT_ID_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_collection_paths() {
        assert!(validate_collection_path("patients").is_ok());
        assert!(validate_collection_path("users/u1/medications").is_ok());
        assert!(validate_collection_path("users/u1").is_err());
        assert!(validate_collection_path("users//medications").is_err());
        assert!(validate_collection_path("").is_err());
    }

    #[test]
    fn test_payload_size() {
        assert!(validate_payload_size(&[0u8; 16]).is_ok());
        assert!(validate_payload_size(&vec![0u8; MAX_PAYLOAD_BYTES + 1]).is_err());
    }

    #[test]
    fn test_index_names() {
        assert!(validate_index_name("owner_id").is_ok());
        assert!(validate_index_name("owner id").is_err());
        assert!(validate_index_name("").is_err());
    }
}
