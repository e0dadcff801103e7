//! Input validation for untrusted data.
//!
//! Path parameters, operation ids and presenter payloads arrive from clients
//! and are checked here before they reach a session.

use thiserror::Error;

/// Maximum length for diagram IDs.
pub const MAX_DIAGRAM_ID_LEN: usize = 64;
/// Maximum length for threat model IDs.
pub const MAX_THREAT_MODEL_ID_LEN: usize = 64;
/// Maximum length for client operation IDs.
pub const MAX_OPERATION_ID_LEN: usize = 128;
/// Maximum number of cells in a presenter selection.
pub const MAX_SELECTED_CELLS: usize = 1_000;
/// Default maximum WebSocket message size.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65_536; // 64KB

/// Validation error types.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Diagram ID exceeds maximum length.
    #[error("diagram_id too long (max {MAX_DIAGRAM_ID_LEN} chars)")]
    DiagramIdTooLong,
    /// Diagram ID is empty or contains invalid characters.
    #[error("diagram_id contains invalid characters")]
    DiagramIdInvalidChars,
    /// Threat model ID exceeds maximum length.
    #[error("threat_model_id too long (max {MAX_THREAT_MODEL_ID_LEN} chars)")]
    ThreatModelIdTooLong,
    /// Threat model ID contains invalid characters.
    #[error("threat_model_id contains invalid characters")]
    ThreatModelIdInvalidChars,
    /// Operation ID is empty or too long.
    #[error("operation_id must be 1-{MAX_OPERATION_ID_LEN} chars")]
    InvalidOperationId,
    /// WebSocket message exceeds the configured size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    MessageTooLarge {
        /// Size of the rejected message.
        size: usize,
        /// Configured limit.
        max: usize,
    },
    /// Selection lists too many cells.
    #[error("too many selected cells (max {MAX_SELECTED_CELLS})")]
    TooManySelectedCells,
    /// Selection names a malformed cell id.
    #[error("invalid cell id in selection: {0}")]
    InvalidSelectedCell(String),
    /// Cursor coordinates are not finite numbers.
    #[error("cursor position must be finite")]
    InvalidCursor,
}

/// Check if a character is valid for IDs (alphanumeric, hyphen, or underscore).
fn is_valid_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Validate a diagram ID.
///
/// Valid diagram IDs:
/// - 1-64 characters
/// - ASCII alphanumeric, hyphen, underscore only (UUIDs are valid)
///
/// # Errors
///
/// Returns [`ValidationError::DiagramIdTooLong`] if the ID exceeds 64 characters.
/// Returns [`ValidationError::DiagramIdInvalidChars`] if the ID is empty or contains invalid characters.
pub fn validate_diagram_id(id: &str) -> Result<(), ValidationError> {
    if id.len() > MAX_DIAGRAM_ID_LEN {
        return Err(ValidationError::DiagramIdTooLong);
    }
    if id.is_empty() || !id.chars().all(is_valid_id_char) {
        return Err(ValidationError::DiagramIdInvalidChars);
    }
    Ok(())
}

/// Validate a threat model ID. The empty string means "no threat model".
///
/// # Errors
///
/// Returns [`ValidationError::ThreatModelIdTooLong`] if the ID exceeds 64 characters.
/// Returns [`ValidationError::ThreatModelIdInvalidChars`] if the ID contains invalid characters.
pub fn validate_threat_model_id(id: &str) -> Result<(), ValidationError> {
    if id.len() > MAX_THREAT_MODEL_ID_LEN {
        return Err(ValidationError::ThreatModelIdTooLong);
    }
    if !id.chars().all(is_valid_id_char) {
        return Err(ValidationError::ThreatModelIdInvalidChars);
    }
    Ok(())
}

/// Validate a client-supplied operation ID.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidOperationId`] if the ID is empty or exceeds 128 characters.
pub fn validate_operation_id(id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() || id.len() > MAX_OPERATION_ID_LEN {
        return Err(ValidationError::InvalidOperationId);
    }
    Ok(())
}

/// Validate WebSocket message size against the configured limit.
///
/// # Errors
///
/// Returns [`ValidationError::MessageTooLarge`] if `size` exceeds `max`.
pub fn validate_message_size(size: usize, max: usize) -> Result<(), ValidationError> {
    if size > max {
        return Err(ValidationError::MessageTooLarge { size, max });
    }
    Ok(())
}

/// Validate a presenter selection.
///
/// # Errors
///
/// Returns [`ValidationError::TooManySelectedCells`] or
/// [`ValidationError::InvalidSelectedCell`].
pub fn validate_selection(cells: &[String]) -> Result<(), ValidationError> {
    if cells.len() > MAX_SELECTED_CELLS {
        return Err(ValidationError::TooManySelectedCells);
    }
    if let Some(bad) = cells.iter().find(|id| !collab_core::is_valid_cell_id(id)) {
        return Err(ValidationError::InvalidSelectedCell(bad.clone()));
    }
    Ok(())
}

/// Validate presenter cursor coordinates.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidCursor`] for NaN or infinite coordinates.
pub fn validate_cursor(x: f64, y: f64) -> Result<(), ValidationError> {
    if x.is_finite() && y.is_finite() {
        Ok(())
    } else {
        Err(ValidationError::InvalidCursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_diagram_ids() {
        assert!(validate_diagram_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
        assert!(validate_diagram_id("flows_v2").is_ok());
        assert!(validate_diagram_id("d").is_ok());
    }

    #[test]
    fn test_invalid_diagram_ids() {
        assert!(validate_diagram_id("").is_err());
        assert!(validate_diagram_id("has spaces").is_err());
        assert!(validate_diagram_id("../../../etc/passwd").is_err());
        assert!(validate_diagram_id("contains<script>").is_err());
        assert!(validate_diagram_id("diagramé").is_err());
    }

    #[test]
    fn test_diagram_id_boundary() {
        // Exactly at limit should pass
        let at_limit = "x".repeat(MAX_DIAGRAM_ID_LEN);
        assert!(validate_diagram_id(&at_limit).is_ok());

        let over_limit = "x".repeat(MAX_DIAGRAM_ID_LEN + 1);
        assert!(matches!(
            validate_diagram_id(&over_limit),
            Err(ValidationError::DiagramIdTooLong)
        ));
    }

    #[test]
    fn test_threat_model_id_may_be_empty() {
        assert!(validate_threat_model_id("").is_ok());
        assert!(validate_threat_model_id("tm-1").is_ok());
        assert!(validate_threat_model_id("tm/1").is_err());
        assert!(validate_threat_model_id(&"x".repeat(MAX_THREAT_MODEL_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_operation_id() {
        assert!(validate_operation_id("op-1").is_ok());
        assert!(validate_operation_id("   ").is_err());
        assert!(validate_operation_id(&"x".repeat(MAX_OPERATION_ID_LEN)).is_ok());
        assert!(validate_operation_id(&"x".repeat(MAX_OPERATION_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_message_size() {
        assert!(validate_message_size(1000, DEFAULT_MAX_MESSAGE_SIZE).is_ok());
        assert!(validate_message_size(DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_MESSAGE_SIZE).is_ok());
        let err = validate_message_size(DEFAULT_MAX_MESSAGE_SIZE + 1, DEFAULT_MAX_MESSAGE_SIZE)
            .expect_err("over limit");
        assert!(err.to_string().contains("65536"));
    }

    #[test]
    fn test_selection() {
        assert!(validate_selection(&["a".to_string(), "b-2".to_string()]).is_ok());
        assert!(validate_selection(&[]).is_ok());
        assert!(matches!(
            validate_selection(&["bad id".to_string()]),
            Err(ValidationError::InvalidSelectedCell(_))
        ));
        let too_many: Vec<String> = (0..=MAX_SELECTED_CELLS).map(|i| format!("c{i}")).collect();
        assert!(validate_selection(&too_many).is_err());
    }

    #[test]
    fn test_cursor() {
        assert!(validate_cursor(1.5, -20.0).is_ok());
        assert!(validate_cursor(f64::NAN, 0.0).is_err());
        assert!(validate_cursor(0.0, f64::INFINITY).is_err());
    }
}
