use thiserror::Error;

/// A3S Store error types
///
/// Payloads are plain strings so the error can be cloned and handed to every
/// caller waiting on the same in-flight layer creation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Content digest did not match the declared digest
    #[error("Integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    /// Declared parent layer is not in the index
    #[error("Parent layer not found: {0}")]
    ParentNotFound(String),

    /// A layer's ancestor is missing from the index
    #[error("Broken layer chain: {layer} references missing ancestor {missing}")]
    BrokenChain { layer: String, missing: String },

    /// Layer is still referenced by images or child layers
    #[error("Layer {layer} has dependents: {references} reference(s), {children} child layer(s)")]
    HasDependents {
        layer: String,
        references: u32,
        children: u32,
    },

    /// Image still carries tags
    #[error("Image {image} is in use by tag(s): {}", tags.join(", "))]
    ImageInUse { image: String, tags: Vec<String> },

    /// Id prefix matched more than one image
    #[error("Ambiguous reference '{reference}' matches {} images", matches.len())]
    AmbiguousReference {
        reference: String,
        matches: Vec<String>,
    },

    /// Referenced object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Registry transfer failed
    #[error("Transfer failed: {registry} - {message}")]
    TransferFailed { registry: String, message: String },

    /// Disk failure
    #[error("Storage I/O error: {0}")]
    StorageIo(String),

    /// Malformed image reference
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    /// Malformed digest string
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    /// Operation exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether the caller may reasonably retry the failed operation.
    ///
    /// Only transport failures and deadlines qualify; integrity and index
    /// consistency errors are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::TransferFailed { .. } | StoreError::Timeout(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::StorageIo(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for StoreError {
    fn from(err: serde_yaml::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type alias for A3S Store operations
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_mismatch_display() {
        let error = StoreError::IntegrityMismatch {
            expected: "sha256:aaa".to_string(),
            actual: "sha256:bbb".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Integrity mismatch: expected sha256:aaa, got sha256:bbb"
        );
    }

    #[test]
    fn test_has_dependents_display() {
        let error = StoreError::HasDependents {
            layer: "abc".to_string(),
            references: 2,
            children: 1,
        };
        assert_eq!(
            error.to_string(),
            "Layer abc has dependents: 2 reference(s), 1 child layer(s)"
        );
    }

    #[test]
    fn test_image_in_use_display() {
        let error = StoreError::ImageInUse {
            image: "abc".to_string(),
            tags: vec!["a:1".to_string(), "b:2".to_string()],
        };
        assert_eq!(error.to_string(), "Image abc is in use by tag(s): a:1, b:2");
    }

    #[test]
    fn test_ambiguous_reference_display() {
        let error = StoreError::AmbiguousReference {
            reference: "ab".to_string(),
            matches: vec!["ab1".to_string(), "ab2".to_string()],
        };
        assert_eq!(error.to_string(), "Ambiguous reference 'ab' matches 2 images");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: StoreError = io_error.into();
        assert!(matches!(error, StoreError::StorageIo(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope");
        let error: StoreError = result.unwrap_err().into();
        assert!(matches!(error, StoreError::Serialization(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: StoreError = result.unwrap_err().into();
        assert!(matches!(error, StoreError::Serialization(_)));
    }

    #[test]
    fn test_is_retryable() {
        assert!(StoreError::TransferFailed {
            registry: "ghcr.io".to_string(),
            message: "connection reset".to_string(),
        }
        .is_retryable());
        assert!(StoreError::Timeout("pull".to_string()).is_retryable());
        assert!(!StoreError::IntegrityMismatch {
            expected: "a".to_string(),
            actual: "b".to_string(),
        }
        .is_retryable());
        assert!(!StoreError::NotFound("x".to_string()).is_retryable());
    }

    #[test]
    fn test_error_is_clone() {
        let error = StoreError::ParentNotFound("abc".to_string());
        assert_eq!(error.clone(), error);
    }
}
