//! Standalone error types for nebula-extent-hooks
//!
//! Errors only surface from configuration and from the page primitives.
//! Dispatcher operations keep their boolean contract (`false` = success,
//! `true` = failure) and never return these types.

use std::io;

use thiserror::Error;

/// Result type for configuration and page-primitive operations
pub type Result<T> = std::result::Result<T, ExtentHooksError>;

/// Extent hook layer errors
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ExtentHooksError {
    // --- Page Errors ---
    /// An OS page primitive failed
    #[error("Page operation '{operation}' failed: {source}")]
    PageOperation {
        /// Primitive that failed
        operation: &'static str,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Size or alignment unusable for page mapping
    #[error("Invalid extent layout: {reason}")]
    InvalidLayout {
        /// What was wrong
        reason: String,
    },

    // --- Configuration Errors ---
    /// Configuration rejected
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong
        reason: String,
    },

    /// Global state set twice
    #[error("{component} is already initialized")]
    AlreadyInitialized {
        /// What was initialized
        component: &'static str,
    },

    // --- Feature Support Errors ---
    /// Platform lacks the primitive
    #[error("Feature not supported on this platform: {feature}")]
    NotSupported {
        /// Missing primitive
        feature: &'static str,
    },
}

impl ExtentHooksError {
    /// Get error code for categorization
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::PageOperation { .. } => "EHOOKS:PAGES:OS",
            Self::InvalidLayout { .. } => "EHOOKS:PAGES:LAYOUT",
            Self::InvalidConfig { .. } => "EHOOKS:CONFIG:INVALID",
            Self::AlreadyInitialized { .. } => "EHOOKS:CONFIG:INIT",
            Self::NotSupported { .. } => "EHOOKS:FEATURE:UNSUPPORTED",
        }
    }

    /// Returns true when the failure came from the operating system rather
    /// than from the caller's arguments.
    #[must_use]
    pub fn is_os_failure(&self) -> bool {
        matches!(self, Self::PageOperation { .. })
    }

    // ============================================================================
    // Convenience Constructors
    // ============================================================================

    /// Wrap the last OS error for a page operation
    pub fn last_os_error(operation: &'static str) -> Self {
        Self::PageOperation {
            operation,
            source: io::Error::last_os_error(),
        }
    }

    /// Create invalid layout error
    pub fn invalid_layout(reason: impl Into<String>) -> Self {
        Self::InvalidLayout {
            reason: reason.into(),
        }
    }

    /// Create invalid configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create unsupported feature error
    pub fn not_supported(feature: &'static str) -> Self {
        Self::NotSupported { feature }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            ExtentHooksError::invalid_layout("size is zero").code(),
            "EHOOKS:PAGES:LAYOUT"
        );
        assert_eq!(
            ExtentHooksError::invalid_config("bad").code(),
            "EHOOKS:CONFIG:INVALID"
        );
        assert_eq!(
            ExtentHooksError::not_supported("lazy purge").code(),
            "EHOOKS:FEATURE:UNSUPPORTED"
        );
        assert_eq!(
            ExtentHooksError::AlreadyInitialized { component: "config" }.code(),
            "EHOOKS:CONFIG:INIT"
        );
    }

    #[test]
    fn page_errors_keep_their_source() {
        let err = ExtentHooksError::PageOperation {
            operation: "mmap",
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        };
        assert!(err.is_os_failure());
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().starts_with("Page operation 'mmap' failed"));
    }

    #[test]
    fn caller_errors_are_not_os_failures() {
        assert!(!ExtentHooksError::invalid_layout("unaligned").is_os_failure());
        assert!(!ExtentHooksError::not_supported("merge").is_os_failure());
    }
}
