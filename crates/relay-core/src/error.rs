//! Error taxonomy for the execution core
//!
//! The category enum is closed and small on purpose: integrations put their
//! detail into [`CoreError::context`], not into new variants.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of an execution error.
///
/// Categories drive retry decisions: only [`Transient`](ErrorCategory::Transient)
/// and [`Timeout`](ErrorCategory::Timeout) failures are eligible for retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Input failed schema or spec validation. Surfaced synchronously.
    Validation,

    /// Runtime misconfiguration. Surfaced to the operator.
    Config,

    /// Upstream dependency returned bad data or a client error.
    Source,

    /// Network blip, lock contention, short-lived resource exhaustion.
    Transient,

    /// Wall-clock limit exceeded.
    Timeout,

    /// Unexpected invariant violation.
    Internal,
}

impl ErrorCategory {
    /// Whether failures in this category may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::Config => "CONFIG",
            Self::Source => "SOURCE",
            Self::Transient => "TRANSIENT",
            Self::Timeout => "TIMEOUT",
            Self::Internal => "INTERNAL",
        }
    }

    /// Parse a stored category string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "VALIDATION" => Some(Self::Validation),
            "CONFIG" => Some(Self::Config),
            "SOURCE" => Some(Self::Source),
            "TRANSIENT" => Some(Self::Transient),
            "TIMEOUT" => Some(Self::Timeout),
            "INTERNAL" => Some(Self::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categorised execution error.
///
/// Carries a category, a human-readable message, an optional chained cause,
/// and a structured context map for anything integration-specific.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{category}] {message}")]
pub struct CoreError {
    pub category: ErrorCategory,
    pub message: String,

    /// Rendered cause chain, outermost first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,

    /// Structured context (run ids, source names, offsets, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl CoreError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            cause: None,
            context: BTreeMap::new(),
        }
    }

    /// Input failed validation; never retried.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
    }

    /// Runtime misconfiguration.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Config, message)
    }

    /// Upstream returned bad data.
    pub fn source(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Source, message)
    }

    /// Short-lived failure worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Transient, message)
    }

    /// Wall-clock limit exceeded.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, message)
    }

    /// Unexpected invariant violation.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, message)
    }

    /// Attach a rendered cause.
    pub fn with_cause(mut self, cause: impl fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// Attach a structured context entry.
    pub fn with_context(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }

    /// Error type tag recorded on run records (category string).
    pub fn error_type(&self) -> &'static str {
        self.category.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(ErrorCategory::Timeout.is_retryable());
        assert!(!ErrorCategory::Validation.is_retryable());
        assert!(!ErrorCategory::Config.is_retryable());
        assert!(!ErrorCategory::Source.is_retryable());
        assert!(!ErrorCategory::Internal.is_retryable());
    }

    #[test]
    fn test_category_round_trip() {
        for cat in [
            ErrorCategory::Validation,
            ErrorCategory::Config,
            ErrorCategory::Source,
            ErrorCategory::Transient,
            ErrorCategory::Timeout,
            ErrorCategory::Internal,
        ] {
            assert_eq!(ErrorCategory::parse(cat.as_str()), Some(cat));
        }
        assert_eq!(ErrorCategory::parse("bogus"), None);
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::transient("connection reset").with_cause("io error");
        assert_eq!(err.to_string(), "[TRANSIENT] connection reset");
        assert_eq!(err.cause.as_deref(), Some("io error"));
    }

    #[test]
    fn test_error_context() {
        let err = CoreError::source("bad payload")
            .with_context("source", "edgar")
            .with_context("status", 422);

        assert_eq!(err.context["source"], serde_json::json!("edgar"));
        assert_eq!(err.context["status"], serde_json::json!(422));
    }

    #[test]
    fn test_error_serialization() {
        let err = CoreError::timeout("took too long").with_context("limit_seconds", 30);
        let json = serde_json::to_string(&err).unwrap();
        let parsed: CoreError = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.category, ErrorCategory::Timeout);
        assert_eq!(parsed.message, "took too long");
        assert_eq!(parsed.context["limit_seconds"], serde_json::json!(30));
    }
}
