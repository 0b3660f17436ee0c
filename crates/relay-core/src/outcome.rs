//! Success/failure envelope for handler outputs
//!
//! Handlers may either return `Result<Value, CoreError>` directly or wrap
//! their payload in an [`Outcome`], which makes success explicit in the
//! serialised form (`{"ok": true, "value": ...}`) and composes with the
//! usual combinators.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Explicit success-or-failure envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ok")]
pub enum Outcome<T> {
    /// Successful result carrying a value.
    #[serde(rename = "true")]
    Ok { value: T },

    /// Failed result carrying a categorised error.
    #[serde(rename = "false")]
    Err { error: CoreError },
}

impl<T> Outcome<T> {
    pub fn ok(value: T) -> Self {
        Self::Ok { value }
    }

    pub fn err(error: CoreError) -> Self {
        Self::Err { error }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn is_err(&self) -> bool {
        matches!(self, Self::Err { .. })
    }

    /// Transform the value if `Ok`.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Ok { value } => Outcome::Ok { value: f(value) },
            Self::Err { error } => Outcome::Err { error },
        }
    }

    /// Chain to another `Outcome`-returning function.
    pub fn and_then<U>(self, f: impl FnOnce(T) -> Outcome<U>) -> Outcome<U> {
        match self {
            Self::Ok { value } => f(value),
            Self::Err { error } => Outcome::Err { error },
        }
    }

    /// Transform the error if `Err`.
    pub fn map_err(self, f: impl FnOnce(CoreError) -> CoreError) -> Outcome<T> {
        match self {
            Self::Ok { value } => Outcome::Ok { value },
            Self::Err { error } => Outcome::Err { error: f(error) },
        }
    }

    /// Recover from an error with another `Outcome`.
    pub fn or_else(self, f: impl FnOnce(CoreError) -> Outcome<T>) -> Outcome<T> {
        match self {
            Self::Ok { value } => Outcome::Ok { value },
            Self::Err { error } => f(error),
        }
    }

    pub fn unwrap_or(self, default: T) -> T {
        match self {
            Self::Ok { value } => value,
            Self::Err { .. } => default,
        }
    }

    pub fn unwrap_or_else(self, f: impl FnOnce(CoreError) -> T) -> T {
        match self {
            Self::Ok { value } => value,
            Self::Err { error } => f(error),
        }
    }

    /// Side-effect on the value, returning self.
    pub fn inspect_ok(self, f: impl FnOnce(&T)) -> Self {
        if let Self::Ok { value } = &self {
            f(value);
        }
        self
    }

    /// Side-effect on the error, returning self.
    pub fn inspect_err(self, f: impl FnOnce(&CoreError)) -> Self {
        if let Self::Err { error } = &self {
            f(error);
        }
        self
    }

    pub fn into_result(self) -> Result<T, CoreError> {
        match self {
            Self::Ok { value } => Ok(value),
            Self::Err { error } => Err(error),
        }
    }
}

impl<T> From<Result<T, CoreError>> for Outcome<T> {
    fn from(result: Result<T, CoreError>) -> Self {
        match result {
            Ok(value) => Self::Ok { value },
            Err(error) => Self::Err { error },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn test_map_and_chain() {
        let out = Outcome::ok(2).map(|v| v * 10).and_then(|v| {
            if v > 10 {
                Outcome::ok(v + 1)
            } else {
                Outcome::err(CoreError::validation("too small"))
            }
        });

        assert_eq!(out, Outcome::ok(21));
    }

    #[test]
    fn test_err_short_circuits() {
        let out: Outcome<i32> = Outcome::<i32>::err(CoreError::transient("blip"))
            .map(|v| v * 10)
            .and_then(Outcome::ok);

        assert!(out.is_err());
        assert_eq!(out.unwrap_or(7), 7);
    }

    #[test]
    fn test_or_else_recovers() {
        let out: Outcome<i32> =
            Outcome::err(CoreError::transient("blip")).or_else(|_| Outcome::ok(42));
        assert_eq!(out, Outcome::ok(42));
    }

    #[test]
    fn test_map_err() {
        let out: Outcome<i32> = Outcome::err(CoreError::transient("blip"))
            .map_err(|e| CoreError::internal(format!("wrapped: {}", e.message)));

        match out {
            Outcome::Err { error } => {
                assert_eq!(error.category, ErrorCategory::Internal);
                assert_eq!(error.message, "wrapped: blip");
            }
            _ => panic!("expected Err"),
        }
    }

    #[test]
    fn test_serialization_shape() {
        let ok: Outcome<serde_json::Value> = Outcome::ok(serde_json::json!({"rows": 3}));
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["ok"], serde_json::json!("true"));
        assert_eq!(json["value"]["rows"], serde_json::json!(3));

        let err: Outcome<serde_json::Value> = Outcome::err(CoreError::source("bad feed"));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["ok"], serde_json::json!("false"));
        assert_eq!(json["error"]["category"], serde_json::json!("SOURCE"));

        let parsed: Outcome<serde_json::Value> = serde_json::from_value(json).unwrap();
        assert!(parsed.is_err());
    }
}
