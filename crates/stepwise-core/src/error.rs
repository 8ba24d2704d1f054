//! Structured errors that survive the trip across the execution transport

use serde::{Deserialize, Serialize};
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Validation,
    TargetNotFound,
    Timeout,
    NavigationFailed,
    ProtocolViolation,
    ActionFailed,
    SelectorInvalid,
    Unknown,
}

impl ErrorCode {
    /// Failures the controller may retry before applying its pause/fail policy.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::TargetNotFound | ErrorCode::Timeout | ErrorCode::NavigationFailed
        )
    }
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            suggestions: Vec::new(),
            context: None,
        }
    }

    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = suggestions;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn target_not_found(locator: &str) -> Self {
        Self::new(
            ErrorCode::TargetNotFound,
            format!("No element matching: {}", locator),
        )
    }

    pub fn timeout(what: &str, timeout_ms: u64) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("Timeout after {}ms waiting for: {}", timeout_ms, what),
        )
    }

    pub fn navigation_failed(url: &str, reason: &str) -> Self {
        Self::new(
            ErrorCode::NavigationFailed,
            format!("Navigation to {} failed: {}", url, reason),
        )
    }

    pub fn action_failed(action: &str, reason: &str) -> Self {
        Self::new(
            ErrorCode::ActionFailed,
            format!("{} failed: {}", action, reason),
        )
    }

    pub fn selector_invalid(selector: &str, reason: &str) -> Self {
        Self::new(
            ErrorCode::SelectorInvalid,
            format!("Invalid selector '{}': {}", selector, reason),
        )
    }

    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolViolation, message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorCode::Validation, e.to_string())
    }
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        let mut context = serde_json::json!({ "field": e.field });
        if let Some(index) = e.step_index {
            context["stepIndex"] = index.into();
        }
        Self::new(ErrorCode::Validation, e.to_string()).with_context(context)
    }
}

/// A workflow or step document that does not satisfy the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub step_index: Option<usize>,
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn workflow(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            step_index: None,
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn step(index: usize, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            step_index: Some(index),
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn at(mut self, index: usize) -> Self {
        self.step_index = Some(index);
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(index) = self.step_index {
            write!(f, "step {}: ", index)?;
        }
        write!(f, "field `{}` {}", self.field, self.reason)
    }
}

impl std::error::Error for ValidationError {}
