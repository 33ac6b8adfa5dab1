//! The workflow error taxonomy.
//!
//! Every failure in the core is represented as a [`WorkflowError`]: a
//! category, a severity, a retry strategy with a bounded attempt count,
//! and advisory fields. Classification happens once, at the layer that
//! first interprets the underlying provider error; outer layers add
//! context (component, operation, keys) and never re-classify.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Object-storage failures.
    Storage,
    /// Metadata-store failures.
    Metastore,
    /// Template selection/rendering failures.
    Template,
    /// Model invocation failures.
    Model,
    /// Parsing/conversion failures of model output.
    Conversion,
    /// Input validation failures.
    Validation,
    /// Network-level failures (timeouts, resets).
    Network,
    /// Throttling and rate limits.
    Capacity,
    /// Caller errors the provider rejected; retrying cannot help.
    Client,
    /// Internal invariant violations.
    Internal,
    /// Deadline or cancellation.
    Timeout,
}

impl ErrorCategory {
    /// Default severity for errors of this category.
    pub fn default_severity(&self) -> ErrorSeverity {
        match self {
            ErrorCategory::Validation | ErrorCategory::Client | ErrorCategory::Internal => {
                ErrorSeverity::Critical
            }
            ErrorCategory::Capacity => ErrorSeverity::Medium,
            _ => ErrorSeverity::High,
        }
    }

    /// Default retry strategy and attempt bound for this category.
    pub fn default_retry(&self) -> (RetryStrategy, u32) {
        match self {
            ErrorCategory::Storage | ErrorCategory::Metastore | ErrorCategory::Model => {
                (RetryStrategy::Exponential, 3)
            }
            ErrorCategory::Network | ErrorCategory::Timeout => (RetryStrategy::Linear, 2),
            ErrorCategory::Capacity => (RetryStrategy::Jittered, 5),
            ErrorCategory::Template
            | ErrorCategory::Conversion
            | ErrorCategory::Validation
            | ErrorCategory::Client
            | ErrorCategory::Internal => (RetryStrategy::None, 0),
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Storage => "STORAGE",
            ErrorCategory::Metastore => "METASTORE",
            ErrorCategory::Template => "TEMPLATE",
            ErrorCategory::Model => "MODEL",
            ErrorCategory::Conversion => "CONVERSION",
            ErrorCategory::Validation => "VALIDATION",
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::Capacity => "CAPACITY",
            ErrorCategory::Client => "CLIENT",
            ErrorCategory::Internal => "INTERNAL",
            ErrorCategory::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

/// How bad a failure is, for logging and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    /// Informational; the workflow continued.
    Low,
    /// Degraded but recoverable.
    Medium,
    /// The turn failed.
    High,
    /// Invariant violation or unrecoverable caller error.
    Critical,
}

/// Backoff shape between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStrategy {
    /// No retry.
    None,
    /// `base · n`, capped.
    Linear,
    /// `min(base · 2^(n−1), cap)`.
    Exponential,
    /// `uniform(0, base · 2^(n−1))`, capped.
    Jittered,
}

/// The typed error carried through the whole workflow.
///
/// Constructed with a category (which fixes default severity, retry
/// strategy, and attempt bound) and enriched with builder methods as it
/// bubbles up. Enrichment is additive: `category`, `retry_strategy`, and
/// `max_retries` are set at classification time and no wrapping layer
/// changes them.
#[derive(Debug, Error)]
#[error("[{category}/{code}] {message}")]
pub struct WorkflowError {
    /// Stable machine-readable code, e.g. `MISSING_VERIFICATION_ID`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Failure kind.
    pub category: ErrorCategory,
    /// Severity for logging and alerting.
    pub severity: ErrorSeverity,
    /// Backoff shape to use between attempts.
    pub retry_strategy: RetryStrategy,
    /// Upper bound on attempts for this class of failure.
    pub max_retries: u32,
    /// Component that produced the error.
    pub component: String,
    /// Operation that failed.
    pub operation: String,
    /// Structured context accumulated while bubbling up.
    pub context: BTreeMap<String, serde_json::Value>,
    /// Operator-facing suggestions.
    pub suggestions: Vec<String>,
    /// Recovery hints for automated handling.
    pub recovery_hints: Vec<String>,
    /// The verification the error belongs to, when known.
    pub verification_id: Option<String>,
    /// When the error was classified.
    pub timestamp: DateTime<Utc>,
    /// Wrapped cause.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl WorkflowError {
    /// Classify a new error. Severity, retry strategy, and attempt bound
    /// come from the category defaults.
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let (retry_strategy, max_retries) = category.default_retry();
        Self {
            code: code.into(),
            message: message.into(),
            category,
            severity: category.default_severity(),
            retry_strategy,
            max_retries,
            component: String::new(),
            operation: String::new(),
            context: BTreeMap::new(),
            suggestions: Vec::new(),
            recovery_hints: Vec::new(),
            verification_id: None,
            timestamp: Utc::now(),
            source: None,
        }
    }

    /// An internal invariant violation: CRITICAL, never retried.
    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, code, message)
    }

    /// A cancellation/deadline error. Not retried: the caller's clock or
    /// token already expired.
    pub fn canceled(operation: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorCategory::Timeout, "CANCELED", "operation was canceled");
        err.retry_strategy = RetryStrategy::None;
        err.max_retries = 0;
        err.operation = operation.into();
        err
    }

    /// Override the default severity.
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Record the component reporting the error.
    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = component.into();
        self
    }

    /// Record the failing operation.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    /// Attach a structured context value.
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Attach the verification id.
    pub fn with_verification_id(mut self, id: impl Into<String>) -> Self {
        self.verification_id = Some(id.into());
        self
    }

    /// Attach an operator-facing suggestion.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// Attach a recovery hint.
    pub fn with_recovery_hint(mut self, hint: impl Into<String>) -> Self {
        self.recovery_hints.push(hint.into());
        self
    }

    /// Wrap the underlying cause.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Mark the error non-retryable without changing its category.
    pub fn non_retryable(mut self) -> Self {
        self.retry_strategy = RetryStrategy::None;
        self.max_retries = 0;
        self
    }

    /// Whether retrying this error might succeed.
    pub fn retryable(&self) -> bool {
        self.retry_strategy != RetryStrategy::None && self.max_retries > 1
    }

    /// Serializable snapshot carrying the full advisory payload.
    pub fn record(&self) -> ErrorRecord {
        ErrorRecord {
            code: self.code.clone(),
            message: self.message.clone(),
            details: self.context.clone(),
            component: self.component.clone(),
            operation: self.operation.clone(),
            category: self.category,
            severity: self.severity,
            retry_strategy: self.retry_strategy,
            max_retries: self.max_retries,
            suggestions: self.suggestions.clone(),
            recovery_hints: self.recovery_hints.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Compact snapshot for the metadata-store error fields.
    pub fn info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code.clone(),
            message: self.message.clone(),
            details: self.context.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Classify a model-invocation failure by substrings of the underlying
/// error message. The first match wins; matching is case-insensitive.
///
/// - `throttling` or `rate limit` → CAPACITY, jittered, 5 attempts,
///   MEDIUM;
/// - `validation` or `invalid` → CLIENT, no retry, CRITICAL;
/// - `timeout` → NETWORK, linear, 2 attempts, HIGH;
/// - otherwise → SERVER-side model failure: MODEL, exponential,
///   3 attempts, HIGH.
pub fn classify_model_failure(message: &str) -> WorkflowError {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("throttling") || lowered.contains("rate limit") {
        let mut err = WorkflowError::new(ErrorCategory::Capacity, "MODEL_THROTTLED", message);
        err.retry_strategy = RetryStrategy::Jittered;
        err.max_retries = 5;
        err.severity = ErrorSeverity::Medium;
        err.with_suggestion("reduce request rate or raise the model quota")
    } else if lowered.contains("validation") || lowered.contains("invalid") {
        let mut err = WorkflowError::new(ErrorCategory::Client, "MODEL_REJECTED_REQUEST", message);
        err.retry_strategy = RetryStrategy::None;
        err.max_retries = 0;
        err.severity = ErrorSeverity::Critical;
        err.with_suggestion("inspect the request payload; retrying cannot help")
    } else if lowered.contains("timeout") {
        let mut err = WorkflowError::new(ErrorCategory::Network, "MODEL_TIMEOUT", message);
        err.retry_strategy = RetryStrategy::Linear;
        err.max_retries = 2;
        err.severity = ErrorSeverity::High;
        err
    } else {
        let mut err = WorkflowError::new(ErrorCategory::Model, "MODEL_SERVER_ERROR", message);
        err.retry_strategy = RetryStrategy::Exponential;
        err.max_retries = 3;
        err.severity = ErrorSeverity::High;
        err
    }
}

/// Serializable snapshot of a [`WorkflowError`], suitable for storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
    /// Component that produced the error.
    pub component: String,
    /// Operation that failed.
    pub operation: String,
    /// Failure kind.
    pub category: ErrorCategory,
    /// Severity.
    pub severity: ErrorSeverity,
    /// Backoff shape.
    pub retry_strategy: RetryStrategy,
    /// Attempt bound.
    pub max_retries: u32,
    /// Operator-facing suggestions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    /// Recovery hints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery_hints: Vec<String>,
    /// When the error was classified.
    pub timestamp: DateTime<Utc>,
}

/// Compact error snapshot attached to the verification row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Structured details.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
    /// When the error occurred.
    pub timestamp: DateTime<Utc>,
}

/// Error-tracking block on the verification row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorTracking {
    /// Whether the verification has recorded errors.
    pub has_errors: bool,
    /// The most recent error.
    pub current_error: ErrorInfo,
    /// All recorded errors, oldest first.
    pub error_history: Vec<ErrorInfo>,
    /// When the most recent error occurred.
    pub last_error_at: DateTime<Utc>,
}

impl ErrorTracking {
    /// Build a tracking block for a single error.
    pub fn for_error(error: &WorkflowError) -> Self {
        let info = error.info();
        Self {
            has_errors: true,
            last_error_at: info.timestamp,
            error_history: vec![info.clone()],
            current_error: info,
        }
    }
}
