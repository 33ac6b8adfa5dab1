//! Startup configuration. Read once, treated as immutable.

use crate::error::{ErrorCategory, WorkflowError};
use std::fmt;
use std::str::FromStr;

/// Default verification-id prefix.
pub const DEFAULT_ID_PREFIX: &str = "verif-";

/// Default maximum decoded image size: 20 MiB.
pub const DEFAULT_MAX_IMAGE_SIZE_BYTES: u64 = 20 * (1 << 20);

/// Log level carried in configuration and mapped onto the embedding
/// binary's `tracing` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Normal operation.
    #[default]
    Info,
    /// Degraded operation only.
    Warn,
    /// Failures only.
    Error,
}

impl LogLevel {
    /// The `tracing_subscriber::EnvFilter` directive for this level.
    pub fn filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        })
    }
}

/// Worker configuration.
///
/// Bucket and table names, the model id, and the business thresholds.
/// Constructed literally or from the environment; never mutated after
/// startup.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowConfig {
    /// Bucket holding every verification artifact. Required.
    pub artifact_bucket: String,
    /// Metadata table for verification rows. Required.
    pub verification_meta_table: String,
    /// Metadata table for conversation rows. Required.
    pub conversation_meta_table: String,
    /// Model identifier. Required.
    pub model_id: String,
    /// Maximum output tokens per model call.
    pub model_max_tokens: u32,
    /// Sampling temperature.
    pub model_temperature: f64,
    /// Nucleus sampling parameter.
    pub model_top_p: Option<f64>,
    /// Business-rule threshold for MISSING/MISPLACED discrepancies.
    /// `0` disables the rule.
    pub discrepancy_threshold: u32,
    /// Maximum decoded image size in bytes.
    pub max_image_size_bytes: u64,
    /// Prefix every verification id starts with.
    pub verification_id_prefix: String,
    /// Log level for the embedding binary.
    pub log_level: LogLevel,
}

impl WorkflowConfig {
    /// Build a configuration with the required values and defaults for
    /// everything else.
    pub fn new(
        artifact_bucket: impl Into<String>,
        verification_meta_table: impl Into<String>,
        conversation_meta_table: impl Into<String>,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            artifact_bucket: artifact_bucket.into(),
            verification_meta_table: verification_meta_table.into(),
            conversation_meta_table: conversation_meta_table.into(),
            model_id: model_id.into(),
            model_max_tokens: 4096,
            model_temperature: 0.0,
            model_top_p: None,
            discrepancy_threshold: 0,
            max_image_size_bytes: DEFAULT_MAX_IMAGE_SIZE_BYTES,
            verification_id_prefix: DEFAULT_ID_PREFIX.to_string(),
            log_level: LogLevel::default(),
        }
    }

    /// Read configuration from the environment.
    ///
    /// Required: `ARTIFACT_BUCKET`, `VERIFICATION_META_TABLE`,
    /// `CONVERSATION_META_TABLE`, `MODEL_ID`. Optional:
    /// `MODEL_MAX_TOKENS`, `MODEL_TEMPERATURE`, `MODEL_TOP_P`,
    /// `DISCREPANCY_THRESHOLD`, `MAX_IMAGE_SIZE_BYTES`,
    /// `VERIFICATION_ID_PREFIX`, `LOG_LEVEL`.
    pub fn from_env() -> Result<Self, WorkflowError> {
        let mut config = Self::new(
            required_env("ARTIFACT_BUCKET")?,
            required_env("VERIFICATION_META_TABLE")?,
            required_env("CONVERSATION_META_TABLE")?,
            required_env("MODEL_ID")?,
        );
        if let Some(value) = optional_env("MODEL_MAX_TOKENS") {
            config.model_max_tokens = parse_env("MODEL_MAX_TOKENS", &value)?;
        }
        if let Some(value) = optional_env("MODEL_TEMPERATURE") {
            config.model_temperature = parse_env("MODEL_TEMPERATURE", &value)?;
        }
        if let Some(value) = optional_env("MODEL_TOP_P") {
            config.model_top_p = Some(parse_env("MODEL_TOP_P", &value)?);
        }
        if let Some(value) = optional_env("DISCREPANCY_THRESHOLD") {
            config.discrepancy_threshold = parse_env("DISCREPANCY_THRESHOLD", &value)?;
        }
        if let Some(value) = optional_env("MAX_IMAGE_SIZE_BYTES") {
            config.max_image_size_bytes = parse_env("MAX_IMAGE_SIZE_BYTES", &value)?;
        }
        if let Some(value) = optional_env("VERIFICATION_ID_PREFIX") {
            config.verification_id_prefix = value;
        }
        if let Some(value) = optional_env("LOG_LEVEL") {
            config.log_level = value.parse().map_err(|e: String| {
                WorkflowError::new(ErrorCategory::Validation, "INVALID_CONFIG", e)
            })?;
        }
        Ok(config)
    }
}

fn required_env(name: &str) -> Result<String, WorkflowError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(WorkflowError::new(
            ErrorCategory::Validation,
            "MISSING_CONFIG",
            format!("required configuration {name} is not set"),
        )
        .with_context("variable", serde_json::json!(name))),
    }
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T, WorkflowError>
where
    T::Err: fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| {
        WorkflowError::new(
            ErrorCategory::Validation,
            "INVALID_CONFIG",
            format!("configuration {name} is invalid: {e}"),
        )
    })
}
