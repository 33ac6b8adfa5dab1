//! Status tokens, the legal-transition rule, and status history entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Every status token a verification can carry.
///
/// The token set is part of the external contract; new stages pick from
/// this set. The primary sequence runs Initialize → Turn-1 → Turn-2 →
/// finalization; previous-vs-current verifications may branch through the
/// historical-context statuses right after initialization. Error
/// terminals exist per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    /// A verification was requested.
    VerificationRequested,
    /// The initialization record was written.
    VerificationInitialized,
    /// Historical context was found and loaded (previous-vs-current).
    HistoricalContextLoaded,
    /// No prior verification existed; an empty historical context was
    /// synthesized (previous-vs-current).
    HistoricalContextNotFound,
    /// Image fetch started.
    FetchingImages,
    /// Both images are stored.
    ImagesFetched,
    /// The system prompt is prepared.
    PromptPrepared,
    /// Turn-1 prompt inputs are ready.
    Turn1PromptReady,
    /// Turn-1 worker started.
    Turn1Started,
    /// Turn-1 context loading finished.
    Turn1ContextLoaded,
    /// Turn-1 prompt rendered.
    Turn1PromptPrepared,
    /// Turn-1 image loaded.
    Turn1ImageLoaded,
    /// Turn-1 model invocation dispatched.
    Turn1BedrockInvoked,
    /// Turn-1 model invocation returned.
    Turn1BedrockCompleted,
    /// Turn-1 response processing started.
    Turn1ResponseProcessing,
    /// Turn-1 finished and was persisted.
    Turn1Completed,
    /// Turn-1 outputs were post-processed.
    Turn1Processed,
    /// Turn-2 prompt inputs are ready.
    Turn2PromptReady,
    /// Turn-2 worker started.
    Turn2Started,
    /// Turn-2 context loading finished.
    Turn2ContextLoaded,
    /// Turn-2 prompt rendered.
    Turn2PromptPrepared,
    /// Turn-2 image loaded.
    Turn2ImageLoaded,
    /// Turn-2 model invocation dispatched.
    Turn2BedrockInvoked,
    /// Turn-2 model invocation returned.
    Turn2BedrockCompleted,
    /// Turn-2 response processing started.
    Turn2ResponseProcessing,
    /// Turn-2 finished and was persisted.
    Turn2Completed,
    /// Turn-2 outputs were post-processed.
    Turn2Processed,
    /// The final outcome was computed.
    ResultsFinalized,
    /// The final outcome was stored.
    ResultsStored,
    /// The verification completed.
    Completed,

    /// Initialization failed.
    InitializationFailed,
    /// Historical-context fetch failed.
    HistoricalFetchFailed,
    /// Image fetch failed.
    ImageFetchFailed,
    /// Template processing failed.
    TemplateProcessingError,
    /// Turn-1 failed.
    Turn1Error,
    /// Turn-2 failed.
    Turn2Error,
    /// Model processing failed.
    BedrockProcessingFailed,
    /// The verification failed.
    VerificationFailed,
}

impl VerificationStatus {
    /// Whether this status is a terminal error state.
    pub fn is_error_terminal(&self) -> bool {
        matches!(
            self,
            VerificationStatus::InitializationFailed
                | VerificationStatus::HistoricalFetchFailed
                | VerificationStatus::ImageFetchFailed
                | VerificationStatus::TemplateProcessingError
                | VerificationStatus::Turn1Error
                | VerificationStatus::Turn2Error
                | VerificationStatus::BedrockProcessingFailed
                | VerificationStatus::VerificationFailed
        )
    }

    /// Whether no further transitions may leave this status.
    pub fn is_terminal(&self) -> bool {
        self.is_error_terminal() || *self == VerificationStatus::Completed
    }

    /// Position in the forward sequence. Error terminals have no
    /// position. The two historical-context branch statuses share a
    /// position: either may follow initialization, neither may follow
    /// the other.
    fn sequence_index(&self) -> Option<u32> {
        use VerificationStatus::*;
        let index = match self {
            VerificationRequested => 0,
            VerificationInitialized => 1,
            HistoricalContextLoaded | HistoricalContextNotFound => 2,
            FetchingImages => 3,
            ImagesFetched => 4,
            PromptPrepared => 5,
            Turn1PromptReady => 6,
            Turn1Started => 7,
            Turn1ContextLoaded => 8,
            Turn1PromptPrepared => 9,
            Turn1ImageLoaded => 10,
            Turn1BedrockInvoked => 11,
            Turn1BedrockCompleted => 12,
            Turn1ResponseProcessing => 13,
            Turn1Completed => 14,
            Turn1Processed => 15,
            Turn2PromptReady => 16,
            Turn2Started => 17,
            Turn2ContextLoaded => 18,
            Turn2PromptPrepared => 19,
            Turn2ImageLoaded => 20,
            Turn2BedrockInvoked => 21,
            Turn2BedrockCompleted => 22,
            Turn2ResponseProcessing => 23,
            Turn2Completed => 24,
            Turn2Processed => 25,
            ResultsFinalized => 26,
            ResultsStored => 27,
            Completed => 28,
            _ => return None,
        };
        Some(index)
    }

    /// The error terminals reachable from this status.
    ///
    /// `VERIFICATION_FAILED` matches every non-terminal status.
    fn matching_error_terminals(&self) -> &'static [VerificationStatus] {
        use VerificationStatus::*;
        match self {
            VerificationRequested | VerificationInitialized => {
                &[InitializationFailed, VerificationFailed]
            }
            HistoricalContextLoaded | HistoricalContextNotFound => {
                &[HistoricalFetchFailed, VerificationFailed]
            }
            FetchingImages | ImagesFetched => &[ImageFetchFailed, VerificationFailed],
            PromptPrepared => &[TemplateProcessingError, VerificationFailed],
            Turn1PromptReady | Turn1Started | Turn1ContextLoaded | Turn1PromptPrepared
            | Turn1ImageLoaded | Turn1ResponseProcessing | Turn1Completed | Turn1Processed => &[
                Turn1Error,
                TemplateProcessingError,
                VerificationFailed,
            ],
            Turn1BedrockInvoked | Turn1BedrockCompleted => {
                &[Turn1Error, BedrockProcessingFailed, VerificationFailed]
            }
            Turn2PromptReady | Turn2Started | Turn2ContextLoaded | Turn2PromptPrepared
            | Turn2ImageLoaded | Turn2ResponseProcessing | Turn2Completed | Turn2Processed => &[
                Turn2Error,
                TemplateProcessingError,
                VerificationFailed,
            ],
            Turn2BedrockInvoked | Turn2BedrockCompleted => {
                &[Turn2Error, BedrockProcessingFailed, VerificationFailed]
            }
            ResultsFinalized | ResultsStored => &[VerificationFailed],
            _ => &[],
        }
    }

    /// Whether `self → to` is a legal transition.
    ///
    /// Forward moves within the sequence are legal (skipping sub-stages
    /// is allowed); any non-terminal status may move to a matching error
    /// terminal. Backwards transitions and transitions out of a terminal
    /// status are not legal.
    pub fn can_transition_to(&self, to: VerificationStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to.is_error_terminal() {
            return self.matching_error_terminals().contains(&to);
        }
        match (self.sequence_index(), to.sequence_index()) {
            (Some(from), Some(to)) => from < to,
            _ => false,
        }
    }

    /// The wire token for this status.
    pub fn as_str(&self) -> &'static str {
        use VerificationStatus::*;
        match self {
            VerificationRequested => "VERIFICATION_REQUESTED",
            VerificationInitialized => "VERIFICATION_INITIALIZED",
            HistoricalContextLoaded => "HISTORICAL_CONTEXT_LOADED",
            HistoricalContextNotFound => "HISTORICAL_CONTEXT_NOT_FOUND",
            FetchingImages => "FETCHING_IMAGES",
            ImagesFetched => "IMAGES_FETCHED",
            PromptPrepared => "PROMPT_PREPARED",
            Turn1PromptReady => "TURN1_PROMPT_READY",
            Turn1Started => "TURN1_STARTED",
            Turn1ContextLoaded => "TURN1_CONTEXT_LOADED",
            Turn1PromptPrepared => "TURN1_PROMPT_PREPARED",
            Turn1ImageLoaded => "TURN1_IMAGE_LOADED",
            Turn1BedrockInvoked => "TURN1_BEDROCK_INVOKED",
            Turn1BedrockCompleted => "TURN1_BEDROCK_COMPLETED",
            Turn1ResponseProcessing => "TURN1_RESPONSE_PROCESSING",
            Turn1Completed => "TURN1_COMPLETED",
            Turn1Processed => "TURN1_PROCESSED",
            Turn2PromptReady => "TURN2_PROMPT_READY",
            Turn2Started => "TURN2_STARTED",
            Turn2ContextLoaded => "TURN2_CONTEXT_LOADED",
            Turn2PromptPrepared => "TURN2_PROMPT_PREPARED",
            Turn2ImageLoaded => "TURN2_IMAGE_LOADED",
            Turn2BedrockInvoked => "TURN2_BEDROCK_INVOKED",
            Turn2BedrockCompleted => "TURN2_BEDROCK_COMPLETED",
            Turn2ResponseProcessing => "TURN2_RESPONSE_PROCESSING",
            Turn2Completed => "TURN2_COMPLETED",
            Turn2Processed => "TURN2_PROCESSED",
            ResultsFinalized => "RESULTS_FINALIZED",
            ResultsStored => "RESULTS_STORED",
            Completed => "COMPLETED",
            InitializationFailed => "INITIALIZATION_FAILED",
            HistoricalFetchFailed => "HISTORICAL_FETCH_FAILED",
            ImageFetchFailed => "IMAGE_FETCH_FAILED",
            TemplateProcessingError => "TEMPLATE_PROCESSING_ERROR",
            Turn1Error => "TURN1_ERROR",
            Turn2Error => "TURN2_ERROR",
            BedrockProcessingFailed => "BEDROCK_PROCESSING_FAILED",
            VerificationFailed => "VERIFICATION_FAILED",
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One appended row of a verification's status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryEntry {
    /// The status reached.
    pub status: VerificationStatus,
    /// When the status was reached.
    pub timestamp: DateTime<Utc>,
    /// The worker function recording the entry.
    pub function_name: String,
    /// Wall-clock time spent in the stage, milliseconds.
    pub processing_time_ms: u64,
    /// Sub-stage name (e.g. the failing pipeline step).
    pub stage: String,
    /// Free-form stage metrics.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

impl StatusHistoryEntry {
    /// Create an entry timestamped now.
    pub fn new(
        status: VerificationStatus,
        function_name: impl Into<String>,
        stage: impl Into<String>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            status,
            timestamp: Utc::now(),
            function_name: function_name.into(),
            processing_time_ms,
            stage: stage.into(),
            metrics: BTreeMap::new(),
        }
    }

    /// Attach a metric to the entry.
    pub fn with_metric(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }

    /// Whether `other` duplicates this entry for idempotency purposes.
    ///
    /// Replays of the same request must not grow the history without
    /// bound: two rows with the same `(status, stage)` within the same
    /// minute are equivalent.
    pub fn duplicates(&self, other: &StatusHistoryEntry) -> bool {
        self.status == other.status
            && self.stage == other.stage
            && (self.timestamp - other.timestamp).num_minutes().abs() == 0
    }
}
