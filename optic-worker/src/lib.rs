//! The combined two-turn stage worker.
//!
//! One worker handles both turns of a verification: Turn 1 analyzes the
//! reference (or previous) image, Turn 2 analyzes the checking (or
//! current) image and compares. Each invocation consumes an inbound
//! [`Envelope`], resolves it into a [`optic_protocol::TurnRequest`],
//! drives the turn pipeline, and emits the outbound envelope.
//!
//! The worker is stateless between invocations: everything it reads and
//! writes travels by reference through the artifact store and the
//! metadata store. One worker processes one request at a time; the only
//! internal concurrency is the context loader's parallel fetch.

mod conversation;
mod event;
mod executor;
mod interpret;
mod loader;
mod persist;
mod prompt;
mod respond;

pub use conversation::{ImageBlock, build_turn1_conversation, build_turn2_conversation};
pub use event::EventTransformer;
pub use executor::{TurnArtifactRefs, TurnExecutor, TurnFlags, TurnOutcome};
pub use interpret::{Interpretation, interpret};
pub use loader::{ContextLoader, TurnContext};
pub use persist::persist_failure;
pub use prompt::prompt_variables;
pub use respond::build_envelope;

use optic_protocol::{
    ArtifactStore, Envelope, MetaStore, ModelClient, TurnId, WorkflowConfig, WorkflowError,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The combined stage worker: transformer + executor + response
/// builder over the three ports.
pub struct StageWorker {
    config: Arc<WorkflowConfig>,
    artifacts: Arc<dyn ArtifactStore>,
    meta: Arc<dyn MetaStore>,
    model: Arc<dyn ModelClient>,
    cancel: CancellationToken,
}

impl StageWorker {
    /// Create a worker over the three ports.
    pub fn new(
        config: Arc<WorkflowConfig>,
        artifacts: Arc<dyn ArtifactStore>,
        meta: Arc<dyn MetaStore>,
        model: Arc<dyn ModelClient>,
    ) -> Self {
        Self {
            config,
            artifacts,
            meta,
            model,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach a cancellation token; ongoing I/O and backoff waits abort
    /// when it fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle one turn: inbound envelope in, outbound envelope out.
    pub async fn handle(&self, turn_id: TurnId, event: Envelope) -> Result<Envelope, WorkflowError> {
        let transformer = EventTransformer::new(
            self.config.clone(),
            self.artifacts.clone(),
            self.cancel.clone(),
        );
        let request = transformer.transform(turn_id, event).await?;
        tracing::debug!(
            verification_id = %request.context.verification_id,
            turn = %turn_id,
            verification_type = %request.context.verification_type,
            "processing turn"
        );

        let executor = TurnExecutor::new(
            self.config.clone(),
            self.artifacts.clone(),
            self.meta.clone(),
            self.model.clone(),
            self.cancel.clone(),
        );
        let outcome = executor.process_turn(&request).await?;
        Ok(build_envelope(&request, &outcome))
    }

    /// Handle a raw JSON event (decodes the envelope first).
    pub async fn handle_value(
        &self,
        turn_id: TurnId,
        event: serde_json::Value,
    ) -> Result<Envelope, WorkflowError> {
        let transformer = EventTransformer::new(
            self.config.clone(),
            self.artifacts.clone(),
            self.cancel.clone(),
        );
        let request = transformer.transform_value(turn_id, event).await?;
        let executor = TurnExecutor::new(
            self.config.clone(),
            self.artifacts.clone(),
            self.meta.clone(),
            self.model.clone(),
            self.cancel.clone(),
        );
        let outcome = executor.process_turn(&request).await?;
        Ok(build_envelope(&request, &outcome))
    }
}
