//! The on-wire message exchanged between stage workers.

use crate::reference::{LogicalName, Reference};
use crate::status::VerificationStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema version stamped on every envelope.
pub const SCHEMA_VERSION: &str = "2.1.0";

/// The message passed between stages.
///
/// Workers consume an inbound envelope, produce a new one, and never
/// mutate input references. An outbound envelope's reference map is always
/// a superset of the inbound map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Envelope schema version (`2.1.0`).
    pub schema_version: String,
    /// Opaque stable verification identifier. Never empty after the
    /// Initialize stage.
    pub verification_id: String,
    /// Current status token.
    pub status: VerificationStatus,
    /// Typed references to stored artifacts.
    #[serde(rename = "s3References", default)]
    pub references: BTreeMap<LogicalName, Reference>,
    /// Optional free-form summary emitted by the producing stage.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub summary: BTreeMap<String, serde_json::Value>,
}

impl Envelope {
    /// Create an envelope with the current schema version and no
    /// references.
    pub fn new(verification_id: impl Into<String>, status: VerificationStatus) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            verification_id: verification_id.into(),
            status,
            references: BTreeMap::new(),
            summary: BTreeMap::new(),
        }
    }

    /// Look up a reference by logical name.
    pub fn reference(&self, name: LogicalName) -> Option<&Reference> {
        self.references.get(&name)
    }

    /// Insert or replace a reference.
    pub fn set_reference(&mut self, name: LogicalName, reference: Reference) {
        self.references.insert(name, reference);
    }

    /// Decode an envelope from a JSON value, rejecting unknown logical
    /// names and malformed references.
    pub fn from_json(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Envelope {
        let mut envelope = Envelope::new(
            "verif-20250401123000",
            VerificationStatus::Turn1Completed,
        );
        envelope.set_reference(
            LogicalName::ProcessingInitialization,
            Reference::new(
                "artifacts",
                "2025/04/01/verif-20250401123000/processing/initialization.json",
                512,
            ),
        );
        envelope
    }

    #[test]
    fn wire_shape_uses_s3_references_key() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["schemaVersion"], "2.1.0");
        assert_eq!(json["verificationId"], "verif-20250401123000");
        assert_eq!(json["status"], "TURN1_COMPLETED");
        assert!(json["s3References"]["processing_initialization"].is_object());
        assert_eq!(
            json["s3References"]["processing_initialization"]["size"],
            512
        );
    }

    #[test]
    fn roundtrip_preserves_verification_id() {
        let envelope = sample();
        let json = serde_json::to_value(&envelope).unwrap();
        let back = Envelope::from_json(json).unwrap();
        assert_eq!(back.verification_id, envelope.verification_id);
        assert_eq!(back.references, envelope.references);
    }

    #[test]
    fn unknown_logical_name_is_rejected() {
        let value = json!({
            "schemaVersion": "2.1.0",
            "verificationId": "verif-1",
            "status": "TURN1_COMPLETED",
            "s3References": {
                "responses_turn9Raw": {"bucket": "b", "key": "k", "size": 1}
            }
        });
        assert!(Envelope::from_json(value).is_err());
    }

    #[test]
    fn missing_summary_defaults_to_empty() {
        let value = json!({
            "schemaVersion": "2.1.0",
            "verificationId": "verif-1",
            "status": "VERIFICATION_INITIALIZED",
            "s3References": {}
        });
        let envelope = Envelope::from_json(value).unwrap();
        assert!(envelope.summary.is_empty());
    }
}
