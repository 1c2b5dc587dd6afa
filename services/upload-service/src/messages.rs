//! Outbound event bus messages.

use serde::{Deserialize, Serialize};

/// Account/principal used when the caller sent no identity header
pub const PLACEHOLDER_ACCOUNT: &str = "000001";
pub const PLACEHOLDER_PRINCIPAL: &str = "default_principal";

/// An event waiting to be produced. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    topic: String,
    key: Option<String>,
    payload: serde_json::Value,
}

impl OutboundEvent {
    /// Build an event with a JSON payload
    pub fn new<T: Serialize>(
        topic: impl Into<String>,
        key: Option<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            topic: topic.into(),
            key,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Wire encoding of the payload
    pub fn payload_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.payload)
    }

    /// The `payload_id` field of the payload, if it carries one
    pub fn payload_id(&self) -> Option<&str> {
        self.payload.get("payload_id").and_then(|v| v.as_str())
    }
}

/// Announces a freshly quarantined upload to the service it is destined for.
///
/// `hash` mirrors `payload_id` for consumers that have not moved off the old field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadReceived {
    pub rh_account: String,
    pub principal: String,
    pub validation: u8,
    pub payload_id: String,
    pub hash: String,
    pub size: u64,
    pub service: String,
    pub url: String,
}

impl UploadReceived {
    pub fn new(
        account: Option<(String, String)>,
        payload_id: impl Into<String>,
        size: u64,
        service: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        let (rh_account, principal) = account.unwrap_or_else(|| {
            (
                PLACEHOLDER_ACCOUNT.to_string(),
                PLACEHOLDER_PRINCIPAL.to_string(),
            )
        });
        let payload_id = payload_id.into();

        Self {
            rh_account,
            principal,
            validation: 1,
            hash: payload_id.clone(),
            payload_id,
            size,
            service: service.into(),
            url: url.into(),
        }
    }
}

/// Announces an upload that passed validation and now lives in permanent storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadAvailable {
    pub url: String,
    pub payload_id: String,
}
