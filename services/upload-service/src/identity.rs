//! Caller identity carried in the `x-rh-identity` header.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Identity header is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Identity header is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Identity {
    pub account_number: String,
    pub org_id: String,
}

#[derive(Deserialize)]
struct IdentityEnvelope {
    identity: Identity,
}

impl Identity {
    /// Decode a base64 JSON document of the form `{"identity": {...}}`
    pub fn from_header(header: &str) -> Result<Self, IdentityError> {
        let raw = STANDARD.decode(header.trim())?;
        let envelope: IdentityEnvelope = serde_json::from_slice(&raw)?;
        Ok(envelope.identity)
    }

    /// The `(rh_account, principal)` pair carried on received events
    pub fn into_account(self) -> (String, String) {
        (self.account_number, self.org_id)
    }
}
