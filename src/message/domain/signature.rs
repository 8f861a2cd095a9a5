//! Optional signature block attached by senders that sign their payloads.
//!
//! Key management and signature verification belong to an external
//! authentication collaborator. The core only checks that the recorded
//! payload digest still matches the payload it travels with.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Name of the digest algorithm recorded in [`SignatureBlock::algorithm`].
pub const SHA256_ALGORITHM: &str = "sha256";

/// Signature metadata attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBlock {
    /// Digest algorithm used for [`Self::digest`].
    pub algorithm: String,
    /// Identifier of the signing key.
    pub key_id: String,
    /// Hex-encoded digest of the canonical payload.
    pub digest: String,
    /// Opaque signature over the digest.
    pub signature: String,
}

impl SignatureBlock {
    /// Creates a signature block whose digest covers `payload`.
    ///
    /// # Examples
    ///
    /// ```
    /// use serde_json::json;
    /// use switchyard::message::domain::SignatureBlock;
    ///
    /// let payload = json!({"task": "summarise"});
    /// let block = SignatureBlock::for_payload("key-1", &payload, "sig");
    /// assert!(block.matches(&payload));
    /// assert!(!block.matches(&json!({"task": "delete"})));
    /// ```
    #[must_use]
    pub fn for_payload(
        key_id: impl Into<String>,
        payload: &Value,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            algorithm: SHA256_ALGORITHM.to_owned(),
            key_id: key_id.into(),
            digest: payload_digest(payload),
            signature: signature.into(),
        }
    }

    /// Returns `true` if the recorded digest matches `payload`.
    #[must_use]
    pub fn matches(&self, payload: &Value) -> bool {
        self.algorithm.eq_ignore_ascii_case(SHA256_ALGORITHM)
            && self.digest.eq_ignore_ascii_case(&payload_digest(payload))
    }
}

/// Computes the hex-encoded SHA-256 digest of a payload's JSON encoding.
///
/// `serde_json` keeps object keys sorted, so equal payloads always hash to
/// the same digest.
#[must_use]
pub fn payload_digest(payload: &Value) -> String {
    let canonical = payload.to_string();
    let hash = Sha256::digest(canonical.as_bytes());
    hash.iter().map(|byte| format!("{byte:02x}")).collect()
}
