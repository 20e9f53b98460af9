//! Session credential value.
//!
//! A [`SessionCredential`] is what the RPC layer attaches to each scheduler
//! request: the owner, a millisecond timestamp nonce, and either the owner's
//! signature over the decimal nonce or the `UNAUTHENTICATED` sentinel.
//!
//! The serialized shape is fixed:
//!
//! ```text
//! {"owner":"alice","nonce":1700000000000,"nonce_sig":"AAAADHJzYS1zaGEyLTUx…"}
//! {"owner":"bob","nonce":1700000000000,"nonce_sig":"UNAUTHENTICATED"}
//! ```
//!
//! Signed values are the SSH wire encoding of the agent's signature,
//! standard base64.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};
use ssh_encoding::{Decode, Encode};
use ssh_key::{PublicKey, Signature};

use crate::{AuthError, Identity};

/// Marker sent in place of a signature when no usable key was found.
pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";

#[derive(Clone, PartialEq, Eq)]
pub enum NonceSignature {
    /// SSH wire-encoded signature over the decimal nonce.
    Signed(Vec<u8>),
    Unauthenticated,
}

impl NonceSignature {
    pub fn is_signed(&self) -> bool {
        matches!(self, Self::Signed(_))
    }
}

impl std::fmt::Debug for NonceSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Signed(blob) => f.debug_tuple("Signed").field(&blob.len()).finish(),
            Self::Unauthenticated => f.write_str(UNAUTHENTICATED),
        }
    }
}

impl Serialize for NonceSignature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Self::Signed(blob) => serializer.serialize_str(&B64.encode(blob)),
            Self::Unauthenticated => serializer.serialize_str(UNAUTHENTICATED),
        }
    }
}

impl<'de> Deserialize<'de> for NonceSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s == UNAUTHENTICATED {
            return Ok(Self::Unauthenticated);
        }
        B64.decode(s.as_bytes())
            .map(Self::Signed)
            .map_err(|e| serde::de::Error::custom(format!("nonce_sig is not base64: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredential {
    owner: Identity,
    nonce: u64,
    #[serde(rename = "nonce_sig")]
    signature: NonceSignature,
}

impl SessionCredential {
    /// Build a signed credential from the agent's signature over `nonce`.
    pub fn signed(owner: Identity, nonce: u64, signature: &Signature) -> Result<Self, AuthError> {
        let mut blob = Vec::new();
        signature
            .encode(&mut blob)
            .map_err(|e| AuthError::Agent(format!("malformed signature from agent: {e}")))?;
        Ok(Self {
            owner,
            nonce,
            signature: NonceSignature::Signed(blob),
        })
    }

    pub fn unauthenticated(owner: Identity, nonce: u64) -> Self {
        Self {
            owner,
            nonce,
            signature: NonceSignature::Unauthenticated,
        }
    }

    pub fn owner(&self) -> &Identity {
        &self.owner
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn signature(&self) -> &NonceSignature {
        &self.signature
    }

    pub fn is_authenticated(&self) -> bool {
        self.signature.is_signed()
    }

    /// The exact bytes that were signed for this credential.
    pub fn signed_message(&self) -> Vec<u8> {
        nonce_message(self.nonce)
    }

    /// Check the signature against `key`.
    ///
    /// Always `false` for an unauthenticated credential.
    pub fn verify(&self, key: &PublicKey) -> bool {
        let NonceSignature::Signed(blob) = &self.signature else {
            return false;
        };
        let mut reader = blob.as_slice();
        let Ok(sig) = Signature::decode(&mut reader) else {
            return false;
        };
        signature::Verifier::verify(key.key_data(), &self.signed_message(), &sig).is_ok()
    }
}

/// Decimal string form of a nonce, as signed by the session signer.
pub fn nonce_message(nonce: u64) -> Vec<u8> {
    nonce.to_string().into_bytes()
}
