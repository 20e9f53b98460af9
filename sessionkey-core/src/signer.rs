//! Session signer: timestamp the session and have the agent sign it.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::credential::{SessionCredential, nonce_message};
use crate::{AgentKeyHandle, AuthError, Identity, KeyAgent};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Sign the current timestamp with `key` and wrap it as a credential.
///
/// Agent failures surface as [`AuthError::Agent`]; the caller may retry.
pub async fn sign(
    agent: &mut dyn KeyAgent,
    identity: &Identity,
    key: &AgentKeyHandle,
) -> Result<SessionCredential, AuthError> {
    let nonce = timestamp_millis();
    let signature = agent
        .sign(key, &nonce_message(nonce))
        .await
        .map_err(|e| match e {
            AuthError::Agent(_) => e,
            other => AuthError::Agent(other.to_string()),
        })?;

    debug!(
        identity = %identity,
        fingerprint = %key.fingerprint(),
        nonce,
        "signed session nonce"
    );
    SessionCredential::signed(identity.clone(), nonce, &signature)
}
