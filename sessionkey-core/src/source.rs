//! Credential assembly with unauthenticated fallback.
//!
//! [`CredentialSource::acquire_session_credential`] is the only entry point
//! callers need.  It never fails: every [`AuthError`] is reduced to an
//! `UNAUTHENTICATED` credential by [`settle`], and whether the scheduler
//! accepts that is decided server-side.
//!
//! Each acquisition opens its own agent connection and drops it before
//! returning, so a source can be shared freely between tasks.

use std::sync::Arc;

use tracing::warn;

use crate::credential::SessionCredential;
use crate::matcher::KeyMatcher;
use crate::signer::{self, timestamp_millis};
use crate::{AgentConnector, AuthError, Identity, KeyDirectory};

#[derive(Clone)]
pub struct CredentialSource {
    directory: Arc<dyn KeyDirectory>,
    agent: Arc<dyn AgentConnector>,
    matcher: KeyMatcher,
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSource")
            .field("matcher", &self.matcher)
            .finish_non_exhaustive()
    }
}

impl CredentialSource {
    pub fn new(
        directory: Arc<dyn KeyDirectory>,
        agent: Arc<dyn AgentConnector>,
        matcher: KeyMatcher,
    ) -> Self {
        Self {
            directory,
            agent,
            matcher,
        }
    }

    pub fn directory(&self) -> &dyn KeyDirectory {
        self.directory.as_ref()
    }

    pub fn matcher(&self) -> &KeyMatcher {
        &self.matcher
    }

    /// Produce a credential for `identity`, signed if possible.
    pub async fn acquire_session_credential(&self, identity: &Identity) -> SessionCredential {
        settle(identity, self.try_acquire(identity).await)
    }

    /// Match a key and sign a fresh nonce, reporting why if that fails.
    pub async fn try_acquire(&self, identity: &Identity) -> Result<SessionCredential, AuthError> {
        let trusted = self
            .matcher
            .trusted_keys(self.directory.as_ref(), identity)
            .await?;
        let mut agent = self.agent.connect().await?;
        let key = self.matcher.select(agent.as_mut(), identity, &trusted).await?;
        signer::sign(agent.as_mut(), identity, &key).await
    }

    /// Only the key-matching half of [`try_acquire`](Self::try_acquire).
    pub async fn find_matching_key(
        &self,
        identity: &Identity,
    ) -> Result<crate::AgentKeyHandle, AuthError> {
        self.matcher
            .find_matching_key(self.directory.as_ref(), self.agent.as_ref(), identity)
            .await
    }
}

/// Reduce an acquisition outcome to a credential.
///
/// Failures log two warnings (the cause, then the fallback) and yield an
/// unauthenticated credential stamped with the current time.
pub fn settle(identity: &Identity, outcome: Result<SessionCredential, AuthError>) -> SessionCredential {
    match outcome {
        Ok(credential) => credential,
        Err(e) => {
            warn!(identity = %identity, kind = %e.kind(), "Cannot use SSH auth: {e}");
            warn!("Attempting un-authenticated communication");
            SessionCredential::unauthenticated(identity.clone(), timestamp_millis())
        }
    }
}
