//! Key matching between the agent and the key directory.
//!
//! Users commonly have several keys loaded in their agent (one for the
//! directory, others for unrelated hosts), so the first agent key is often
//! the wrong one.  The matcher has each agent key sign a fixed probe message
//! and checks that signature against every key the directory holds for the
//! user.  No key material is compared directly and no private key ever
//! leaves the agent.
//!
//! Ordering: agent keys are tried in the order the agent lists them and
//! directory keys in the order the directory returned them.  The first
//! verified pair wins.

use ssh_key::{PublicKey, Signature};
use tracing::{debug, info};

use crate::config::MatchingConfig;
use crate::{AgentConnector, AgentKeyHandle, AuthError, Identity, KeyAgent, KeyDirectory};

/// Probe message signed by each agent key during matching.
///
/// Never part of a credential.
pub const CHALLENGE: &[u8] = b"sessionkey: key correspondence probe";

#[derive(Debug, Clone)]
pub struct KeyMatcher {
    accepted_key_types: Vec<String>,
}

impl Default for KeyMatcher {
    fn default() -> Self {
        Self::from_config(&MatchingConfig::default())
    }
}

impl KeyMatcher {
    pub fn new(accepted_key_types: Vec<String>) -> Self {
        Self { accepted_key_types }
    }

    pub fn from_config(config: &MatchingConfig) -> Self {
        Self::new(config.accepted_key_types.clone())
    }

    pub fn accepted_key_types(&self) -> &[String] {
        &self.accepted_key_types
    }

    /// Fetch the directory keys for `identity` that the matcher can use.
    ///
    /// Records of an unaccepted type, or that fail to parse, are dropped.
    pub async fn trusted_keys(
        &self,
        directory: &dyn KeyDirectory,
        identity: &Identity,
    ) -> Result<Vec<PublicKey>, AuthError> {
        let records = directory.lookup(identity).await?;

        let mut keys = Vec::with_capacity(records.len());
        for record in &records {
            let key = match record.public_key() {
                Ok(key) => key,
                Err(e) => {
                    debug!(identity = %identity, error = %e, "unparsable directory key, skipping");
                    continue;
                }
            };
            let algorithm = key.algorithm();
            if !self.accepted_key_types.iter().any(|t| t == algorithm.as_str()) {
                debug!(
                    identity = %identity,
                    algorithm = algorithm.as_str(),
                    "directory key type not accepted, skipping"
                );
                continue;
            }
            keys.push(key);
        }

        debug!(
            identity = %identity,
            records = records.len(),
            usable = keys.len(),
            "directory lookup complete"
        );
        Ok(keys)
    }

    /// Pick the first agent key whose probe signature verifies against one
    /// of `trusted`.
    pub async fn select(
        &self,
        agent: &mut dyn KeyAgent,
        identity: &Identity,
        trusted: &[PublicKey],
    ) -> Result<AgentKeyHandle, AuthError> {
        let handles = agent.list_keys().await?;
        debug!(count = handles.len(), "agent keys listed");

        let mut signed_any = false;
        let mut last_error = None;

        for handle in &handles {
            let probe = match agent.sign(handle, CHALLENGE).await {
                Ok(sig) => sig,
                Err(e) => {
                    debug!(
                        fingerprint = %handle.fingerprint(),
                        error = %e,
                        "agent refused probe signature, trying next key"
                    );
                    last_error = Some(e);
                    continue;
                }
            };
            signed_any = true;

            if trusted.iter().any(|key| verifies(key, &probe)) {
                info!(
                    identity = %identity,
                    fingerprint = %handle.fingerprint(),
                    comment = handle.comment(),
                    "found agent key registered in key directory"
                );
                return Ok(handle.clone());
            }
            debug!(fingerprint = %handle.fingerprint(), "agent key not registered");
        }

        if !signed_any && let Some(e) = last_error {
            return Err(e);
        }

        Err(AuthError::NotFound {
            identity: identity.to_string(),
            agent_keys: handles.len(),
            directory_keys: trusted.len(),
        })
    }

    /// Directory lookup, agent connection, and selection in one call.
    ///
    /// The agent connection is closed before returning.
    pub async fn find_matching_key(
        &self,
        directory: &dyn KeyDirectory,
        connector: &dyn AgentConnector,
        identity: &Identity,
    ) -> Result<AgentKeyHandle, AuthError> {
        let trusted = self.trusted_keys(directory, identity).await?;
        let mut agent = connector.connect().await?;
        self.select(agent.as_mut(), identity, &trusted).await
    }
}

fn verifies(key: &PublicKey, probe: &Signature) -> bool {
    signature::Verifier::verify(key.key_data(), CHALLENGE, probe).is_ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use ssh_key::PrivateKey;

    use super::*;
    use crate::local::sign_with_key;
    use crate::{DirectoryError, FailureKind, PublicKeyRecord};

    pub(crate) const RSA_A: &str = include_str!("../../testdata/alice_rsa_a");
    pub(crate) const RSA_A_PUB: &str = include_str!("../../testdata/alice_rsa_a.pub");
    pub(crate) const RSA_B: &str = include_str!("../../testdata/alice_rsa_b");
    pub(crate) const RSA_B_PUB: &str = include_str!("../../testdata/alice_rsa_b.pub");
    pub(crate) const STRANGER: &str = include_str!("../../testdata/stranger_rsa");
    pub(crate) const STRANGER_PUB: &str = include_str!("../../testdata/stranger_rsa.pub");
    pub(crate) const ED25519: &str = include_str!("../../testdata/alice_ed25519");
    pub(crate) const ED25519_PUB: &str = include_str!("../../testdata/alice_ed25519.pub");

    /// Agent backed by in-memory private keys.
    pub(crate) struct FakeAgent {
        keys: Vec<PrivateKey>,
        pub(crate) signed: Vec<Vec<u8>>,
        /// Signatures left before the agent starts refusing; `None` is unlimited.
        pub(crate) sign_limit: Option<usize>,
        /// Shared count of open connections, decremented on drop.
        open: Option<Arc<AtomicUsize>>,
    }

    impl FakeAgent {
        pub(crate) fn with_keys(pems: &[&str]) -> Self {
            Self {
                keys: pems
                    .iter()
                    .map(|pem| PrivateKey::from_openssh(pem).unwrap())
                    .collect(),
                signed: Vec::new(),
                sign_limit: None,
                open: None,
            }
        }
    }

    impl Drop for FakeAgent {
        fn drop(&mut self) {
            if let Some(open) = &self.open {
                open.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    #[async_trait::async_trait]
    impl KeyAgent for FakeAgent {
        async fn list_keys(&mut self) -> Result<Vec<AgentKeyHandle>, AuthError> {
            Ok(self
                .keys
                .iter()
                .map(|k| AgentKeyHandle::new(k.public_key().clone()))
                .collect())
        }

        async fn sign(
            &mut self,
            key: &AgentKeyHandle,
            message: &[u8],
        ) -> Result<Signature, AuthError> {
            match &mut self.sign_limit {
                Some(0) => return Err(AuthError::Agent("agent refused operation".into())),
                Some(left) => *left -= 1,
                None => {}
            }
            let private = self
                .keys
                .iter()
                .find(|k| k.public_key().key_data() == key.public_key().key_data())
                .ok_or_else(|| AuthError::Agent("key not found".into()))?;
            self.signed.push(message.to_vec());
            sign_with_key(private, message)
        }
    }

    /// Connector handing out fresh [`FakeAgent`]s, or failing when `None`.
    pub(crate) struct FakeConnector {
        keys: Option<Vec<&'static str>>,
        pub(crate) sign_limit: Option<usize>,
        pub(crate) connects: AtomicUsize,
        /// Agents handed out and not yet dropped.
        pub(crate) open: Arc<AtomicUsize>,
    }

    impl FakeConnector {
        pub(crate) fn with_keys(pems: &[&'static str]) -> Self {
            Self {
                keys: Some(pems.to_vec()),
                sign_limit: None,
                connects: AtomicUsize::new(0),
                open: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub(crate) fn unavailable() -> Self {
            Self {
                keys: None,
                ..Self::with_keys(&[])
            }
        }
    }

    #[async_trait::async_trait]
    impl AgentConnector for FakeConnector {
        async fn connect(&self) -> Result<Box<dyn KeyAgent>, AuthError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let keys = self
                .keys
                .as_ref()
                .ok_or_else(|| AuthError::AgentUnavailable("SSH_AUTH_SOCK is not set".into()))?;
            let mut agent = FakeAgent::with_keys(keys);
            agent.sign_limit = self.sign_limit;
            self.open.fetch_add(1, Ordering::SeqCst);
            agent.open = Some(Arc::clone(&self.open));
            Ok(Box::new(agent))
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeDirectory {
        users: HashMap<String, Vec<String>>,
        pub(crate) lookups: Mutex<Vec<String>>,
    }

    impl FakeDirectory {
        pub(crate) fn with_user(mut self, name: &str, lines: &[&str]) -> Self {
            self.users
                .insert(name.to_string(), lines.iter().map(|l| l.to_string()).collect());
            self
        }
    }

    #[async_trait::async_trait]
    impl KeyDirectory for FakeDirectory {
        async fn lookup(&self, identity: &Identity) -> Result<Vec<PublicKeyRecord>, DirectoryError> {
            self.lookups.lock().unwrap().push(identity.to_string());
            self.users
                .get(identity.as_str())
                .map(|lines| lines.iter().map(PublicKeyRecord::new).collect())
                .ok_or_else(|| DirectoryError::UnknownIdentity(identity.to_string()))
        }
    }

    fn alice() -> Identity {
        Identity::new("alice").unwrap()
    }

    fn public(pub_line: &str) -> PublicKey {
        PublicKey::from_openssh(pub_line.trim()).unwrap()
    }

    #[tokio::test]
    async fn second_agent_key_matches_second_directory_key() {
        let directory = FakeDirectory::default().with_user("alice", &[STRANGER_PUB, RSA_B_PUB]);
        let connector = FakeConnector::with_keys(&[RSA_A, RSA_B]);

        let handle = KeyMatcher::default()
            .find_matching_key(&directory, &connector, &alice())
            .await
            .unwrap();

        assert_eq!(handle.public_key().key_data(), public(RSA_B_PUB).key_data());
        assert_eq!(handle.comment(), "alice-github");
    }

    #[tokio::test]
    async fn first_matching_agent_key_wins() {
        let directory = FakeDirectory::default().with_user("alice", &[RSA_B_PUB, RSA_A_PUB]);
        let matcher = KeyMatcher::default();
        let trusted = matcher.trusted_keys(&directory, &alice()).await.unwrap();

        let mut agent = FakeAgent::with_keys(&[RSA_A, RSA_B]);
        let handle = matcher.select(&mut agent, &alice(), &trusted).await.unwrap();
        assert_eq!(handle.comment(), "alice-work");
        // Early exit: only the first agent key was asked to sign.
        assert_eq!(agent.signed, vec![CHALLENGE.to_vec()]);
    }

    #[tokio::test]
    async fn matching_is_repeatable() {
        let directory = FakeDirectory::default().with_user("alice", &[RSA_A_PUB, RSA_B_PUB]);
        let connector = FakeConnector::with_keys(&[STRANGER, RSA_B, RSA_A]);
        let matcher = KeyMatcher::default();

        let first = matcher
            .find_matching_key(&directory, &connector, &alice())
            .await
            .unwrap();
        let second = matcher
            .find_matching_key(&directory, &connector, &alice())
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.comment(), "alice-github");
    }

    #[tokio::test]
    async fn non_rsa_directory_keys_are_ignored_by_default() {
        let directory = FakeDirectory::default().with_user("alice", &[ED25519_PUB]);
        let connector = FakeConnector::with_keys(&[ED25519]);

        let err = KeyMatcher::default()
            .find_matching_key(&directory, &connector, &alice())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AuthError::NotFound {
                identity: "alice".into(),
                agent_keys: 1,
                directory_keys: 0,
            }
        );
    }

    #[tokio::test]
    async fn accepted_key_types_are_configurable() {
        let directory = FakeDirectory::default().with_user("alice", &[ED25519_PUB]);
        let connector = FakeConnector::with_keys(&[RSA_A, ED25519]);
        let matcher = KeyMatcher::new(vec!["ssh-rsa".into(), "ssh-ed25519".into()]);

        let handle = matcher
            .find_matching_key(&directory, &connector, &alice())
            .await
            .unwrap();
        assert_eq!(handle.comment(), "alice-ed25519");
    }

    #[tokio::test]
    async fn unparsable_directory_lines_are_skipped() {
        let directory = FakeDirectory::default().with_user("alice", &["ssh-rsa AAAA!!garbage", RSA_A_PUB]);
        let trusted = KeyMatcher::default()
            .trusted_keys(&directory, &alice())
            .await
            .unwrap();
        assert_eq!(trusted, vec![public(RSA_A_PUB)]);
    }

    #[tokio::test]
    async fn options_prefixed_directory_line_is_trusted() {
        let line = format!("no-pty,no-port-forwarding {}", RSA_B_PUB.trim());
        let directory = FakeDirectory::default().with_user("alice", &[line.as_str()]);
        let connector = FakeConnector::with_keys(&[RSA_A, RSA_B]);
        let matcher = KeyMatcher::default();

        let trusted = matcher.trusted_keys(&directory, &alice()).await.unwrap();
        assert_eq!(trusted, vec![public(RSA_B_PUB)]);

        let handle = matcher
            .find_matching_key(&directory, &connector, &alice())
            .await
            .unwrap();
        assert_eq!(handle.comment(), "alice-github");
    }

    #[tokio::test]
    async fn no_matching_agent_key_is_not_found() {
        let directory = FakeDirectory::default().with_user("alice", &[RSA_A_PUB]);
        let connector = FakeConnector::with_keys(&[STRANGER, RSA_B]);

        let err = KeyMatcher::default()
            .find_matching_key(&directory, &connector, &alice())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::NotFound);
    }

    #[tokio::test]
    async fn empty_agent_is_not_found() {
        let directory = FakeDirectory::default().with_user("alice", &[RSA_A_PUB]);
        let connector = FakeConnector::with_keys(&[]);

        let err = KeyMatcher::default()
            .find_matching_key(&directory, &connector, &alice())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NotFound { agent_keys: 0, .. }), "{err:?}");
    }

    #[tokio::test]
    async fn unknown_identity_is_directory_error() {
        let directory = FakeDirectory::default().with_user("alice", &[RSA_A_PUB]);
        let connector = FakeConnector::with_keys(&[RSA_A]);

        let err = KeyMatcher::default()
            .find_matching_key(&directory, &connector, &Identity::new("bob").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::Directory(DirectoryError::UnknownIdentity("bob".into())));
        // The directory is consulted before the agent is touched.
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_agent_is_agent_unavailable() {
        let directory = FakeDirectory::default().with_user("alice", &[RSA_A_PUB]);
        let connector = FakeConnector::unavailable();

        let err = KeyMatcher::default()
            .find_matching_key(&directory, &connector, &alice())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::AgentUnavailable);
    }

    #[tokio::test]
    async fn agent_refusing_every_probe_is_agent_error() {
        let directory = FakeDirectory::default().with_user("alice", &[RSA_A_PUB]);
        let mut connector = FakeConnector::with_keys(&[RSA_A]);
        connector.sign_limit = Some(0);

        let err = KeyMatcher::default()
            .find_matching_key(&directory, &connector, &alice())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Agent);
    }
}
