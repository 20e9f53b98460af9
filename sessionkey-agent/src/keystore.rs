//! In-memory key store and the agent that serves it.
//!
//! The [`KeyStore`] holds private keys loaded from disk (see
//! [`crate::pem`]).  [`MemoryAgentConnector`] hands out [`MemoryAgent`]
//! sessions sharing the store, so the rest of the crate sees the same
//! list-then-sign interface a real SSH agent offers: callers get public
//! halves and signatures, never the private keys.
//!
//! Thread safety: all mutations go through `Arc<RwLock<KeyStore>>`.

use std::sync::{Arc, RwLock};

use sessionkey_core::local::sign_with_key;
use sessionkey_core::{AgentConnector, AgentKeyHandle, AuthError, KeyAgent};
use ssh_key::{HashAlg, PrivateKey, Signature};
use tracing::debug;

/// One key held by the store.
#[derive(Clone)]
pub struct KeyEntry {
    /// Where the key came from (file path or caller-supplied label).
    pub source: String,

    /// The private key (zeroized on drop via `ssh_key::PrivateKey`).
    pub private_key: PrivateKey,

    /// SHA-256 fingerprint string (e.g. `"SHA256:abc123…"`).
    pub fingerprint: String,
}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEntry")
            .field("source", &self.source)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl KeyEntry {
    pub fn new(private_key: PrivateKey, source: impl Into<String>) -> Self {
        let fingerprint = private_key
            .public_key()
            .fingerprint(HashAlg::Sha256)
            .to_string();
        Self {
            source: source.into(),
            private_key,
            fingerprint,
        }
    }
}

/// Ordered key store.
///
/// Keys are listed in insertion order, which is the order the matcher tries
/// them in.  Inserting a key whose fingerprint is already present is a
/// no-op.
#[derive(Debug, Default)]
pub struct KeyStore {
    entries: Vec<KeyEntry>,
}

impl KeyStore {
    /// Create an empty shared key store.
    pub fn new() -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Insert a key entry.  Returns `false` if the fingerprint was already
    /// loaded.
    pub fn insert(&mut self, entry: KeyEntry) -> bool {
        if self.get_by_fingerprint(&entry.fingerprint).is_some() {
            debug!(fingerprint = %entry.fingerprint, source = %entry.source, "keystore: duplicate key ignored");
            return false;
        }
        debug!(fingerprint = %entry.fingerprint, source = %entry.source, "keystore: adding key");
        self.entries.push(entry);
        true
    }

    pub fn get_by_fingerprint(&self, fingerprint: &str) -> Option<&KeyEntry> {
        self.entries.iter().find(|e| e.fingerprint == fingerprint)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeyEntry> {
        self.entries.iter()
    }
}

fn poisoned() -> AuthError {
    AuthError::Agent("key store lock poisoned".to_string())
}

/// Hands out [`MemoryAgent`] sessions over a shared [`KeyStore`].
#[derive(Clone, Debug)]
pub struct MemoryAgentConnector {
    store: Arc<RwLock<KeyStore>>,
}

impl MemoryAgentConnector {
    pub fn new(store: Arc<RwLock<KeyStore>>) -> Self {
        Self { store }
    }

    /// Build a connector over `keys`, listed in the given order.
    pub fn with_keys(keys: impl IntoIterator<Item = (PrivateKey, String)>) -> Self {
        let store = KeyStore::new();
        if let Ok(mut guard) = store.write() {
            for (key, source) in keys {
                guard.insert(KeyEntry::new(key, source));
            }
        }
        Self { store }
    }

    pub fn store(&self) -> &Arc<RwLock<KeyStore>> {
        &self.store
    }
}

#[async_trait::async_trait]
impl AgentConnector for MemoryAgentConnector {
    async fn connect(&self) -> Result<Box<dyn KeyAgent>, AuthError> {
        Ok(Box::new(MemoryAgent {
            store: Arc::clone(&self.store),
        }))
    }
}

/// One session against a [`KeyStore`].
#[derive(Clone, Debug)]
pub struct MemoryAgent {
    store: Arc<RwLock<KeyStore>>,
}

#[async_trait::async_trait]
impl KeyAgent for MemoryAgent {
    async fn list_keys(&mut self) -> Result<Vec<AgentKeyHandle>, AuthError> {
        let store = self.store.read().map_err(|_| poisoned())?;
        let handles: Vec<AgentKeyHandle> = store
            .iter()
            .map(|entry| AgentKeyHandle::new(entry.private_key.public_key().clone()))
            .collect();
        debug!(count = handles.len(), "request_identities");
        Ok(handles)
    }

    async fn sign(&mut self, key: &AgentKeyHandle, message: &[u8]) -> Result<Signature, AuthError> {
        let fingerprint = key.fingerprint();
        let store = self.store.read().map_err(|_| poisoned())?;
        let entry = store
            .get_by_fingerprint(&fingerprint)
            .ok_or_else(|| AuthError::Agent(format!("key {fingerprint} not loaded")))?;

        debug!(fingerprint = %fingerprint, data_len = message.len(), "sign");

        sign_with_key(&entry.private_key, message)
    }
}
