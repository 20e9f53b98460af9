use std::fmt;

use serde::{Deserialize, Serialize};
use ssh_key::authorized_keys::Entry;
use ssh_key::{Algorithm, HashAlg, PublicKey, Signature};

pub mod config;
pub mod credential;
pub mod local;
pub mod matcher;
pub mod signer;
pub mod source;

pub use credential::{NonceSignature, SessionCredential};
pub use matcher::KeyMatcher;
pub use source::CredentialSource;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A username as known to the key directory.
///
/// Validated on construction so that it can be used verbatim as a directory
/// file name or URL path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidIdentity> {
        let name = name.into();
        if name.is_empty() || name == "." || name == ".." {
            return Err(InvalidIdentity(name));
        }
        if name
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '/' || c == '\\')
        {
            return Err(InvalidIdentity(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid username {0:?}")]
pub struct InvalidIdentity(pub String);

// ---------------------------------------------------------------------------
// Directory records and agent handles
// ---------------------------------------------------------------------------

/// One public key registered for an identity, exactly as the directory
/// returned it (an `authorized_keys`-style line).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyRecord {
    line: String,
}

impl PublicKeyRecord {
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into().trim().to_string(),
        }
    }

    /// Parse a directory payload: one record per line, skipping blank lines
    /// and `#` comments.
    pub fn parse_lines(text: &str) -> Vec<Self> {
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(Self::new)
            .collect()
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    /// Parse the line as an `authorized_keys` entry, options prefix included.
    pub fn entry(&self) -> Result<Entry, ssh_key::Error> {
        self.line.parse()
    }

    /// Key algorithm, or `None` if the line does not parse.
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.entry().ok().map(|e| e.public_key().algorithm())
    }

    pub fn public_key(&self) -> Result<PublicKey, ssh_key::Error> {
        Ok(self.entry()?.public_key().clone())
    }
}

/// Reference to a private key held by the agent.
///
/// Only the public half is visible; signing goes through [`KeyAgent::sign`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentKeyHandle {
    public_key: PublicKey,
}

impl AgentKeyHandle {
    pub fn new(public_key: PublicKey) -> Self {
        Self { public_key }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn comment(&self) -> &str {
        self.public_key.comment()
    }

    /// SHA-256 fingerprint string (e.g. `"SHA256:abc123…"`).
    pub fn fingerprint(&self) -> String {
        self.public_key.fingerprint(HashAlg::Sha256).to_string()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("could not query {0} from the key directory")]
    UnknownIdentity(String),
    #[error("key directory lookup failed: {0}")]
    Lookup(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("could not talk to SSH agent: {0}")]
    AgentUnavailable(String),
    #[error("SSH agent error: {0}")]
    Agent(String),
    #[error(
        "none of the {agent_keys} agent key(s) match the {directory_keys} key(s) registered for \
         {identity}; make sure your SSH key is loaded and uploaded to the key directory"
    )]
    NotFound {
        identity: String,
        agent_keys: usize,
        directory_keys: usize,
    },
}

/// Coarse classification of an [`AuthError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Directory,
    AgentUnavailable,
    Agent,
    NotFound,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Directory => "directory",
            Self::AgentUnavailable => "agent_unavailable",
            Self::Agent => "agent",
            Self::NotFound => "not_found",
        })
    }
}

impl AuthError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Directory(_) => FailureKind::Directory,
            Self::AgentUnavailable(_) => FailureKind::AgentUnavailable,
            Self::Agent(_) => FailureKind::Agent,
            Self::NotFound { .. } => FailureKind::NotFound,
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Maps usernames to the public keys registered for them.
#[async_trait::async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Return every record on file for `identity`.
    ///
    /// An identity the directory has never heard of is
    /// [`DirectoryError::UnknownIdentity`]; a known identity with no keys is
    /// `Ok(vec![])`.
    async fn lookup(&self, identity: &Identity) -> Result<Vec<PublicKeyRecord>, DirectoryError>;
}

/// An open connection to a key agent.
///
/// The connection is closed when the box is dropped.
#[async_trait::async_trait]
pub trait KeyAgent: Send {
    /// Keys currently loaded, in the order the agent reports them.
    async fn list_keys(&mut self) -> Result<Vec<AgentKeyHandle>, AuthError>;

    /// Ask the agent to sign `message` with the private half of `key`.
    async fn sign(&mut self, key: &AgentKeyHandle, message: &[u8]) -> Result<Signature, AuthError>;
}

/// Opens [`KeyAgent`] connections.
///
/// Fails with [`AuthError::AgentUnavailable`] when no agent can be reached.
#[async_trait::async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn KeyAgent>, AuthError>;
}
