//! Key directory clients.
//!
//! Every backend answers the same question: which public keys are on record
//! for a username?  Payloads use the `authorized_keys` line format
//! throughout (see [`PublicKeyRecord::parse_lines`]).
//!
//! [`PublicKeyRecord::parse_lines`]: sessionkey_core::PublicKeyRecord::parse_lines

use std::collections::HashMap;

use sessionkey_core::{DirectoryError, Identity, KeyDirectory, PublicKeyRecord};

pub mod file;
pub mod http;

pub use file::FileDirectory;
pub use http::HttpDirectory;

/// Fixed in-memory directory.
#[derive(Debug, Clone, Default)]
pub struct MemoryDirectory {
    users: HashMap<String, Vec<PublicKeyRecord>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `identity` with the given `authorized_keys` lines.
    pub fn with_user(mut self, identity: &str, lines: &[&str]) -> Self {
        self.insert(identity, lines);
        self
    }

    pub fn insert(&mut self, identity: &str, lines: &[&str]) {
        let records = lines
            .iter()
            .flat_map(|l| PublicKeyRecord::parse_lines(l))
            .collect();
        self.users.insert(identity.to_string(), records);
    }
}

#[async_trait::async_trait]
impl KeyDirectory for MemoryDirectory {
    async fn lookup(&self, identity: &Identity) -> Result<Vec<PublicKeyRecord>, DirectoryError> {
        self.users
            .get(identity.as_str())
            .cloned()
            .ok_or_else(|| DirectoryError::UnknownIdentity(identity.to_string()))
    }
}
