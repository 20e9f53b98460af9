use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent socket path.  Falls back to `$SSH_AUTH_SOCK` when unset.
    #[serde(default)]
    pub socket: Option<PathBuf>,
    /// OpenSSH private key files to serve from an in-process agent instead
    /// of connecting to the SSH agent.  Passphrase-protected keys are skipped.
    #[serde(default)]
    pub key_files: Vec<PathBuf>,
}

/// Where public keys for a username are looked up.
///
/// ```toml
/// [directory]
/// type = "http"
/// url  = "https://github.com"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DirectoryConfig {
    /// `<path>/<username>.keys` files.  `None` means the default key
    /// directory next to the config file.
    File {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// `GET <url>/<username>.keys`.
    Http {
        url: String,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self::File { path: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    /// Directory key types considered during matching, by their
    /// `authorized_keys` type token.
    #[serde(default = "default_accepted_key_types")]
    pub accepted_key_types: Vec<String>,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            accepted_key_types: default_accepted_key_types(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_accepted_key_types() -> Vec<String> {
    vec!["ssh-rsa".to_string()]
}
