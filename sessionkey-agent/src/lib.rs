//! Key agent clients for session-key acquisition.
//!
//! Two [`AgentConnector`][sessionkey_core::AgentConnector] implementations:
//!
//! - [`SshAgentConnector`] talks to a running OpenSSH-compatible agent over
//!   its Unix socket (`$SSH_AUTH_SOCK`, or a configured path).
//! - [`MemoryAgentConnector`] serves keys from an in-process [`KeyStore`],
//!   populated from OpenSSH private key files.
//!
//! # Architecture
//!
//! ```text
//! CredentialSource ──connect()──► SshAgentConnector ──UnixStream──► ssh-agent
//!                   │                     │
//!                   │              SshAgentClient (dropped after use)
//!                   │
//!                   └──connect()──► MemoryAgentConnector
//!                                         │
//!                                  MemoryAgent (clone of Arc<RwLock<KeyStore>>)
//! ```

pub mod client;
pub mod keystore;
pub mod pem;

pub use client::{SshAgentClient, SshAgentConnector};
pub use keystore::{KeyEntry, KeyStore, MemoryAgent, MemoryAgentConnector};
