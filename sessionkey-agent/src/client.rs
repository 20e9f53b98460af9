//! OpenSSH agent client.

use std::path::{Path, PathBuf};

use sessionkey_core::config::AgentConfig;
use sessionkey_core::{AgentConnector, AgentKeyHandle, AuthError, KeyAgent};
use ssh_agent_lib::agent::Session as _;
use ssh_agent_lib::client::Client;
use ssh_agent_lib::proto::SignRequest;
use ssh_key::{Algorithm, PublicKey, Signature};
use tokio::net::UnixStream;
use tracing::debug;

/// Agent sign-request flag asking for an `rsa-sha2-512` signature instead of
/// legacy SHA-1 `ssh-rsa`.
const SSH_AGENT_RSA_SHA2_512: u32 = 0x04;

/// Opens a fresh connection to the SSH agent on each [`connect`] call.
///
/// [`connect`]: AgentConnector::connect
#[derive(Clone, Debug, Default)]
pub struct SshAgentConnector {
    socket: Option<PathBuf>,
}

impl SshAgentConnector {
    pub fn new(socket: Option<PathBuf>) -> Self {
        Self { socket }
    }

    /// Use `$SSH_AUTH_SOCK`.  An empty value counts as unset.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var_os("SSH_AUTH_SOCK")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        )
    }

    /// Use the configured socket, falling back to `$SSH_AUTH_SOCK`.
    pub fn from_config(config: &AgentConfig) -> Self {
        match &config.socket {
            Some(path) => Self::new(Some(path.clone())),
            None => Self::from_env(),
        }
    }

    pub fn socket(&self) -> Option<&Path> {
        self.socket.as_deref()
    }
}

#[async_trait::async_trait]
impl AgentConnector for SshAgentConnector {
    async fn connect(&self) -> Result<Box<dyn KeyAgent>, AuthError> {
        let socket = self.socket.as_ref().ok_or_else(|| {
            AuthError::AgentUnavailable(
                "SSH_AUTH_SOCK is not set; make sure ssh-agent is running and agent \
                 forwarding is enabled in your ssh config"
                    .to_string(),
            )
        })?;

        let stream = UnixStream::connect(socket).await.map_err(|e| {
            AuthError::AgentUnavailable(format!("connect {}: {e}", socket.display()))
        })?;
        debug!(socket = %socket.display(), "connected to SSH agent");

        Ok(Box::new(SshAgentClient {
            client: Client::new(stream),
        }))
    }
}

/// One open agent connection.  Dropping it closes the socket.
pub struct SshAgentClient {
    client: Client<UnixStream>,
}

impl std::fmt::Debug for SshAgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshAgentClient").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl KeyAgent for SshAgentClient {
    async fn list_keys(&mut self) -> Result<Vec<AgentKeyHandle>, AuthError> {
        let identities = self
            .client
            .request_identities()
            .await
            .map_err(|e| AuthError::Agent(format!("request_identities: {e}")))?;

        debug!(count = identities.len(), "request_identities");
        Ok(identities
            .into_iter()
            .map(|id| AgentKeyHandle::new(PublicKey::new(id.pubkey, id.comment)))
            .collect())
    }

    async fn sign(&mut self, key: &AgentKeyHandle, message: &[u8]) -> Result<Signature, AuthError> {
        let flags = match key.public_key().algorithm() {
            Algorithm::Rsa { .. } => SSH_AGENT_RSA_SHA2_512,
            _ => 0,
        };
        debug!(fingerprint = %key.fingerprint(), data_len = message.len(), flags, "sign");

        self.client
            .sign(SignRequest {
                pubkey: key.public_key().key_data().clone(),
                data: message.to_vec(),
                flags,
            })
            .await
            .map_err(|e| AuthError::Agent(format!("sign with {}: {e}", key.fingerprint())))
    }
}
