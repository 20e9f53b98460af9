//! Directory served over HTTP as `GET <base>/<username>.keys`.
//!
//! This is the layout GitHub and GitLab use for published user keys: the
//! body is `authorized_keys` text and an unknown user is a 404.

use std::time::Duration;

use reqwest::Url;
use sessionkey_core::{DirectoryError, Identity, KeyDirectory, PublicKeyRecord};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HttpDirectory {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DirectoryError> {
        let http = reqwest::Client::builder()
            .user_agent(format!("sessionkey/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| DirectoryError::Lookup(format!("HTTP client init: {e}")))?;
        let parsed = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| DirectoryError::Lookup(format!("invalid directory URL {base_url:?}: {e}")))?;
        if parsed.cannot_be_a_base() {
            return Err(DirectoryError::Lookup(format!(
                "invalid directory URL {base_url:?}: not a base URL"
            )));
        }
        Ok(Self {
            http,
            base_url: parsed,
        })
    }

    /// `<base>/<identity>.keys`, with the file name percent-encoded as a
    /// single path segment.
    pub fn keys_url(&self, identity: &Identity) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(&format!("{identity}.keys"));
        }
        url
    }
}

#[async_trait::async_trait]
impl KeyDirectory for HttpDirectory {
    async fn lookup(&self, identity: &Identity) -> Result<Vec<PublicKeyRecord>, DirectoryError> {
        let url = self.keys_url(identity);
        let resp = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| DirectoryError::Lookup(format!("GET {url}: {e}")))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DirectoryError::UnknownIdentity(identity.to_string()));
        }
        if !status.is_success() {
            return Err(DirectoryError::Lookup(format!("GET {url}: HTTP {status}")));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| DirectoryError::Lookup(format!("GET {url}: reading body: {e}")))?;
        let records = PublicKeyRecord::parse_lines(&body);
        debug!(url = %url, count = records.len(), "fetched directory keys");
        Ok(records)
    }
}
