//! Directory backed by `<root>/<username>.keys` files.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use sessionkey_core::{DirectoryError, Identity, KeyDirectory, PublicKeyRecord};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct FileDirectory {
    root: PathBuf,
}

impl FileDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key_file(&self, identity: &Identity) -> PathBuf {
        self.root.join(format!("{identity}.keys"))
    }
}

#[async_trait::async_trait]
impl KeyDirectory for FileDirectory {
    async fn lookup(&self, identity: &Identity) -> Result<Vec<PublicKeyRecord>, DirectoryError> {
        let path = self.key_file(identity);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(DirectoryError::UnknownIdentity(identity.to_string()));
            }
            Err(e) => {
                return Err(DirectoryError::Lookup(format!("read {}: {e}", path.display())));
            }
        };
        let records = PublicKeyRecord::parse_lines(&text);
        debug!(path = %path.display(), count = records.len(), "read key file");
        Ok(records)
    }
}
