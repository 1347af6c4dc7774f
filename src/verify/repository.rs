use crate::primitives::{
    hex,
    keccak256,
    Address,
    SourceAddress,
    SourceOrigin,
};

use std::{
    fs,
    io::Write,
    path::{
        Path,
        PathBuf,
    },
};

use tempfile::NamedTempFile;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
#[error("repository write to {path} failed: {source}")]
pub struct RepositoryError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Content-addressed filesystem archive of verified artifacts.
///
/// Full matches live under the metadata's own content address
/// (`ipfs/<base58>`, `swarm/bzzr0/<hex>`, `swarm/bzzr1/<hex>`), partial
/// matches under `partial_matches/<chain>/<address>/metadata.json`, and
/// every source file under `sources/<keccak256>`. Writes are atomic
/// (temp file in the destination directory, then rename) and re-writing
/// identical bytes is a no-op.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stores a fully matched metadata document under its content address.
    pub fn store_metadata(
        &self,
        address: &SourceAddress,
        bytes: &[u8],
    ) -> Result<PathBuf, RepositoryError> {
        let relative = match address.origin {
            SourceOrigin::Ipfs => format!("ipfs/{}", address.id),
            SourceOrigin::Bzzr0 => format!("swarm/bzzr0/{}", address.id),
            SourceOrigin::Bzzr1 => format!("swarm/bzzr1/{}", address.id),
        };
        self.write(relative, bytes)
    }

    /// Stores a partially matched metadata document under its deployment
    /// coordinates.
    pub fn store_partial_metadata(
        &self,
        chain_id: u64,
        address: Address,
        bytes: &[u8],
    ) -> Result<PathBuf, RepositoryError> {
        self.write(
            format!("partial_matches/{chain_id}/{address}/metadata.json"),
            bytes,
        )
    }

    /// Stores a source file keyed by the keccak256 of its content; the
    /// metadata document is the index into this tree.
    pub fn store_source(&self, content: &str) -> Result<PathBuf, RepositoryError> {
        let key = hex::encode(keccak256(content.as_bytes()));
        self.write(format!("sources/{key}"), content.as_bytes())
    }

    fn write(
        &self,
        relative: impl AsRef<Path>,
        bytes: &[u8],
    ) -> Result<PathBuf, RepositoryError> {
        let path = self.root.join(relative.as_ref());

        // Re-injection of an identical artifact leaves the file untouched.
        if let Ok(existing) = fs::read(&path) {
            if existing == bytes {
                return Ok(path);
            }
        }

        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).map_err(|source| RepositoryError {
            path: path.clone(),
            source,
        })?;

        let mut temp = NamedTempFile::new_in(dir).map_err(|source| RepositoryError {
            path: path.clone(),
            source,
        })?;
        temp.write_all(bytes).map_err(|source| RepositoryError {
            path: path.clone(),
            source,
        })?;
        temp.persist(&path).map_err(|err| RepositoryError {
            path: path.clone(),
            source: err.error,
        })?;

        debug!(
            target: "contract_verifier::repository",
            path = %path.display(),
            bytes = bytes.len(),
            "stored artifact"
        );
        Ok(path)
    }
}
