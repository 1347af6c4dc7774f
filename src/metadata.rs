use crate::primitives::{
    keccak256,
    SourceAddress,
    SourceOrigin,
    B256,
};

use serde::{
    Deserialize,
    Serialize,
};

use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("metadata declares no usable compilation target")]
    InvalidCompilationTarget,
    #[error("source file {0} cannot be found in the provided files")]
    MissingSource(String),
    #[error("source file {name} does not match the hash declared in metadata (expected {expected}, got {got})")]
    HashMismatch {
        name: String,
        expected: B256,
        got: B256,
    },
    #[error("metadata declares no sources")]
    NoSources,
}

/// The compiler-emitted metadata document describing one deterministic
/// compilation: compiler version, full input settings, and the name plus
/// keccak256 of every source file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Metadata {
    pub compiler: CompilerVersion,
    #[serde(default)]
    pub language: Option<String>,
    pub settings: serde_json::Value,
    pub sources: BTreeMap<String, MetadataSource>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompilerVersion {
    pub version: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetadataSource {
    pub keccak256: B256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
}

impl Metadata {
    pub fn parse(bytes: &[u8]) -> Result<Self, MetadataError> {
        let metadata: Metadata = serde_json::from_slice(bytes)?;
        if metadata.sources.is_empty() {
            return Err(MetadataError::NoSources);
        }
        Ok(metadata)
    }

    /// The single `(source file, contract name)` pair this metadata compiles.
    pub fn compilation_target(&self) -> Result<(String, String), MetadataError> {
        let target = self
            .settings
            .get("compilationTarget")
            .and_then(|t| t.as_object())
            .ok_or(MetadataError::InvalidCompilationTarget)?;
        if target.len() != 1 {
            return Err(MetadataError::InvalidCompilationTarget);
        }
        let (file, name) = target
            .iter()
            .next()
            .ok_or(MetadataError::InvalidCompilationTarget)?;
        let name = name
            .as_str()
            .ok_or(MetadataError::InvalidCompilationTarget)?;
        Ok((file.clone(), name.to_owned()))
    }
}

impl MetadataSource {
    /// Content addresses encoded in this source's `urls`, in declaration
    /// order. Unrecognized URL schemes are skipped.
    pub fn source_addresses(&self) -> Vec<SourceAddress> {
        self.urls
            .iter()
            .filter_map(|url| parse_source_url(url))
            .collect()
    }
}

fn parse_source_url(url: &str) -> Option<SourceAddress> {
    if let Some(id) = url.strip_prefix("dweb:/ipfs/") {
        return Some(SourceAddress::new(SourceOrigin::Ipfs, id));
    }
    if let Some(id) = url.strip_prefix("ipfs://") {
        return Some(SourceAddress::new(SourceOrigin::Ipfs, id));
    }
    if let Some(id) = url.strip_prefix("bzz-raw://") {
        return Some(SourceAddress::new(SourceOrigin::Bzzr1, id));
    }
    None
}

/// One hash-verified source file of a [`CheckedContract`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub content: String,
    pub keccak: B256,
}

/// A fully assembled verification input: parsed metadata, the exact metadata
/// bytes it was built from, and one content entry per source the metadata
/// declares, each verified against its declared keccak256.
#[derive(Debug, Clone)]
pub struct CheckedContract {
    pub name: String,
    pub compiler_version: String,
    pub metadata: Metadata,
    pub raw_metadata: Vec<u8>,
    pub sources: BTreeMap<String, SourceFile>,
}

impl CheckedContract {
    pub fn new(
        raw_metadata: Vec<u8>,
        contents: BTreeMap<String, String>,
    ) -> Result<Self, MetadataError> {
        let metadata = Metadata::parse(&raw_metadata)?;
        let (_, name) = metadata.compilation_target()?;

        let mut sources = BTreeMap::new();
        for (source_name, declared) in &metadata.sources {
            let content = contents
                .get(source_name)
                .ok_or_else(|| MetadataError::MissingSource(source_name.clone()))?;
            let keccak = keccak256(content.as_bytes());
            if keccak != declared.keccak256 {
                return Err(MetadataError::HashMismatch {
                    name: source_name.clone(),
                    expected: declared.keccak256,
                    got: keccak,
                });
            }
            sources.insert(
                source_name.clone(),
                SourceFile {
                    content: content.clone(),
                    keccak,
                },
            );
        }

        Ok(Self {
            name,
            compiler_version: metadata.compiler.version.clone(),
            metadata,
            raw_metadata,
            sources,
        })
    }
}
