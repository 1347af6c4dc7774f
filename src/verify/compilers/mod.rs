mod solc;
pub use solc::SolcCompiler;

#[cfg(any(test, feature = "test"))]
mod mock;
#[cfg(any(test, feature = "test"))]
pub use mock::MockCompiler;

use crate::{
    metadata::CheckedContract,
    primitives::Bytes,
};

use serde_json::json;
use std::future::Future;

#[derive(Debug, thiserror::Error)]
pub enum CompilerError {
    #[error("unsupported compiler version {0}")]
    UnsupportedVersion(String),
    #[error("metadata settings are not a JSON object")]
    InvalidSettings,
    #[error("failed to run the compiler: {0}")]
    Io(#[from] std::io::Error),
    #[error("compiler output could not be parsed: {0}")]
    OutputParse(#[from] serde_json::Error),
    #[error("compilation failed: {0}")]
    Failed(String),
    #[error("contract {0} is missing from the compiler output")]
    TargetMissing(String),
}

/// Standard-JSON input reconstructed from a [`CheckedContract`]'s metadata,
/// plus the coordinates of the one contract to extract from the output.
#[derive(Debug, Clone, PartialEq)]
pub struct CompilerInput {
    pub version: String,
    pub target_file: String,
    pub target_contract: String,
    pub input: serde_json::Value,
}

impl CompilerInput {
    /// Rebuilds the compiler invocation the metadata describes: the declared
    /// settings verbatim (minus `compilationTarget`, which is output-only),
    /// the assembled sources overlaid by logical name, and an output
    /// selection narrowed to what verification needs.
    pub fn from_contract(contract: &CheckedContract) -> Result<Self, CompilerError> {
        let (target_file, target_contract) = contract
            .metadata
            .compilation_target()
            .map_err(|_| CompilerError::InvalidSettings)?;

        let mut settings = contract.metadata.settings.clone();
        let settings_map = settings
            .as_object_mut()
            .ok_or(CompilerError::InvalidSettings)?;
        settings_map.remove("compilationTarget");

        // Verification compares only the target contract's deployed
        // bytecode and metadata.
        let mut selection = serde_json::Map::new();
        selection.insert(
            target_contract.clone(),
            json!(["evm.deployedBytecode", "metadata"]),
        );
        settings_map.insert("outputSelection".to_owned(), json!({ "*": selection }));

        let sources: serde_json::Map<String, serde_json::Value> = contract
            .sources
            .iter()
            .map(|(name, source)| (name.clone(), json!({ "content": source.content })))
            .collect();

        let language = contract
            .metadata
            .language
            .clone()
            .unwrap_or_else(|| "Solidity".to_owned());

        Ok(Self {
            version: contract.compiler_version.clone(),
            target_file,
            target_contract,
            input: json!({
                "language": language,
                "sources": sources,
                "settings": settings,
            }),
        })
    }
}

/// What a recompilation produced for the target contract.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledContract {
    /// Runtime (deployed) bytecode.
    pub runtime_code: Bytes,
    /// The compiler's own metadata output, byte-stable for identical inputs.
    pub metadata: String,
}

/// An exact-version compiler invoked on reconstructed standard-JSON input.
pub trait Compiler: Send + Sync {
    fn compile(
        &self,
        input: &CompilerInput,
    ) -> impl Future<Output = Result<CompiledContract, CompilerError>> + Send;
}
