use super::{
    CompiledContract,
    Compiler,
    CompilerError,
    CompilerInput,
};

use crate::primitives::hex;

use std::{
    path::PathBuf,
    process::Stdio,
};

use tokio::{
    io::AsyncWriteExt,
    process::Command,
};

use tracing::debug;

/// Drives `solc` release binaries over the standard-JSON interface.
///
/// Binaries are looked up as `<compilers_dir>/solc-<version>` with the exact
/// version string the metadata declares (for example
/// `solc-0.8.18+commit.87f61d96`); a version with no binary on disk is
/// rejected before anything is spawned.
#[derive(Debug, Clone)]
pub struct SolcCompiler {
    compilers_dir: PathBuf,
}

impl SolcCompiler {
    pub fn new(compilers_dir: impl Into<PathBuf>) -> Self {
        Self {
            compilers_dir: compilers_dir.into(),
        }
    }

    fn binary_for(&self, version: &str) -> Result<PathBuf, CompilerError> {
        let binary = self.compilers_dir.join(format!("solc-{version}"));
        if !binary.is_file() {
            return Err(CompilerError::UnsupportedVersion(version.to_owned()));
        }
        Ok(binary)
    }
}

impl Compiler for SolcCompiler {
    async fn compile(&self, input: &CompilerInput) -> Result<CompiledContract, CompilerError> {
        let binary = self.binary_for(&input.version)?;
        let payload = serde_json::to_vec(&input.input)?;

        debug!(
            target: "contract_verifier::compiler",
            version = %input.version,
            target = %input.target_contract,
            "invoking compiler"
        );

        let mut child = Command::new(&binary)
            .arg("--standard-json")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(CompilerError::Failed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        let output: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        if let Some(errors) = output.get("errors").and_then(|errors| errors.as_array()) {
            let fatal: Vec<&str> = errors
                .iter()
                .filter(|diagnostic| {
                    diagnostic.get("severity").and_then(|s| s.as_str()) == Some("error")
                })
                .map(|diagnostic| {
                    diagnostic
                        .get("formattedMessage")
                        .or_else(|| diagnostic.get("message"))
                        .and_then(|message| message.as_str())
                        .unwrap_or("unknown compiler error")
                })
                .collect();
            if !fatal.is_empty() {
                return Err(CompilerError::Failed(fatal.join("\n")));
            }
        }

        let qualified = format!("{}:{}", input.target_file, input.target_contract);
        let contract = output
            .get("contracts")
            .and_then(|contracts| contracts.get(&input.target_file))
            .and_then(|file| file.get(&input.target_contract))
            .ok_or_else(|| CompilerError::TargetMissing(qualified.clone()))?;

        let code_hex = contract
            .pointer("/evm/deployedBytecode/object")
            .and_then(|object| object.as_str())
            .ok_or_else(|| CompilerError::TargetMissing(qualified.clone()))?;
        let runtime_code = hex::decode(code_hex)
            .map_err(|err| CompilerError::Failed(format!("invalid bytecode output: {err}")))?;

        let metadata = contract
            .get("metadata")
            .and_then(|metadata| metadata.as_str())
            .ok_or(CompilerError::TargetMissing(qualified))?
            .to_owned();

        Ok(CompiledContract {
            runtime_code: runtime_code.into(),
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_version_is_rejected_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let compiler = SolcCompiler::new(dir.path());

        let input = CompilerInput {
            version: "0.0.0+commit.00000000".to_owned(),
            target_file: "A.sol".to_owned(),
            target_contract: "A".to_owned(),
            input: serde_json::json!({}),
        };

        let err = compiler.compile(&input).await.unwrap_err();
        assert!(matches!(err, CompilerError::UnsupportedVersion(version) if version.starts_with("0.0.0")));
    }
}
