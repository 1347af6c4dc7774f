use crate::{
    metadata::{
        CheckedContract,
        Metadata,
        MetadataError,
    },
    monitor::{
        ChainClientError,
        ChainRpcClient,
    },
    primitives::{
        keccak256,
        Address,
        AuxdataError,
        Bytes,
        SourceAddress,
    },
    verify::{
        compilers::{
            Compiler,
            CompilerError,
            CompilerInput,
        },
        matcher::{
            match_runtime_code,
            Verdict,
        },
        repository::{
            Repository,
            RepositoryError,
        },
    },
};

use std::{
    collections::BTreeMap,
    path::PathBuf,
};

use serde_json::json;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum InjectorError {
    #[error("Metadata file not found. Did you include \"metadata.json\"?")]
    MetadataNotFound,
    #[error("Could not match on-chain deployed bytecode to recompiled bytecode for {0}")]
    BytecodeMismatch(String),
    #[error("no addresses provided for verification")]
    NoAddresses,
    #[error("no on-chain bytecode available for {0} and no chain client configured")]
    NoBytecode(Address),
    #[error("metadata settings cannot carry library links")]
    UnlinkableMetadata,
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Compiler(#[from] CompilerError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Chain(#[from] ChainClientError),
    #[error(transparent)]
    Auxdata(#[from] AuxdataError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStatus {
    Perfect,
    Partial,
}

/// Where and how strongly one injection landed in the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionOutcome {
    pub status: MatchStatus,
    pub storage_path: PathBuf,
    pub chain_id: u64,
    pub address: Address,
}

#[derive(Debug, Clone)]
pub struct InjectionFile {
    pub name: String,
    pub content: String,
}

/// A user-driven injection: sources and metadata mixed in `files`, verified
/// against every listed address on one chain. `bytecode` short-circuits the
/// on-chain lookup when the caller already holds the deployed code.
#[derive(Debug, Clone)]
pub struct InjectionRequest {
    pub chain_id: u64,
    pub addresses: Vec<Address>,
    pub files: Vec<InjectionFile>,
    pub bytecode: Option<Bytes>,
    pub libraries: BTreeMap<String, Address>,
}

/// Orchestrates recompile, match, and store for assembled or user-provided
/// inputs.
#[derive(Debug)]
pub struct Injector<C> {
    repository: Repository,
    compiler: C,
    chain: Option<ChainRpcClient>,
}

impl<C: Compiler> Injector<C> {
    /// An injector with no chain access; callers must supply on-chain
    /// bytecode themselves. This is the monitor's configuration.
    pub fn offline(repository: Repository, compiler: C) -> Self {
        Self {
            repository,
            compiler,
            chain: None,
        }
    }

    pub fn with_chain(repository: Repository, compiler: C, chain: ChainRpcClient) -> Self {
        Self {
            repository,
            compiler,
            chain: Some(chain),
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Verifies an assembled contract against bytecode already read from the
    /// chain.
    pub async fn inject_checked(
        &self,
        contract: CheckedContract,
        onchain: Bytes,
        chain_id: u64,
        address: Address,
    ) -> Result<InjectionOutcome, InjectorError> {
        self.verify_and_store(contract, onchain, chain_id, address)
            .await
    }

    /// Verifies a user-provided bundle of files against every requested
    /// address.
    pub async fn inject(
        &self,
        request: InjectionRequest,
    ) -> Result<Vec<InjectionOutcome>, InjectorError> {
        let mut metadatas = Vec::new();
        let mut source_files = Vec::new();
        for file in request.files {
            match parse_as_metadata(file.content.as_bytes()) {
                Some(metadata) => metadatas.push((file.content.into_bytes(), metadata)),
                None => source_files.push(file),
            }
        }
        if metadatas.is_empty() {
            return Err(InjectorError::MetadataNotFound);
        }
        if request.addresses.is_empty() {
            return Err(InjectorError::NoAddresses);
        }

        let mut outcomes = Vec::new();
        for (raw_metadata, metadata) in metadatas {
            let contents = resolve_sources(&metadata, &source_files)?;
            let mut contract = CheckedContract::new(raw_metadata, contents)?;
            if !request.libraries.is_empty() {
                contract = add_library_links(contract, &request.libraries)?;
            }

            for address in &request.addresses {
                let onchain = match &request.bytecode {
                    Some(bytecode) => bytecode.clone(),
                    None => self.fetch_onchain(*address).await?,
                };
                let outcome = self
                    .verify_and_store(contract.clone(), onchain, request.chain_id, *address)
                    .await?;
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    async fn fetch_onchain(&self, address: Address) -> Result<Bytes, InjectorError> {
        match &self.chain {
            Some(chain) => Ok(chain.code_at(address).await?),
            None => Err(InjectorError::NoBytecode(address)),
        }
    }

    async fn verify_and_store(
        &self,
        contract: CheckedContract,
        onchain: Bytes,
        chain_id: u64,
        address: Address,
    ) -> Result<InjectionOutcome, InjectorError> {
        let input = CompilerInput::from_contract(&contract)?;
        let compiled = self.compiler.compile(&input).await?;

        let status = match match_runtime_code(&onchain, &compiled.runtime_code) {
            Verdict::Perfect => {
                // The metadata's own content address, as advertised by the
                // bytecode that just matched.
                let pointer = SourceAddress::from_runtime_code(&onchain)
                    .or_else(|_| SourceAddress::ipfs_of(&contract.raw_metadata))?;
                let path = self
                    .repository
                    .store_metadata(&pointer, &contract.raw_metadata)?;
                self.store_sources(&contract)?;
                (MatchStatus::Perfect, path)
            }
            Verdict::Partial => {
                let path = self.repository.store_partial_metadata(
                    chain_id,
                    address,
                    &contract.raw_metadata,
                )?;
                self.store_sources(&contract)?;
                (MatchStatus::Partial, path)
            }
            Verdict::NoMatch => {
                let sources = contract
                    .sources
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(InjectorError::BytecodeMismatch(sources));
            }
        };

        info!(
            target: "contract_verifier::injector",
            chain_id,
            %address,
            contract = %contract.name,
            status = ?status.0,
            "stored verified contract"
        );

        Ok(InjectionOutcome {
            status: status.0,
            storage_path: status.1,
            chain_id,
            address,
        })
    }

    fn store_sources(&self, contract: &CheckedContract) -> Result<(), RepositoryError> {
        for source in contract.sources.values() {
            self.repository.store_source(&source.content)?;
        }
        Ok(())
    }
}

/// A provided file counts as metadata when it parses as a metadata document
/// with a compiler version and a single compilation target.
fn parse_as_metadata(bytes: &[u8]) -> Option<Metadata> {
    let metadata = Metadata::parse(bytes).ok()?;
    if metadata.compiler.version.is_empty() {
        return None;
    }
    metadata.compilation_target().ok()?;
    Some(metadata)
}

/// Resolves every metadata-declared source against the provided files by
/// keccak256, falling back to inline content where the metadata embeds it.
fn resolve_sources(
    metadata: &Metadata,
    files: &[InjectionFile],
) -> Result<BTreeMap<String, String>, InjectorError> {
    let mut contents = BTreeMap::new();
    for (name, declared) in &metadata.sources {
        if let Some(content) = &declared.content {
            contents.insert(name.clone(), content.clone());
            continue;
        }
        let matched = files
            .iter()
            .find(|file| keccak256(file.content.as_bytes()) == declared.keccak256);
        match matched {
            Some(file) => {
                contents.insert(name.clone(), file.content.clone());
            }
            None => return Err(MetadataError::MissingSource(name.clone()).into()),
        }
    }
    Ok(contents)
}

/// Injects deployed library addresses into `settings.libraries`, keyed by
/// bare library name, and rebuilds the contract from the re-serialized
/// metadata so the stored artifact carries the links.
pub fn add_library_links(
    contract: CheckedContract,
    links: &BTreeMap<String, Address>,
) -> Result<CheckedContract, InjectorError> {
    let mut value: serde_json::Value = serde_json::from_slice(&contract.raw_metadata)
        .map_err(MetadataError::Json)?;
    let settings = value
        .get_mut("settings")
        .and_then(|settings| settings.as_object_mut())
        .ok_or(InjectorError::UnlinkableMetadata)?;
    let libraries = settings
        .entry("libraries")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or(InjectorError::UnlinkableMetadata)?;

    for (name, address) in links {
        let bare_name = name.rsplit(':').next().unwrap_or(name);
        libraries.insert(bare_name.to_owned(), json!(format!("{address:#x}")));
    }

    let raw_metadata = serde_json::to_vec(&value).map_err(MetadataError::Json)?;
    let contents = contract
        .sources
        .into_iter()
        .map(|(name, source)| (name, source.content))
        .collect();
    Ok(CheckedContract::new(raw_metadata, contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::code_with_auxdata,
        verify::compilers::{
            CompiledContract,
            MockCompiler,
        },
    };
    use multihash_codetable::{
        Code,
        MultihashDigest,
    };
    use serde_json::json;

    const BODY: &[u8] = &[0x60, 0x80, 0x60, 0x40, 0x52];

    fn storage_metadata(content: &str, inline: bool) -> Vec<u8> {
        let source = if inline {
            json!({ "keccak256": keccak256(content.as_bytes()), "content": content })
        } else {
            json!({
                "keccak256": keccak256(content.as_bytes()),
                "urls": ["dweb:/ipfs/QmSourcePointer"]
            })
        };
        serde_json::to_vec(&json!({
            "compiler": { "version": "0.6.1+commit.e6f7d5a4" },
            "language": "Solidity",
            "settings": {
                "compilationTarget": { "Storage.sol": "Storage" },
                "optimizer": { "enabled": false, "runs": 200 }
            },
            "sources": { "Storage.sol": source },
            "version": 1
        }))
        .unwrap()
    }

    fn code_with_ipfs_of(metadata: &[u8]) -> Vec<u8> {
        let multihash = Code::Sha2_256.digest(metadata).to_bytes();
        code_with_auxdata(BODY, vec![("ipfs", multihash), ("solc", vec![0, 6, 1])])
    }

    fn echoing_compiler(runtime_code: Vec<u8>, metadata: &[u8]) -> MockCompiler {
        MockCompiler::returning(CompiledContract {
            runtime_code: runtime_code.into(),
            metadata: String::from_utf8(metadata.to_vec()).unwrap(),
        })
    }

    fn request(files: Vec<(&str, &[u8])>, bytecode: Vec<u8>) -> InjectionRequest {
        InjectionRequest {
            chain_id: 5,
            addresses: vec![Address::repeat_byte(0x11)],
            files: files
                .into_iter()
                .map(|(name, content)| InjectionFile {
                    name: name.to_owned(),
                    content: String::from_utf8(content.to_vec()).unwrap(),
                })
                .collect(),
            bytecode: Some(bytecode.into()),
            libraries: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn full_match_is_stored_under_the_metadata_ipfs_hash() {
        let dir = tempfile::tempdir().unwrap();
        let content = "pragma solidity ^0.6.0; contract Storage {}";
        let metadata = storage_metadata(content, false);
        let onchain = code_with_ipfs_of(&metadata);

        let injector = Injector::offline(
            Repository::new(dir.path()),
            echoing_compiler(onchain.clone(), &metadata),
        );
        let outcomes = injector
            .inject(request(
                vec![("metadata.json", &metadata), ("Storage.sol", content.as_bytes())],
                onchain,
            ))
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, MatchStatus::Perfect);

        let ipfs_hash = SourceAddress::ipfs_of(&metadata).unwrap().id;
        let stored = dir.path().join("ipfs").join(&ipfs_hash);
        assert_eq!(outcomes[0].storage_path, stored);
        assert_eq!(std::fs::read(&stored).unwrap(), metadata);

        // The source lands in the hash-keyed tree alongside it.
        let source_key = crate::primitives::hex::encode(keccak256(content.as_bytes()));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("sources").join(source_key)).unwrap(),
            content
        );
    }

    #[tokio::test]
    async fn embedded_sources_need_no_source_files() {
        let dir = tempfile::tempdir().unwrap();
        let content = "contract Storage { uint256 n; }";
        let metadata = storage_metadata(content, true);
        let onchain = code_with_ipfs_of(&metadata);

        let injector = Injector::offline(
            Repository::new(dir.path()),
            echoing_compiler(onchain.clone(), &metadata),
        );
        let outcomes = injector
            .inject(request(vec![("metadata.json", &metadata)], onchain))
            .await
            .unwrap();

        assert_eq!(outcomes[0].status, MatchStatus::Perfect);
        assert_eq!(
            std::fs::read(&outcomes[0].storage_path).unwrap(),
            metadata
        );
    }

    #[tokio::test]
    async fn swarm_indexed_artifacts_land_under_swarm() {
        let dir = tempfile::tempdir().unwrap();
        let content = "contract Storage {}";
        let metadata = storage_metadata(content, true);
        let swarm_hash = [0xcd; 32];
        let onchain = code_with_auxdata(BODY, vec![("bzzr0", swarm_hash.to_vec())]);

        let injector = Injector::offline(
            Repository::new(dir.path()),
            echoing_compiler(onchain.clone(), &metadata),
        );
        let outcomes = injector
            .inject(request(vec![("metadata.json", &metadata)], onchain))
            .await
            .unwrap();

        assert_eq!(outcomes[0].status, MatchStatus::Perfect);
        assert_eq!(
            outcomes[0].storage_path,
            dir.path()
                .join("swarm/bzzr0")
                .join(crate::primitives::hex::encode(swarm_hash))
        );
    }

    #[tokio::test]
    async fn differing_metadata_hash_is_a_partial_match() {
        let dir = tempfile::tempdir().unwrap();
        let content = "contract Storage {}";
        // Deployed with 0.6.0, verified against 0.6.1: identical body,
        // different metadata hash in the auxdata.
        let metadata = storage_metadata(content, true);
        let onchain = code_with_auxdata(BODY, vec![("ipfs", vec![0x11; 34])]);
        let recompiled = code_with_auxdata(BODY, vec![("ipfs", vec![0x22; 34])]);

        let injector = Injector::offline(
            Repository::new(dir.path()),
            echoing_compiler(recompiled, &metadata),
        );
        let outcomes = injector
            .inject(request(vec![("metadata.json", &metadata)], onchain))
            .await
            .unwrap();

        assert_eq!(outcomes[0].status, MatchStatus::Partial);
        let address = Address::repeat_byte(0x11);
        let expected = dir
            .path()
            .join(format!("partial_matches/5/{address}/metadata.json"));
        assert_eq!(outcomes[0].storage_path, expected);
        assert_eq!(std::fs::read(&expected).unwrap(), metadata);
    }

    #[tokio::test]
    async fn library_links_are_substituted_into_stored_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let content = "contract Storage {}";
        let metadata = storage_metadata(content, true);
        let onchain = code_with_auxdata(BODY, vec![("ipfs", vec![0x11; 34])]);
        let recompiled = code_with_auxdata(BODY, vec![("ipfs", vec![0x22; 34])]);

        let library_address = Address::repeat_byte(0xab);
        let compiler = echoing_compiler(recompiled, &metadata);
        let injector = Injector::offline(Repository::new(dir.path()), compiler.clone());

        let mut req = request(vec![("metadata.json", &metadata)], onchain);
        req.libraries
            .insert("contracts/Library.sol:Library".to_owned(), library_address);

        let outcomes = injector.inject(req).await.unwrap();
        assert_eq!(outcomes[0].status, MatchStatus::Partial);

        let stored: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&outcomes[0].storage_path).unwrap()).unwrap();
        assert_eq!(
            stored["settings"]["libraries"],
            json!({ "Library": format!("{library_address:#x}") })
        );

        // The recompilation saw the linked settings too.
        let inputs = compiler.inputs();
        assert_eq!(
            inputs[0].input["settings"]["libraries"]["Library"],
            format!("{library_address:#x}")
        );
    }

    #[tokio::test]
    async fn missing_metadata_is_reported_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let injector = Injector::offline(
            Repository::new(dir.path()),
            MockCompiler::failing("unused"),
        );

        let err = injector
            .inject(request(
                vec![("Storage.sol", b"contract Storage {}".as_slice())],
                vec![0x00],
            ))
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Metadata file not found. Did you include \"metadata.json\"?"
        );
    }

    #[tokio::test]
    async fn missing_source_is_reported_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = serde_json::to_vec(&json!({
            "compiler": { "version": "0.6.1+commit.e6f7d5a4" },
            "settings": { "compilationTarget": { "Simple.sol": "Simple" } },
            "sources": {
                "Simple.sol": {
                    "keccak256": keccak256(b"never provided"),
                    "urls": ["dweb:/ipfs/QmElsewhere"]
                }
            }
        }))
        .unwrap();

        let injector = Injector::offline(
            Repository::new(dir.path()),
            MockCompiler::failing("unused"),
        );
        let err = injector
            .inject(request(vec![("metadata.json", &metadata)], vec![0x00]))
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("Simple.sol"));
        assert!(message.contains("cannot be found"));
    }

    #[tokio::test]
    async fn unrelated_bytecode_is_a_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let content = "contract Storage {}";
        let metadata = storage_metadata(content, true);
        // Bytecode of some other contract entirely.
        let onchain = code_with_auxdata(&[0xde, 0xad, 0xbe, 0xef], vec![("ipfs", vec![0x11; 34])]);
        let recompiled = code_with_auxdata(BODY, vec![("ipfs", vec![0x22; 34])]);

        let injector = Injector::offline(
            Repository::new(dir.path()),
            echoing_compiler(recompiled, &metadata),
        );
        let err = injector
            .inject(request(vec![("metadata.json", &metadata)], onchain))
            .await
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("Could not match on-chain deployed bytecode"));
        assert!(message.contains("Storage.sol"));
        assert!(dir.path().read_dir().unwrap().next().is_none());
    }

    #[tokio::test]
    async fn injection_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let content = "contract Storage {}";
        let metadata = storage_metadata(content, true);
        let onchain = code_with_ipfs_of(&metadata);

        let injector = Injector::offline(
            Repository::new(dir.path()),
            echoing_compiler(onchain.clone(), &metadata),
        );
        let req = request(vec![("metadata.json", &metadata)], onchain);

        let first = injector.inject(req.clone()).await.unwrap();
        let stored_before = std::fs::read(&first[0].storage_path).unwrap();
        let second = injector.inject(req).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read(&second[0].storage_path).unwrap(), stored_before);
    }

    #[tokio::test]
    async fn checked_injection_verifies_monitor_contracts() {
        let dir = tempfile::tempdir().unwrap();
        let content = "contract Storage {}";
        let metadata = storage_metadata(content, true);
        let onchain = code_with_ipfs_of(&metadata);

        let mut contents = BTreeMap::new();
        contents.insert("Storage.sol".to_owned(), content.to_owned());
        let contract = CheckedContract::new(metadata.clone(), contents).unwrap();

        let injector = Injector::offline(
            Repository::new(dir.path()),
            echoing_compiler(onchain.clone(), &metadata),
        );
        let outcome = injector
            .inject_checked(contract, onchain.into(), 1, Address::repeat_byte(0x22))
            .await
            .unwrap();

        assert_eq!(outcome.status, MatchStatus::Perfect);
        assert!(outcome.storage_path.starts_with(dir.path().join("ipfs")));
    }
}
