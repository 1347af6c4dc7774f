use crate::{
    fetch::SourceFetcher,
    metadata::{
        CheckedContract,
        Metadata,
        MetadataError,
    },
    primitives::{
        keccak256,
        SourceAddress,
    },
};

use std::{
    collections::BTreeMap,
    time::{
        Duration,
        Instant,
    },
};

use tokio::{
    sync::mpsc,
    time::MissedTickBehavior,
};

use tracing::{
    debug,
    info,
    warn,
};

#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("source file {0} declares no fetchable location")]
    NoFetchableSource(String),
    #[error("inline source {0} does not match its declared hash")]
    InlineHashMismatch(String),
}

type CompletionCallback = Box<dyn FnOnce(CheckedContract) + Send>;

enum Msg {
    Begin {
        address: SourceAddress,
        on_complete: CompletionCallback,
    },
    Metadata {
        id: u64,
        body: Vec<u8>,
    },
    Source {
        id: u64,
        name: String,
        body: Vec<u8>,
    },
}

/// Reassembles complete compilable contracts from their on-chain metadata
/// pointer.
///
/// Assembly state lives in an arena owned by a single worker task; the fetch
/// callbacks registered with the [`SourceFetcher`] carry only the arena id
/// and source name back into the worker. An assembly whose artifacts never
/// all arrive is swept after the fetcher's cleanup window; the monitor will
/// rediscover the contract on a later block scan.
#[derive(Clone)]
pub struct Assembler {
    tx: mpsc::UnboundedSender<Msg>,
}

impl Assembler {
    pub fn new(fetcher: SourceFetcher, cleanup_time: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            tx: tx.clone(),
            rx,
            fetcher,
            pending: BTreeMap::new(),
            next_id: 0,
            cleanup_time,
        };
        tokio::spawn(worker.run());
        Self { tx }
    }

    /// Begins assembling the contract whose metadata lives at `address`.
    /// `on_complete` fires exactly once, with every source hash-verified,
    /// and must not block: offload real work to another task.
    pub fn assemble(
        &self,
        address: SourceAddress,
        on_complete: impl FnOnce(CheckedContract) + Send + 'static,
    ) {
        let _ = self.tx.send(Msg::Begin {
            address,
            on_complete: Box::new(on_complete),
        });
    }
}

enum SourceState {
    Pending,
    Fetched(String),
}

struct PendingContract {
    raw_metadata: Vec<u8>,
    metadata: Option<Metadata>,
    sources: BTreeMap<String, SourceState>,
    on_complete: CompletionCallback,
    created_at: Instant,
}

struct Worker {
    tx: mpsc::UnboundedSender<Msg>,
    rx: mpsc::UnboundedReceiver<Msg>,
    fetcher: SourceFetcher,
    pending: BTreeMap<u64, PendingContract>,
    next_id: u64,
    cleanup_time: Duration,
}

impl Worker {
    async fn run(mut self) {
        let sweep_period = if self.cleanup_time.is_zero() {
            Duration::from_millis(1)
        } else {
            self.cleanup_time
        };
        let mut sweeper = tokio::time::interval(sweep_period);
        sweeper.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(Msg::Begin { address, on_complete }) => {
                        self.handle_begin(address, on_complete)
                    }
                    Some(Msg::Metadata { id, body }) => self.handle_metadata(id, body),
                    Some(Msg::Source { id, name, body }) => self.handle_source(id, name, body),
                    None => return,
                },
                _ = sweeper.tick() => self.sweep(),
            }
        }
    }

    fn handle_begin(&mut self, address: SourceAddress, on_complete: CompletionCallback) {
        let id = self.next_id;
        self.next_id += 1;

        let tx = self.tx.clone();
        if let Err(err) = self.fetcher.subscribe(address.clone(), move |body| {
            let _ = tx.send(Msg::Metadata { id, body });
        }) {
            warn!(
                target: "contract_verifier::assembler",
                %address,
                %err,
                "cannot subscribe for metadata"
            );
            return;
        }

        debug!(target: "contract_verifier::assembler", id, %address, "assembly started");
        self.pending.insert(
            id,
            PendingContract {
                raw_metadata: Vec::new(),
                metadata: None,
                sources: BTreeMap::new(),
                on_complete,
                created_at: Instant::now(),
            },
        );
    }

    fn handle_metadata(&mut self, id: u64, body: Vec<u8>) {
        if !self.pending.contains_key(&id) {
            return;
        }
        if let Err(err) = self.apply_metadata(id, body) {
            warn!(target: "contract_verifier::assembler", id, %err, "assembly aborted");
            self.pending.remove(&id);
            return;
        }
        self.try_complete(id);
    }

    /// Parses the metadata document and registers a subscription for every
    /// source it does not already carry inline.
    fn apply_metadata(&mut self, id: u64, body: Vec<u8>) -> Result<(), AssemblyError> {
        let metadata = Metadata::parse(&body)?;
        metadata.compilation_target()?;

        let mut states = BTreeMap::new();
        for (name, source) in &metadata.sources {
            if let Some(content) = &source.content {
                if keccak256(content.as_bytes()) != source.keccak256 {
                    return Err(AssemblyError::InlineHashMismatch(name.clone()));
                }
                states.insert(name.clone(), SourceState::Fetched(content.clone()));
                continue;
            }

            let mut subscribed = false;
            for address in source.source_addresses() {
                let tx = self.tx.clone();
                let name = name.clone();
                if self
                    .fetcher
                    .subscribe(address, move |body| {
                        let _ = tx.send(Msg::Source { id, name, body });
                    })
                    .is_ok()
                {
                    subscribed = true;
                    break;
                }
            }
            if !subscribed {
                return Err(AssemblyError::NoFetchableSource(name.clone()));
            }
            states.insert(name.clone(), SourceState::Pending);
        }

        let Some(entry) = self.pending.get_mut(&id) else {
            return Ok(());
        };
        entry.raw_metadata = body;
        entry.metadata = Some(metadata);
        entry.sources = states;
        Ok(())
    }

    fn handle_source(&mut self, id: u64, name: String, body: Vec<u8>) {
        let Some(entry) = self.pending.get_mut(&id) else {
            return;
        };
        let Some(declared) = entry
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.sources.get(&name))
        else {
            return;
        };

        if keccak256(&body) != declared.keccak256 {
            warn!(
                target: "contract_verifier::assembler",
                id,
                source = %name,
                "fetched source does not match its declared hash"
            );
            self.pending.remove(&id);
            return;
        }
        let content = match String::from_utf8(body) {
            Ok(content) => content,
            Err(_) => {
                warn!(
                    target: "contract_verifier::assembler",
                    id,
                    source = %name,
                    "fetched source is not valid UTF-8"
                );
                self.pending.remove(&id);
                return;
            }
        };

        entry.sources.insert(name, SourceState::Fetched(content));
        self.try_complete(id);
    }

    fn try_complete(&mut self, id: u64) {
        let complete = self
            .pending
            .get(&id)
            .map(|entry| {
                entry.metadata.is_some()
                    && entry
                        .sources
                        .values()
                        .all(|state| matches!(state, SourceState::Fetched(_)))
            })
            .unwrap_or(false);
        if !complete {
            return;
        }

        let Some(entry) = self.pending.remove(&id) else {
            return;
        };
        let contents = entry
            .sources
            .into_iter()
            .filter_map(|(name, state)| match state {
                SourceState::Fetched(content) => Some((name, content)),
                SourceState::Pending => None,
            })
            .collect();

        match CheckedContract::new(entry.raw_metadata, contents) {
            Ok(contract) => {
                info!(
                    target: "contract_verifier::assembler",
                    id,
                    contract = %contract.name,
                    sources = contract.sources.len(),
                    "assembly complete"
                );
                (entry.on_complete)(contract);
            }
            Err(err) => {
                warn!(target: "contract_verifier::assembler", id, %err, "assembly aborted");
            }
        }
    }

    fn sweep(&mut self) {
        let cleanup_time = self.cleanup_time;
        let before = self.pending.len();
        self.pending
            .retain(|_, entry| entry.created_at.elapsed() <= cleanup_time);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!(
                target: "contract_verifier::assembler",
                dropped,
                "swept stale assemblies"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fetch::{
            FetcherConfig,
            GatewaySet,
        },
        primitives::SourceOrigin,
        test_utils::MockGateway,
    };
    use serde_json::json;
    use std::sync::Arc;

    fn fetcher_for(gateway: &MockGateway) -> SourceFetcher {
        let gateways = Arc::new(GatewaySet::new(&format!("{}ipfs/", gateway.base_url)));
        SourceFetcher::new(
            gateways,
            FetcherConfig {
                fetch_timeout: Duration::from_secs(5),
                fetch_pause: Duration::from_millis(20),
                cleanup_time: Duration::from_secs(60),
            },
        )
    }

    fn metadata_with_url(source_hash_hex: String) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "compiler": { "version": "0.8.18+commit.87f61d96" },
            "language": "Solidity",
            "settings": {
                "compilationTarget": { "Simple.sol": "Simple" },
                "optimizer": { "enabled": false, "runs": 200 }
            },
            "sources": {
                "Simple.sol": {
                    "keccak256": source_hash_hex,
                    "urls": ["dweb:/ipfs/QmSource"]
                }
            },
            "version": 1
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn assembles_contract_from_gateway_sources() {
        let content = "pragma solidity ^0.8.0; contract Simple {}";
        let metadata = metadata_with_url(keccak256(content.as_bytes()).to_string());

        let gateway = MockGateway::spawn().await;
        gateway.route("ipfs/QmMeta", 200, metadata.clone());
        gateway.route("ipfs/QmSource", 200, content.as_bytes().to_vec());

        let assembler = Assembler::new(fetcher_for(&gateway), Duration::from_secs(60));
        let (tx, mut rx) = mpsc::unbounded_channel();
        assembler.assemble(
            SourceAddress::new(SourceOrigin::Ipfs, "QmMeta"),
            move |contract| {
                let _ = tx.send(contract);
            },
        );

        let contract = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(contract.name, "Simple");
        assert_eq!(contract.raw_metadata, metadata);
        assert_eq!(contract.sources["Simple.sol"].content, content);
        assert_eq!(gateway.requests("ipfs/QmMeta"), 1);
        assert_eq!(gateway.requests("ipfs/QmSource"), 1);
    }

    #[tokio::test]
    async fn inline_content_completes_without_source_fetches() {
        let content = "contract Simple {}";
        let metadata = serde_json::to_vec(&json!({
            "compiler": { "version": "0.8.18+commit.87f61d96" },
            "settings": { "compilationTarget": { "Simple.sol": "Simple" } },
            "sources": {
                "Simple.sol": {
                    "keccak256": keccak256(content.as_bytes()),
                    "content": content
                }
            }
        }))
        .unwrap();

        let gateway = MockGateway::spawn().await;
        gateway.route("ipfs/QmInline", 200, metadata);

        let assembler = Assembler::new(fetcher_for(&gateway), Duration::from_secs(60));
        let (tx, mut rx) = mpsc::unbounded_channel();
        assembler.assemble(
            SourceAddress::new(SourceOrigin::Ipfs, "QmInline"),
            move |contract| {
                let _ = tx.send(contract);
            },
        );

        let contract = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(contract.sources["Simple.sol"].content, content);
        assert_eq!(gateway.requests("ipfs/QmSource"), 0);
    }

    #[tokio::test]
    async fn mismatched_source_hash_aborts_assembly() {
        let metadata = metadata_with_url(keccak256("the real content".as_bytes()).to_string());

        let gateway = MockGateway::spawn().await;
        gateway.route("ipfs/QmMeta", 200, metadata);
        gateway.route("ipfs/QmSource", 200, b"tampered content".to_vec());

        let assembler = Assembler::new(fetcher_for(&gateway), Duration::from_secs(60));
        let (tx, mut rx) = mpsc::unbounded_channel();
        assembler.assemble(
            SourceAddress::new(SourceOrigin::Ipfs, "QmMeta"),
            move |contract| {
                let _ = tx.send(contract);
            },
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
    }
}
